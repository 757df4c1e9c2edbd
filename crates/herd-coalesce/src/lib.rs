//! # Herd Coalesce
//!
//! Deduplicates concurrent identical calls. Callers that ask for the same
//! key while a call is running share that one execution; a successful
//! result is reused for the rest of a short window.
//!
//! ## Example
//!
//! ```rust
//! use herd_coalesce::{CoalescerSettings, RequestCoalescer};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> herd_core::Result<()> {
//! let coalescer = RequestCoalescer::<String, u64>::new(CoalescerSettings::default());
//!
//! let balance = coalescer
//!     .execute("account:42".to_string(), || async { Ok::<_, anyhow::Error>(1_000) })
//!     .await?;
//! assert_eq!(balance, 1_000);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod coalescer;
pub mod manager;

pub use cache::{TimedCache, TimedCacheStats};
pub use coalescer::{CoalescerSettings, CoalescerStats, RequestCoalescer};
pub use manager::CoalescingManager;
