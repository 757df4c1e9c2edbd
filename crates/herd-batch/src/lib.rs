//! # Herd Batch
//!
//! Groups many small requests into fewer bulk operations.
//!
//! - [`BatchCollector`]: a standing collector that flushes on size, on a
//!   timer, or on demand, and fans results back to each caller
//! - [`BatchProcessor`]: independent collectors per key
//! - [`executor`]: one-shot chunked execution of a list already in hand
//!
//! ## Example
//!
//! ```rust
//! use herd_batch::{BatchCollector, BatchSettings};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> herd_core::Result<()> {
//! let settings = BatchSettings {
//!     max_batch_size: 2,
//!     max_wait: Duration::from_millis(10),
//!     auto_process: true,
//! };
//! let lookups = BatchCollector::new(settings, |ids: Vec<u32>| async move {
//!     Ok(ids.into_iter().map(|id| format!("user-{id}")).collect())
//! });
//!
//! let (a, b) = (lookups.add(1), lookups.add(2));
//! assert_eq!(a.await?, "user-1");
//! assert_eq!(b.await?, "user-2");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collector;
pub mod executor;
pub mod processor;

pub use collector::{
    batch_fn, BatchCollector, BatchFn, BatchSettings, BatchStats, BatchTicket, FlushTrigger,
};
pub use executor::{execute_batch, ExecutionMode};
pub use processor::BatchProcessor;
