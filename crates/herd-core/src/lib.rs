//! # Herd Core
//!
//! Shared building blocks for the herd performance primitives: the error
//! taxonomy every component reports through, a serde helper for
//! millisecond durations in settings, and logging initialization.
//!
//! ## Example
//!
//! ```rust
//! use herd_core::{HerdError, Result};
//! use std::time::Duration;
//!
//! fn acquire_slot(free: usize) -> Result<usize> {
//!     if free == 0 {
//!         return Err(HerdError::timeout("worker slot", Duration::from_millis(50)));
//!     }
//!     Ok(free - 1)
//! }
//!
//! assert!(acquire_slot(0).unwrap_err().is_timeout());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod observability;
pub mod serde_ms;

pub use error::{HerdError, Result, SharedError};
pub use observability::{init_logging, LogFormat};
