//! # Herd Pool
//!
//! Bounded pools of reusable, expensive resources such as network
//! connections.
//!
//! - [`ConnectionPool`]: fair, bounded acquire/release with validation,
//!   lifetime and idle expiry
//! - [`ConnectionFactory`]: how connections are opened, checked and closed
//! - [`PoolManager`]: named pools with a process-wide shutdown
//!
//! ## Example
//!
//! ```rust
//! use herd_pool::{ConnectionPool, FnFactory, PoolSettings};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> herd_core::Result<()> {
//! let factory = FnFactory::new(|| async { Ok::<_, anyhow::Error>(String::from("session")) });
//! let pool = ConnectionPool::new("sessions", factory, PoolSettings::conservative());
//! pool.initialize().await;
//!
//! let conn = pool.acquire().await?;
//! assert_eq!(conn.as_str(), "session");
//! conn.release().await;
//!
//! pool.close().await;
//! assert!(pool.acquire().await.unwrap_err().is_closed());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod factory;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod settings;

pub use factory::{ConnectionFactory, FnFactory};
pub use manager::PoolManager;
pub use metrics::{PoolMetrics, PoolStats};
pub use pool::{ConnectionPool, PooledConnection};
pub use settings::PoolSettings;
