//! # Herd
//!
//! Performance primitives for services that talk to slow or expensive
//! backends:
//!
//! - [`coalesce`]: concurrent identical requests share one execution
//! - [`batch`]: many small requests become fewer bulk calls
//! - [`pool`]: bounded reuse of expensive connections
//!
//! A [`Context`] builds all three from one [`HerdConfig`], reports their
//! statistics through [`Telemetry`], and shuts them down in order.
//!
//! ## Example
//!
//! ```rust,no_run
//! use herd::{Context, HerdConfig};
//! use herd::pool::FnFactory;
//! use std::path::Path;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = HerdConfig::load(Some(Path::new("herd.yaml")))?;
//! let context = Context::new(config)?;
//! context.init_logging();
//!
//! let pool = context
//!     .create_pool("primary", FnFactory::new(|| async { Ok::<_, anyhow::Error>(Vec::<u8>::new()) }))
//!     .await?;
//! let conn = pool.acquire().await?;
//! conn.release().await;
//!
//! println!("{}", context.telemetry().encode());
//! context.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod context;
pub mod telemetry;

pub use config::{ConfigError, HerdConfig, LoggingConfig};
pub use context::Context;
pub use herd_core::{HerdError, LogFormat, Result};
pub use telemetry::{Snapshot, Telemetry};

pub use herd_batch as batch;
pub use herd_coalesce as coalesce;
pub use herd_pool as pool;
