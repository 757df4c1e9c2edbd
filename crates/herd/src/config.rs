//! Process configuration.
//!
//! A [`HerdConfig`] is read from an optional file (format chosen by its
//! extension) with `HERD__`-prefixed environment variables layered on top:
//!
//! ```text
//! HERD__LOGGING__LEVEL=debug
//! HERD__COALESCER__WINDOW_MS=250
//! HERD__POOLS__PRIMARY__MAX_SIZE=32
//! ```

use herd_batch::BatchSettings;
use herd_coalesce::CoalescerSettings;
use herd_core::{HerdError, LogFormat};
use herd_pool::PoolSettings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use validator::{Validate, ValidationErrors};

/// Prefix of environment variables read by [`HerdConfig::load`].
pub const ENV_PREFIX: &str = "HERD";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be read or deserialized.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// A top-level section failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(#[from] ValidationErrors),

    /// A named pool's settings failed validation.
    #[error("invalid settings for pool `{name}`: {source}")]
    Pool {
        /// Pool name.
        name: String,
        /// What was wrong.
        #[source]
        source: ValidationErrors,
    },
}

impl From<ConfigError> for HerdError {
    fn from(err: ConfigError) -> Self {
        HerdError::config(err.to_string())
    }
}

/// Logging section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for the herd crates, overridden by `RUST_LOG`.
    #[validate(length(min = 1))]
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

/// Settings for every component a [`Context`](crate::Context) builds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HerdConfig {
    /// Logging section.
    #[validate(nested)]
    pub logging: LoggingConfig,
    /// Settings shared by every coalescer.
    #[validate(nested)]
    pub coalescer: CoalescerSettings,
    /// Settings shared by every batch processor.
    #[validate(nested)]
    pub batch: BatchSettings,
    /// Per-pool settings by pool name. Pools without an entry use
    /// [`PoolSettings::default`].
    pub pools: BTreeMap<String, PoolSettings>,
}

impl HerdConfig {
    /// Loads configuration from `path`, if given, then from the environment,
    /// and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config: HerdConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.check()?;
        Ok(config)
    }

    /// Validates every section, including each named pool.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;
        for (name, settings) in &self.pools {
            settings.validate().map_err(|source| ConfigError::Pool {
                name: name.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Returns the settings for the pool named `name`.
    pub fn pool_settings(&self, name: &str) -> PoolSettings {
        self.pools.get(name).cloned().unwrap_or_default()
    }
}
