//! Connection pool settings and presets.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_sizes"))]
pub struct PoolSettings {
    /// Connections created by [`initialize`](crate::ConnectionPool::initialize).
    pub min_size: usize,
    /// Maximum connections alive at once, checked out or idle.
    #[validate(range(min = 1))]
    pub max_size: usize,
    /// Maximum idle connections kept for reuse. Extra released connections
    /// are closed.
    pub max_idle: usize,
    /// Connections older than this are closed instead of handed out.
    #[serde(with = "herd_core::serde_ms", rename = "max_lifetime_ms")]
    pub max_lifetime: Duration,
    /// How long `acquire` waits when the pool is at capacity.
    #[serde(with = "herd_core::serde_ms", rename = "acquire_timeout_ms")]
    pub acquire_timeout: Duration,
    /// Idle connections unused for this long are closed.
    #[serde(with = "herd_core::serde_ms", rename = "idle_timeout_ms")]
    pub idle_timeout: Duration,
    /// Whether `acquire` checks liveness and lifetime before handing out.
    pub validate_on_acquire: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            max_idle: 5,
            max_lifetime: Duration::from_secs(3600),
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            validate_on_acquire: true,
        }
    }
}

impl PoolSettings {
    /// Large, warm pool for high-throughput services. Skips validation on
    /// acquire.
    pub fn aggressive() -> Self {
        Self {
            min_size: 10,
            max_size: 100,
            max_idle: 20,
            max_lifetime: Duration::from_secs(1800),
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            validate_on_acquire: false,
        }
    }

    /// Small pool that holds few connections and waits patiently.
    pub fn conservative() -> Self {
        Self {
            min_size: 1,
            max_size: 5,
            max_idle: 2,
            max_lifetime: Duration::from_secs(7200),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(1800),
            validate_on_acquire: true,
        }
    }

    /// Middle ground between [`aggressive`](Self::aggressive) and
    /// [`conservative`](Self::conservative).
    pub fn balanced() -> Self {
        Self {
            min_size: 5,
            max_size: 20,
            max_idle: 10,
            max_lifetime: Duration::from_secs(3600),
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            validate_on_acquire: true,
        }
    }
}

fn validate_sizes(settings: &PoolSettings) -> Result<(), ValidationError> {
    if settings.min_size > settings.max_size {
        let mut err = ValidationError::new("min_size");
        err.message = Some(
            format!(
                "min_size ({}) must not exceed max_size ({})",
                settings.min_size, settings.max_size
            )
            .into(),
        );
        return Err(err);
    }

    if settings.max_idle > settings.max_size {
        let mut err = ValidationError::new("max_idle");
        err.message = Some(
            format!(
                "max_idle ({}) must not exceed max_size ({})",
                settings.max_idle, settings.max_size
            )
            .into(),
        );
        return Err(err);
    }

    Ok(())
}
