//! Serialize [`Duration`] settings as whole milliseconds.
//!
//! Settings files carry durations as integers (`window_ms: 100`), which
//! keeps YAML, TOML and environment overrides uniform.
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Timeouts {
//!     #[serde(with = "herd_core::serde_ms", rename = "acquire_timeout_ms")]
//!     acquire_timeout: Duration,
//! }
//! ```

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Serializes a duration as milliseconds.
pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
    serializer.serialize_u64(millis)
}

/// Deserializes a duration from milliseconds.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
