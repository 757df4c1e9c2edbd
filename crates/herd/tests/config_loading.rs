//! Loading [`HerdConfig`] from files.

use herd::pool::PoolSettings;
use herd::{ConfigError, HerdConfig, LogFormat};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn config_file(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_yaml_roundtrip() {
    let mut config = HerdConfig::default();
    config.logging.format = LogFormat::Json;
    config.coalescer.window = Duration::from_millis(250);
    config.coalescer.max_requests = Some(50);
    config.batch.max_batch_size = 500;
    config.pools.insert("primary".to_string(), PoolSettings::balanced());
    config.pools.insert("replica".to_string(), PoolSettings::conservative());

    let file = config_file(".yaml", &serde_yaml::to_string(&config).unwrap());
    let loaded = HerdConfig::load(Some(file.path())).unwrap();

    assert_eq!(loaded, config);
}

#[test]
fn test_partial_toml_keeps_defaults() {
    let file = config_file(
        ".toml",
        r#"
[logging]
level = "debug"

[batch]
max_wait_ms = 5

[pools.primary]
min_size = 2
max_size = 8
max_idle = 4
acquire_timeout_ms = 750
"#,
    );

    let config = HerdConfig::load(Some(file.path())).unwrap();

    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.batch.max_wait, Duration::from_millis(5));
    assert_eq!(config.batch.max_batch_size, 100);
    assert_eq!(config.coalescer.max_entries, 10_000);

    let primary = config.pool_settings("primary");
    assert_eq!(primary.max_size, 8);
    assert_eq!(primary.acquire_timeout, Duration::from_millis(750));
    assert_eq!(primary.max_lifetime, Duration::from_secs(3600));
}

#[test]
fn test_invalid_pool_is_reported_by_name() {
    let file = config_file(
        ".json",
        r#"{"pools": {"cache": {"min_size": 10, "max_size": 2, "max_idle": 1}}}"#,
    );

    let err = HerdConfig::load(Some(file.path())).unwrap_err();
    assert!(matches!(&err, ConfigError::Pool { name, .. } if name == "cache"));
    assert!(err.to_string().contains("cache"));
}

#[test]
fn test_missing_file_fails_to_load() {
    let dir = tempfile::tempdir().unwrap();
    let err = HerdConfig::load(Some(&dir.path().join("absent.yaml"))).unwrap_err();
    assert!(matches!(err, ConfigError::Load(_)));
}

#[test]
fn test_malformed_values_fail_to_load() {
    let file = config_file(".yaml", "coalescer:\n  window_ms: soon\n");
    assert!(matches!(
        HerdConfig::load(Some(file.path())),
        Err(ConfigError::Load(_))
    ));
}
