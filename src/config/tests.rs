use super::settings::Settings;
use super::{StorageBackend, load_config_from};

use serial_test::serial;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 8080);
    assert_eq!(settings.broker.max_connections, 1000);
    assert_eq!(settings.broker.default_max_retry, 5);
    assert_eq!(settings.broker.message_ttl_secs, 0);
    assert_eq!(settings.storage.backend, StorageBackend::Sled);
    assert_eq!(settings.logging.level, "info");
}

#[test]
#[serial]
fn missing_file_yields_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("absent");
    let cfg = load_config_from(path.to_str().unwrap()).expect("load_config failed");
    assert_eq!(cfg, Settings::default());
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let file = tmp.path().join("popmq.toml");
    let toml = r#"
        [server]
        host = "0.0.0.0"
        port = 9000

        [broker]
        default_max_retry = 2
        redelivery_timeout_ms = 500

        [storage]
        backend = "memory"
    "#;
    fs::write(&file, toml).expect("write config file");

    let cfg = load_config_from(file.to_str().unwrap()).expect("load_config failed");
    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.port, 9000);
    assert_eq!(cfg.broker.default_max_retry, 2);
    assert_eq!(cfg.broker.redelivery_timeout_ms, 500);
    // untouched keys keep their defaults
    assert_eq!(cfg.broker.sweep_interval_ms, 1000);
    assert_eq!(cfg.storage.backend, StorageBackend::Memory);
    assert_eq!(cfg.storage.path, "popmq_db");
}

#[test]
#[serial]
fn environment_overrides_file() {
    let tmp = TempDir::new().expect("create tempdir");
    let file = tmp.path().join("popmq.toml");
    fs::write(&file, "[server]\nport = 9000\n").expect("write config file");

    temp_env::with_vars(
        [
            ("POPMQ_SERVER__PORT", Some("9100")),
            ("POPMQ_BROKER__DEFAULT_PREFETCH", Some("3")),
            ("POPMQ_LOGGING__LEVEL", Some("debug")),
        ],
        || {
            let cfg = load_config_from(file.to_str().unwrap()).expect("load_config failed");
            assert_eq!(cfg.server.port, 9100);
            assert_eq!(cfg.broker.default_prefetch, 3);
            assert_eq!(cfg.logging.level, "debug");
        },
    );
}
