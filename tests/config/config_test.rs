//! Loading config files from disk.

use switchboard::config::{config_dir, load_config};

#[test]
fn missing_file_yields_defaults_resolved_next_to_it() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("config.toml");

    let config = load_config(&path).expect("defaults should load");
    assert_eq!(config.broker.session_ttl_seconds, 300);
    assert_eq!(config.server.bind, "127.0.0.1:7878");
    assert_eq!(config.paths.audit_log, tmp.path().join("audit.jsonl"));
    assert_eq!(config.paths.logs_dir, tmp.path().join("logs"));
}

#[test]
fn file_values_override_defaults() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[broker]
session_ttl_seconds = 120
max_requests_per_session = 50

[rate_limit]
requests_per_minute = 10

[paths]
audit_log = "/var/log/switchboard/audit.jsonl"
"#,
    )
    .expect("write config");

    let config = load_config(&path).expect("config should load");
    assert_eq!(config.broker.session_ttl_seconds, 120);
    assert_eq!(config.broker.max_requests_per_session, 50);
    assert_eq!(config.rate_limit.requests_per_minute, 10);
    assert_eq!(config.rate_limit.tokens_per_minute, 100_000);
    assert_eq!(
        config.paths.audit_log,
        std::path::PathBuf::from("/var/log/switchboard/audit.jsonl")
    );
}

#[test]
fn malformed_file_is_an_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[broker\nsession_ttl_seconds = ").expect("write config");
    assert!(load_config(&path).is_err());
}

#[test]
fn invalid_values_fail_validation() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "[relay]\nmax_stream_queue_depth = 0\n").expect("write config");
    let err = load_config(&path).expect_err("zero depth is invalid");
    assert!(err.to_string().contains("max_stream_queue_depth"));
}

#[test]
fn config_dir_is_under_home() {
    let dir = config_dir().expect("home directory should resolve");
    assert!(dir.ends_with(".switchboard"));
}
