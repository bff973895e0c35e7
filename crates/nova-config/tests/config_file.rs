use std::io::Write;

use nova_config::{init_tracing, ConfigError, LoggingConfig, StreamDebugConfig};
use pretty_assertions::assert_eq;

#[test]
fn load_from_path_reads_all_tables() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[logging]
level = "debug"
json = true

[jdwp]
reply_timeout_ms = 250
event_channel_size = 8

[trace]
invoke_single_threaded = false
"#
    )
    .unwrap();

    let config = StreamDebugConfig::load_from_path(file.path()).unwrap();
    assert_eq!(config.logging.level, "debug");
    assert!(config.logging.json);
    assert_eq!(config.jdwp.reply_timeout_ms, 250);
    assert_eq!(config.jdwp.event_channel_size, 8);
    assert_eq!(config.jdwp.handshake_timeout_ms, 5_000);
    assert!(!config.trace.invoke_single_threaded);
}

#[test]
fn missing_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.toml");

    let err = StreamDebugConfig::load_from_path(&path).unwrap_err();
    match err {
        ConfigError::Io { path: reported, .. } => {
            assert_eq!(reported, path.display().to_string())
        }
        other => panic!("expected io error, got {other:?}"),
    }
}

#[test]
fn init_tracing_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let config = LoggingConfig {
        stderr: false,
        file: Some(dir.path().join("trace.log")),
        ..LoggingConfig::default()
    };
    init_tracing(&config);
    init_tracing(&config);
    tracing::info!(target: "nova.stream_debug", "logging initialized");
}
