//! Configuration and logging setup for the Nova stream debugger.
//!
//! A single TOML file with `[logging]`, `[jdwp]` and `[trace]` tables. Every
//! field has a default, so an empty file (or no file at all) is valid.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamDebugConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub jdwp: JdwpConfig,
    #[serde(default)]
    pub trace: TraceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A simple level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs in JSON format.
    #[serde(default)]
    pub json: bool,

    /// Mirror logs to stderr.
    #[serde(default = "default_true")]
    pub stderr: bool,

    /// Append logs to the given file path. If the file cannot be opened, file
    /// logging is skipped while stderr stays active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(&directives).unwrap_or_else(|err| {
            tracing::warn!(
                target: "nova.config",
                level = %directives,
                error = %err,
                "invalid logging level; falling back to info"
            );
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// The effective filter: configured directives, with `RUST_LOG` merged on top.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        match env_directives {
            Some(env_directives) => {
                let config_directives = Self::normalize_level_directives(&self.level);
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: true,
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JdwpConfig {
    #[serde(default = "JdwpConfig::default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "JdwpConfig::default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    /// Capacity of the event broadcast channel. Slow subscribers past this
    /// many queued events observe a lag.
    #[serde(default = "JdwpConfig::default_event_channel_size")]
    pub event_channel_size: usize,
}

impl JdwpConfig {
    fn default_handshake_timeout_ms() -> u64 {
        5_000
    }

    fn default_reply_timeout_ms() -> u64 {
        10_000
    }

    fn default_event_channel_size() -> usize {
        256
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

impl Default for JdwpConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: Self::default_handshake_timeout_ms(),
            reply_timeout_ms: Self::default_reply_timeout_ms(),
            event_channel_size: Self::default_event_channel_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceConfig {
    /// Directory holding the precompiled helper classes as `<binary/name>.class`.
    #[serde(default)]
    pub helper_classes_dir: Option<PathBuf>,

    /// Abort the trace when writing substituted arguments or return values fails.
    /// When unset the failure is reported and tracing continues.
    #[serde(default)]
    pub fail_on_substitution_error: bool,

    /// Upper bound on step-into requests issued while returning to the invoking frame.
    #[serde(default = "TraceConfig::default_max_step_attempts")]
    pub max_step_attempts: u32,

    /// Force the source stream to be sequential before it is traced.
    #[serde(default = "default_true")]
    pub sequential_source: bool,

    /// Run remote invocations with only the traced thread resumed.
    #[serde(default = "default_true")]
    pub invoke_single_threaded: bool,
}

impl TraceConfig {
    fn default_max_step_attempts() -> u32 {
        1_000
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            helper_classes_dir: None,
            fail_on_substitution_error: false,
            max_step_attempts: Self::default_max_step_attempts(),
            sequential_source: true,
            invoke_single_threaded: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // `Display` would embed a source snippet; keep only the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

pub type Result<T, E = ConfigError> = std::result::Result<T, E>;

impl StreamDebugConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::load_from_str(&text)?;
        tracing::debug!(target: "nova.config", path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn load_from_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

static TRACING_INIT: Once = Once::new();

/// Installs the global `tracing` subscriber.
///
/// Safe to call multiple times; only the first call has an effect.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let file = config.file.as_ref().and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

        let mut make_writer = BoxMakeWriter::new(std::io::sink);
        if config.stderr {
            // `TestWriter` keeps `cargo test` output capture working in debug builds.
            make_writer = if cfg!(debug_assertions) {
                BoxMakeWriter::new(
                    make_writer.and(tracing_subscriber::fmt::writer::TestWriter::with_stderr),
                )
            } else {
                BoxMakeWriter::new(make_writer.and(std::io::stderr))
            };
        }
        if let Some(file) = file {
            make_writer = BoxMakeWriter::new(make_writer.and(Mutex::new(file)));
        }

        let layer: Box<dyn Layer<_> + Send + Sync> = if config.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        };

        let _ = tracing_subscriber::registry()
            .with(config.env_filter())
            .with(layer)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_toml_uses_defaults() {
        let config = StreamDebugConfig::load_from_str("").expect("config should parse");
        assert_eq!(config, StreamDebugConfig::default());
        assert!(config.trace.sequential_source);
        assert!(config.trace.invoke_single_threaded);
        assert!(!config.trace.fail_on_substitution_error);
        assert_eq!(config.jdwp.reply_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn trace_table_parses() {
        let text = r#"
[trace]
helper_classes_dir = "/opt/nova/helpers"
fail_on_substitution_error = true
max_step_attempts = 12
"#;
        let config = StreamDebugConfig::load_from_str(text).expect("config should parse");
        assert_eq!(
            config.trace.helper_classes_dir,
            Some(PathBuf::from("/opt/nova/helpers"))
        );
        assert!(config.trace.fail_on_substitution_error);
        assert_eq!(config.trace.max_step_attempts, 12);
        assert!(config.trace.sequential_source);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = StreamDebugConfig::load_from_str("[trace]\nmax_steps = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)), "{err:?}");
    }

    #[test]
    fn config_file_loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nova.toml");
        std::fs::write(&path, "[trace]\nmax_step_attempts = 3\n").unwrap();

        let config = StreamDebugConfig::load_from_path(&path).unwrap();
        assert_eq!(config.trace.max_step_attempts, 3);

        let err = StreamDebugConfig::load_from_path(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }), "{err}");
    }

    #[test]
    fn invalid_level_falls_back_to_info() {
        let logging = LoggingConfig {
            level: "nova=loudest".to_string(),
            ..LoggingConfig::default()
        };
        assert_eq!(logging.config_env_filter().to_string(), "info");
    }

    #[test]
    fn level_directives_are_normalized() {
        assert_eq!(LoggingConfig::normalize_level_directives(" WARNING "), "warn");
        assert_eq!(LoggingConfig::normalize_level_directives(""), "info");
        assert_eq!(
            LoggingConfig::normalize_level_directives("nova.stream_debug=trace"),
            "nova.stream_debug=trace"
        );
    }
}
