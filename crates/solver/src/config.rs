use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

/// Which model backend handles exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gemini,
    Local,
}

fn default_provider() -> Provider { Provider::Gemini }

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Target output language for generated code.
    #[serde(default = "default_language")]
    pub language: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            capture: CaptureConfig::default(),
            compression: CompressionConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            language: default_language(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_provider")]
    pub provider: Provider,
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Use the streaming endpoint and forward chunks as they arrive.
    #[serde(default)]
    pub stream: bool,
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub local: LocalModelConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocalModelConfig {
    #[serde(default = "default_local_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_local_model")]
    pub model: String,
}

fn default_local_endpoint() -> String { "http://localhost:11434/v1/chat/completions".into() }
fn default_local_model() -> String { "minicpm-v".into() }

impl Default for LocalModelConfig {
    fn default() -> Self {
        Self {
            endpoint: default_local_endpoint(),
            model: default_local_model(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_max_attempts_per_window")]
    pub max_attempts_per_window: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompressionConfig {
    #[serde(default = "default_payload_limit_bytes")]
    pub payload_limit_bytes: usize,
    #[serde(default = "default_compression_attempts")]
    pub max_attempts: usize,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// Where queued screenshots are persisted. Default: the system temp dir.
    pub directory: Option<PathBuf>,
}

impl StorageConfig {
    pub fn root(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("snapsolve"))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_enabled")]
    pub enabled: bool,
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log directory. When unset, diagnostics go to stderr and no transcript
    /// is written.
    pub directory: Option<PathBuf>,
    /// Write a plain-text transcript of each exchange.
    #[serde(default = "default_transcript")]
    pub transcript: bool,
}

fn default_language() -> String { "python".into() }
fn default_model() -> String { "gemini-2.5-flash".into() }
fn default_max_tokens() -> u32 { 8192 }
fn default_stream_timeout_secs() -> u64 { 300 }
fn default_request_timeout_secs() -> u64 { 120 }
fn default_min_interval_ms() -> u64 { 500 }
fn default_rate_limit_window_secs() -> u64 { 10 }
fn default_max_attempts_per_window() -> usize { 5 }
fn default_queue_capacity() -> usize { 2 }
fn default_payload_limit_bytes() -> usize { 4 * 1024 * 1024 }
fn default_compression_attempts() -> usize { 3 }
fn default_logging_enabled() -> bool { true }
fn default_log_level() -> String { "info".into() }
fn default_transcript() -> bool { true }

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            key: String::new(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            stream: false,
            stream_timeout_secs: default_stream_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            local: LocalModelConfig::default(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            max_attempts_per_window: default_max_attempts_per_window(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            payload_limit_bytes: default_payload_limit_bytes(),
            max_attempts: default_compression_attempts(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_logging_enabled(),
            level: default_log_level(),
            directory: None,
            transcript: default_transcript(),
        }
    }
}

impl LoggingConfig {
    /// Parse `level`, falling back to INFO on anything unrecognized.
    pub fn max_level(&self) -> tracing::Level {
        self.level.parse().unwrap_or(tracing::Level::INFO)
    }
}

impl Config {
    /// Read `path` as TOML. A missing or malformed file yields the defaults;
    /// the problem is logged, never returned.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml(&contents).unwrap_or_else(|e| {
                warn!("Failed to parse {}: {e}", path.display());
                Self::default()
            }),
            Err(_) => {
                warn!("{} not found, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_documented_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.language, "python");
        assert_eq!(config.api.provider, Provider::Gemini);
        assert_eq!(config.api.stream_timeout_secs, 300);
        assert_eq!(config.capture.min_interval_ms, 500);
        assert_eq!(config.capture.rate_limit_window_secs, 10);
        assert_eq!(config.capture.max_attempts_per_window, 5);
        assert_eq!(config.capture.queue_capacity, 2);
        assert_eq!(config.compression.payload_limit_bytes, 4 * 1024 * 1024);
        assert_eq!(config.compression.max_attempts, 3);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            language = "rust"

            [api]
            provider = "local"
            stream = true

            [api.local]
            model = "llava"
            "#,
        )
        .unwrap();
        assert_eq!(config.language, "rust");
        assert_eq!(config.api.provider, Provider::Local);
        assert!(config.api.stream);
        assert_eq!(config.api.local.model, "llava");
        assert_eq!(
            config.api.local.endpoint,
            "http://localhost:11434/v1/chat/completions"
        );
        assert_eq!(config.api.model, "gemini-2.5-flash");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml"));
        assert_eq!(config.language, "python");
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[api\nkey = ").unwrap();
        let config = Config::load(&path);
        assert!(config.api.key.is_empty());
    }

    #[test]
    fn unknown_log_level_is_info() {
        let logging = LoggingConfig {
            level: "chatty".into(),
            ..LoggingConfig::default()
        };
        assert_eq!(logging.max_level(), tracing::Level::INFO);
    }
}
