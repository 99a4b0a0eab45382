//! Configuration for the bridge
//!
//! Configuration can be loaded from a TOML file and/or environment variables.
//! Command-line flags are applied on top by the binary.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use tsbridge_srt::EndpointOptions;

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// SRT listener feeding the bus
    #[serde(default)]
    pub ingest: IngestConfig,

    /// SRT caller fed from the bus
    #[serde(default)]
    pub egress: EgressConfig,

    /// Transport tuning shared by both directions
    #[serde(default)]
    pub srt: SrtConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Local `host:port` to listen on
    #[serde(default = "default_ingest_host")]
    pub host: String,

    /// Stream name published on the bus
    #[serde(default = "default_stream")]
    pub stream: String,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_ingest_host() -> String {
    "0.0.0.0:1234".to_string()
}

fn default_stream() -> String {
    "srtIn".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            host: default_ingest_host(),
            stream: default_stream(),
            enabled: default_true(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EgressConfig {
    /// Remote `host:port` to push TS to; egress is off when unset
    #[serde(default)]
    pub target: Option<String>,

    /// Stream name subscribed on the bus
    #[serde(default = "default_stream")]
    pub stream: String,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            target: None,
            stream: default_stream(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SrtConfig {
    /// Connection monitor poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// SRT latency in milliseconds; library default when unset
    #[serde(default)]
    pub latency_ms: Option<u32>,
}

fn default_poll_interval_ms() -> u64 {
    250
}

impl Default for SrtConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            latency_ms: None,
        }
    }
}

impl SrtConfig {
    pub fn endpoint_options(&self) -> EndpointOptions {
        EndpointOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            latency_ms: self.latency_ms,
            ..EndpointOptions::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive, used when `RUST_LOG` is not set
    #[serde(default)]
    pub filter: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Override fields from `TSBRIDGE_*` variables looked up through `var`
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = var("TSBRIDGE_SRT_HOST") {
            self.ingest.host = host;
        }
        if let Some(stream) = var("TSBRIDGE_STREAM") {
            self.ingest.stream = stream;
        }
        if let Some(target) = var("TSBRIDGE_SRT_TARGET") {
            self.egress.target = Some(target).filter(|t| !t.is_empty());
        }
        if let Some(stream) = var("TSBRIDGE_EGRESS_STREAM") {
            self.egress.stream = stream;
        }

        if let Some(ms) = var("TSBRIDGE_POLL_INTERVAL_MS") {
            match ms.parse() {
                Ok(ms) => self.srt.poll_interval_ms = ms,
                Err(_) => tracing::warn!(value = %ms, "ignoring invalid TSBRIDGE_POLL_INTERVAL_MS"),
            }
        }
        if let Some(ms) = var("TSBRIDGE_LATENCY_MS") {
            match ms.parse() {
                Ok(ms) => self.srt.latency_ms = Some(ms),
                Err(_) => tracing::warn!(value = %ms, "ignoring invalid TSBRIDGE_LATENCY_MS"),
            }
        }

        if let Some(filter) = var("TSBRIDGE_LOG") {
            self.logging.filter = Some(filter);
        }
    }

    /// Load configuration from file if it exists, then apply environment
    /// overrides
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.as_ref().exists() => Self::from_file(p)?,
            Some(p) => {
                tracing::warn!(path = %p.as_ref().display(), "config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.ingest.host, "0.0.0.0:1234");
        assert_eq!(config.ingest.stream, "srtIn");
        assert!(config.ingest.enabled);
        assert_eq!(config.egress.target, None);
        assert_eq!(config.srt.poll_interval_ms, 250);
        assert_eq!(
            config.srt.endpoint_options().poll_interval,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
[ingest]
host = "127.0.0.1:9000"

[egress]
target = "relay.example.com:9001"
stream = "program"

[srt]
latency_ms = 120
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.ingest.host, "127.0.0.1:9000");
        assert_eq!(config.ingest.stream, "srtIn");
        assert_eq!(config.egress.target.as_deref(), Some("relay.example.com:9001"));
        assert_eq!(config.egress.stream, "program");
        assert_eq!(config.srt.poll_interval_ms, 250);
        assert_eq!(config.srt.endpoint_options().latency_ms, Some(120));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TSBRIDGE_SRT_HOST", "0.0.0.0:7000"),
            ("TSBRIDGE_SRT_TARGET", "10.0.0.2:7001"),
            ("TSBRIDGE_POLL_INTERVAL_MS", "50"),
            ("TSBRIDGE_LATENCY_MS", "not-a-number"),
            ("TSBRIDGE_LOG", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.ingest.host, "0.0.0.0:7000");
        assert_eq!(config.egress.target.as_deref(), Some("10.0.0.2:7001"));
        assert_eq!(config.srt.poll_interval_ms, 50);
        assert_eq!(config.srt.latency_ms, None);
        assert_eq!(config.logging.filter.as_deref(), Some("debug"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[ingest]\nstream = \"studio\"").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.ingest.stream, "studio");

        writeln!(file, "[ingest").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Config::from_file("/nonexistent/tsbridge.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
