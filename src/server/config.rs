//! Configuration loading for huginnd.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. `--config <path>` (CLI flag)
//! 2. `~/.huginn/config.toml` (user)
//! 3. `/etc/huginn/config.toml` (system)
//!
//! With no file at any of these locations the built-in defaults apply.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::builder::{DEFAULT_MAX_CONCURRENT_REQUESTS, HuginnBuilder};
use crate::recorder::{DEFAULT_ENGINE, DEFAULT_MAX_MODEL_LEN, RecorderConfig};
use crate::upstream::{DEFAULT_BASE_URL, UpstreamConfig};
use crate::{Huginn, HuginnError, Result};

/// Daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to (default: 127.0.0.1:8000).
    #[serde(default = "default_address")]
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
        }
    }
}

fn default_address() -> String {
    "127.0.0.1:8000".to_string()
}

/// Upstream inference server.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSection {
    /// Base URL (default: http://127.0.0.1:8001).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Maximum gap between body chunks.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Bound on sending the request and receiving response headers.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    /// Admission to end of body; 0 disables the deadline (default: 600).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    300
}

fn default_write_timeout() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    600
}

/// Admission limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrent upstream requests (default: 100). Zero is rejected.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
    /// Give up waiting for a slot after this many seconds (default: never).
    #[serde(default)]
    pub queue_timeout_secs: Option<u64>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent(),
            queue_timeout_secs: None,
        }
    }
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT_REQUESTS
}

/// Metric labels and bucket sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Upper bound for the token-count histogram buckets (default: 8192).
    #[serde(default = "default_max_model_len")]
    pub max_model_len: u64,
    /// Override for the request latency buckets, in seconds.
    #[serde(default)]
    pub latency_buckets: Option<Vec<f64>>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            model_name: default_model_name(),
            engine: default_engine(),
            max_model_len: default_max_model_len(),
            latency_buckets: None,
        }
    }
}

fn default_model_name() -> String {
    "unknown".to_string()
}

fn default_engine() -> String {
    DEFAULT_ENGINE.to_string()
}

fn default_max_model_len() -> u64 {
    DEFAULT_MAX_MODEL_LEN
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided, must exist)
    /// 2. `~/.huginn/config.toml`
    /// 3. `/etc/huginn/config.toml`
    /// 4. Built-in defaults
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        match Self::resolve_config_path(explicit_path)? {
            Some(path) => Self::load_from_file(&path),
            None => Ok(Self::default()),
        }
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            HuginnError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            HuginnError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    /// Resolve the config file path.
    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(HuginnError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".huginn").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/huginn/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }

    pub fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig::new(self.upstream.base_url.clone())
            .connect_timeout(Duration::from_secs(self.upstream.connect_timeout_secs))
            .read_timeout(Duration::from_secs(self.upstream.read_timeout_secs))
            .write_timeout(Duration::from_secs(self.upstream.write_timeout_secs))
    }

    pub fn recorder_config(&self) -> RecorderConfig {
        let mut config = RecorderConfig::new()
            .model_name(self.metrics.model_name.clone())
            .engine(self.metrics.engine.clone())
            .max_model_len(self.metrics.max_model_len);
        if let Some(buckets) = &self.metrics.latency_buckets {
            config = config.latency_buckets(buckets.clone());
        }
        config
    }

    /// A proxy builder carrying every setting in this configuration.
    pub fn builder(&self) -> HuginnBuilder {
        let request_timeout = match self.upstream.request_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let mut builder = Huginn::builder()
            .upstream_config(self.upstream_config())
            .recorder_config(self.recorder_config())
            .max_concurrency(self.limits.max_concurrent_requests)
            .request_timeout(request_timeout);
        if let Some(secs) = self.limits.queue_timeout_secs {
            builder = builder.queue_timeout(Duration::from_secs(secs));
        }
        builder
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.server.address, "127.0.0.1:8000");
        assert_eq!(config.upstream.base_url, "http://127.0.0.1:8001");
        assert_eq!(config.limits.max_concurrent_requests, 100);
        assert_eq!(config.limits.queue_timeout_secs, None);
        assert_eq!(config.metrics.engine, "vllm");
        assert_eq!(config.metrics.max_model_len, 8192);
    }

    #[test]
    fn parse_minimal_config() {
        let toml = r#"
            [server]
            address = "0.0.0.0:8000"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.address, "0.0.0.0:8000");
        // Defaults preserved
        assert_eq!(config.limits.max_concurrent_requests, 100);
        assert_eq!(config.upstream.request_timeout_secs, 600);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [server]
            address = "127.0.0.1:9000"

            [upstream]
            base_url = "http://gpu-box:8000"
            connect_timeout_secs = 3
            read_timeout_secs = 30
            write_timeout_secs = 15
            request_timeout_secs = 0

            [limits]
            max_concurrent_requests = 8
            queue_timeout_secs = 20

            [metrics]
            model_name = "qwen2.5-7b"
            engine = "sglang"
            max_model_len = 32768
            latency_buckets = [0.1, 1.0, 10.0]
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.upstream.base_url, "http://gpu-box:8000");
        assert_eq!(config.limits.max_concurrent_requests, 8);
        assert_eq!(config.limits.queue_timeout_secs, Some(20));
        assert_eq!(config.metrics.model_name, "qwen2.5-7b");
        assert_eq!(config.metrics.latency_buckets, Some(vec![0.1, 1.0, 10.0]));

        let upstream = config.upstream_config();
        assert_eq!(upstream.connect_timeout, Duration::from_secs(3));
        assert_eq!(upstream.read_timeout, Duration::from_secs(30));
        let recorder = config.recorder_config();
        assert_eq!(recorder.engine, "sglang");
        assert_eq!(recorder.max_model_len, 32768);
    }

    #[test]
    fn config_not_found_returns_error() {
        let result = Config::load(Some(Path::new("/nonexistent/config.toml")));
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Config file not found"));
    }

    #[test]
    fn load_from_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[limits]\nmax_concurrent_requests = 4").unwrap();
        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.limits.max_concurrent_requests, 4);
    }

    #[test]
    fn malformed_file_is_a_configuration_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[limits\nmax_concurrent_requests = ").unwrap();
        let err = Config::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, HuginnError::Configuration(_)));
    }

    #[test]
    fn zero_concurrency_fails_at_build() {
        let toml = r#"
            [limits]
            max_concurrent_requests = 0
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.builder().build().unwrap_err();
        assert!(matches!(err, HuginnError::Configuration(_)));
    }
}
