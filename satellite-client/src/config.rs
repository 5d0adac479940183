//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via SATELLITE_CONFIG or --config)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default RPC timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Default outbound push window in milliseconds.
pub const DEFAULT_PUSH_PERIOD_MS: u64 = 500;

/// Satellite client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SatelliteClientConfig {
    /// Application id sent as the auth request id.
    pub app: String,
    /// Authentication token.
    pub token: String,
    /// Replication service host.
    pub host: String,
    /// Replication service port.
    pub port: u16,
    /// RPC timeout in milliseconds.
    pub timeout_ms: u64,
    /// Throttle window of the outbound push loop in milliseconds.
    pub push_period_ms: u64,
    /// Connect over plain TCP instead of TLS.
    pub insecure: bool,
    /// TLS settings, used unless `insecure` is set.
    pub tls: TlsConfig,
}

impl Default for SatelliteClientConfig {
    fn default() -> Self {
        Self {
            app: String::new(),
            token: String::new(),
            host: "127.0.0.1".to_string(),
            port: 443,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            push_period_ms: DEFAULT_PUSH_PERIOD_MS,
            insecure: false,
            tls: TlsConfig::default(),
        }
    }
}

impl SatelliteClientConfig {
    pub fn new(app: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            token: token.into(),
            ..Self::default()
        }
    }

    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_push_period(mut self, period: Duration) -> Self {
        self.push_period_ms = period.as_millis() as u64;
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("SATELLITE_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Applies `SATELLITE_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(app) = var("SATELLITE_APP") {
            self.app = app;
        }
        if let Some(token) = var("SATELLITE_TOKEN") {
            self.token = token;
        }
        if let Some(host) = var("SATELLITE_HOST") {
            self.host = host;
        }
        if let Some(port) = var("SATELLITE_PORT").and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        if let Some(ms) = var("SATELLITE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.timeout_ms = ms;
        }
        if let Some(ms) = var("SATELLITE_PUSH_PERIOD_MS").and_then(|v| v.parse().ok()) {
            self.push_period_ms = ms;
        }
        if let Some(insecure) = var("SATELLITE_INSECURE") {
            self.insecure = insecure == "1" || insecure.to_lowercase() == "true";
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app.is_empty() {
            return Err(ConfigError::Validation("app id must be set".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::Validation("port must be non-zero".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "timeout_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the RPC timeout as Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Returns the push window as Duration.
    pub fn push_period(&self) -> Duration {
        Duration::from_millis(self.push_period_ms)
    }

    /// Returns the connection URL handed to the socket factory.
    pub fn url(&self) -> String {
        let scheme = if self.insecure { "tcp" } else { "tls" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to PEM-encoded CA certificate(s). Webpki roots are used if unset.
    pub ca_cert_path: Option<PathBuf>,
    /// Server name for SNI (defaults to the host).
    pub server_name: Option<String>,
    /// Skip server certificate verification (development only).
    pub skip_verify: bool,
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    Io(PathBuf, std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = SatelliteClientConfig::default();
        assert_eq!(config.timeout(), Duration::from_millis(3000));
        assert_eq!(config.push_period(), Duration::from_millis(500));
        assert_eq!(config.port, 443);
        assert!(!config.insecure);
        assert_eq!(config.url(), "tls://127.0.0.1:443");
    }

    #[test]
    fn test_validate() {
        use tokio_test::{assert_err, assert_ok};

        assert_err!(SatelliteClientConfig::default().validate());

        let config = SatelliteClientConfig::new("app", "token");
        assert_ok!(config.validate());

        let config = SatelliteClientConfig::new("app", "token").with_address("localhost", 0);
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let config = SatelliteClientConfig::new("app", "token").with_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "app: fake_id\ntoken: fake_token\nhost: 127.0.0.1\nport: 30002\ninsecure: true\ntls:\n  skip_verify: true"
        )
        .unwrap();

        let config = SatelliteClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.app, "fake_id");
        assert_eq!(config.port, 30002);
        assert!(config.insecure);
        assert!(config.tls.skip_verify);
        // Unset keys keep their defaults
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.url(), "tcp://127.0.0.1:30002");
    }

    #[test]
    fn test_from_file_errors() {
        let result = SatelliteClientConfig::from_file("/nonexistent/satellite.yaml");
        assert!(matches!(result, Err(ConfigError::Io(..))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port: not-a-port").unwrap();
        let result = SatelliteClientConfig::from_file(file.path());
        assert!(matches!(result, Err(ConfigError::Parse(..))));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SATELLITE_APP", "other"),
            ("SATELLITE_PORT", "30003"),
            ("SATELLITE_TIMEOUT_MS", "50"),
            ("SATELLITE_INSECURE", "TRUE"),
            ("SATELLITE_PUSH_PERIOD_MS", "bogus"),
        ]
        .into_iter()
        .collect();

        let mut config = SatelliteClientConfig::new("app", "token");
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.app, "other");
        assert_eq!(config.token, "token");
        assert_eq!(config.port, 30003);
        assert_eq!(config.timeout_ms, 50);
        assert!(config.insecure);
        assert_eq!(config.push_period_ms, DEFAULT_PUSH_PERIOD_MS);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = SatelliteClientConfig::new("app", "token").with_insecure(true);
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: SatelliteClientConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }
}
