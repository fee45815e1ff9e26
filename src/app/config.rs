//! Application configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Proxy settings
    pub proxy: ProxyConfig,

    /// Certificate authority settings
    pub certificates: CertificateConfig,

    /// Repeater settings
    pub repeater: RepeaterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory (defaults to the platform data dir)
    pub data_dir: Option<PathBuf>,

    /// Maximum entries kept in the request history
    pub max_history_items: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy listen address
    pub listen_addr: String,

    /// Default proxy port
    pub default_port: u16,

    /// Pause requests for review before forwarding
    pub intercept_enabled: bool,

    /// Log every proxied request
    pub log_enabled: bool,

    /// Request size limit in bytes
    pub max_request_size: usize,

    /// Response bytes captured into history
    pub max_response_size: usize,

    /// Upstream connect/response timeout in seconds
    pub upstream_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CertificateConfig {
    /// Directory holding ca.crt and ca.key
    pub storage_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepeaterConfig {
    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Accept invalid upstream TLS certificates
    pub accept_invalid_certs: bool,

    /// User agent sent when the request has none
    pub user_agent: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_history_items: 10_000,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            default_port: 8080,
            intercept_enabled: true,
            log_enabled: true,
            max_request_size: 10 * 1024 * 1024,  // 10MB
            max_response_size: 50 * 1024 * 1024, // 50MB
            upstream_timeout_secs: 30,
        }
    }
}

impl Default for RepeaterConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            accept_invalid_certs: false,
            user_agent: format!("Waylay/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ProxyConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: Option<&str>) -> Result<Self> {
        let (config_path, explicit) = match path {
            Some(p) => (PathBuf::from(p), true),
            None => (Self::default_config_path()?, false),
        };

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(|source| {
                ConfigError::ReadError {
                    path: config_path.display().to_string(),
                    source,
                }
            })?;

            let config: Config = toml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?;

            tracing::info!("Loaded configuration from {:?}", config_path);
            Ok(config)
        } else if explicit {
            Err(ConfigError::NotFound(config_path.display().to_string()).into())
        } else {
            tracing::info!("No configuration file found, using defaults");
            Ok(Self::default())
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy.max_request_size == 0 {
            return Err(invalid("proxy.max_request_size", "must be greater than 0"));
        }
        if self.proxy.max_response_size == 0 {
            return Err(invalid("proxy.max_response_size", "must be greater than 0"));
        }
        if self.proxy.upstream_timeout_secs == 0 {
            return Err(invalid("proxy.upstream_timeout_secs", "must be greater than 0"));
        }
        if self.repeater.timeout_secs == 0 {
            return Err(invalid("repeater.timeout_secs", "must be greater than 0"));
        }
        if self.general.max_history_items == 0 {
            return Err(invalid("general.max_history_items", "must be greater than 0"));
        }
        if self.proxy.listen_addr.parse::<std::net::IpAddr>().is_err() {
            return Err(invalid("proxy.listen_addr", "must be an IP address"));
        }
        Ok(())
    }

    /// Directory holding the CA key pair
    pub fn certificate_dir(&self) -> Result<PathBuf> {
        match &self.certificates.storage_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.resolved_data_dir()?.join("certs")),
        }
    }

    /// Data directory, honouring the configured override
    pub fn resolved_data_dir(&self) -> Result<PathBuf> {
        match &self.general.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Self::data_dir(),
        }
    }

    /// Get default configuration file path
    fn default_config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("io", "waylay", "waylay")
            .context("Failed to determine config directory")?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Get data directory path
    pub fn data_dir() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("io", "waylay", "waylay")
            .context("Failed to determine data directory")?;

        Ok(dirs.data_dir().to_path_buf())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.proxy.default_port, 8080);
        assert!(config.proxy.intercept_enabled);
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [proxy]
            default_port = 9090
            intercept_enabled = false

            [certificates]
            storage_dir = "/tmp/waylay-certs"
            "#,
        )
        .unwrap();

        assert_eq!(config.proxy.default_port, 9090);
        assert!(!config.proxy.intercept_enabled);
        assert_eq!(config.proxy.listen_addr, "127.0.0.1");
        assert_eq!(
            config.certificate_dir().unwrap(),
            PathBuf::from("/tmp/waylay-certs")
        );
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let mut config = Config::default();
        config.proxy.upstream_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_explicit_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        assert!(Config::load(path.to_str()).is_err());
    }
}
