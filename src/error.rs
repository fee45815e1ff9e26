//! Custom error types for Waylay
//!
//! Provides structured error handling for the proxy control plane
//! and user-friendly error messages.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Proxy service errors
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Failed to start proxy on port {port}: {reason}")]
    StartError { port: u16, reason: String },

    #[error("Proxy is already running")]
    AlreadyRunning,

    #[error("Failed to initialize certificate authority at {}: {reason}", path.display())]
    CertificateInit { path: PathBuf, reason: String },

    #[error("Connection to {target} failed: {reason}")]
    UpstreamConnection { target: String, reason: String },

    #[error("Request with ID {0} not found or already resolved")]
    UnknownRequest(Uuid),

    #[error("Invalid proxy request: {0}")]
    MalformedInput(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {path}")]
    ReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {field} - {reason}")]
    ValidationError { field: String, reason: String },

    #[error("Configuration file not found: {0}")]
    NotFound(String),
}

impl ProxyError {
    pub(crate) fn certificate(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        ProxyError::CertificateInit {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn upstream(target: impl Into<String>, reason: impl ToString) -> Self {
        ProxyError::UpstreamConnection {
            target: target.into(),
            reason: reason.to_string(),
        }
    }
}

/// Trait for providing user-friendly hints
pub trait UserHint {
    fn user_hint(&self) -> String;
}

impl UserHint for ConfigError {
    fn user_hint(&self) -> String {
        match self {
            ConfigError::ReadError { path, .. } => {
                format!("Could not read '{}'. Check if the file exists and you have read permissions.", path)
            }
            ConfigError::ParseError(_) => {
                "The configuration file has invalid syntax. Check for TOML formatting errors.".into()
            }
            ConfigError::ValidationError { field, reason } => {
                format!("Invalid value for '{}': {}", field, reason)
            }
            ConfigError::NotFound(path) => {
                format!("Configuration file '{}' not found. Run with --generate-config to create one.", path)
            }
        }
    }
}

impl UserHint for ProxyError {
    fn user_hint(&self) -> String {
        match self {
            ProxyError::StartError { port, .. } => {
                format!("Could not start proxy on port {}. It may already be in use.", port)
            }
            ProxyError::CertificateInit { path, .. } => {
                format!("Could not set up the CA in '{}'. Check directory permissions.", path.display())
            }
            ProxyError::UnknownRequest(id) => {
                format!("Request {} is not paused. It may have been forwarded or dropped already.", id)
            }
            ProxyError::Config(e) => e.user_hint(),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_hints() {
        let err = ProxyError::StartError {
            port: 8080,
            reason: "address in use".into(),
        };
        assert!(err.user_hint().contains("8080"));

        let err = ProxyError::Config(ConfigError::ValidationError {
            field: "proxy.max_request_size".into(),
            reason: "must be greater than 0".into(),
        });
        assert!(err.user_hint().contains("proxy.max_request_size"));
    }
}
