//! Waylay - interactive intercepting HTTP proxy
//!
//! Sits between a client and the servers it talks to, records every
//! request, and lets an operator pause, edit, forward or drop plain HTTP
//! requests before they leave. HTTPS is tunneled opaquely via CONNECT; a
//! private root CA is generated on first start for later TLS interception.

pub mod app;
pub mod error;
pub mod http;
pub mod proxy;

pub use error::{ConfigError, ProxyError, UserHint};
pub use proxy::{ProxyServer, ProxyServerConfig, ProxyStatus};
