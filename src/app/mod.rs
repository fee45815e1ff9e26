//! Application core module
//!
//! Configuration and the event bus shared between the proxy and its
//! consumers.

mod config;
mod events;

pub use config::{CertificateConfig, Config, GeneralConfig, ProxyConfig, RepeaterConfig};
pub use events::{EventBus, ProxyEvent};
