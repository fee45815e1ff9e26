//! Intercepting proxy module
//!
//! Accepts proxy connections, records every request in the ledger, pauses
//! requests for operator decisions, forwards plain HTTP, tunnels CONNECT, and
//! replays one-off requests.

mod forward;
mod history;
mod intercept;
mod repeater;
mod request;
mod server;
mod tls;
mod tunnel;

pub use forward::Forwarder;
pub use history::RequestLedger;
pub use intercept::InterceptDecision;
pub use repeater::{RepeaterRequest, ReplayClient};
pub use request::{ProxyRequest, ProxyResponse, RequestModification, RequestStatus};
pub use server::{ProxyServer, ProxyServerConfig, ProxyStatus};
pub use tls::{CertificateAuthority, CA_KEY_BITS, CA_VALIDITY_YEARS};
pub use tunnel::TunnelManager;
