//! HTTP/1.x plumbing shared by the proxy
//!
//! Header storage and message framing used by the forwarder and the
//! connection dispatcher.

pub mod codec;
mod headers;

pub use codec::{BodyFraming, CodecError, Overflow, RequestHead, ResponseHead, Transfer};
pub use headers::Headers;
