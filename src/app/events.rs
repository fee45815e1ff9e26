//! Proxy lifecycle events

use serde::Serialize;
use tokio::sync::broadcast;

use crate::proxy::ProxyRequest;

/// Events published to subscribers (UI, analysis hooks)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ProxyEvent {
    /// Listener bound
    Started { port: u16 },

    /// Listener closed
    Stopped,

    /// Request paused awaiting a decision
    RequestIntercepted(ProxyRequest),

    /// Paused request released unchanged
    RequestForwarded(ProxyRequest),

    /// Paused request edited and released
    RequestModified(ProxyRequest),

    /// Paused request discarded
    RequestDropped(ProxyRequest),

    /// Upstream response captured
    RequestCompleted(ProxyRequest),

    /// Upstream or client failure
    RequestError(ProxyRequest),

    /// Repeater round trip finished
    RepeaterRequestSent(ProxyRequest),

    /// Server-level failure
    Error { cause: String },
}

impl ProxyEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            ProxyEvent::Started { .. } => "started",
            ProxyEvent::Stopped => "stopped",
            ProxyEvent::RequestIntercepted(_) => "requestIntercepted",
            ProxyEvent::RequestForwarded(_) => "requestForwarded",
            ProxyEvent::RequestModified(_) => "requestModified",
            ProxyEvent::RequestDropped(_) => "requestDropped",
            ProxyEvent::RequestCompleted(_) => "requestCompleted",
            ProxyEvent::RequestError(_) => "requestError",
            ProxyEvent::RepeaterRequestSent(_) => "repeaterRequestSent",
            ProxyEvent::Error { .. } => "error",
        }
    }

    /// The request the event is about, if any
    pub fn request(&self) -> Option<&ProxyRequest> {
        match self {
            ProxyEvent::RequestIntercepted(r)
            | ProxyEvent::RequestForwarded(r)
            | ProxyEvent::RequestModified(r)
            | ProxyEvent::RequestDropped(r)
            | ProxyEvent::RequestCompleted(r)
            | ProxyEvent::RequestError(r)
            | ProxyEvent::RepeaterRequestSent(r) => Some(r),
            ProxyEvent::Started { .. } | ProxyEvent::Stopped | ProxyEvent::Error { .. } => None,
        }
    }
}

/// Fire-and-forget event fan-out.
///
/// Publishing never waits on subscribers; a subscriber that falls more than
/// the channel capacity behind sees `RecvError::Lagged` and skips ahead.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProxyEvent>,
}

impl EventBus {
    const CAPACITY: usize = 256;

    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(Self::CAPACITY);
        Self { tx }
    }

    /// Publish an event
    pub fn publish(&self, event: ProxyEvent) {
        tracing::trace!(event = event.name(), "Publishing proxy event");
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
