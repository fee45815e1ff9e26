//! Proxy request history and the paused-request index

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

use super::intercept::{decision_channel, DecisionReceiver, DecisionSender, InterceptDecision};
use super::request::{ProxyRequest, ProxyResponse, RequestModification, RequestStatus};
use crate::app::{EventBus, ProxyEvent};
use crate::error::ProxyError;

/// Record of every transaction seen this session.
///
/// History is append-only in arrival order. Paused requests live in a
/// separate index keyed by id and leave it atomically when decided. All
/// mutation happens behind one lock, and events are published while it is
/// held so each request's events reach subscribers in transition order.
pub struct RequestLedger {
    inner: Mutex<LedgerInner>,
    events: EventBus,
    max_entries: usize,
}

#[derive(Default)]
struct LedgerInner {
    records: HashMap<Uuid, ProxyRequest>,
    /// Oldest first
    order: VecDeque<Uuid>,
    paused: HashMap<Uuid, DecisionSender>,
    /// Live requests whose history entry was cleared
    detached: HashSet<Uuid>,
}

impl LedgerInner {
    fn advance(&mut self, id: Uuid, next: RequestStatus) -> Option<&mut ProxyRequest> {
        let record = self.records.get_mut(&id)?;
        if !record.status.can_transition_to(next) {
            tracing::warn!(
                request_id = %id,
                from = %record.status,
                to = %next,
                "Rejected invalid status transition"
            );
            return None;
        }
        record.status = next;
        Some(record)
    }

    /// Forget a detached request once it reaches a terminal state
    fn release_if_detached(&mut self, id: Uuid) {
        if self.detached.remove(&id) {
            self.records.remove(&id);
        }
    }

    /// Drop the oldest finished entries until history fits. Live requests
    /// are never evicted, so history may run over the bound while they are
    /// in flight; the excess goes on the next append.
    fn evict_over(&mut self, max_entries: usize) {
        while self.order.len() > max_entries {
            let records = &self.records;
            let finished = |id: &Uuid| records.get(id).map_or(true, |r| r.status.is_terminal());
            let Some(pos) = self.order.iter().position(finished) else {
                break;
            };
            if let Some(id) = self.order.remove(pos) {
                self.records.remove(&id);
            }
        }
    }
}

impl RequestLedger {
    pub fn new(max_entries: usize, events: EventBus) -> Self {
        Self {
            inner: Mutex::new(LedgerInner::default()),
            events,
            max_entries: max_entries.max(1),
        }
    }

    /// Append a new request to history
    pub fn record(&self, request: ProxyRequest) -> Uuid {
        let id = request.id;
        let mut inner = self.inner.lock();
        inner.records.insert(id, request);
        inner.order.push_back(id);
        inner.evict_over(self.max_entries);
        id
    }

    /// Attach the buffered request body
    pub fn set_body(&self, id: Uuid, body: Option<Vec<u8>>) {
        if let Some(record) = self.inner.lock().records.get_mut(&id) {
            record.body = body.filter(|b| !b.is_empty());
        }
    }

    /// Park a pending request until an operator decides
    pub(crate) fn pause(&self, id: Uuid) -> Option<DecisionReceiver> {
        let mut inner = self.inner.lock();
        let snapshot = inner.advance(id, RequestStatus::Intercepted)?.clone();
        let (tx, rx) = decision_channel();
        inner.paused.insert(id, tx);
        self.events.publish(ProxyEvent::RequestIntercepted(snapshot));
        Some(rx)
    }

    /// Release a paused request unchanged
    pub fn forward(&self, id: Uuid) -> Result<ProxyRequest, ProxyError> {
        let mut inner = self.inner.lock();
        let tx = inner.paused.remove(&id).ok_or(ProxyError::UnknownRequest(id))?;

        let snapshot = inner
            .advance(id, RequestStatus::Forwarded)
            .ok_or(ProxyError::UnknownRequest(id))?
            .clone();
        self.events.publish(ProxyEvent::RequestForwarded(snapshot.clone()));
        self.deliver(&mut inner, id, tx, InterceptDecision::Forward(snapshot.clone()));
        Ok(snapshot)
    }

    /// Apply operator edits to a paused request and release it
    pub fn modify(&self, id: Uuid, changes: RequestModification) -> Result<ProxyRequest, ProxyError> {
        changes.validate()?;

        let mut inner = self.inner.lock();
        if !inner.paused.contains_key(&id) {
            return Err(ProxyError::UnknownRequest(id));
        }

        let record = inner
            .advance(id, RequestStatus::Modified)
            .ok_or(ProxyError::UnknownRequest(id))?;
        changes.apply(record);
        let modified = record.clone();
        self.events.publish(ProxyEvent::RequestModified(modified.clone()));

        let forwarded = inner
            .advance(id, RequestStatus::Forwarded)
            .cloned()
            .unwrap_or_else(|| modified.clone());
        if let Some(tx) = inner.paused.remove(&id) {
            self.deliver(&mut inner, id, tx, InterceptDecision::Forward(forwarded));
        }
        Ok(modified)
    }

    /// Discard a paused request
    pub fn drop_request(&self, id: Uuid) -> Result<ProxyRequest, ProxyError> {
        let mut inner = self.inner.lock();
        let tx = inner.paused.remove(&id).ok_or(ProxyError::UnknownRequest(id))?;

        let snapshot = inner
            .advance(id, RequestStatus::Dropped)
            .ok_or(ProxyError::UnknownRequest(id))?
            .clone();
        // Dropped is terminal whether or not the client is still there
        let _ = tx.send(InterceptDecision::Drop);
        self.events.publish(ProxyEvent::RequestDropped(snapshot.clone()));
        inner.release_if_detached(id);
        Ok(snapshot)
    }

    fn deliver(&self, inner: &mut LedgerInner, id: Uuid, tx: DecisionSender, decision: InterceptDecision) {
        if tx.send(decision).is_err() {
            tracing::warn!(request_id = %id, "Client disconnected before the decision arrived");
            if let Some(record) = inner.advance(id, RequestStatus::Error) {
                record.error = Some("client disconnected while paused".to_string());
                let snapshot = record.clone();
                self.events.publish(ProxyEvent::RequestError(snapshot));
                inner.release_if_detached(id);
            }
        }
    }

    /// Resolve a paused request whose client went away
    pub(crate) fn abandon(&self, id: Uuid, reason: &str) -> Option<ProxyRequest> {
        let mut inner = self.inner.lock();
        inner.paused.remove(&id)?;
        let record = inner.advance(id, RequestStatus::Error)?;
        record.error = Some(reason.to_string());
        let snapshot = record.clone();
        self.events.publish(ProxyEvent::RequestError(snapshot.clone()));
        inner.release_if_detached(id);
        Some(snapshot)
    }

    /// Mark a request completed with its response
    pub(crate) fn complete(&self, id: Uuid, response: Option<ProxyResponse>) -> Option<ProxyRequest> {
        let mut inner = self.inner.lock();
        let record = inner.advance(id, RequestStatus::Completed)?;
        record.response = response;
        let snapshot = record.clone();
        self.events.publish(ProxyEvent::RequestCompleted(snapshot.clone()));
        inner.release_if_detached(id);
        Some(snapshot)
    }

    /// Mark a request failed
    pub(crate) fn fail(&self, id: Uuid, reason: &str) -> Option<ProxyRequest> {
        let mut inner = self.inner.lock();
        let record = inner.advance(id, RequestStatus::Error)?;
        record.error = Some(reason.to_string());
        let snapshot = record.clone();
        self.events.publish(ProxyEvent::RequestError(snapshot.clone()));
        inner.release_if_detached(id);
        Some(snapshot)
    }

    /// Get entry by ID
    pub fn get(&self, id: Uuid) -> Option<ProxyRequest> {
        self.inner.lock().records.get(&id).cloned()
    }

    /// All history entries, newest first
    pub fn all(&self) -> Vec<ProxyRequest> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.records.get(id).cloned())
            .collect()
    }

    /// Currently paused requests, oldest first
    pub fn paused(&self) -> Vec<ProxyRequest> {
        let inner = self.inner.lock();
        let mut paused: Vec<ProxyRequest> = inner
            .paused
            .keys()
            .filter_map(|id| inner.records.get(id).cloned())
            .collect();
        paused.sort_by_key(|r| r.timestamp);
        paused
    }

    pub fn is_paused(&self, id: Uuid) -> bool {
        self.inner.lock().paused.contains_key(&id)
    }

    pub fn paused_count(&self) -> usize {
        self.inner.lock().paused.len()
    }

    /// Number of history entries
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the history.
    ///
    /// Requests still in flight (paused ones included) are detached rather
    /// than forgotten, so they stay decidable and still report completion.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.order.clear();
        let LedgerInner { records, detached, .. } = &mut *inner;
        records.retain(|id, record| {
            let live = !record.status.is_terminal();
            if live {
                detached.insert(*id);
            }
            live
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Headers;

    fn ledger() -> RequestLedger {
        RequestLedger::new(100, EventBus::new())
    }

    fn request(path: &str) -> ProxyRequest {
        ProxyRequest::new("GET", &format!("http://example.com{}", path), Headers::new())
    }

    #[test]
    fn test_history_newest_first() {
        let ledger = ledger();
        let first = ledger.record(request("/1"));
        let second = ledger.record(request("/2"));

        let all = ledger.all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, second);
        assert_eq!(all[1].id, first);
    }

    #[test]
    fn test_forward_is_not_idempotent() {
        let ledger = ledger();
        let id = ledger.record(request("/"));
        let _rx = ledger.pause(id).unwrap();
        assert!(ledger.is_paused(id));

        let forwarded = ledger.forward(id).unwrap();
        assert_eq!(forwarded.status, RequestStatus::Forwarded);
        assert!(!ledger.is_paused(id));

        assert!(matches!(ledger.forward(id), Err(ProxyError::UnknownRequest(u)) if u == id));
        assert!(matches!(ledger.drop_request(id), Err(ProxyError::UnknownRequest(_))));
        assert!(matches!(
            ledger.modify(id, RequestModification::default()),
            Err(ProxyError::UnknownRequest(_))
        ));
    }

    #[test]
    fn test_unknown_id_leaves_ledger_untouched() {
        let ledger = ledger();
        let id = ledger.record(request("/"));
        let before = ledger.get(id).unwrap();

        assert!(ledger.forward(id).is_err());
        assert!(ledger.drop_request(Uuid::new_v4()).is_err());
        assert_eq!(ledger.get(id).unwrap(), before);
    }

    #[test]
    fn test_drop_delivers_decision() {
        let ledger = ledger();
        let id = ledger.record(request("/"));
        let mut rx = ledger.pause(id).unwrap();

        let dropped = ledger.drop_request(id).unwrap();
        assert_eq!(dropped.status, RequestStatus::Dropped);
        assert!(matches!(rx.try_recv(), Ok(InterceptDecision::Drop)));
        assert!(ledger.drop_request(id).is_err());
    }

    #[test]
    fn test_modify_applies_changes_and_forwards() {
        let ledger = ledger();
        let id = ledger.record(request("/"));
        let mut rx = ledger.pause(id).unwrap();

        let mut headers = Headers::new();
        headers.append("X-Test", "1");
        let modified = ledger
            .modify(
                id,
                RequestModification {
                    headers: Some(headers),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(modified.status, RequestStatus::Modified);
        match rx.try_recv() {
            Ok(InterceptDecision::Forward(r)) => {
                assert_eq!(r.headers.get("x-test"), Some("1"));
                assert_eq!(r.status, RequestStatus::Forwarded);
            }
            other => panic!("unexpected decision: {:?}", other),
        }
        assert_eq!(ledger.get(id).unwrap().status, RequestStatus::Forwarded);
    }

    #[test]
    fn test_invalid_modification_keeps_request_paused() {
        let ledger = ledger();
        let id = ledger.record(request("/"));
        let _rx = ledger.pause(id).unwrap();

        let result = ledger.modify(
            id,
            RequestModification {
                url: Some("::nope::".into()),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(ProxyError::MalformedInput(_))));
        assert!(ledger.is_paused(id));
        assert_eq!(ledger.get(id).unwrap().status, RequestStatus::Intercepted);
    }

    #[test]
    fn test_forward_to_vanished_client_marks_error() {
        let ledger = ledger();
        let id = ledger.record(request("/"));
        let rx = ledger.pause(id).unwrap();
        drop(rx);

        ledger.forward(id).unwrap();
        let record = ledger.get(id).unwrap();
        assert_eq!(record.status, RequestStatus::Error);
        assert!(record.error.is_some());
    }

    #[test]
    fn test_clear_keeps_paused_requests_decidable() {
        let ledger = ledger();
        let done = ledger.record(request("/done"));
        ledger.complete(done, None);
        let held = ledger.record(request("/held"));
        let _rx = ledger.pause(held).unwrap();

        ledger.clear();

        assert!(ledger.is_empty());
        assert!(ledger.get(done).is_none());
        assert_eq!(ledger.paused_count(), 1);
        assert_eq!(ledger.paused()[0].id, held);
        assert!(ledger.forward(held).is_ok());
        assert!(ledger.complete(held, None).is_some());
        assert!(ledger.get(held).is_none());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_eviction_skips_live_entries() {
        let ledger = RequestLedger::new(2, EventBus::new());
        let held = ledger.record(request("/held"));
        let _rx = ledger.pause(held).unwrap();
        let a = ledger.record(request("/a"));
        ledger.complete(a, None);
        let b = ledger.record(request("/b"));

        let ids: Vec<_> = ledger.all().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![b, held]);
        assert!(ledger.get(a).is_none());
        assert!(ledger.is_paused(held));
    }

    #[tokio::test]
    async fn test_in_flight_request_at_capacity_still_completes() {
        let events = EventBus::new();
        let mut rx_events = events.subscribe();
        let ledger = RequestLedger::new(1, events);

        let held = ledger.record(request("/held"));
        let _rx = ledger.pause(held).unwrap();
        let live = ledger.record(request("/live"));
        assert_eq!(ledger.len(), 2);

        let completed = ledger.complete(live, None).unwrap();
        assert_eq!(completed.id, live);
        assert_eq!(rx_events.try_recv().unwrap().name(), "requestIntercepted");
        assert_eq!(rx_events.try_recv().unwrap().name(), "requestCompleted");
        assert_eq!(ledger.get(live).unwrap().status, RequestStatus::Completed);

        // The next append evicts the finished entry, never the paused one
        let next = ledger.record(request("/next"));
        let ids: Vec<_> = ledger.all().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![next, held]);
        assert!(ledger.forward(held).is_ok());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let ledger = ledger();
        let id = ledger.record(request("/"));
        assert!(ledger.complete(id, None).is_some());
        assert!(ledger.fail(id, "late failure").is_none());
        assert!(ledger.pause(id).is_none());
        assert_eq!(ledger.get(id).unwrap().status, RequestStatus::Completed);
    }

    #[test]
    fn test_abandon_only_affects_paused() {
        let ledger = ledger();
        let id = ledger.record(request("/"));
        assert!(ledger.abandon(id, "gone").is_none());

        let _rx = ledger.pause(id).unwrap();
        let abandoned = ledger.abandon(id, "gone").unwrap();
        assert_eq!(abandoned.status, RequestStatus::Error);
        assert_eq!(ledger.paused_count(), 0);
    }

    #[tokio::test]
    async fn test_event_order_for_forwarded_request() {
        let events = EventBus::new();
        let mut rx_events = events.subscribe();
        let ledger = RequestLedger::new(10, events);

        let id = ledger.record(request("/"));
        let _rx = ledger.pause(id).unwrap();
        ledger.forward(id).unwrap();
        ledger.complete(id, None);

        let names: Vec<_> = (0..3)
            .map(|_| rx_events.try_recv().unwrap().name())
            .collect();
        assert_eq!(names, vec!["requestIntercepted", "requestForwarded", "requestCompleted"]);
    }
}
