//! Per-client accounting state and the global demand counter.
//!
//! Sessions are keyed by client identifier. The map lock is held only for
//! lookup and insertion; every session carries its own async mutex, so
//! handlers working on different clients never serialize against each
//! other while a single client's counter and buffer stay consistent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

use crate::gateway::QueueId;

/// Accounting for one client's outstanding work.
#[derive(Debug, Default)]
pub struct ClientSession {
    /// Dispatched-but-unacknowledged batches. Never negative in a healthy
    /// system; a negative value signals duplicate or reordered delivery.
    pub pending_batches: i64,
    /// Accumulated per-batch result bodies.
    pub buffer: String,
    /// Reply queue handle, created when the first completion notice is
    /// published.
    pub reply_queue: Option<QueueId>,
}

impl ClientSession {
    /// Appends one batch result to the accumulated buffer.
    pub fn append_result(&mut self, body: &str) {
        if body.is_empty() {
            return;
        }
        if !self.buffer.is_empty() {
            self.buffer.push('\n');
        }
        self.buffer.push_str(body);
    }
}

/// Concurrent map of live client sessions.
pub struct SessionMap {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<ClientSession>>>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the session for a client, creating it if absent.
    ///
    /// Both the dispatch and result paths call this, so a result arriving
    /// before its submission is fully recorded still finds a session.
    pub fn get_or_create(&self, client_id: &str) -> Arc<AsyncMutex<ClientSession>> {
        let mut sessions = self.inner.lock().expect("session map poisoned");
        Arc::clone(
            sessions
                .entry(client_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(ClientSession::default()))),
        )
    }

    /// Removes a client's session, returning it if present.
    pub fn remove(&self, client_id: &str) -> Option<Arc<AsyncMutex<ClientSession>>> {
        let mut sessions = self.inner.lock().expect("session map poisoned");
        sessions.remove(client_id)
    }

    /// Returns whether any session is live.
    pub fn is_empty(&self) -> bool {
        let sessions = self.inner.lock().expect("session map poisoned");
        sessions.is_empty()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        let sessions = self.inner.lock().expect("session map poisoned");
        sessions.len()
    }

    /// Sum of `pending_batches` across all live sessions.
    ///
    /// Intended for invariant checks; acquires each session lock in turn.
    pub async fn pending_total(&self) -> i64 {
        let sessions: Vec<Arc<AsyncMutex<ClientSession>>> = {
            let map = self.inner.lock().expect("session map poisoned");
            map.values().map(Arc::clone).collect()
        };

        let mut total = 0;
        for session in sessions {
            total += session.lock().await.pending_batches;
        }
        total
    }
}

impl Default for SessionMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide count of in-flight batches across all clients.
///
/// Signed so that an erroneous negative excursion is observable rather
/// than wrapping.
#[derive(Debug, Default)]
pub struct DemandCounter(AtomicI64);

impl DemandCounter {
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    /// Increments the counter, returning the new value.
    pub fn increment(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrements the counter, returning the new value.
    pub fn decrement(&self) -> i64 {
        self.0.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Current value.
    pub fn current(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Reply queues created so far, tracked so teardown can delete them.
#[derive(Debug, Default)]
pub struct ReplyQueueRegistry {
    inner: Mutex<Vec<QueueId>>,
}

impl ReplyQueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a reply queue for later deletion.
    pub fn record(&self, queue: QueueId) {
        let mut queues = self.inner.lock().expect("reply registry poisoned");
        if !queues.contains(&queue) {
            queues.push(queue);
        }
    }

    /// Takes every recorded reply queue.
    pub fn drain(&self) -> Vec<QueueId> {
        let mut queues = self.inner.lock().expect("reply registry poisoned");
        std::mem::take(&mut *queues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_result() {
        let mut session = ClientSession::default();
        session.append_result("first");
        session.append_result("");
        session.append_result("second");

        assert_eq!(session.buffer, "first\nsecond");
    }

    #[test]
    fn test_get_or_create_returns_same_session() {
        let map = SessionMap::new();
        let a = map.get_or_create("client-1");
        let b = map.get_or_create("client-1");

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_remove() {
        let map = SessionMap::new();
        map.get_or_create("client-1");

        assert!(map.remove("client-1").is_some());
        assert!(map.remove("client-1").is_none());
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_pending_total() {
        let map = SessionMap::new();
        map.get_or_create("a").lock().await.pending_batches = 2;
        map.get_or_create("b").lock().await.pending_batches = 3;

        assert_eq!(map.pending_total().await, 5);
    }

    #[test]
    fn test_demand_counter() {
        let demand = DemandCounter::new();

        assert_eq!(demand.increment(), 1);
        assert_eq!(demand.increment(), 2);
        assert_eq!(demand.decrement(), 1);
        assert_eq!(demand.current(), 1);
        assert_eq!(demand.decrement(), 0);
        assert_eq!(demand.decrement(), -1);
    }

    #[test]
    fn test_reply_registry_deduplicates() {
        let registry = ReplyQueueRegistry::new();
        registry.record(QueueId("reply-a".to_string()));
        registry.record(QueueId("reply-a".to_string()));
        registry.record(QueueId("reply-b".to_string()));

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.drain().is_empty());
    }
}
