use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tb_shared::{ClientError, Result};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Callback form of a pending request; invoked exactly once.
pub type ResponseCallback = Box<dyn FnOnce(Result<Value>) + Send + 'static>;

enum Responder {
    Waiter(oneshot::Sender<Result<Value>>),
    Callback(ResponseCallback),
}

impl Responder {
    fn deliver(self, result: Result<Value>) {
        match self {
            Responder::Waiter(tx) => {
                // the waiter may have given up already
                let _ = tx.send(result);
            }
            Responder::Callback(callback) => callback(result),
        }
    }
}

struct PendingRequest {
    response_topic: String,
    timeout: Duration,
    deadline: Instant,
    responder: Responder,
}

struct TrackerState {
    last_id: u32,
    pending: HashMap<u32, PendingRequest>,
}

/// Correlates outbound requests with the responses that echo their id.
#[derive(Clone)]
pub struct RequestTracker {
    max_id: u32,
    state: Arc<Mutex<TrackerState>>,
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::with_max_id(u32::MAX)
    }

    /// Tracker whose ids wrap after `max_id`.
    pub fn with_max_id(max_id: u32) -> Self {
        Self {
            max_id: max_id.max(1),
            state: Arc::new(Mutex::new(TrackerState {
                last_id: 0,
                pending: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn allocate(&self, state: &mut TrackerState) -> Result<u32> {
        let candidate = if state.last_id >= self.max_id { 1 } else { state.last_id + 1 };
        if state.pending.contains_key(&candidate) {
            return Err(ClientError::RequestIdsExhausted);
        }
        state.last_id = candidate;
        Ok(candidate)
    }

    /// Allocates an id without registering a pending entry.
    pub fn reserve_id(&self) -> Result<u32> {
        let mut state = self.lock();
        self.allocate(&mut state)
    }

    fn register(
        &self,
        response_topic: impl FnOnce(u32) -> String,
        timeout: Duration,
        responder: Responder,
    ) -> Result<u32> {
        let mut state = self.lock();
        let id = self.allocate(&mut state)?;
        let topic = response_topic(id);
        debug!("Registered request {} awaiting {}", id, topic);
        state.pending.insert(
            id,
            PendingRequest {
                response_topic: topic,
                timeout,
                deadline: Instant::now() + timeout,
                responder,
            },
        );
        Ok(id)
    }

    /// Registers a request whose caller will `wait` for the response.
    pub fn begin_wait(
        &self,
        response_topic: impl FnOnce(u32) -> String,
        timeout: Duration,
    ) -> Result<PendingResponse> {
        let (tx, rx) = oneshot::channel();
        let id = self.register(response_topic, timeout, Responder::Waiter(tx))?;
        Ok(PendingResponse {
            id,
            timeout,
            rx,
            tracker: self.clone(),
        })
    }

    /// Registers a request answered through `callback`.
    pub fn begin_callback(
        &self,
        response_topic: impl FnOnce(u32) -> String,
        timeout: Duration,
        callback: impl FnOnce(Result<Value>) + Send + 'static,
    ) -> Result<u32> {
        self.register(response_topic, timeout, Responder::Callback(Box::new(callback)))
    }

    /// Resolves the request `id` if it is pending and `topic` is the topic it
    /// expects. Unknown, already resolved or mismatched responses are dropped.
    pub fn resolve(&self, id: u32, topic: &str, result: Result<Value>) -> bool {
        let entry = {
            let mut state = self.lock();
            let expected = state.pending.get(&id).map(|pending| pending.response_topic.clone());
            match expected {
                Some(expected) if expected == topic => state.pending.remove(&id),
                Some(expected) => {
                    warn!(
                        "Response for request {} arrived on {} instead of {}, discarding",
                        id, topic, expected
                    );
                    None
                }
                None => {
                    debug!("No pending request {} for response on {}, discarding", id, topic);
                    None
                }
            }
        };

        match entry {
            Some(pending) => {
                pending.responder.deliver(result);
                true
            }
            None => false,
        }
    }

    fn take(&self, id: u32) -> Option<PendingRequest> {
        self.lock().pending.remove(&id)
    }

    /// Drops a pending request without notifying it. Used when the request
    /// never reached the transport and the caller gets the error directly.
    pub fn withdraw(&self, id: u32) -> bool {
        self.take(id).is_some()
    }

    /// Cancels a pending request; its waiter sees `Cancelled`, not `Timeout`.
    pub fn cancel(&self, id: u32) -> bool {
        match self.take(id) {
            Some(pending) => {
                pending.responder.deliver(Err(ClientError::Cancelled(id)));
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(u32, PendingRequest)> = self.lock().pending.drain().collect();
        let count = drained.len();
        for (id, pending) in drained {
            pending.responder.deliver(Err(ClientError::Cancelled(id)));
        }
        count
    }

    /// Fails every request whose deadline has passed.
    pub fn expire(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(u32, PendingRequest)> = {
            let mut state = self.lock();
            let ids: Vec<u32> = state
                .pending
                .iter()
                .filter(|(_, pending)| pending.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.pending.remove(&id).map(|p| (id, p)))
                .collect()
        };

        let count = expired.len();
        for (id, pending) in expired {
            warn!("Request {} timed out waiting for {}", id, pending.response_topic);
            let timeout = pending.timeout;
            pending.responder.deliver(Err(ClientError::Timeout { id, timeout }));
        }
        count
    }

    pub fn is_pending(&self, id: u32) -> bool {
        self.lock().pending.contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}

/// Blocking half of a request registered with [`RequestTracker::begin_wait`].
pub struct PendingResponse {
    id: u32,
    timeout: Duration,
    rx: oneshot::Receiver<Result<Value>>,
    tracker: RequestTracker,
}

impl PendingResponse {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub async fn wait(mut self) -> Result<Value> {
        match tokio::time::timeout(self.timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Cancelled(self.id)),
            Err(_) => {
                if self.tracker.take(self.id).is_none() {
                    // resolved concurrently with the deadline
                    if let Ok(result) = self.rx.try_recv() {
                        return result;
                    }
                }
                Err(ClientError::Timeout { id: self.id, timeout: self.timeout })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn topic(id: u32) -> String {
        format!("v1/devices/me/rpc/response/{}", id)
    }

    #[tokio::test]
    async fn test_resolve_wakes_waiter() {
        let tracker = RequestTracker::new();
        let pending = tracker.begin_wait(topic, Duration::from_secs(5)).unwrap();
        let id = pending.id();

        assert!(tracker.resolve(id, &topic(id), Ok(json!({"ok": true}))));
        assert_eq!(pending.wait().await.unwrap(), json!({"ok": true}));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_monotonic() {
        let tracker = RequestTracker::new();
        let a = tracker.begin_wait(topic, Duration::from_secs(5)).unwrap();
        let b = tracker.begin_wait(topic, Duration::from_secs(5)).unwrap();
        assert!(b.id() > a.id());
        assert_eq!(tracker.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_or_duplicate_response_is_discarded() {
        let tracker = RequestTracker::new();
        let first = tracker.begin_wait(topic, Duration::from_secs(5)).unwrap();
        let second = tracker.begin_wait(topic, Duration::from_secs(5)).unwrap();
        let (first_id, second_id) = (first.id(), second.id());

        assert!(!tracker.resolve(999, &topic(999), Ok(json!(1))));
        assert!(tracker.resolve(first_id, &topic(first_id), Ok(json!(1))));
        assert!(!tracker.resolve(first_id, &topic(first_id), Ok(json!(2))));
        // wrong topic leaves the entry alone
        assert!(!tracker.resolve(second_id, "v1/devices/me/attributes/response/2", Ok(json!(3))));

        assert_eq!(first.wait().await.unwrap(), json!(1));
        assert!(tracker.is_pending(second_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let tracker = RequestTracker::new();
        let pending = tracker.begin_wait(topic, Duration::from_secs(1)).unwrap();

        let result = pending.wait().await;
        assert!(matches!(result, Err(ClientError::Timeout { .. })));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_is_distinguishable_from_timeout() {
        let tracker = RequestTracker::new();
        let pending = tracker.begin_wait(topic, Duration::from_secs(30)).unwrap();
        let id = pending.id();

        let waiter = tokio::spawn(pending.wait());
        assert!(tracker.cancel(id));
        assert!(!tracker.cancel(id));

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ClientError::Cancelled(cancelled)) if cancelled == id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_invokes_callback_with_timeout() {
        let tracker = RequestTracker::new();
        let timeouts = Arc::new(AtomicUsize::new(0));
        let counter = timeouts.clone();

        tracker
            .begin_callback(topic, Duration::from_secs(2), move |result| {
                if matches!(result, Err(ClientError::Timeout { .. })) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        assert_eq!(tracker.expire(), 0);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(tracker.expire(), 1);
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wrapping_fails_fast_on_pending_id() {
        let tracker = RequestTracker::with_max_id(2);
        let first = tracker.begin_callback(topic, Duration::from_secs(5), |_| {}).unwrap();
        let second = tracker.begin_callback(topic, Duration::from_secs(5), |_| {}).unwrap();
        assert_eq!((first, second), (1, 2));

        let exhausted = tracker.begin_callback(topic, Duration::from_secs(5), |_| {});
        assert!(matches!(exhausted, Err(ClientError::RequestIdsExhausted)));

        assert!(tracker.resolve(1, &topic(1), Ok(Value::Null)));
        assert_eq!(tracker.begin_callback(topic, Duration::from_secs(5), |_| {}).unwrap(), 1);
    }

    #[test]
    fn test_cancel_all() {
        let tracker = RequestTracker::new();
        tracker.begin_callback(topic, Duration::from_secs(5), |_| {}).unwrap();
        tracker.begin_callback(topic, Duration::from_secs(5), |_| {}).unwrap();
        assert_eq!(tracker.cancel_all(), 2);
        assert_eq!(tracker.pending_count(), 0);
    }
}
