//! Request/response correlation table.
//!
//! Ties an outbound `request_id` to the task waiting for its response. Each
//! entry owns a single-shot reply channel and two background sweeps: one
//! that fires the alert callback if `alert_deadline` elapses unanswered, one
//! that resolves the waiter with [`KeybridgeError::Timeout`] if
//! `final_deadline` elapses unanswered. An incoming ack pushes both
//! deadlines a full window out from the moment it arrives, so a phone that
//! is still working keeps the request alive instead of it expiring
//! underneath it. A bounded LRU of already-resolved ids lets late, duplicate
//! responses be dropped silently instead of logged as errors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tokio::sync::{oneshot, Notify};
use tokio::time::{sleep_until, Duration, Instant};
use uuid::Uuid;

use crate::config::CapTable;
use crate::errors::KeybridgeError;

use super::protocol::{Response, RequestKind};

/// Callback fired at most once per request when its alert deadline elapses
/// unanswered, or when the phone sends an ack.
pub type AlertCallback = Arc<dyn Fn() + Send + Sync>;

struct PendingRequest {
    reply_tx: Mutex<Option<oneshot::Sender<Result<Response, KeybridgeError>>>>,
    alerted: AtomicBool,
    on_ack: Option<AlertCallback>,
    timeouts: KindTimeouts,
    final_deadline: Mutex<Instant>,
    alert_deadline: Mutex<Option<Instant>>,
    reset: Notify,
}

impl PendingRequest {
    /// An ack extends both deadlines a full window out from now — the
    /// defining effect of an ack per the correlation engine's timeout rules.
    fn extend_on_ack(&self) {
        let now = Instant::now();
        *self.final_deadline.lock().expect("correlation lock poisoned") =
            now + self.timeouts.final_deadline;
        if let Some(alert_after) = self.timeouts.alert_deadline {
            *self.alert_deadline.lock().expect("correlation lock poisoned") = Some(now + alert_after);
        }
        self.reset.notify_waiters();
    }
}

/// Mutex-guarded map of in-flight requests plus a bounded completed-id LRU.
pub struct CorrelationTable {
    pending: Mutex<HashMap<Uuid, Arc<PendingRequest>>>,
    completed: Mutex<LruCache<Uuid, ()>>,
}

impl std::fmt::Debug for CorrelationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("pending_count", &self.pending.lock().expect("correlation lock poisoned").len())
            .finish()
    }
}

/// Final/alert timeout pair for one request kind.
#[derive(Debug, Clone, Copy)]
pub struct KindTimeouts {
    /// Deadline after which the waiter receives [`KeybridgeError::Timeout`].
    pub final_deadline: Duration,
    /// Deadline after which [`AlertCallback`] fires, if still unanswered.
    pub alert_deadline: Option<Duration>,
}

impl CorrelationTable {
    /// New, empty table with the completed-id LRU sized from `caps`.
    #[must_use]
    pub fn new(caps: &CapTable) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            completed: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(caps.completed_requests.max(1))
                    .expect("completed request cap must be nonzero"),
            )),
        })
    }

    /// Register a new outbound request and spawn its deadline sweeps.
    /// Returns the fresh `request_id` and the receiver half of its reply
    /// channel.
    pub fn register(
        self: &Arc<Self>,
        timeouts: KindTimeouts,
        on_ack: Option<AlertCallback>,
    ) -> (Uuid, oneshot::Receiver<Result<Response, KeybridgeError>>) {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();

        let entry = Arc::new(PendingRequest {
            reply_tx: Mutex::new(Some(tx)),
            alerted: AtomicBool::new(false),
            on_ack,
            timeouts,
            final_deadline: Mutex::new(now + timeouts.final_deadline),
            alert_deadline: Mutex::new(timeouts.alert_deadline.map(|d| now + d)),
            reset: Notify::new(),
        });

        self.pending
            .lock()
            .expect("correlation lock poisoned")
            .insert(request_id, Arc::clone(&entry));

        let table = Arc::clone(self);
        let alert_entry = Arc::clone(&entry);
        tokio::spawn(async move { table.run_alert_sweep(request_id, alert_entry).await });

        let table = Arc::clone(self);
        tokio::spawn(async move { table.run_final_sweep(request_id, entry).await });

        (request_id, rx)
    }

    /// Sleep until `alert_deadline`, re-sleeping whenever an ack pushes it
    /// out; fires the alert at most once (`try_fire_alert`'s CAS).
    async fn run_alert_sweep(&self, request_id: Uuid, entry: Arc<PendingRequest>) {
        loop {
            let Some(deadline) = *entry.alert_deadline.lock().expect("correlation lock poisoned") else {
                return;
            };
            tokio::select! {
                _ = sleep_until(deadline) => {
                    let still_due = *entry.alert_deadline.lock().expect("correlation lock poisoned") == Some(deadline);
                    if still_due {
                        try_fire_alert(&entry);
                        return;
                    }
                }
                _ = entry.reset.notified() => {}
            }
            if !self.pending.lock().expect("correlation lock poisoned").contains_key(&request_id) {
                return;
            }
        }
    }

    /// Sleep until `final_deadline`, re-sleeping whenever an ack pushes it
    /// out; resolves the waiter with [`KeybridgeError::Timeout`] once it
    /// truly elapses unanswered.
    async fn run_final_sweep(&self, request_id: Uuid, entry: Arc<PendingRequest>) {
        loop {
            let deadline = *entry.final_deadline.lock().expect("correlation lock poisoned");
            tokio::select! {
                _ = sleep_until(deadline) => {
                    let still_due = *entry.final_deadline.lock().expect("correlation lock poisoned") == deadline;
                    if still_due {
                        self.expire_if_pending(request_id);
                        return;
                    }
                }
                _ = entry.reset.notified() => {}
            }
            if !self.pending.lock().expect("correlation lock poisoned").contains_key(&request_id) {
                return;
            }
        }
    }

    /// Fetch the pending entry for `request_id`, if any, firing its alert
    /// callback (at most once).
    fn fire_alert_if_pending(&self, request_id: Uuid) -> Option<Arc<PendingRequest>> {
        let entry = {
            let pending = self.pending.lock().expect("correlation lock poisoned");
            pending.get(&request_id).cloned()
        };
        if let Some(entry) = &entry {
            try_fire_alert(entry);
        }
        entry
    }

    fn expire_if_pending(&self, request_id: Uuid) {
        let entry = self
            .pending
            .lock()
            .expect("correlation lock poisoned")
            .remove(&request_id);
        if let Some(entry) = entry {
            self.mark_completed(request_id);
            if let Some(tx) = entry.reply_tx.lock().expect("correlation lock poisoned").take() {
                let _ = tx.send(Err(KeybridgeError::Timeout));
            }
            entry.reset.notify_waiters();
        }
    }

    fn mark_completed(&self, request_id: Uuid) {
        self.completed
            .lock()
            .expect("correlation lock poisoned")
            .put(request_id, ());
    }

    /// True if `request_id` has already been resolved (delivered or timed out).
    #[must_use]
    pub fn is_completed(&self, request_id: Uuid) -> bool {
        self.completed
            .lock()
            .expect("correlation lock poisoned")
            .contains(&request_id)
    }

    /// Deliver an inbound [`Response`]. An ack with no final payload extends
    /// both of the request's deadlines a full window out from now and fires
    /// the alert callback (at most once); a final response resolves and
    /// removes it. Unknown or already-completed ids are dropped silently.
    pub fn deliver(&self, response: Response) {
        let is_final = response.me.is_some() || response.sign.is_some() || response.list.is_some();

        if response.ack && !is_final {
            if let Some(entry) = self.fire_alert_if_pending(response.request_id) {
                entry.extend_on_ack();
            }
            return;
        }

        let entry = self
            .pending
            .lock()
            .expect("correlation lock poisoned")
            .remove(&response.request_id);

        match entry {
            Some(entry) => {
                self.mark_completed(response.request_id);
                if let Some(tx) = entry.reply_tx.lock().expect("correlation lock poisoned").take() {
                    let _ = tx.send(Ok(response));
                }
                entry.reset.notify_waiters();
            }
            None => {
                if !self.is_completed(response.request_id) {
                    log::warn!("dropping response for unknown request_id={}", response.request_id);
                }
            }
        }
    }

    /// Fail every currently pending request with `error` (used by `unpair`
    /// and remote-unpair-request handling) and clear the table.
    pub fn cancel_all(&self, error_factory: impl Fn() -> KeybridgeError) {
        let drained: Vec<Arc<PendingRequest>> = {
            let mut pending = self.pending.lock().expect("correlation lock poisoned");
            pending.drain().map(|(_, v)| v).collect()
        };
        for entry in drained {
            if let Some(tx) = entry.reply_tx.lock().expect("correlation lock poisoned").take() {
                let _ = tx.send(Err(error_factory()));
            }
            entry.reset.notify_waiters();
        }
    }

    /// Number of currently pending requests (test/observability use).
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("correlation lock poisoned").len()
    }
}

fn try_fire_alert(entry: &Arc<PendingRequest>) {
    if entry
        .alerted
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        if let Some(on_ack) = &entry.on_ack {
            on_ack();
        }
    }
}

/// Look up the configured final/alert timeouts for a request kind. `Pair`
/// is not a wire request kind (the handshake is driven directly by
/// `EnclaveClient::pair`, see [`crate::config::TimeoutTable::pair`]) and so
/// has no entry here.
#[must_use]
pub fn timeouts_for(kind: RequestKind, table: &crate::config::TimeoutTable) -> KindTimeouts {
    match kind {
        RequestKind::Me => KindTimeouts {
            final_deadline: table.me,
            alert_deadline: Some(table.me_alert),
        },
        RequestKind::Sign => KindTimeouts {
            final_deadline: table.sign,
            alert_deadline: Some(table.sign_alert),
        },
        RequestKind::List => KindTimeouts {
            final_deadline: table.me,
            alert_deadline: Some(table.me_alert),
        },
        RequestKind::NoOp | RequestKind::Unpair => KindTimeouts {
            final_deadline: table.noop,
            alert_deadline: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CapTable;
    use std::sync::atomic::AtomicUsize;

    fn table() -> Arc<CorrelationTable> {
        CorrelationTable::new(&CapTable::default())
    }

    fn response(request_id: Uuid, ack: bool, me: Option<super::super::protocol::MeResponse>) -> Response {
        Response {
            request_id,
            me,
            sign: None,
            list: None,
            ack,
            sns_endpoint: None,
            unpair_request: false,
        }
    }

    #[tokio::test]
    async fn delivers_final_response_to_waiter() {
        let table = self::table();
        let (request_id, rx) = table.register(
            KindTimeouts {
                final_deadline: Duration::from_millis(500),
                alert_deadline: None,
            },
            None,
        );

        table.deliver(response(request_id, false, Some(super::super::protocol::MeResponse {
            fingerprint: "fp".into(),
            public_key: "pk".into(),
            display_name: None,
            supports_rsa_sha2: true,
        })));

        let result = rx.await.unwrap();
        assert!(result.is_ok());
        assert!(table.is_completed(request_id));
    }

    #[tokio::test]
    async fn ack_fires_alert_but_does_not_resolve() {
        let table = self::table();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);

        let (request_id, mut rx) = table.register(
            KindTimeouts {
                final_deadline: Duration::from_millis(500),
                alert_deadline: Some(Duration::from_millis(300)),
            },
            Some(Arc::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );

        table.deliver(response(request_id, true, None));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(table.pending_count(), 1);
    }

    #[tokio::test]
    async fn alert_fires_exactly_once_even_with_duplicate_acks() {
        let table = self::table();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);

        let (request_id, _rx) = table.register(
            KindTimeouts {
                final_deadline: Duration::from_millis(500),
                alert_deadline: Some(Duration::from_millis(300)),
            },
            Some(Arc::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );

        table.deliver(response(request_id, true, None));
        table.deliver(response(request_id, true, None));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_resolves_waiter_after_final_deadline() {
        let table = self::table();
        let (_request_id, rx) = table.register(
            KindTimeouts {
                final_deadline: Duration::from_millis(50),
                alert_deadline: None,
            },
            None,
        );

        let result = tokio::time::timeout(Duration::from_millis(200), rx)
            .await
            .expect("should resolve before outer timeout")
            .unwrap();
        assert!(matches!(result, Err(KeybridgeError::Timeout)));
    }

    #[tokio::test]
    async fn late_response_after_timeout_is_dropped_silently() {
        let table = self::table();
        let (request_id, rx) = table.register(
            KindTimeouts {
                final_deadline: Duration::from_millis(50),
                alert_deadline: None,
            },
            None,
        );
        let _ = rx.await;
        assert!(table.is_completed(request_id));

        table.deliver(response(request_id, false, Some(super::super::protocol::MeResponse {
            fingerprint: "fp".into(),
            public_key: "pk".into(),
            display_name: None,
            supports_rsa_sha2: true,
        })));
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_all_fails_every_pending_waiter() {
        let table = self::table();
        let (_a, rx_a) = table.register(
            KindTimeouts {
                final_deadline: Duration::from_secs(5),
                alert_deadline: None,
            },
            None,
        );
        let (_b, rx_b) = table.register(
            KindTimeouts {
                final_deadline: Duration::from_secs(5),
                alert_deadline: None,
            },
            None,
        );

        table.cancel_all(|| KeybridgeError::NotPaired);

        assert!(matches!(rx_a.await.unwrap(), Err(KeybridgeError::NotPaired)));
        assert!(matches!(rx_b.await.unwrap(), Err(KeybridgeError::NotPaired)));
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn ack_extends_the_final_deadline_past_its_original_value() {
        let table = self::table();
        let (request_id, rx) = table.register(
            KindTimeouts {
                final_deadline: Duration::from_millis(150),
                alert_deadline: Some(Duration::from_millis(50)),
            },
            None,
        );

        // Ack arrives before the original final deadline (150ms) elapses.
        tokio::time::sleep(Duration::from_millis(100)).await;
        table.deliver(response(request_id, true, None));

        // The original deadline has now passed; without extension the
        // waiter would already be resolved with `Timeout`.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(table.pending_count(), 1);

        table.deliver(response(request_id, false, Some(super::super::protocol::MeResponse {
            fingerprint: "fp".into(),
            public_key: "pk".into(),
            display_name: None,
            supports_rsa_sha2: true,
        })));

        assert!(rx.await.unwrap().is_ok());
    }
}
