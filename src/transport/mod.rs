//! Multi-transport fan-out.
//!
//! A pairing can reach the phone over more than one path at once (BLE when
//! nearby, a cloud queue otherwise). [`Transport`] is the seam each path
//! implements; [`Fanout`] sends to every registered transport in parallel
//! and resolves with whichever responds first, retrying anything left in
//! the outbox after the next successful key-wrap.

pub mod cloud;
pub mod memory;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::constants::OUTBOX_CAP;
use crate::errors::KeybridgeError;

/// One path an encrypted frame can travel to reach the paired phone.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable name for logging (`"ble"`, `"cloud"`, ...).
    fn name(&self) -> &str;

    /// Send one already-encrypted frame. Implementations should not block
    /// on a reply; delivery is fire-and-forget from the caller's point of
    /// view, with replies arriving later via whatever receive path the
    /// transport uses.
    async fn send(&self, frame: &[u8]) -> Result<(), KeybridgeError>;

    /// Drain any frames that have arrived since the last call. Called on a
    /// short poll interval by the Enclave Client's per-transport receive
    /// loop; an empty vec means nothing new, not an error.
    async fn receive(&self) -> Result<Vec<Vec<u8>>, KeybridgeError>;

    /// True if this transport currently believes it can reach the peer
    /// (e.g. BLE device in range, cloud credentials configured). Used only
    /// to order fan-out attempts and to decide whether to fall back to the
    /// bounded outbox; `send` is still attempted on transports that report
    /// `false` here, in case the estimate is stale.
    fn is_likely_reachable(&self) -> bool {
        true
    }
}

/// Outcome of a single attempt to get a frame to the peer.
#[derive(Debug)]
pub enum SendOutcome {
    /// At least one transport accepted the frame for delivery.
    Sent,
    /// No transport is currently reachable; the frame was appended to the
    /// bounded outbox and will be retried after the next successful
    /// key-wrap.
    Queued,
    /// Every transport rejected the frame outright (not just "unreachable").
    Failed(KeybridgeError),
}

/// Sends an encrypted frame to every registered transport in parallel and
/// keeps a bounded outbox of frames that found no reachable transport.
#[derive(Default)]
pub struct Fanout {
    transports: Vec<Arc<dyn Transport>>,
    outbox: Mutex<VecDeque<Vec<u8>>>,
    /// Plaintext queued by a caller whose request landed before the
    /// symmetric key was installed; drained and encrypted once the key-wrap
    /// completes. Distinct from `outbox`, which holds already-encrypted
    /// frames queued because no transport was reachable.
    plaintext_outbox: Mutex<VecDeque<Vec<u8>>>,
}

impl std::fmt::Debug for Fanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fanout")
            .field("transport_count", &self.transports.len())
            .field("outbox_len", &self.outbox_len())
            .field("plaintext_outbox_len", &self.plaintext_outbox_len())
            .finish()
    }
}

impl Fanout {
    /// Fan out across `transports`, tried in the given order when reporting
    /// but all dispatched concurrently.
    #[must_use]
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> Self {
        Self {
            transports,
            outbox: Mutex::new(VecDeque::new()),
            plaintext_outbox: Mutex::new(VecDeque::new()),
        }
    }

    /// Send `frame` to every transport concurrently. `Sent` if at least one
    /// accepted it; otherwise the frame is appended to the bounded outbox
    /// (oldest evicted first past [`OUTBOX_CAP`]) and `Queued` is returned.
    pub async fn send(&self, frame: &[u8]) -> SendOutcome {
        if self.transports.is_empty() {
            self.enqueue(frame);
            return SendOutcome::Queued;
        }

        let mut set = tokio::task::JoinSet::new();
        for transport in &self.transports {
            let transport = Arc::clone(transport);
            let frame = frame.to_vec();
            set.spawn(async move { transport.send(&frame).await });
        }

        let mut any_ok = false;
        while let Some(joined) = set.join_next().await {
            if matches!(joined, Ok(Ok(()))) {
                any_ok = true;
            }
        }

        if any_ok {
            SendOutcome::Sent
        } else {
            self.enqueue(frame);
            SendOutcome::Queued
        }
    }

    fn enqueue(&self, frame: &[u8]) {
        let mut outbox = self.outbox.lock().expect("fanout outbox lock poisoned");
        if outbox.len() >= OUTBOX_CAP {
            outbox.pop_front();
        }
        outbox.push_back(frame.to_vec());
    }

    /// Number of frames currently queued in the outbox.
    #[must_use]
    pub fn outbox_len(&self) -> usize {
        self.outbox.lock().expect("fanout outbox lock poisoned").len()
    }

    /// Drain and resend every queued frame (called after a successful
    /// key-wrap establishes a reachable transport).
    pub async fn retry_outbox(&self) {
        let drained: Vec<Vec<u8>> = {
            let mut outbox = self.outbox.lock().expect("fanout outbox lock poisoned");
            outbox.drain(..).collect()
        };
        for frame in drained {
            let _ = self.send(&frame).await;
        }
    }

    /// Queue plaintext whose encryption failed because no symmetric key is
    /// installed yet (oldest evicted first past [`OUTBOX_CAP`]).
    pub fn queue_plaintext(&self, plaintext: &[u8]) {
        let mut outbox = self.plaintext_outbox.lock().expect("fanout plaintext outbox lock poisoned");
        if outbox.len() >= OUTBOX_CAP {
            outbox.pop_front();
        }
        outbox.push_back(plaintext.to_vec());
    }

    /// Number of plaintext messages currently queued awaiting a key-wrap.
    #[must_use]
    pub fn plaintext_outbox_len(&self) -> usize {
        self.plaintext_outbox.lock().expect("fanout plaintext outbox lock poisoned").len()
    }

    /// Drain every plaintext message queued while waiting for a key-wrap, in
    /// FIFO order. The caller is responsible for encrypting and sending each
    /// one with the now-installed symmetric key.
    pub fn drain_plaintext(&self) -> Vec<Vec<u8>> {
        self.plaintext_outbox
            .lock()
            .expect("fanout plaintext outbox lock poisoned")
            .drain(..)
            .collect()
    }
}
