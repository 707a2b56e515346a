//! In-process transport double used by the enclave client's scenario tests.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::KeybridgeError;

use super::Transport;

/// Records every frame handed to it; can be toggled unreachable to exercise
/// the outbox path.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<Vec<u8>>>,
    reachable: Mutex<bool>,
    inbox: Mutex<Vec<Vec<u8>>>,
}

impl MemoryTransport {
    /// New transport, reachable by default.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            reachable: Mutex::new(true),
            inbox: Mutex::new(Vec::new()),
        }
    }

    /// Toggle reachability, to simulate the peer going out of range.
    pub fn set_reachable(&self, reachable: bool) {
        *self.reachable.lock().expect("memory transport lock poisoned") = reachable;
    }

    /// Every frame accepted so far, in send order.
    #[must_use]
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().expect("memory transport lock poisoned").clone()
    }

    /// Queue a frame as if the phone had sent it; picked up by the next
    /// `receive()` call.
    pub fn push_inbound(&self, frame: Vec<u8>) {
        self.inbox.lock().expect("memory transport lock poisoned").push(frame);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, frame: &[u8]) -> Result<(), KeybridgeError> {
        if !self.is_likely_reachable() {
            return Err(KeybridgeError::SendError("peer unreachable".into()));
        }
        self.sent.lock().expect("memory transport lock poisoned").push(frame.to_vec());
        Ok(())
    }

    async fn receive(&self) -> Result<Vec<Vec<u8>>, KeybridgeError> {
        let mut inbox = self.inbox.lock().expect("memory transport lock poisoned");
        Ok(std::mem::take(&mut *inbox))
    }

    fn is_likely_reachable(&self) -> bool {
        *self.reachable.lock().expect("memory transport lock poisoned")
    }
}
