//! Cloud queue transport (SNS/SQS or equivalent).
//!
//! The actual queue client is out of scope here: this module only defines
//! the boundary a real client plugs into. [`CloudTransport`] is usable today
//! as long as no [`QueueClient`] is installed, in which case it reports
//! itself unreachable so the fan-out falls back to the bounded outbox
//! instead of failing the whole send.

use async_trait::async_trait;

use crate::errors::KeybridgeError;

use super::Transport;

/// Minimal surface a real cloud-queue client needs to implement.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Publish one frame to the send queue.
    async fn publish(&self, queue_name: &str, frame: &[u8]) -> Result<(), KeybridgeError>;

    /// Drain any frames currently available on the receive queue.
    async fn poll(&self, queue_name: &str) -> Result<Vec<Vec<u8>>, KeybridgeError>;
}

/// Cloud transport bound to one pairing's send and receive queue names.
pub struct CloudTransport {
    send_queue_name: String,
    receive_queue_name: String,
    client: Option<Box<dyn QueueClient>>,
}

impl std::fmt::Debug for CloudTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudTransport")
            .field("send_queue_name", &self.send_queue_name)
            .field("receive_queue_name", &self.receive_queue_name)
            .field("configured", &self.client.is_some())
            .finish()
    }
}

impl CloudTransport {
    /// A cloud transport with no client installed; always reports
    /// unreachable until [`Self::with_client`] is used instead.
    #[must_use]
    pub fn unconfigured(send_queue_name: impl Into<String>, receive_queue_name: impl Into<String>) -> Self {
        Self {
            send_queue_name: send_queue_name.into(),
            receive_queue_name: receive_queue_name.into(),
            client: None,
        }
    }

    /// A cloud transport backed by a real queue client.
    #[must_use]
    pub fn with_client(
        send_queue_name: impl Into<String>,
        receive_queue_name: impl Into<String>,
        client: Box<dyn QueueClient>,
    ) -> Self {
        Self {
            send_queue_name: send_queue_name.into(),
            receive_queue_name: receive_queue_name.into(),
            client: Some(client),
        }
    }
}

#[async_trait]
impl Transport for CloudTransport {
    fn name(&self) -> &str {
        "cloud"
    }

    async fn send(&self, frame: &[u8]) -> Result<(), KeybridgeError> {
        match &self.client {
            Some(client) => client.publish(&self.send_queue_name, frame).await,
            None => Err(KeybridgeError::SendError("cloud transport not configured".into())),
        }
    }

    async fn receive(&self) -> Result<Vec<Vec<u8>>, KeybridgeError> {
        match &self.client {
            Some(client) => client.poll(&self.receive_queue_name).await,
            None => Ok(Vec::new()),
        }
    }

    fn is_likely_reachable(&self) -> bool {
        self.client.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_transport_reports_unreachable_and_fails_send() {
        let transport = CloudTransport::unconfigured("keybridge-abc-send", "keybridge-abc-recv");
        assert!(!transport.is_likely_reachable());
        assert!(transport.send(b"frame").await.is_err());
    }

    #[tokio::test]
    async fn unconfigured_transport_receive_is_empty_not_an_error() {
        let transport = CloudTransport::unconfigured("keybridge-abc-send", "keybridge-abc-recv");
        assert_eq!(transport.receive().await.unwrap(), Vec::<Vec<u8>>::new());
    }
}
