//! Typed error taxonomy for the enclave core.
//!
//! Mirrors the escalating-severity error kinds the core must surface:
//! `NotPaired`, `WaitingForKey`, `SendError`, `RecvError`, `Timeout`,
//! `Rejected`, `HostKeyMismatch`, `Signing`, `Protocol`. The HTTP control
//! server (out of scope) maps these to status codes via [`KeybridgeError::status_code`];
//! everywhere else in the crate propagates `anyhow::Error` at process edges.

use thiserror::Error;

/// All failure modes the enclave core can surface to a caller.
#[derive(Debug, Clone, Error)]
pub enum KeybridgeError {
    /// No pairing secret is installed.
    #[error("not paired")]
    NotPaired,

    /// The symmetric channel key has not been installed yet; the message
    /// was queued in the outbox instead of sent.
    #[error("waiting for key, message queued")]
    WaitingForKey,

    /// Every transport's send attempt failed.
    #[error("send failed: {0}")]
    SendError(String),

    /// A transport delivered a frame that could not be parsed.
    #[error("receive failed: {0}")]
    RecvError(String),

    /// The request's final deadline elapsed with no response.
    #[error("timed out waiting for response")]
    Timeout,

    /// The phone reported the user rejected the request.
    #[error("rejected by phone")]
    Rejected,

    /// The phone reported the host key pinned to this session changed.
    #[error("host public key mismatched")]
    HostKeyMismatch,

    /// The phone reported a generic signing failure.
    #[error("signing failed: {0}")]
    Signing(String),

    /// An inbound frame could not be decoded; the frame is dropped and
    /// logged, nothing else follows from this error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl KeybridgeError {
    /// HTTP status the out-of-scope control server should map this to.
    ///
    /// Only `NotPaired` (404) and `Timeout` (500) are named explicitly by
    /// the glue contract; everything else that reaches the HTTP boundary is
    /// a `500` since the daemon completed the exchange but the outcome was
    /// not success.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotPaired => 404,
            Self::Timeout => 500,
            _ => 500,
        }
    }

    /// Stable machine-readable identifier for logs and the notifier.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotPaired => "not_paired",
            Self::WaitingForKey => "waiting_for_key",
            Self::SendError(_) => "send_error",
            Self::RecvError(_) => "recv_error",
            Self::Timeout => "timeout",
            Self::Rejected => "rejected",
            Self::HostKeyMismatch => "host_key_mismatch",
            Self::Signing(_) => "signing",
            Self::Protocol(_) => "protocol",
        }
    }
}
