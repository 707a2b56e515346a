//! Wire types exchanged with the paired phone.
//!
//! Plaintext of every non-key-wrap frame is one JSON [`Request`] (workstation
//! → phone) or [`Response`] (phone → workstation), after the frame has been
//! through [`crate::pairing::secret::PairingSecret::decrypt_message`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of operation a [`Request`] is asking the phone to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Fetch the user's public identity.
    Me,
    /// Ask the phone to produce a signature.
    Sign,
    /// Ask the phone to enumerate available keys.
    List,
    /// Keep-alive; fire-and-forget.
    NoOp,
    /// Tear down the pairing.
    Unpair,
}

/// Detached signature over an SSH host key binding the phone to a remote host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostAuth {
    /// Base64-encoded SSH host public-key blob.
    pub host_key_blob: String,
    /// PEM-armored `SSHSIG` detached signature over the session id.
    pub detached_signature_over_session_id: String,
    /// Host names the server presented (for display only).
    pub host_names: Vec<String>,
}

/// Payload for a [`RequestKind::Sign`] request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignPayload {
    /// SSH public-key fingerprint identifying which key should sign.
    pub fingerprint: String,
    /// Raw SSH user-auth signature payload ("data") to be signed.
    pub data: String,
    /// Forensic context only; never inspected by correctness-bearing code.
    pub command: Option<String>,
    /// Host-auth binding this request to a specific remote host, if any.
    pub host_auth: Option<HostAuth>,
}

/// One outbound request, keyed by a random 128-bit id for correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Random id; uniqueness is a precondition for correlation.
    pub request_id: Uuid,
    /// Which operation this is.
    pub kind: RequestKind,
    /// Kind-specific payload, JSON-encoded by the caller.
    pub payload: serde_json::Value,
}

impl Request {
    /// Build a request with a fresh random id.
    #[must_use]
    pub fn new(kind: RequestKind, payload: serde_json::Value) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            kind,
            payload,
        }
    }
}

/// The user's public identity, as reported by the phone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeResponse {
    /// SSH public-key fingerprint of the user's enclave-held key.
    pub fingerprint: String,
    /// Full SSH public key blob, base64.
    pub public_key: String,
    /// Display name for the identity, if the phone has one.
    pub display_name: Option<String>,
    /// Whether the enclave supports the rsa-sha2-256/512 signature formats
    /// (open question (a): exposed as an explicit capability flag, not a
    /// silent guess by the Agent Adapter).
    pub supports_rsa_sha2: bool,
}

/// Result of a signing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignResponse {
    /// Base64-encoded SSH signature blob, present on success.
    pub signature: Option<String>,
    /// Phone-reported error, if the request failed: `"rejected"` or
    /// `"host public key mismatched"`.
    pub error: Option<String>,
}

/// One key the phone is willing to authenticate with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListedKey {
    /// SSH public-key fingerprint.
    pub fingerprint: String,
    /// Full SSH public key blob, base64.
    pub public_key: String,
    /// Human-readable comment, if any.
    pub comment: Option<String>,
}

/// Result of a key-enumeration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
    /// Keys the phone currently offers.
    pub keys: Vec<ListedKey>,
}

/// One inbound message from the phone, correlated by `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Matches the `request_id` of the request this answers.
    pub request_id: Uuid,
    /// Present on a successful `Me` response.
    pub me: Option<MeResponse>,
    /// Present on a completed `Sign` response.
    pub sign: Option<SignResponse>,
    /// Present on a completed `List` response.
    pub list: Option<ListResponse>,
    /// If set and no final payload is present, this only extends the
    /// caller's alert/timeout window; it never resolves the pending request.
    pub ack: bool,
    /// Cloud push endpoint the phone registered, if any (recorded, not acted on).
    pub sns_endpoint: Option<String>,
    /// If set, the phone is tearing down the pairing; the Enclave Client
    /// must unpair locally and fail all waiters with a pairing-changed error.
    pub unpair_request: bool,
}
