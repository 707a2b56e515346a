//! The Agent Adapter: an SSH-agent protocol surface backed by the paired
//! phone, falling back to a locally-running agent for keys the phone does
//! not own.
//!
//! [`AgentAdapter`] is the one piece that ties together the
//! [`crate::enclave::EnclaveClient`], [`crate::hostauth::HostAuthIntake`],
//! [`crate::notifier::Notifier`], and [`fallback::FallbackAgent`]; `main`
//! only needs to construct one and call [`AgentAdapter::serve`] on the
//! agent-protocol socket.

pub mod fallback;
pub mod protocol;

use std::path::PathBuf;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::enclave::correlation::AlertCallback;
use crate::enclave::protocol::SignPayload;
use crate::enclave::EnclaveClient;
use crate::errors::KeybridgeError;
use crate::hostauth::HostAuthIntake;
use crate::notifier::{derive_prefix, Color, ControlToken, Notifier};

use fallback::FallbackAgent;

/// SSH-agent protocol server, fallback-agent composer, and notifier wiring.
pub struct AgentAdapter {
    enclave: Arc<EnclaveClient>,
    hostauth: Arc<HostAuthIntake>,
    notifier: Arc<Notifier>,
    fallback: FallbackAgent,
}

impl AgentAdapter {
    /// Build an adapter over an already-constructed Enclave Client,
    /// Host-Auth Intake, and Notifier, delegating keys it doesn't own to
    /// the fallback agent at `fallback_socket_path`.
    #[must_use]
    pub fn new(
        enclave: Arc<EnclaveClient>,
        hostauth: Arc<HostAuthIntake>,
        notifier: Arc<Notifier>,
        fallback_socket_path: PathBuf,
    ) -> Self {
        Self {
            enclave,
            hostauth,
            notifier,
            fallback: FallbackAgent::new(fallback_socket_path),
        }
    }

    /// Bind the agent-protocol socket and serve connections until the
    /// socket file is removed.
    pub async fn serve(self: Arc<Self>, socket_path: PathBuf) -> anyhow::Result<()> {
        let listener = crate::net::bind(&socket_path)?;
        crate::net::accept_loop(listener, socket_path, move |stream| {
            let this = Arc::clone(&self);
            async move { this.handle_connection(stream).await }
        })
        .await;
        Ok(())
    }

    async fn handle_connection(&self, stream: tokio::net::UnixStream) {
        let (mut reader, mut writer) = stream.into_split();
        loop {
            let body = match protocol::read_frame(&mut reader).await {
                Ok(Some(body)) if !body.is_empty() => body,
                Ok(_) => break,
                Err(e) => {
                    log::warn!("agent connection read error: {e}");
                    break;
                }
            };

            let response = match body[0] {
                protocol::REQUEST_IDENTITIES => self.list().await,
                protocol::SIGN_REQUEST => match protocol::parse_sign_request(&body[1..]) {
                    Ok(req) => self.sign(&req.key_blob, &req.data, req.flags).await,
                    Err(e) => {
                        log::warn!("malformed SIGN_REQUEST: {e}");
                        protocol::encode_failure()
                    }
                },
                _ => self.fallback.passthrough(&body).await,
            };

            if protocol::write_frame(&mut writer, &response).await.is_err() {
                break;
            }
        }
    }

    /// `List()`: union of the cached profile's single key (if paired) and
    /// the fallback agent's list.
    async fn list(&self) -> Vec<u8> {
        let mut identities = Vec::new();

        if self.enclave.is_paired() {
            if let Some(me) = self.enclave.get_cached_me() {
                if let Ok(blob) = BASE64.decode(&me.public_key) {
                    identities.push(protocol::Identity {
                        key_blob: blob,
                        comment: me.display_name.unwrap_or(me.fingerprint),
                    });
                }
            }
        } else {
            self.notifier.line("status", Color::Yellow, "not paired");
        }

        identities.extend(self.fallback.list_identities().await);
        protocol::encode_identities_answer(&identities)
    }

    /// `Sign(public_key, data)`, see `SPEC_FULL.md` §4.6.
    async fn sign(&self, key_blob: &[u8], data: &[u8], flags: u32) -> Vec<u8> {
        let cached = self.enclave.get_cached_me();
        let belongs_to_phone = cached
            .as_ref()
            .and_then(|me| BASE64.decode(&me.public_key).ok())
            .is_some_and(|phone_blob| phone_blob == key_blob);

        if !belongs_to_phone {
            return match self.fallback.sign(key_blob, data, flags).await {
                Some((format, sig)) => protocol::encode_sign_response(&format, &sig),
                None => protocol::encode_failure(),
            };
        }

        let Some(me) = cached else {
            self.notifier.line("status", Color::Yellow, "please pair");
            return protocol::encode_failure();
        };

        let Ok(parsed) = protocol::parse_userauth_sign_data(data) else {
            log::warn!("sign request data is not a userauth sign payload");
            return protocol::encode_failure();
        };

        let session_id_b64 = BASE64.encode(parsed.session_id);
        let host_auth = self.hostauth.await_host_auth_for(&session_id_b64).await;
        let prefix = host_auth
            .as_ref()
            .map(|h| derive_prefix(h.detached_signature_over_session_id.as_bytes()))
            .unwrap_or_else(|| derive_prefix(data));

        let stripped = protocol::strip_redundant_public_key(data, &parsed);
        let payload = SignPayload {
            fingerprint: me.fingerprint.clone(),
            data: BASE64.encode(stripped),
            command: None,
            host_auth: host_auth.clone(),
        };

        let notifier = Arc::clone(&self.notifier);
        let ack_prefix = prefix.clone();
        let on_ack: AlertCallback = Arc::new(move || {
            notifier.line(&ack_prefix, Color::Yellow, "phone approval required");
        });

        match self.enclave.request_signature(payload, Some(on_ack)).await {
            Ok(response) => self.finish_sign(&prefix, key_blob, parsed.algorithm_name, me.supports_rsa_sha2, response),
            Err(KeybridgeError::NotPaired) => {
                self.notifier.line(&prefix, Color::Yellow, "please pair");
                protocol::encode_failure()
            }
            Err(KeybridgeError::Timeout) => {
                self.notifier
                    .line(&prefix, Color::Red, "timed out, falling back to local keys");
                self.notifier.control(&prefix, ControlToken::Stop);
                protocol::encode_failure()
            }
            Err(e) => {
                self.notifier.line(&prefix, Color::Red, &e.to_string());
                self.notifier.control(&prefix, ControlToken::Stop);
                protocol::encode_failure()
            }
        }
    }

    fn finish_sign(
        &self,
        prefix: &str,
        key_blob: &[u8],
        payload_algorithm: &str,
        supports_rsa_sha2: bool,
        response: crate::enclave::protocol::SignResponse,
    ) -> Vec<u8> {
        if let Some(error) = response.error {
            self.notifier
                .line(prefix, Color::Red, &format!("sign failed: {error}"));
            let mapped = classify_sign_error(&error);
            match mapped {
                KeybridgeError::Rejected => self.notifier.control(prefix, ControlToken::Rejected),
                KeybridgeError::HostKeyMismatch => {
                    self.notifier.control(prefix, ControlToken::HostKeyMismatch);
                }
                _ => {}
            }
            self.notifier.control(prefix, ControlToken::Stop);
            return protocol::encode_failure();
        }

        let Some(signature_b64) = response.signature else {
            self.notifier.line(prefix, Color::Red, "empty signature response");
            self.notifier.control(prefix, ControlToken::Stop);
            return protocol::encode_failure();
        };

        let Ok(signature) = BASE64.decode(&signature_b64) else {
            self.notifier.line(prefix, Color::Red, "malformed signature response");
            self.notifier.control(prefix, ControlToken::Stop);
            return protocol::encode_failure();
        };

        let key_type = ssh_key::PublicKey::from_bytes(key_blob)
            .map(|pk| pk.algorithm().to_string())
            .unwrap_or_else(|_| "ssh-rsa".to_string());
        let format = negotiate_format(payload_algorithm, &key_type, supports_rsa_sha2);

        self.notifier.line(prefix, Color::Green, "signed");
        protocol::encode_sign_response(&format, &signature)
    }
}

/// Prefer the algorithm the client asked for only when the phone has
/// advertised support for it (open question (a)); otherwise fall back to
/// the key's legacy type.
fn negotiate_format(payload_algorithm: &str, key_type: &str, supports_rsa_sha2: bool) -> String {
    let is_rsa_sha2 = payload_algorithm == "rsa-sha2-256" || payload_algorithm == "rsa-sha2-512";
    if is_rsa_sha2 && supports_rsa_sha2 {
        payload_algorithm.to_string()
    } else {
        key_type.to_string()
    }
}

/// Map a phone-reported error string onto the typed taxonomy. The Enclave
/// Client deliberately leaves this string uninterpreted; the Agent Adapter
/// is the caller that turns it into control-line behaviour.
fn classify_sign_error(error: &str) -> KeybridgeError {
    if error == "rejected" {
        KeybridgeError::Rejected
    } else if error.contains("host public key mismatched") {
        KeybridgeError::HostKeyMismatch
    } else {
        KeybridgeError::Signing(error.to_string())
    }
}
