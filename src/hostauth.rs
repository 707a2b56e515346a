//! Host-Auth Intake.
//!
//! Receives detached signatures a locally-running SSH client extracted from
//! its transport handshake (proving a host key is bound to this session)
//! and binds them to the matching pending `Sign` request before the Agent
//! Adapter calls [`crate::enclave::EnclaveClient::request_signature`].
//! Delivered over [`crate::net`]'s one-shot JSON socket (see
//! `SPEC_FULL.md` §6, host-auth socket).

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use lru::LruCache;
use serde::Deserialize;
use ssh_key::{PublicKey, SshSig};
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::time::Duration;

use crate::constants::MAX_AGENT_FRAME_LEN;
use crate::enclave::protocol::HostAuth;

const HOSTAUTH_NAMESPACE: &str = "keybridge-hostauth";

/// Wire shape of the one-shot JSON object pushed over the host-auth socket
/// (`SPEC_FULL.md` §6): `PascalCase` keys, matching the local SSH client's
/// own naming rather than this crate's internal [`HostAuth`] field names.
#[derive(Debug, Deserialize)]
struct WireHostAuth {
    #[serde(rename = "HostKey")]
    host_key: String,
    #[serde(rename = "Signature")]
    signature: String,
    #[serde(rename = "HostNames")]
    host_names: Vec<String>,
}

impl From<WireHostAuth> for HostAuth {
    fn from(wire: WireHostAuth) -> Self {
        Self {
            host_key_blob: wire.host_key,
            detached_signature_over_session_id: wire.signature,
            host_names: wire.host_names,
        }
    }
}

/// Bind the host-auth socket and feed every one-shot JSON object received on
/// it to `intake.on_host_auth`. Each connection carries exactly one object
/// followed by EOF; malformed bodies are logged and dropped rather than
/// killing the listener.
pub async fn serve(socket_path: PathBuf, intake: Arc<HostAuthIntake>) -> anyhow::Result<()> {
    let listener = crate::net::bind(&socket_path)?;
    crate::net::accept_loop(listener, socket_path, move |stream| {
        let intake = Arc::clone(&intake);
        async move { handle_connection(stream, &intake).await }
    })
    .await;
    Ok(())
}

async fn handle_connection(mut stream: UnixStream, intake: &HostAuthIntake) {
    let mut buf = Vec::new();
    let mut limited = (&mut stream).take(MAX_AGENT_FRAME_LEN as u64);
    if let Err(e) = limited.read_to_end(&mut buf).await {
        log::warn!("failed to read host-auth connection: {e}");
        return;
    }

    let wire: WireHostAuth = match serde_json::from_slice(&buf) {
        Ok(wire) => wire,
        Err(e) => {
            log::warn!("malformed host-auth payload: {e}");
            return;
        }
    };

    if let Err(e) = intake.on_host_auth(wire.into()) {
        log::warn!("rejected host-auth payload: {e}");
    }
}

struct RecentEntry {
    host_auth: HostAuth,
}

/// Buffers recent host-key bindings and resolves waiters asking whether a
/// given SSH session id has a matching, verified `HostAuth`.
pub struct HostAuthIntake {
    recent: Mutex<VecDeque<RecentEntry>>,
    recent_cap: usize,
    awaiting: Mutex<LruCache<String, Vec<oneshot::Sender<HostAuth>>>>,
    await_timeout: Duration,
}

impl std::fmt::Debug for HostAuthIntake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostAuthIntake")
            .field("recent_len", &self.recent.lock().expect("hostauth lock poisoned").len())
            .finish()
    }
}

impl HostAuthIntake {
    /// New intake with bounded buffers sized from `caps`.
    #[must_use]
    pub fn new(caps: &crate::config::CapTable) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(caps.recent_signatures)),
            recent_cap: caps.recent_signatures,
            awaiting: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(caps.host_auth_await.max(1))
                    .expect("host-auth await cap must be nonzero"),
            )),
            await_timeout: caps.host_auth_await_timeout,
        }
    }

    /// Record a host-key binding pushed in over the host-auth socket.
    /// Structurally validates that the host key and signature parse, then
    /// resolves any waiter whose session id this binding verifies against.
    pub fn on_host_auth(&self, host_auth: HostAuth) -> anyhow::Result<()> {
        let _ = parse_public_key(&host_auth.host_key_blob)?;
        let _ = parse_signature(&host_auth.detached_signature_over_session_id)?;

        {
            let mut recent = self.recent.lock().expect("hostauth lock poisoned");
            if recent.len() >= self.recent_cap {
                recent.pop_back();
            }
            recent.push_front(RecentEntry {
                host_auth: host_auth.clone(),
            });
        }

        let waiters: Vec<(String, Vec<oneshot::Sender<HostAuth>>)> = {
            let mut awaiting = self.awaiting.lock().expect("hostauth lock poisoned");
            let keys: Vec<String> = awaiting.iter().map(|(k, _)| k.clone()).collect();
            keys.into_iter()
                .filter_map(|session_id| {
                    if verifies(&host_auth, &session_id) {
                        awaiting.pop(&session_id).map(|txs| (session_id, txs))
                    } else {
                        None
                    }
                })
                .collect()
        };

        for (_, txs) in waiters {
            for tx in txs {
                let _ = tx.send(host_auth.clone());
            }
        }

        Ok(())
    }

    /// Resolve the `HostAuth` whose detached signature verifies over
    /// `session_id` (base64). Scans the recent buffer first; otherwise
    /// waits up to the configured timeout for a late-arriving binding.
    pub async fn await_host_auth_for(&self, session_id: &str) -> Option<HostAuth> {
        {
            let recent = self.recent.lock().expect("hostauth lock poisoned");
            for entry in recent.iter() {
                if verifies(&entry.host_auth, session_id) {
                    return Some(entry.host_auth.clone());
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut awaiting = self.awaiting.lock().expect("hostauth lock poisoned");
            match awaiting.get_mut(session_id) {
                Some(txs) => txs.push(tx),
                None => {
                    awaiting.put(session_id.to_string(), vec![tx]);
                }
            }
        }

        tokio::time::timeout(self.await_timeout, rx).await.ok()?.ok()
    }
}

fn parse_public_key(blob_b64: &str) -> anyhow::Result<PublicKey> {
    let bytes = BASE64.decode(blob_b64)?;
    Ok(PublicKey::from_bytes(&bytes)?)
}

fn parse_signature(pem: &str) -> anyhow::Result<SshSig> {
    Ok(SshSig::from_pem(pem)?)
}

fn verifies(host_auth: &HostAuth, session_id_b64: &str) -> bool {
    let Ok(public_key) = parse_public_key(&host_auth.host_key_blob) else {
        return false;
    };
    let Ok(signature) = parse_signature(&host_auth.detached_signature_over_session_id) else {
        return false;
    };
    let Ok(session_id) = BASE64.decode(session_id_b64) else {
        return false;
    };
    public_key
        .verify(HOSTAUTH_NAMESPACE, &session_id, &signature)
        .is_ok()
}
