//! Default timeouts and bounded-structure caps for the enclave core.
//!
//! Values here are the defaults named in the correlation engine's timeout
//! table and the boundary-behavior caps; every one of them is overridable
//! through [`crate::config::Config`] so tests can use short values.

use std::time::Duration;

/// Final deadline for a `Pair` request.
pub const PAIR_TIMEOUT: Duration = Duration::from_secs(30);
/// Alert deadline for a `Pair` request.
pub const PAIR_ALERT: Duration = Duration::from_secs(10);

/// Final deadline for a `Me` request.
pub const ME_TIMEOUT: Duration = Duration::from_secs(30);
/// Alert deadline for a `Me` request.
pub const ME_ALERT: Duration = Duration::from_secs(10);

/// Final deadline for a `Sign` request.
pub const SIGN_TIMEOUT: Duration = Duration::from_secs(60);
/// Alert deadline for a `Sign` request.
pub const SIGN_ALERT: Duration = Duration::from_secs(20);

/// Final deadline for a `NoOp` keep-alive.
pub const NOOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum plaintext messages held in the outbox while waiting for a key-wrap.
pub const OUTBOX_CAP: usize = 128;

/// Maximum `(public_key, signature, host_name)` triples kept by the
/// Host-Auth Intake's recent-signatures buffer.
pub const RECENT_SIGNATURES_CAP: usize = 50;

/// Maximum entries in the Host-Auth Intake's one-shot awaiting-callback LRU.
pub const HOST_AUTH_AWAIT_CAP: usize = 128;

/// How long `await_host_auth_for` waits for a late-arriving `HostAuth`
/// before giving up and returning `None`.
pub const HOST_AUTH_AWAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Maximum completed request ids retained for at-most-once delivery.
pub const COMPLETED_REQUEST_LRU_CAP: usize = 128;

/// Nonblocking-accept retry backoff used by Unix socket listeners.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Maximum length of a `sun_path` this daemon will accept for a socket path
/// (conservative cross-platform limit; macOS caps at 104, Linux at 108).
pub const MAX_SOCKET_PATH_LEN: usize = 104;

/// Poll interval for each transport's inbound receive loop.
pub const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Largest single SSH-agent-protocol frame the Agent Adapter will read
/// before treating the connection as misbehaving and closing it.
pub const MAX_AGENT_FRAME_LEN: usize = 256 * 1024;
