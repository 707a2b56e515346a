//! Daemon configuration: socket paths, per-request-kind timeouts, and the
//! bounded-structure caps used by the correlation engine and Host-Auth
//! Intake.
//!
//! Resolution order for the config directory: unit tests use a directory under the crate's own
//! `target/`, `KEYBRIDGE_CONFIG_DIR` is an explicit override, any test mode
//! (`KEYBRIDGE_ENV=test|system_test`) uses a tmp directory, and production
//! falls back to the OS config directory.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants;

/// Per-request-kind final and alert deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutTable {
    /// Final deadline for a `Pair` request.
    pub pair: Duration,
    /// Alert deadline for a `Pair` request.
    pub pair_alert: Duration,
    /// Final deadline for a `Me` request.
    pub me: Duration,
    /// Alert deadline for a `Me` request.
    pub me_alert: Duration,
    /// Final deadline for a `Sign` request.
    pub sign: Duration,
    /// Alert deadline for a `Sign` request.
    pub sign_alert: Duration,
    /// Final deadline for a `NoOp` keep-alive.
    pub noop: Duration,
}

impl Default for TimeoutTable {
    fn default() -> Self {
        Self {
            pair: constants::PAIR_TIMEOUT,
            pair_alert: constants::PAIR_ALERT,
            me: constants::ME_TIMEOUT,
            me_alert: constants::ME_ALERT,
            sign: constants::SIGN_TIMEOUT,
            sign_alert: constants::SIGN_ALERT,
            noop: constants::NOOP_TIMEOUT,
        }
    }
}

/// Bounded-structure size caps; overridable so tests can exercise eviction
/// without allocating hundreds of fixtures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapTable {
    /// Outbox capacity (messages queued while waiting for a key-wrap).
    pub outbox: usize,
    /// Host-Auth Intake recent-signatures buffer capacity.
    pub recent_signatures: usize,
    /// Host-Auth Intake one-shot awaiting-callback LRU capacity.
    pub host_auth_await: usize,
    /// How long `await_host_auth_for` waits before giving up.
    pub host_auth_await_timeout: Duration,
    /// Completed-request LRU capacity (at-most-once delivery).
    pub completed_requests: usize,
}

impl Default for CapTable {
    fn default() -> Self {
        Self {
            outbox: constants::OUTBOX_CAP,
            recent_signatures: constants::RECENT_SIGNATURES_CAP,
            host_auth_await: constants::HOST_AUTH_AWAIT_CAP,
            host_auth_await_timeout: constants::HOST_AUTH_AWAIT_TIMEOUT,
            completed_requests: constants::COMPLETED_REQUEST_LRU_CAP,
        }
    }
}

/// Where the daemon's log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    /// Plain stderr (default).
    Stderr,
    /// System log facility, per the log-routing environment knob.
    Syslog,
}

impl Default for LogTarget {
    fn default() -> Self {
        Self::Stderr
    }
}

/// Daemon-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Unix socket path speaking the SSH-agent protocol.
    pub agent_socket_path: PathBuf,
    /// Unix socket path accepting one-shot `HostAuth` JSON messages.
    pub hostauth_socket_path: PathBuf,
    /// Unix socket path of the locally-running fallback SSH agent.
    pub fallback_agent_socket_path: PathBuf,
    /// Directory the Persister writes the `PairingSecret` file into.
    pub state_dir: PathBuf,
    /// Per-request-kind timeout overrides.
    pub timeouts: TimeoutTable,
    /// Bounded-structure cap overrides.
    pub caps: CapTable,
    /// Suppress ANSI colorization on the notifier's stderr-backed stream.
    pub suppress_color: bool,
    /// Where log lines are routed.
    pub log_target: LogTarget,
}

impl Default for Config {
    fn default() -> Self {
        let runtime_dir = Self::runtime_dir();
        Self {
            agent_socket_path: runtime_dir.join("keybridge-agent.sock"),
            hostauth_socket_path: runtime_dir.join("keybridge-hostauth.sock"),
            fallback_agent_socket_path: std::env::var("SSH_AUTH_SOCK")
                .map(PathBuf::from)
                .unwrap_or_else(|_| runtime_dir.join("fallback-agent.sock")),
            state_dir: Self::config_dir().unwrap_or_else(|_| runtime_dir.clone()),
            timeouts: TimeoutTable::default(),
            caps: CapTable::default(),
            suppress_color: std::env::var_os("KEYBRIDGE_NO_COLOR").is_some(),
            log_target: match std::env::var("KEYBRIDGE_LOG_TARGET").as_deref() {
                Ok("syslog") => LogTarget::Syslog,
                _ => LogTarget::Stderr,
            },
        }
    }
}

impl Config {
    /// Directory for Unix sockets: `$XDG_RUNTIME_DIR` in production, or a
    /// scratch directory under the repo in test mode.
    fn runtime_dir() -> PathBuf {
        if crate::env::should_skip_keyring() {
            return Self::config_dir().unwrap_or_else(|_| std::env::temp_dir());
        }
        std::env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir())
    }

    /// Resolve the directory configuration and persisted state live in.
    ///
    /// Priority: unit tests (`cfg(test)`) use a directory under the crate's
    /// own `target/`; `KEYBRIDGE_CONFIG_DIR` is an explicit override; any
    /// runtime test mode uses a tmp directory; production uses the OS config
    /// directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = {
            #[cfg(test)]
            {
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("target/test-config")
            }

            #[cfg(not(test))]
            {
                if let Ok(custom_dir) = std::env::var("KEYBRIDGE_CONFIG_DIR") {
                    PathBuf::from(custom_dir)
                } else if crate::env::should_skip_keyring() {
                    std::env::temp_dir().join("keybridge-test")
                } else {
                    dirs::config_dir()
                        .context("could not determine config directory")?
                        .join("keybridge")
                }
            }
        };

        std::fs::create_dir_all(&dir).context("failed to create config directory")?;
        Ok(dir)
    }

    /// Path to the config file itself (`config.json` inside `config_dir()`).
    pub fn config_file_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from disk, falling back to defaults if absent.
    pub fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from_file(&path)
    }

    /// Load config from an explicit path.
    pub fn load_from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("failed to read config file")?;
        serde_json::from_str(&content).context("failed to parse config file")
    }

    /// Persist the config to disk with owner-only permissions.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_file_path()?;
        let content = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(&path, content).context("failed to write config file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&path, perms).context("failed to set config permissions")?;
        }

        Ok(())
    }
}
