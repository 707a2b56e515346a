//! Shared Unix-domain-socket plumbing for the two listeners the Agent
//! Adapter owns: the SSH-agent-protocol socket and the host-auth one-shot
//! JSON socket (`SPEC_FULL.md` §6).
//!
//! Both listeners share the same bind/cleanup/accept-loop shape: remove a
//! stale socket file, bind, restrict permissions to owner-only, and retry
//! `accept()` errors with a short backoff until the socket file itself is
//! gone (the signal that the daemon is shutting down).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::net::{UnixListener, UnixStream};

use crate::constants::{ACCEPT_ERROR_BACKOFF, MAX_SOCKET_PATH_LEN};

/// Bind a Unix listener at `path`, removing any stale socket file first and
/// restricting the new one to owner-only permissions.
pub fn bind(path: &Path) -> Result<UnixListener> {
    let path_len = path.as_os_str().len();
    if path_len >= MAX_SOCKET_PATH_LEN {
        anyhow::bail!(
            "socket path too long ({path_len} bytes, max {}): {}",
            MAX_SOCKET_PATH_LEN - 1,
            path.display()
        );
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create socket directory {}", parent.display()))?;
    }

    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }

    let listener = std::os::unix::net::UnixListener::bind(path)
        .with_context(|| format!("failed to bind socket {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    listener.set_nonblocking(true)?;
    Ok(UnixListener::from_std(listener)?)
}

/// Run an accept loop, calling `on_connection` for each accepted stream.
/// Stops when `accept()` errors and the socket file no longer exists
/// (treated as an intentional shutdown); otherwise logs and backs off.
pub async fn accept_loop<F, Fut>(listener: UnixListener, socket_path: PathBuf, on_connection: F)
where
    F: Fn(UnixStream) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                tokio::spawn(on_connection(stream));
            }
            Err(e) => {
                if !socket_path.exists() {
                    log::info!("socket {} removed, stopping accept loop", socket_path.display());
                    break;
                }
                log::error!("accept error on {}: {e}", socket_path.display());
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}
