//! On-demand client for the locally-running fallback SSH agent.
//!
//! `Add`, `Remove`, `RemoveAll`, `Lock`, `Unlock`, and `Signers` are
//! delegated verbatim; `List` is unioned with the cached profile key; `Sign`
//! falls through here only when the requested key does not belong to the
//! paired phone. Connection failures are logged and turned into empty
//! results or a bare `FAILURE` frame, never an agent-protocol error.

use std::path::PathBuf;

use tokio::net::UnixStream;

use super::protocol::{self, Identity};

/// Thin, connect-per-call wrapper around a well-known fallback-agent socket.
#[derive(Debug, Clone)]
pub struct FallbackAgent {
    socket_path: PathBuf,
}

impl FallbackAgent {
    /// Point at the fallback agent's socket path (typically `$SSH_AUTH_SOCK`).
    #[must_use]
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    async fn connect(&self) -> std::io::Result<UnixStream> {
        UnixStream::connect(&self.socket_path).await
    }

    /// Enumerate the fallback agent's identities. Returns an empty list if
    /// the fallback agent is unreachable or misbehaves.
    pub async fn list_identities(&self) -> Vec<Identity> {
        let Ok(mut stream) = self.connect().await else {
            log::warn!(
                "fallback agent at {} unreachable, returning empty list",
                self.socket_path.display()
            );
            return Vec::new();
        };

        if protocol::write_frame(&mut stream, &[protocol::REQUEST_IDENTITIES])
            .await
            .is_err()
        {
            return Vec::new();
        }

        let Ok(Some(body)) = protocol::read_frame(&mut stream).await else {
            return Vec::new();
        };
        parse_identities_answer(&body).unwrap_or_default()
    }

    /// Delegate a `SIGN_REQUEST` verbatim. Returns `None` if the fallback
    /// agent is unreachable or refuses.
    pub async fn sign(&self, key_blob: &[u8], data: &[u8], flags: u32) -> Option<(String, Vec<u8>)> {
        let mut stream = self.connect().await.ok()?;

        let mut body = vec![protocol::SIGN_REQUEST];
        write_string(&mut body, key_blob);
        write_string(&mut body, data);
        body.extend_from_slice(&flags.to_be_bytes());

        protocol::write_frame(&mut stream, &body).await.ok()?;
        let response = protocol::read_frame(&mut stream).await.ok()??;
        parse_sign_response(&response)
    }

    /// Forward any other raw request frame (`Add`/`Remove`/`RemoveAll`/
    /// `Lock`/`Unlock`/`Signers`) verbatim and return the fallback agent's
    /// raw response frame, or a bare `FAILURE` if it is unreachable.
    pub async fn passthrough(&self, request_body: &[u8]) -> Vec<u8> {
        let Ok(mut stream) = self.connect().await else {
            log::warn!(
                "fallback agent at {} unreachable, reporting failure",
                self.socket_path.display()
            );
            return protocol::encode_failure();
        };

        if protocol::write_frame(&mut stream, request_body).await.is_err() {
            return protocol::encode_failure();
        }
        match protocol::read_frame(&mut stream).await {
            Ok(Some(body)) => body,
            _ => protocol::encode_failure(),
        }
    }
}

fn write_string(out: &mut Vec<u8>, s: &[u8]) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s);
}

fn parse_identities_answer(body: &[u8]) -> Option<Vec<Identity>> {
    if body.first() != Some(&protocol::IDENTITIES_ANSWER) || body.len() < 5 {
        return None;
    }
    let count = u32::from_be_bytes(body[1..5].try_into().ok()?) as usize;
    let mut pos = 5;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let (key_blob, next) = read_string(body, pos)?;
        let (comment_bytes, next) = read_string(body, next)?;
        let comment = String::from_utf8(comment_bytes.to_vec()).ok()?;
        out.push(Identity {
            key_blob: key_blob.to_vec(),
            comment,
        });
        pos = next;
    }
    Some(out)
}

fn parse_sign_response(body: &[u8]) -> Option<(String, Vec<u8>)> {
    if body.first() != Some(&protocol::SIGN_RESPONSE) {
        return None;
    }
    let (blob, _) = read_string(body, 1)?;
    let (format_bytes, next) = read_string(blob, 0)?;
    let (signature, _) = read_string(blob, next)?;
    let format = String::from_utf8(format_bytes.to_vec()).ok()?;
    Some((format, signature.to_vec()))
}

fn read_string(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    if buf.len() < pos + 4 {
        return None;
    }
    let len = u32::from_be_bytes(buf[pos..pos + 4].try_into().ok()?) as usize;
    let start = pos + 4;
    if buf.len() < start + len {
        return None;
    }
    Some((&buf[start..start + len], start + len))
}
