//! Per-request notification stream.
//!
//! The Agent Adapter opens one logical channel per sign request, keyed by a
//! short prefix derived from a digest of the matching `HostAuth`'s
//! signature, and writes short coloured lines to it. Consumers are terminal
//! wrappers that key off the prefix to route or suppress lines; the
//! Notifier keeps no durable state and every write is best-effort (a
//! write failure is logged and otherwise ignored).

use std::io::Write;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

const BASE62_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// ANSI colour for a human-readable notification line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    /// Informational / success.
    Green,
    /// Warning (e.g. not paired).
    Yellow,
    /// Failure.
    Red,
}

impl Color {
    fn ansi_code(self) -> &'static str {
        match self {
            Self::Green => "\x1b[32m",
            Self::Yellow => "\x1b[33m",
            Self::Red => "\x1b[31m",
        }
    }
}

/// The notifier's stable control-token vocabulary; a terminal wrapper uses
/// these to drive a state machine (e.g. kill the SSH session on `Stop`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlToken {
    /// Terminal wrapper should stop waiting on this correlation prefix.
    Stop,
    /// The phone rejected the request.
    Rejected,
    /// The phone refused because the pinned host key changed.
    HostKeyMismatch,
}

impl ControlToken {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "STOP",
            Self::Rejected => "REJECTED",
            Self::HostKeyMismatch => "HOST_KEY_MISMATCH",
        }
    }
}

/// Derive a short, stable, human-typeable prefix from a digest of the
/// `HostAuth` signature bytes (or any other correlation seed).
#[must_use]
pub fn derive_prefix(seed: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    let digest = hasher.finalize();

    let mut value: u64 = 0;
    for byte in &digest[..8] {
        value = value.wrapping_shl(8) | u64::from(*byte);
    }

    let mut out = Vec::with_capacity(8);
    for _ in 0..8 {
        let idx = (value % 62) as usize;
        out.push(BASE62_ALPHABET[idx]);
        value /= 62;
    }
    out.reverse();
    String::from_utf8(out).expect("base62 alphabet is ASCII")
}

/// Append-only, best-effort notification sink.
pub struct Notifier {
    suppress_color: bool,
    sink: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("suppress_color", &self.suppress_color)
            .finish_non_exhaustive()
    }
}

impl Notifier {
    /// Write to stderr, honoring the `suppress_color` config knob.
    #[must_use]
    pub fn new(suppress_color: bool) -> Self {
        Self::with_sink(suppress_color, Box::new(std::io::stderr()))
    }

    /// Write to an arbitrary sink (tests capture into an in-memory buffer).
    #[must_use]
    pub fn with_sink(suppress_color: bool, sink: Box<dyn Write + Send>) -> Self {
        Self {
            suppress_color,
            sink: Mutex::new(sink),
        }
    }

    /// Write one coloured, human-readable line for the given correlation
    /// prefix. Best-effort: a write failure is logged, not propagated.
    pub fn line(&self, prefix: &str, color: Color, text: &str) {
        let rendered = if self.suppress_color {
            format!("[{prefix}] {text}\r\n")
        } else {
            format!("[{prefix}] {}{text}\x1b[0m\r\n", color.ansi_code())
        };
        self.write(&rendered);
    }

    /// Write one control token for the given correlation prefix.
    pub fn control(&self, prefix: &str, token: ControlToken) {
        self.write(&format!("[{prefix}] {}\r\n", token.as_str()));
    }

    fn write(&self, rendered: &str) {
        let mut sink = self.sink.lock().expect("notifier sink lock poisoned");
        if let Err(e) = sink.write_all(rendered.as_bytes()) {
            log::warn!("notifier write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Clone, Default)]
    struct CapturingSink(Arc<StdMutex<Vec<u8>>>);

    impl Write for CapturingSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn derive_prefix_is_pure_and_stable() {
        let a = derive_prefix(b"some-signature-bytes");
        let b = derive_prefix(b"some-signature-bytes");
        let c = derive_prefix(b"different-signature-bytes");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn line_is_prefixed_and_colored_unless_suppressed() {
        let captured = CapturingSink::default();
        let notifier = Notifier::with_sink(false, Box::new(captured.clone()));
        notifier.line("abc12345", Color::Red, "rejected by phone");
        let out = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(out.starts_with("[abc12345] \x1b[31m"));
        assert!(out.ends_with("\r\n"));
    }

    #[test]
    fn line_skips_ansi_codes_when_color_suppressed() {
        let captured = CapturingSink::default();
        let notifier = Notifier::with_sink(true, Box::new(captured.clone()));
        notifier.line("abc12345", Color::Green, "approved");
        let out = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert_eq!(out, "[abc12345] approved\r\n");
    }

    #[test]
    fn control_token_writes_stable_vocabulary() {
        let captured = CapturingSink::default();
        let notifier = Notifier::with_sink(true, Box::new(captured.clone()));
        notifier.control("abc12345", ControlToken::Rejected);
        notifier.control("abc12345", ControlToken::Stop);
        let out = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert_eq!(out, "[abc12345] REJECTED\r\n[abc12345] STOP\r\n");
    }
}
