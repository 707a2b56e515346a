//! Pairing Secret and its durable storage.
//!
//! A [`secret::PairingSecret`] is the single cryptographic identity of one
//! workstation↔phone link: a workstation key pair, the peer's long-term
//! public key, a symmetric channel key installed by the one-time key-wrap
//! handshake, and a stable pairing identifier that deterministically derives
//! queue names and a Bluetooth service UUID. [`persister::Persister`] loads
//! and saves exactly that bundle across daemon restarts.

pub mod persister;
pub mod secret;

pub use persister::{FilePersister, MemoryPersister, Persister};
pub use secret::{KeyWrapOutcome, PairingSecret};
