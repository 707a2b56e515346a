//! Request/response correlation, pairing lifecycle, and profile cache.
//!
//! [`client::EnclaveClient`] is the seam both out-of-scope collaborators
//! (the local HTTP control server and the PKCS#11 shim) and the in-tree
//! [`crate::agent`] adapter call into.

pub mod client;
pub mod correlation;
pub mod profile;
pub mod protocol;

pub use client::EnclaveClient;
