//! Workstation long-term identity.
//!
//! The workstation's half of a pairing needs two long-term keys: an X25519
//! key pair used only for the one-time ECDH key-wrap handshake ([`crate::pairing`]),
//! and an Ed25519 signing key used to authenticate the workstation to the
//! phone during pairing. Both are generated once and persisted alongside a
//! human-readable fingerprint for visual verification.

use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret as X25519Secret};

/// On-disk representation of the workstation's long-term identity.
///
/// Secret key material lives here too: the Persister already treats the
/// entire pairing bundle as a single owner-only file per
/// [`crate::pairing::persister`], so the device identity file follows the
/// same model rather than adding a second storage path.
#[derive(Debug, Serialize, Deserialize, zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
struct StoredDevice {
    ed25519_secret: String,
    x25519_secret: String,
    #[zeroize(skip)]
    fingerprint: String,
    #[zeroize(skip)]
    name: String,
}

/// Runtime workstation identity with parsed keys.
pub struct Device {
    /// Ed25519 signing key, used to authenticate to the phone at pairing time.
    pub signing_key: SigningKey,
    /// Ed25519 verifying key (public half of `signing_key`).
    pub verifying_key: VerifyingKey,
    /// X25519 secret used for the one-time ECDH key-wrap exchange.
    pub x25519_secret: X25519Secret,
    /// X25519 public key, published to the phone at pairing time.
    pub x25519_public: X25519Public,
    /// Human-readable fingerprint for visual verification.
    pub fingerprint: String,
    /// Device name (defaults to hostname).
    pub name: String,
    config_path: PathBuf,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("fingerprint", &self.fingerprint)
            .field("name", &self.name)
            .field("config_path", &self.config_path)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Load the existing device identity, or create and persist a new one.
    pub fn load_or_create() -> Result<Self> {
        let config_path = Self::config_path()?;
        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            Self::create_new(&config_path)
        }
    }

    /// Directory device identity (and, by convention, pairing state) lives in.
    pub fn config_dir() -> Result<PathBuf> {
        crate::config::Config::config_dir()
    }

    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("device.json"))
    }

    fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path).context("failed to read device identity")?;
        let stored: StoredDevice =
            serde_json::from_str(&content).context("failed to parse device identity")?;

        let ed_bytes = BASE64
            .decode(&stored.ed25519_secret)
            .context("invalid ed25519 secret encoding")?;
        let ed_bytes: [u8; 32] = ed_bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid ed25519 secret length"))?;
        let signing_key = SigningKey::from_bytes(&ed_bytes);
        let verifying_key = signing_key.verifying_key();

        let x_bytes = BASE64
            .decode(&stored.x25519_secret)
            .context("invalid x25519 secret encoding")?;
        let x_bytes: [u8; 32] = x_bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid x25519 secret length"))?;
        let x25519_secret = X25519Secret::from(x_bytes);
        let x25519_public = X25519Public::from(&x25519_secret);

        log::info!("loaded device identity fingerprint={}", stored.fingerprint);

        Ok(Self {
            signing_key,
            verifying_key,
            x25519_secret,
            x25519_public,
            fingerprint: stored.fingerprint,
            name: stored.name,
            config_path: path.clone(),
        })
    }

    fn create_new(path: &PathBuf) -> Result<Self> {
        let mut ed_secret = [0u8; 32];
        rand::rng().fill_bytes(&mut ed_secret);
        let signing_key = SigningKey::from_bytes(&ed_secret);
        let verifying_key = signing_key.verifying_key();

        let mut x_secret_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut x_secret_bytes);
        let x25519_secret = X25519Secret::from(x_secret_bytes);
        let x25519_public = X25519Public::from(&x25519_secret);

        let fingerprint = Self::compute_fingerprint(&verifying_key, &x25519_public);
        let name = Self::default_name();

        let stored = StoredDevice {
            ed25519_secret: BASE64.encode(ed_secret),
            x25519_secret: BASE64.encode(x_secret_bytes),
            fingerprint: fingerprint.clone(),
            name: name.clone(),
        };
        let content =
            serde_json::to_string_pretty(&stored).context("failed to serialize device identity")?;
        fs::write(path, content).context("failed to write device identity")?;

        #[cfg(unix)]
        {
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("failed to set device identity permissions")?;
        }

        log::info!("created new device identity fingerprint={}", fingerprint);

        Ok(Self {
            signing_key,
            verifying_key,
            x25519_secret,
            x25519_public,
            fingerprint,
            name,
            config_path: path.clone(),
        })
    }

    /// Fingerprint: first 8 bytes of `SHA256(ed25519_pub || x25519_pub)` as
    /// colon-separated hex, so a changed encryption key also changes the
    /// fingerprint the user verifies.
    fn compute_fingerprint(verifying_key: &VerifyingKey, x25519_public: &X25519Public) -> String {
        let mut hasher = Sha256::new();
        hasher.update(verifying_key.as_bytes());
        hasher.update(x25519_public.as_bytes());
        let hash = hasher.finalize();
        hash[..8]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    fn default_name() -> String {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .map_or_else(|| "keybridge".to_string(), |h| format!("keybridge ({h})"))
    }

    /// Public identity to publish to the phone at pairing time.
    #[must_use]
    pub fn ed25519_public_base64(&self) -> String {
        BASE64.encode(self.verifying_key.as_bytes())
    }

    /// X25519 public key to publish to the phone at pairing time.
    #[must_use]
    pub fn x25519_public_base64(&self) -> String {
        BASE64.encode(self.x25519_public.as_bytes())
    }
}

#[cfg(test)]
impl Device {
    /// Build a throwaway identity for tests that need a `Device` without
    /// touching disk (e.g. [`crate::pairing::secret`]'s test module).
    #[must_use]
    pub fn new_for_test() -> Self {
        let mut ed_secret = [0u8; 32];
        rand::rng().fill_bytes(&mut ed_secret);
        let signing_key = SigningKey::from_bytes(&ed_secret);
        let verifying_key = signing_key.verifying_key();

        let mut x_secret_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut x_secret_bytes);
        let x25519_secret = X25519Secret::from(x_secret_bytes);
        let x25519_public = X25519Public::from(&x25519_secret);

        let fingerprint = Self::compute_fingerprint(&verifying_key, &x25519_public);

        Self {
            signing_key,
            verifying_key,
            x25519_secret,
            x25519_public,
            fingerprint,
            name: "test".into(),
            config_path: PathBuf::from("/dev/null"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_format() {
        let mut ed_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut ed_bytes);
        let signing_key = SigningKey::from_bytes(&ed_bytes);
        let verifying_key = signing_key.verifying_key();

        let mut x_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut x_bytes);
        let x_secret = X25519Secret::from(x_bytes);
        let x_public = X25519Public::from(&x_secret);

        let fingerprint = Device::compute_fingerprint(&verifying_key, &x_public);
        let parts: Vec<&str> = fingerprint.split(':').collect();
        assert_eq!(parts.len(), 8);
        for part in parts {
            assert_eq!(part.len(), 2);
            assert!(part.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}
