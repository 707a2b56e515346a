//! Durable storage for a [`PairingSecret`].
//!
//! Production uses [`FilePersister`]: the whole bundle serialized to one
//! owner-only JSON file, written via a temp-file-plus-rename so a crash
//! mid-write never leaves a half-written pairing file behind.
//! [`MemoryPersister`] backs the in-process scenario tests in
//! [`crate::enclave::client`].

use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use x25519_dalek::StaticSecret as X25519Secret;

use super::secret::PairingSecret;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredPairing {
    workstation_x25519_secret: String,
    peer_x25519_public: Option<String>,
    symmetric_key: Option<String>,
    pairing_id: String,
}

impl StoredPairing {
    fn from_secret(secret: &PairingSecret) -> Self {
        Self {
            workstation_x25519_secret: BASE64.encode(secret.workstation_x25519_secret().to_bytes()),
            peer_x25519_public: secret
                .peer_x25519_public()
                .map(|k| BASE64.encode(k.as_bytes())),
            symmetric_key: secret.symmetric_key().map(|k| BASE64.encode(k)),
            pairing_id: BASE64.encode(secret.pairing_id()),
        }
    }

    fn into_secret(self) -> Result<PairingSecret> {
        let x_bytes = BASE64
            .decode(&self.workstation_x25519_secret)
            .context("invalid workstation secret encoding")?;
        let x_bytes: [u8; 32] = x_bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid workstation secret length"))?;
        let workstation_x25519_secret = X25519Secret::from(x_bytes);

        let peer_x25519_public = self
            .peer_x25519_public
            .map(|encoded| -> Result<_> {
                let bytes = BASE64.decode(&encoded).context("invalid peer key encoding")?;
                let bytes: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("invalid peer key length"))?;
                Ok(x25519_dalek::PublicKey::from(bytes))
            })
            .transpose()?;

        let symmetric_key = self
            .symmetric_key
            .map(|encoded| -> Result<[u8; 32]> {
                let bytes = BASE64.decode(&encoded).context("invalid symmetric key encoding")?;
                bytes
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("invalid symmetric key length"))
            })
            .transpose()?;

        let pairing_id_bytes = BASE64
            .decode(&self.pairing_id)
            .context("invalid pairing id encoding")?;
        let pairing_id: [u8; 16] = pairing_id_bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid pairing id length"))?;

        Ok(PairingSecret::from_parts(
            workstation_x25519_secret,
            peer_x25519_public,
            symmetric_key,
            pairing_id,
        ))
    }
}

/// Loads and saves the pairing bundle across daemon restarts.
pub trait Persister: Send + Sync {
    /// Load the persisted pairing, if any has been saved yet.
    fn load(&self) -> Result<Option<PairingSecret>>;
    /// Persist `secret`, replacing whatever was saved before.
    fn save(&self, secret: &PairingSecret) -> Result<()>;
    /// Remove any persisted pairing (used by `unpair`).
    fn delete(&self) -> Result<()>;
}

/// File-backed persister: one JSON file at `{state_dir}/pairing.json`, 0600,
/// written atomically.
#[derive(Debug)]
pub struct FilePersister {
    path: PathBuf,
}

impl FilePersister {
    /// Persist to `path` (typically `Config::state_dir().join("pairing.json")`).
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn write_atomic(&self, content: &str) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("pairing file path has no parent directory"))?;
        fs::create_dir_all(dir).context("failed to create pairing state directory")?;

        let tmp_path = tmp_path_for(&self.path);
        fs::write(&tmp_path, content).context("failed to write pairing temp file")?;

        #[cfg(unix)]
        {
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&tmp_path, perms).context("failed to set pairing file permissions")?;
        }

        fs::rename(&tmp_path, &self.path).context("failed to install pairing file")?;
        Ok(())
    }
}

impl Persister for FilePersister {
    fn load(&self) -> Result<Option<PairingSecret>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path).context("failed to read pairing file")?;
        let stored: StoredPairing =
            serde_json::from_str(&content).context("failed to parse pairing file")?;
        Ok(Some(stored.into_secret()?))
    }

    fn save(&self, secret: &PairingSecret) -> Result<()> {
        let stored = StoredPairing::from_secret(secret);
        let content =
            serde_json::to_string_pretty(&stored).context("failed to serialize pairing file")?;
        self.write_atomic(&content)
    }

    fn delete(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).context("failed to delete pairing file")?;
        }
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("pairing.json");
    path.with_file_name(format!(".{file_name}.tmp"))
}

/// In-memory persister for scenario tests: no filesystem, no atomicity to verify.
#[derive(Debug, Default)]
pub struct MemoryPersister {
    stored: Mutex<Option<StoredPairing>>,
}

impl MemoryPersister {
    /// New, empty persister.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persister for MemoryPersister {
    fn load(&self) -> Result<Option<PairingSecret>> {
        let guard = self.stored.lock().expect("memory persister lock poisoned");
        guard.as_ref().map(|s| s.clone_stored()?.into_secret()).transpose()
    }

    fn save(&self, secret: &PairingSecret) -> Result<()> {
        let mut guard = self.stored.lock().expect("memory persister lock poisoned");
        *guard = Some(StoredPairing::from_secret(secret));
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        let mut guard = self.stored.lock().expect("memory persister lock poisoned");
        *guard = None;
        Ok(())
    }
}

impl StoredPairing {
    fn clone_stored(&self) -> Result<Self> {
        Ok(Self {
            workstation_x25519_secret: self.workstation_x25519_secret.clone(),
            peer_x25519_public: self.peer_x25519_public.clone(),
            symmetric_key: self.symmetric_key.clone(),
            pairing_id: self.pairing_id.clone(),
        })
    }
}
