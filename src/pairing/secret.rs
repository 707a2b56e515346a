//! The single cryptographic identity of one workstation↔phone pairing.
//!
//! `PairingSecret` owns the workstation's ECDH key pair for this pairing,
//! the peer's long-term public key once learned, the symmetric AEAD channel
//! key once installed by the one-time key-wrap frame, and a stable pairing
//! identifier every derived name (queue names, Bluetooth service UUID) is a
//! pure function of. The key-wrap frame and every subsequent payload frame
//! share one AES-256-GCM envelope shape (random nonce, then ciphertext); the
//! key-wrap step layers an ECDH-derived wrap key on top to deliver the
//! channel key itself.

use std::sync::RwLock;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret as X25519Secret};

use crate::device::Device;
use crate::errors::KeybridgeError;

const NONCE_SIZE: usize = 12;
const KEY_WRAP_TAG: u8 = 0x01;
const PAYLOAD_TAG: u8 = 0x02;

/// Result of feeding an inbound frame through [`PairingSecret::unwrap_key_if_present`].
#[derive(Debug)]
pub enum KeyWrapOutcome {
    /// The frame was the one-time key-wrap message; the symmetric channel
    /// key is now installed.
    Installed,
    /// The frame was a regular payload; here is its (still-encrypted) body,
    /// ready for [`PairingSecret::decrypt_message`].
    Payload(Vec<u8>),
}

/// The cryptographic identity of one pairing.
pub struct PairingSecret {
    workstation_x25519_secret: X25519Secret,
    workstation_x25519_public: X25519Public,
    peer_x25519_public: RwLock<Option<X25519Public>>,
    symmetric_key: RwLock<Option<[u8; 32]>>,
    pairing_id: [u8; 16],
}

impl std::fmt::Debug for PairingSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingSecret")
            .field("pairing_id", &hex(&self.pairing_id))
            .field("is_paired", &self.is_paired())
            .finish_non_exhaustive()
    }
}

impl PairingSecret {
    /// Generate a fresh pairing: new workstation ECDH key pair (borrowed
    /// from the workstation's long-term identity, per `SPEC_FULL.md` §4.1),
    /// fresh pairing identifier, no symmetric key installed yet.
    #[must_use]
    pub fn generate(device: &Device) -> Self {
        let mut pairing_id = [0u8; 16];
        rand::rng().fill_bytes(&mut pairing_id);

        Self {
            workstation_x25519_secret: device.x25519_secret.clone(),
            workstation_x25519_public: device.x25519_public,
            peer_x25519_public: RwLock::new(None),
            symmetric_key: RwLock::new(None),
            pairing_id,
        }
    }

    /// Reconstruct from persisted components (used by [`crate::pairing::persister`]).
    #[must_use]
    pub fn from_parts(
        workstation_x25519_secret: X25519Secret,
        peer_x25519_public: Option<X25519Public>,
        symmetric_key: Option<[u8; 32]>,
        pairing_id: [u8; 16],
    ) -> Self {
        let workstation_x25519_public = X25519Public::from(&workstation_x25519_secret);
        Self {
            workstation_x25519_secret,
            workstation_x25519_public,
            peer_x25519_public: RwLock::new(peer_x25519_public),
            symmetric_key: RwLock::new(symmetric_key),
            pairing_id,
        }
    }

    /// Stable identifier for this pairing.
    #[must_use]
    pub fn pairing_id(&self) -> [u8; 16] {
        self.pairing_id
    }

    /// Workstation ECDH secret for this pairing (exposed for persistence only).
    #[must_use]
    pub fn workstation_x25519_secret(&self) -> &X25519Secret {
        &self.workstation_x25519_secret
    }

    /// Workstation ECDH public key, published to the phone at pairing time.
    #[must_use]
    pub fn workstation_x25519_public(&self) -> X25519Public {
        self.workstation_x25519_public
    }

    /// The peer's long-term public key, once learned.
    #[must_use]
    pub fn peer_x25519_public(&self) -> Option<X25519Public> {
        *self.peer_x25519_public.read().expect("pairing secret lock poisoned")
    }

    /// Record the peer's long-term public key (learned at pair time or via QR).
    pub fn set_peer_x25519_public(&self, key: X25519Public) {
        *self.peer_x25519_public.write().expect("pairing secret lock poisoned") = Some(key);
    }

    /// Deterministic Bluetooth service UUID, a pure function of `pairing_id`.
    #[must_use]
    pub fn derive_uuid(&self) -> uuid::Uuid {
        uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, &self.pairing_id)
    }

    /// Deterministic cloud send-queue name.
    #[must_use]
    pub fn send_queue_name(&self) -> String {
        format!("keybridge-{}-send", hex(&self.pairing_id))
    }

    /// Deterministic cloud receive-queue name.
    #[must_use]
    pub fn receive_queue_name(&self) -> String {
        format!("keybridge-{}-recv", hex(&self.pairing_id))
    }

    /// True iff the symmetric channel key has been installed.
    #[must_use]
    pub fn is_paired(&self) -> bool {
        self.symmetric_key.read().expect("pairing secret lock poisoned").is_some()
    }

    /// Snapshot the installed symmetric key (for persistence).
    #[must_use]
    pub fn symmetric_key(&self) -> Option<[u8; 32]> {
        *self.symmetric_key.read().expect("pairing secret lock poisoned")
    }

    /// Feed one inbound frame. If it is the one-time key-wrap message,
    /// install the symmetric key atomically and report [`KeyWrapOutcome::Installed`];
    /// otherwise return the payload ciphertext for [`Self::decrypt_message`].
    pub fn unwrap_key_if_present(&self, frame: &[u8]) -> Result<KeyWrapOutcome, KeybridgeError> {
        let (tag, body) = frame
            .split_first()
            .ok_or_else(|| KeybridgeError::Protocol("empty frame".into()))?;

        match *tag {
            KEY_WRAP_TAG => {
                if body.len() < 32 + NONCE_SIZE {
                    return Err(KeybridgeError::Protocol("key-wrap frame too short".into()));
                }
                let (peer_ephemeral_bytes, rest) = body.split_at(32);
                let (nonce_bytes, ciphertext) = rest.split_at(NONCE_SIZE);

                let peer_ephemeral: [u8; 32] = peer_ephemeral_bytes
                    .try_into()
                    .map_err(|_| KeybridgeError::Protocol("malformed ephemeral key".into()))?;
                let peer_ephemeral_public = X25519Public::from(peer_ephemeral);

                let shared = self
                    .workstation_x25519_secret
                    .diffie_hellman(&peer_ephemeral_public);
                let wrap_key = derive_wrap_key(shared.as_bytes());

                let cipher = Aes256Gcm::new_from_slice(&wrap_key)
                    .map_err(|e| KeybridgeError::Protocol(format!("bad wrap key: {e}")))?;
                let nonce = Nonce::from_slice(nonce_bytes);
                let plaintext = cipher
                    .decrypt(nonce, ciphertext)
                    .map_err(|_| KeybridgeError::Protocol("key-wrap decryption failed".into()))?;

                let key: [u8; 32] = plaintext
                    .try_into()
                    .map_err(|_| KeybridgeError::Protocol("wrapped key has wrong length".into()))?;

                *self.symmetric_key.write().expect("pairing secret lock poisoned") = Some(key);
                self.set_peer_x25519_public(peer_ephemeral_public);

                Ok(KeyWrapOutcome::Installed)
            }
            PAYLOAD_TAG => Ok(KeyWrapOutcome::Payload(body.to_vec())),
            other => Err(KeybridgeError::Protocol(format!("unknown frame tag {other:#x}"))),
        }
    }

    /// Encrypt `plaintext` under the installed symmetric key, producing a
    /// frame ready to hand to a [`crate::transport::Transport`].
    pub fn encrypt_message(&self, plaintext: &[u8]) -> Result<Vec<u8>, KeybridgeError> {
        let key = self
            .symmetric_key()
            .ok_or(KeybridgeError::WaitingForKey)?;

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| KeybridgeError::Protocol(format!("bad channel key: {e}")))?;
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| KeybridgeError::SendError(format!("encryption failed: {e}")))?;

        let mut frame = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
        frame.push(PAYLOAD_TAG);
        frame.extend_from_slice(&nonce_bytes);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Decrypt a payload body previously returned by [`Self::unwrap_key_if_present`]
    /// as `KeyWrapOutcome::Payload` (i.e. the tag byte already stripped).
    pub fn decrypt_message(&self, body: &[u8]) -> Result<Vec<u8>, KeybridgeError> {
        let key = self
            .symmetric_key()
            .ok_or(KeybridgeError::WaitingForKey)?;
        if body.len() < NONCE_SIZE {
            return Err(KeybridgeError::Protocol("payload too short".into()));
        }
        let (nonce_bytes, ciphertext) = body.split_at(NONCE_SIZE);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| KeybridgeError::Protocol(format!("bad channel key: {e}")))?;
        let nonce = Nonce::from_slice(nonce_bytes);
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| KeybridgeError::Protocol("payload decryption failed".into()))
    }
}

fn derive_wrap_key(shared_secret: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut out = [0u8; 32];
    hk.expand(b"keybridge-pairing-wrap-key-v1", &mut out)
        .expect("32 bytes is a valid HKDF output length");
    out
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_device() -> Device {
        Device::new_for_test()
    }

    fn make_key_wrap_frame(
        our_public: X25519Public,
        symmetric_key: [u8; 32],
    ) -> (Vec<u8>, X25519Secret) {
        let mut phone_secret_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut phone_secret_bytes);
        let phone_secret = X25519Secret::from(phone_secret_bytes);
        let phone_public = X25519Public::from(&phone_secret);

        let shared = phone_secret.diffie_hellman(&our_public);
        let wrap_key = derive_wrap_key(shared.as_bytes());

        let cipher = Aes256Gcm::new_from_slice(&wrap_key).unwrap();
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher.encrypt(nonce, symmetric_key.as_ref()).unwrap();

        let mut frame = vec![KEY_WRAP_TAG];
        frame.extend_from_slice(phone_public.as_bytes());
        frame.extend_from_slice(&nonce_bytes);
        frame.extend_from_slice(&ciphertext);
        (frame, phone_secret)
    }

    #[test]
    fn not_paired_before_key_wrap() {
        let device = test_device();
        let secret = PairingSecret::generate(&device);
        assert!(!secret.is_paired());
        assert!(matches!(
            secret.encrypt_message(b"hi"),
            Err(KeybridgeError::WaitingForKey)
        ));
    }

    #[test]
    fn key_wrap_installs_symmetric_key() {
        let device = test_device();
        let secret = PairingSecret::generate(&device);
        let symmetric_key = [9u8; 32];
        let (frame, _phone_secret) =
            make_key_wrap_frame(secret.workstation_x25519_public(), symmetric_key);

        let outcome = secret.unwrap_key_if_present(&frame).unwrap();
        assert!(matches!(outcome, KeyWrapOutcome::Installed));
        assert!(secret.is_paired());
        assert_eq!(secret.symmetric_key(), Some(symmetric_key));
    }

    #[test]
    fn encrypt_decrypt_roundtrip_after_pairing() {
        let device = test_device();
        let secret = PairingSecret::generate(&device);
        let symmetric_key = [3u8; 32];
        let (frame, _) = make_key_wrap_frame(secret.workstation_x25519_public(), symmetric_key);
        secret.unwrap_key_if_present(&frame).unwrap();

        let encrypted = secret.encrypt_message(b"hello enclave").unwrap();
        let outcome = secret.unwrap_key_if_present(&encrypted).unwrap();
        let KeyWrapOutcome::Payload(body) = outcome else {
            panic!("expected a payload frame");
        };
        let decrypted = secret.decrypt_message(&body).unwrap();
        assert_eq!(decrypted, b"hello enclave");
    }

    #[test]
    fn derived_identifiers_are_pure_functions_of_pairing_id() {
        let device = test_device();
        let secret = PairingSecret::generate(&device);
        assert_eq!(secret.derive_uuid(), secret.derive_uuid());
        assert_eq!(secret.send_queue_name(), secret.send_queue_name());
        assert_ne!(secret.send_queue_name(), secret.receive_queue_name());
    }

    #[test]
    fn two_generate_calls_yield_different_pairing_ids() {
        let device = test_device();
        let a = PairingSecret::generate(&device);
        let b = PairingSecret::generate(&device);
        assert_ne!(a.pairing_id(), b.pairing_id());
        assert_ne!(a.derive_uuid(), b.derive_uuid());
    }
}
