//! Envelope encryption for the secure state store (spec §4.7, §6):
//! AES-256-GCM keyed by a SHA-256 digest of the machine identifier,
//! checksummed before decryption so corruption is caught before the
//! cipher ever runs.
//!
//! No teacher analogue — the teacher crate has no encrypted-at-rest
//! surface. Grounded on `zhubby-moltis`/`paritytech-polkadot-sdk`'s use
//! of `aes-gcm`/`sha2` for the crate choice; the envelope shape itself
//! comes directly from the spec's file layout.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, IntegrityError};

const KEY_CONTEXT: &[u8] = b"gortms-encryption-key";

/// SHA-256(machine_id ‖ "gortms-encryption-key"), used directly as the
/// AES-256 key.
pub fn derive_key(machine_id: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(machine_id.as_bytes());
    hasher.update(KEY_CONTEXT);
    hasher.finalize().into()
}

/// Reads the platform machine identifier; falls back to a fixed string
/// (with a loud log from the caller) if none is available, rather than
/// failing outright — a single-host dev setup without `/etc/machine-id`
/// should still work.
pub fn machine_id() -> String {
    std::fs::read_to_string("/etc/machine-id")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|_| "gortms-dev-machine".to_string())
}

pub struct Envelope {
    pub version: u32,
    pub nonce: [u8; 12],
    pub data: Vec<u8>,
    pub checksum: [u8; 32],
}

pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Envelope {
    let cipher = Aes256Gcm::new(key.into());
    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let data = cipher
        .encrypt(nonce, plaintext)
        .expect("AES-256-GCM encryption cannot fail for a valid key/nonce");
    let checksum = Sha256::digest(&data).into();
    Envelope {
        version: 1,
        nonce: nonce_bytes,
        data,
        checksum,
    }
}

/// Validates the checksum before attempting decryption (spec §6):
/// `InvalidChecksum` on mismatch, `Corrupted` on anything else that goes
/// wrong (bad version, GCM auth failure, non-UTF8 plaintext upstream).
pub fn decrypt(key: &[u8; 32], envelope: &Envelope) -> Result<Vec<u8>, CoreError> {
    if envelope.version != 1 {
        return Err(IntegrityError::Corrupted(format!("unsupported envelope version {}", envelope.version)).into());
    }
    let expected: [u8; 32] = Sha256::digest(&envelope.data).into();
    if expected != envelope.checksum {
        return Err(IntegrityError::InvalidChecksum.into());
    }

    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from_slice(&envelope.nonce);
    cipher
        .decrypt(nonce, envelope.data.as_ref())
        .map_err(|_| IntegrityError::Corrupted("AES-GCM authentication failed".to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plaintext() {
        let key = derive_key("host-a");
        let envelope = encrypt(&key, b"hello world");
        let plaintext = decrypt(&key, &envelope).unwrap();
        assert_eq!(plaintext, b"hello world");
    }

    #[test]
    fn tampered_checksum_is_rejected() {
        let key = derive_key("host-a");
        let mut envelope = encrypt(&key, b"hello world");
        envelope.checksum[0] ^= 0xFF;
        let err = decrypt(&key, &envelope).unwrap_err();
        assert!(matches!(err, CoreError::Integrity(IntegrityError::InvalidChecksum)));
    }

    #[test]
    fn unsupported_version_is_corrupted() {
        let key = derive_key("host-a");
        let mut envelope = encrypt(&key, b"hello world");
        envelope.version = 2;
        let err = decrypt(&key, &envelope).unwrap_err();
        assert!(matches!(err, CoreError::Integrity(IntegrityError::Corrupted(_))));
    }

    #[test]
    fn wrong_key_fails_gcm_auth() {
        let envelope = encrypt(&derive_key("host-a"), b"hello world");
        let err = decrypt(&derive_key("host-b"), &envelope).unwrap_err();
        assert!(matches!(err, CoreError::Integrity(IntegrityError::Corrupted(_))));
    }
}
