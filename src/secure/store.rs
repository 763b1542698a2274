//! Generic encrypted-file persistence shared by the three secure
//! datasets (users, service accounts, account requests — spec §4.7, §6).
//!
//! Grounded on `crypto.rs` for the envelope cipher itself; the on-disk
//! JSON shape (`version`/`nonce`/`data`/`checksum`, each byte field
//! base64-encoded since JSON has no byte string) is new — the teacher
//! crate has no encrypted-at-rest surface to imitate, so this follows
//! the spec's §6 file layout directly, the same way `zhubby-moltis`'s
//! vault crate wraps a cipher behind a small save/load pair
//! (`crates/vault/src/vault.rs`).

use std::path::Path;

use base64::engine::general_purpose::STANDARD as base64_engine;
use base64::Engine;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult, IntegrityError};
use crate::secure::crypto::{self, Envelope};

#[derive(Serialize, Deserialize)]
struct FileEnvelope {
    version: u32,
    nonce: String,
    data: String,
    checksum: String,
}

/// The plaintext wrapped inside the envelope: the caller's dataset plus
/// a 32-byte salt blob (spec §6) generated once per file and carried
/// forward unchanged on every re-save, reserved for a future KDF
/// strengthening the machine-id-derived key is never required to use.
#[derive(Serialize, Deserialize)]
struct Inner<T> {
    salt: String,
    records: T,
}

/// Loads and decrypts `path`, or returns `Ok(None)` if the file does not
/// exist yet (a fresh install). Validates the checksum before attempting
/// decryption (spec §6): `InvalidChecksum` on mismatch, `Corrupted` on
/// anything else malformed.
pub fn load<T: DeserializeOwned>(path: &Path, key: &[u8; 32]) -> CoreResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| CoreError::Integrity(IntegrityError::Corrupted(format!("read failed: {e}"))))?;
    let file: FileEnvelope = serde_json::from_str(&raw)
        .map_err(|e| CoreError::Integrity(IntegrityError::Corrupted(format!("malformed envelope: {e}"))))?;

    let nonce = decode_fixed::<12>(&file.nonce)?;
    let checksum = decode_fixed::<32>(&file.checksum)?;
    let data = base64_engine
        .decode(&file.data)
        .map_err(|e| CoreError::Integrity(IntegrityError::Corrupted(format!("bad base64 data: {e}"))))?;

    let envelope = Envelope {
        version: file.version,
        nonce,
        data,
        checksum,
    };
    let plaintext = crypto::decrypt(key, &envelope)?;

    let inner: Inner<T> = serde_json::from_slice(&plaintext)
        .map_err(|e| CoreError::Integrity(IntegrityError::Corrupted(format!("malformed dataset: {e}"))))?;
    Ok(Some(inner.records))
}

/// Encrypts `records` and writes `path`, reusing `existing_salt` if the
/// file already carried one (the salt blob is stable across saves).
pub fn save<T: Serialize>(path: &Path, key: &[u8; 32], existing_salt: Option<&str>, records: &T) -> CoreResult<()> {
    let salt = existing_salt.map(str::to_string).unwrap_or_else(generate_salt);
    let inner = Inner { salt, records };
    let plaintext = serde_json::to_vec(&inner)
        .map_err(|e| CoreError::Internal(format!("failed to serialize dataset: {e}")))?;

    let envelope = crypto::encrypt(key, &plaintext);
    let file = FileEnvelope {
        version: envelope.version,
        nonce: base64_engine.encode(envelope.nonce),
        data: base64_engine.encode(&envelope.data),
        checksum: base64_engine.encode(envelope.checksum),
    };
    let json = serde_json::to_string_pretty(&file)
        .map_err(|e| CoreError::Internal(format!("failed to serialize envelope: {e}")))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CoreError::Internal(format!("failed to create data dir: {e}")))?;
    }
    std::fs::write(path, json).map_err(|e| CoreError::Internal(format!("failed to write {}: {e}", path.display())))?;
    Ok(())
}

fn generate_salt() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    base64_engine.encode(buf)
}

fn decode_fixed<const N: usize>(b64: &str) -> CoreResult<[u8; N]> {
    let bytes = base64_engine
        .decode(b64)
        .map_err(|e| CoreError::Integrity(IntegrityError::Corrupted(format!("bad base64: {e}"))))?;
    bytes
        .try_into()
        .map_err(|_| CoreError::Integrity(IntegrityError::Corrupted(format!("expected {N} bytes"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Dataset {
        names: Vec<String>,
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dataset.db");
        let key = crypto::derive_key("host-a");
        let dataset = Dataset {
            names: vec!["alice".into(), "bob".into()],
        };

        save(&path, &key, None, &dataset).unwrap();
        let loaded: Dataset = load(&path, &key).unwrap().unwrap();
        assert_eq!(loaded, dataset);
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.db");
        let key = crypto::derive_key("host-a");
        let loaded: Option<Dataset> = load(&path, &key).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn tampered_data_byte_is_rejected_scenario_s6() {
        // Scenario S6
        let dir = tempdir().unwrap();
        let path = dir.path().join("dataset.db");
        let key = crypto::derive_key("host-a");
        save(&path, &key, None, &Dataset { names: vec!["alice".into()] }).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let mut file: FileEnvelope = serde_json::from_str(&raw).unwrap();
        let mut data = base64_engine.decode(&file.data).unwrap();
        data[0] ^= 0xFF;
        file.data = base64_engine.encode(data);
        std::fs::write(&path, serde_json::to_string(&file).unwrap()).unwrap();

        let err = load::<Dataset>(&path, &key).unwrap_err();
        assert!(matches!(err, CoreError::Integrity(_)));
    }

    #[test]
    fn salt_is_preserved_across_saves() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dataset.db");
        let key = crypto::derive_key("host-a");
        save(&path, &key, None, &Dataset { names: vec![] }).unwrap();
        let raw1 = std::fs::read_to_string(&path).unwrap();
        let file1: FileEnvelope = serde_json::from_str(&raw1).unwrap();
        let plaintext1 = crypto::decrypt(
            &key,
            &Envelope {
                version: file1.version,
                nonce: decode_fixed::<12>(&file1.nonce).unwrap(),
                data: base64_engine.decode(&file1.data).unwrap(),
                checksum: decode_fixed::<32>(&file1.checksum).unwrap(),
            },
        )
        .unwrap();
        let inner1: Inner<Dataset> = serde_json::from_slice(&plaintext1).unwrap();

        save(&path, &key, Some(&inner1.salt), &Dataset { names: vec!["x".into()] }).unwrap();
        let raw2 = std::fs::read_to_string(&path).unwrap();
        let file2: FileEnvelope = serde_json::from_str(&raw2).unwrap();
        let plaintext2 = crypto::decrypt(
            &key,
            &Envelope {
                version: file2.version,
                nonce: decode_fixed::<12>(&file2.nonce).unwrap(),
                data: base64_engine.decode(&file2.data).unwrap(),
                checksum: decode_fixed::<32>(&file2.checksum).unwrap(),
            },
        )
        .unwrap();
        let inner2: Inner<Dataset> = serde_json::from_slice(&plaintext2).unwrap();
        assert_eq!(inner1.salt, inner2.salt);
    }
}
