//! Argon2id password hashing for `User` records (spec §4.7): a per-user
//! 16-byte salt plus `(time=1, memory=64 MiB, parallelism=4, out_len=32)`.
//!
//! Grounded on `zhubby-moltis`'s vault KDF
//! (`crates/vault/src/kdf.rs::derive_key`) for the low-level
//! `Argon2::hash_password_into` call shape; unlike the vault (which
//! derives a key to wrap a DEK), the output here is compared directly
//! against a stored hash, constant-time, via `subtle`.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::config::SecureStoreConfig;
use crate::error::{CoreError, CoreResult};

pub fn generate_salt() -> [u8; 16] {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derives the 32-byte Argon2id hash for `password` under `salt`.
pub fn hash(cfg: &SecureStoreConfig, password: &str, salt: &[u8; 16]) -> CoreResult<[u8; 32]> {
    let params = Params::new(cfg.argon2_memory_kib, cfg.argon2_iterations, cfg.argon2_parallelism, Some(32))
        .map_err(|e| CoreError::Internal(format!("invalid argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut out = [0u8; 32];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut out)
        .map_err(|e| CoreError::Internal(format!("argon2 hashing failed: {e}")))?;
    Ok(out)
}

/// `verify(password, hash(password, salt), salt) == true`;
/// `verify(wrong, …) == false` — compared in constant time to avoid
/// leaking the hash through timing.
pub fn verify(cfg: &SecureStoreConfig, password: &str, salt: &[u8; 16], expected: &[u8; 32]) -> bool {
    match hash(cfg, password, salt) {
        Ok(actual) => actual.ct_eq(expected).into(),
        Err(_) => false,
    }
}
