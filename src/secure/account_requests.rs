//! Account requests (spec §3, §4.7): pending user-creation records
//! created out-of-band (an admin dropping a file) and reconciled by the
//! file watcher (`watcher.rs`), awaiting administrative review.
//!
//! Grounded on `users.rs` for the encrypted-store shape; `approve`
//! additionally provisions the real `User` record, which the distilled
//! spec leaves to "administrative attention" but which is the only
//! sensible completion of the request lifecycle described in spec §3.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SecureStoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::secure::store;
use crate::secure::users::{Role, User, UserStore};
use crate::time::current_time_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRequest {
    pub id: Uuid,
    pub username: String,
    pub requested_role: Role,
    pub status: RequestStatus,
    #[serde(with = "hash_hex")]
    pub password_hash: [u8; 32],
    #[serde(with = "salt_hex")]
    pub salt: [u8; 16],
    pub reviewer: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

mod hash_hex {
    use serde::{Deserialize, Deserializer, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

mod salt_hex {
    use serde::{Deserialize, Deserializer, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 16], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}

/// The external, plaintext submission shape a dropped file carries —
/// never persisted verbatim, only ever read once and turned into a
/// hashed `AccountRequest` (spec §4.7).
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingRequest {
    pub username: String,
    pub requested_role: Role,
    pub password: String,
}

#[derive(Default, Serialize, Deserialize)]
struct Dataset {
    requests: Vec<AccountRequest>,
}

pub struct AccountRequestStore {
    path: PathBuf,
    key: [u8; 32],
    cfg: SecureStoreConfig,
    by_id: DashMap<Uuid, AccountRequest>,
    salt_blob: Mutex<Option<String>>,
}

impl AccountRequestStore {
    pub fn load(data_dir: &Path, key: [u8; 32], cfg: SecureStoreConfig) -> CoreResult<Arc<Self>> {
        let path = data_dir.join("account_requests.db");
        let dataset: Dataset = store::load(&path, &key)?.unwrap_or_default();
        let by_id = DashMap::new();
        for request in dataset.requests {
            by_id.insert(request.id, request);
        }
        Ok(Arc::new(Self {
            path,
            key,
            cfg,
            by_id,
            salt_blob: Mutex::new(None),
        }))
    }

    fn persist(&self) -> CoreResult<()> {
        let requests: Vec<AccountRequest> = self.by_id.iter().map(|e| e.value().clone()).collect();
        let salt = self.salt_blob.lock().clone();
        store::save(&self.path, &self.key, salt.as_deref(), &Dataset { requests })
    }

    pub fn has_pending_for(&self, username: &str) -> bool {
        self.by_id
            .iter()
            .any(|e| e.value().username == username && e.value().status == RequestStatus::Pending)
    }

    /// Hashes the incoming plaintext password and stores a new pending
    /// request. Called by the file watcher's reconciliation pass.
    pub fn submit(&self, incoming: &IncomingRequest) -> CoreResult<AccountRequest> {
        let salt = crate::secure::password::generate_salt();
        let password_hash = crate::secure::password::hash(&self.cfg, &incoming.password, &salt)?;
        let now = current_time_ms();
        let request = AccountRequest {
            id: Uuid::new_v4(),
            username: incoming.username.clone(),
            requested_role: incoming.requested_role,
            status: RequestStatus::Pending,
            password_hash,
            salt,
            reviewer: None,
            created_at: now,
            updated_at: now,
        };
        self.by_id.insert(request.id, request.clone());
        self.persist()?;
        Ok(request)
    }

    pub fn list_pending(&self) -> Vec<AccountRequest> {
        self.by_id
            .iter()
            .filter(|e| e.value().status == RequestStatus::Pending)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn get(&self, id: Uuid) -> Option<AccountRequest> {
        self.by_id.get(&id).map(|e| e.value().clone())
    }

    pub fn reject(&self, id: Uuid, reviewer: &str) -> CoreResult<AccountRequest> {
        let mut entry = self
            .by_id
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("account request '{id}'")))?;
        entry.status = RequestStatus::Rejected;
        entry.reviewer = Some(reviewer.to_string());
        entry.updated_at = current_time_ms();
        let updated = entry.clone();
        drop(entry);
        self.persist()?;
        Ok(updated)
    }

    /// Approves the request and provisions the real `User` record,
    /// reusing the already-hashed password/salt pair rather than
    /// re-hashing (the plaintext password was never retained).
    pub fn approve(&self, id: Uuid, reviewer: &str, users: &UserStore) -> CoreResult<User> {
        let mut entry = self
            .by_id
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("account request '{id}'")))?;
        if entry.status != RequestStatus::Pending {
            return Err(CoreError::Validation(format!("request '{id}' is not pending")));
        }
        entry.status = RequestStatus::Approved;
        entry.reviewer = Some(reviewer.to_string());
        entry.updated_at = current_time_ms();
        let request = entry.clone();
        drop(entry);
        self.persist()?;

        users.adopt_hashed(&request.username, request.password_hash, request.salt, request.requested_role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fast_cfg() -> SecureStoreConfig {
        SecureStoreConfig {
            argon2_memory_kib: 256,
            argon2_iterations: 1,
            argon2_parallelism: 1,
            ..SecureStoreConfig::default()
        }
    }

    #[test]
    fn approve_provisions_a_real_user() {
        let dir = tempdir().unwrap();
        let key = crate::secure::crypto::derive_key("host-a");
        let requests = AccountRequestStore::load(dir.path(), key, fast_cfg()).unwrap();
        let users = UserStore::load(dir.path(), key, fast_cfg()).unwrap();

        let request = requests
            .submit(&IncomingRequest {
                username: "carol".to_string(),
                requested_role: Role::User,
                password: "s3cret".to_string(),
            })
            .unwrap();

        let user = requests.approve(request.id, "admin", &users).unwrap();
        assert_eq!(user.username, "carol");
        assert!(users.verify("carol", "s3cret"));
        assert_eq!(requests.get(request.id).unwrap().status, RequestStatus::Approved);
    }

    #[test]
    fn reject_leaves_no_user_behind() {
        let dir = tempdir().unwrap();
        let key = crate::secure::crypto::derive_key("host-a");
        let requests = AccountRequestStore::load(dir.path(), key, fast_cfg()).unwrap();

        let request = requests
            .submit(&IncomingRequest {
                username: "dave".to_string(),
                requested_role: Role::User,
                password: "x".to_string(),
            })
            .unwrap();
        requests.reject(request.id, "admin").unwrap();
        assert_eq!(requests.get(request.id).unwrap().status, RequestStatus::Rejected);
        assert!(requests.list_pending().is_empty());
    }

    #[test]
    fn double_approval_is_rejected() {
        let dir = tempdir().unwrap();
        let key = crate::secure::crypto::derive_key("host-a");
        let requests = AccountRequestStore::load(dir.path(), key, fast_cfg()).unwrap();
        let users = UserStore::load(dir.path(), key, fast_cfg()).unwrap();

        let request = requests
            .submit(&IncomingRequest {
                username: "erin".to_string(),
                requested_role: Role::Admin,
                password: "x".to_string(),
            })
            .unwrap();
        requests.approve(request.id, "admin", &users).unwrap();
        assert!(requests.approve(request.id, "admin", &users).is_err());
    }
}
