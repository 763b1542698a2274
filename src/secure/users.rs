//! Encrypted on-disk user store (spec §3, §4.7): `users.db`.
//!
//! Grounded on the teacher's `QueueManager`/`StoreManager` registry
//! shape (`DashMap` keyed by id, one lock-free directory the whole
//! process shares) generalized here to add disk persistence behind it —
//! the teacher has nothing persisted to disk to imitate directly, so the
//! save/load wiring is adapted from `secure::store`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SecureStoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::secure::{password, store};
use crate::time::current_time_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    #[serde(with = "hash_hex")]
    pub password_hash: [u8; 32],
    #[serde(with = "salt_hex")]
    pub salt: [u8; 16],
    pub role: Role,
    pub created_at: u64,
    pub updated_at: u64,
    pub enabled: bool,
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

#[derive(Default, Serialize, Deserialize)]
struct Dataset {
    users: Vec<User>,
}

pub struct UserStore {
    path: PathBuf,
    key: [u8; 32],
    cfg: SecureStoreConfig,
    by_id: DashMap<Uuid, User>,
    salt_blob: Mutex<Option<String>>,
}

impl UserStore {
    pub fn load(data_dir: &Path, key: [u8; 32], cfg: SecureStoreConfig) -> CoreResult<Arc<Self>> {
        let path = data_dir.join("users.db");
        let dataset: Dataset = store::load(&path, &key)?.unwrap_or_default();
        let by_id = DashMap::new();
        for user in dataset.users {
            by_id.insert(user.id, user);
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
        let users: Vec<User> = self.by_id.iter().map(|e| e.value().clone()).collect();
        let salt = self.salt_blob.lock().clone();
        store::save(&self.path, &self.key, salt.as_deref(), &Dataset { users })
    }

    pub fn create_user(&self, username: &str, password: &str, role: Role) -> CoreResult<User> {
        if self.by_id.iter().any(|e| e.value().username == username) {
            return Err(CoreError::AlreadyExists(format!("user '{username}'")));
        }
        let salt = password::generate_salt();
        let password_hash = password::hash(&self.cfg, password, &salt)?;
        let now = current_time_ms();
        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            password_hash,
            salt,
            role,
            created_at: now,
            updated_at: now,
            enabled: true,
        };
        self.by_id.insert(user.id, user.clone());
        self.persist()?;
        Ok(user)
    }

    /// Provisions a user from an already-hashed password/salt pair —
    /// used when an account request is approved, since the plaintext
    /// password was never retained past the initial hash (spec §4.7).
    pub fn adopt_hashed(&self, username: &str, password_hash: [u8; 32], salt: [u8; 16], role: Role) -> CoreResult<User> {
        if self.by_id.iter().any(|e| e.value().username == username) {
            return Err(CoreError::AlreadyExists(format!("user '{username}'")));
        }
        let now = current_time_ms();
        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            password_hash,
            salt,
            role,
            created_at: now,
            updated_at: now,
            enabled: true,
        };
        self.by_id.insert(user.id, user.clone());
        self.persist()?;
        Ok(user)
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        let Some(user) = self.by_id.iter().find(|e| e.value().username == username).map(|e| e.value().clone()) else {
            return false;
        };
        user.enabled && password::verify(&self.cfg, password, &user.salt, &user.password_hash)
    }

    pub fn get(&self, id: Uuid) -> Option<User> {
        self.by_id.get(&id).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<User> {
        self.by_id.iter().map(|e| e.value().clone()).collect()
    }

    pub fn set_enabled(&self, id: Uuid, enabled: bool) -> CoreResult<()> {
        let mut entry = self
            .by_id
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("user '{id}'")))?;
        entry.enabled = enabled;
        entry.updated_at = current_time_ms();
        drop(entry);
        self.persist()
    }

    pub fn delete(&self, id: Uuid) -> CoreResult<()> {
        self.by_id.remove(&id).ok_or_else(|| CoreError::NotFound(format!("user '{id}'")))?;
        self.persist()
    }
}
