//! Service accounts (spec §3, §4.7, §6): machine identities authenticating
//! via per-request HMAC-SHA256 signatures. The raw secret is disclosed to
//! clients exactly once, at creation or rotation; every subsequent read
//! returns a masked placeholder.
//!
//! Grounded on the teacher's `DashMap`-keyed registries for the in-memory
//! shape; HMAC verification and the canonical-string construction have
//! no teacher analogue and are built directly from spec §6. The
//! `last_used` coalescing reuses `crate::debounce::DebounceMap`
//! (Design Notes: "map `key -> timer handle`").

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::config::SecureStoreConfig;
use crate::debounce::DebounceMap;
use crate::error::{CoreError, CoreResult};
use crate::secure::permission::{self, Permission};
use crate::secure::store;
use crate::time::current_time_ms;

pub const MASKED_SECRET: &str = "••••••••";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAccount {
    pub id: Uuid,
    pub name: String,
    #[serde(with = "secret_hex")]
    pub secret: [u8; 32],
    pub permissions: Vec<Permission>,
    pub ip_whitelist: Vec<String>,
    pub enabled: bool,
    pub last_used: u64,
    pub disclosed: bool,
}

impl ServiceAccount {
    /// Returns the account with the secret masked unless this is the
    /// one-time disclosure right after creation/rotation.
    pub fn redacted(&self, reveal: bool) -> ServiceAccountView {
        ServiceAccountView {
            id: self.id,
            name: self.name.clone(),
            secret: if reveal { Some(hex::encode(self.secret)) } else { None },
            permissions: self.permissions.clone(),
            ip_whitelist: self.ip_whitelist.clone(),
            enabled: self.enabled,
            last_used: self.last_used,
            disclosed: self.disclosed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceAccountView {
    pub id: Uuid,
    pub name: String,
    /// `Some(hex secret)` only immediately after creation/rotation; `None`
    /// (rendered by callers as `MASKED_SECRET`) otherwise.
    pub secret: Option<String>,
    pub permissions: Vec<Permission>,
    pub ip_whitelist: Vec<String>,
    pub enabled: bool,
    pub last_used: u64,
    pub disclosed: bool,
}

mod secret_hex {
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

#[derive(Default, Serialize, Deserialize)]
struct Dataset {
    accounts: Vec<ServiceAccount>,
}

pub struct ServiceAccountStore {
    path: PathBuf,
    key: [u8; 32],
    by_id: DashMap<Uuid, ServiceAccount>,
    salt_blob: Mutex<Option<String>>,
    last_used_debounce: Arc<DebounceMap<Uuid>>,
    self_handle: std::sync::OnceLock<std::sync::Weak<ServiceAccountStore>>,
}

impl ServiceAccountStore {
    pub fn load(data_dir: &Path, key: [u8; 32], cfg: &SecureStoreConfig) -> CoreResult<Arc<Self>> {
        let path = data_dir.join("service.db");
        let dataset: Dataset = store::load(&path, &key)?.unwrap_or_default();
        let by_id = DashMap::new();
        for account in dataset.accounts {
            by_id.insert(account.id, account);
        }
        let store = Arc::new(Self {
            path,
            key,
            by_id,
            salt_blob: Mutex::new(None),
            last_used_debounce: Arc::new(DebounceMap::new(cfg.last_used_debounce)),
            self_handle: std::sync::OnceLock::new(),
        });
        let _ = store.self_handle.set(Arc::downgrade(&store));
        Ok(store)
    }

    fn persist(&self) -> CoreResult<()> {
        let accounts: Vec<ServiceAccount> = self.by_id.iter().map(|e| e.value().clone()).collect();
        let salt = self.salt_blob.lock().clone();
        store::save(&self.path, &self.key, salt.as_deref(), &Dataset { accounts })
    }

    /// Creates a new account; the raw secret is returned once here and
    /// never again (spec §3 lifecycle note).
    pub fn create(&self, name: &str, permissions: Vec<Permission>, ip_whitelist: Vec<String>) -> CoreResult<ServiceAccountView> {
        if self.by_id.iter().any(|e| e.value().name == name) {
            return Err(CoreError::AlreadyExists(format!("service account '{name}'")));
        }
        let account = ServiceAccount {
            id: Uuid::new_v4(),
            name: name.to_string(),
            secret: random_secret(),
            permissions,
            ip_whitelist,
            enabled: true,
            last_used: 0,
            disclosed: false,
        };
        let view = account.redacted(true);
        self.by_id.insert(account.id, ServiceAccount { disclosed: true, ..account });
        self.persist()?;
        Ok(view)
    }

    /// Rotates `id`'s secret, disclosing the new one exactly once.
    pub fn rotate_secret(&self, id: Uuid) -> CoreResult<ServiceAccountView> {
        let mut entry = self
            .by_id
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("service account '{id}'")))?;
        entry.secret = random_secret();
        entry.disclosed = true;
        let view = entry.redacted(true);
        drop(entry);
        self.persist()?;
        Ok(view)
    }

    /// Masked read — never exposes the secret after the one-time
    /// disclosure.
    pub fn get(&self, id: Uuid) -> Option<ServiceAccountView> {
        self.by_id.get(&id).map(|e| e.value().redacted(false))
    }

    pub fn list(&self) -> Vec<ServiceAccountView> {
        self.by_id.iter().map(|e| e.value().redacted(false)).collect()
    }

    pub fn delete(&self, id: Uuid) -> CoreResult<()> {
        self.by_id.remove(&id).ok_or_else(|| CoreError::NotFound(format!("service account '{id}'")))?;
        self.persist()
    }

    /// Verifies an inbound HMAC request (spec §6): canonical string
    /// `METHOD \n PATH \n BODY \n TIMESTAMP`, signature
    /// `HMAC-SHA256(secret, canonical)`, validity window `|now -
    /// timestamp| <= 5min`, plus account enabled/IP-whitelist checks.
    pub fn verify_signature(
        &self,
        service_id: Uuid,
        method: &str,
        path: &str,
        body: &str,
        timestamp: &str,
        signature: &str,
        remote_ip: &str,
    ) -> bool {
        let Some(account) = self.by_id.get(&service_id).map(|e| e.value().clone()) else {
            return false;
        };
        if !account.enabled {
            return false;
        }
        if !permission::ip_allowed(&account.ip_whitelist, remote_ip) {
            return false;
        }
        let Ok(ts) = DateTime::parse_from_rfc3339(timestamp) else {
            return false;
        };
        let now: DateTime<Utc> = Utc::now();
        let delta = (now.timestamp() - ts.timestamp()).abs();
        if delta > Duration::from_secs(5 * 60).as_secs() as i64 {
            return false;
        }

        let canonical = format!("{method}\n{path}\n{body}\n{timestamp}");
        let Some(expected_hex) = signature.strip_prefix("sha256=") else {
            return false;
        };
        let Ok(expected) = hex::decode(expected_hex) else {
            return false;
        };

        let mut mac = match Hmac::<Sha256>::new_from_slice(&account.secret) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(canonical.as_bytes());
        let computed = mac.finalize().into_bytes();
        let ok: bool = computed.as_slice().ct_eq(&expected).into();
        if ok {
            self.mark_used(service_id);
        }
        ok
    }

    /// Updates the in-memory `last_used` immediately but coalesces the
    /// disk flush with a 1s timer per service (spec §4.7) so a request
    /// burst does not amplify into one write per request.
    fn mark_used(&self, id: Uuid) {
        if let Some(mut entry) = self.by_id.get_mut(&id) {
            entry.last_used = current_time_ms();
        }
        let Some(weak) = self.self_handle.get().cloned() else {
            return;
        };
        self.last_used_debounce.fire(id, move || async move {
            if let Some(store) = weak.upgrade() {
                let _ = store.persist();
            }
        });
    }

    pub fn has_permission(&self, id: Uuid, requested: &str) -> bool {
        self.by_id
            .get(&id)
            .map(|e| e.enabled && permission::has_permission(&e.permissions, requested))
            .unwrap_or(false)
    }
}

fn random_secret() -> [u8; 32] {
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}
