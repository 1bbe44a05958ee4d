// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-tenant data key management: lazy generation, caching, rotation.
//!
//! Key rows live in the `tenant_keys` table. The application invariant is
//! at most one `active` key per tenant; the write paths (generate, rotate,
//! revoke) always re-query the store rather than trusting the cache, and
//! rotation invalidates the cache *before* touching rows so a stale entry
//! cannot outlive the revocation by more than the in-flight call.
//!
//! The unwrapped-key cache is the only non-transactional shared state in
//! the engine. Entries expire after a short TTL (5 minutes) and a key
//! fetched just before a rotation may be used for one more encryption;
//! that blob stays decryptable by key id, so this is an accepted window.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::RngCore;
use record_store::{Clock, RecordStore, Row, SystemClock, Tx, Value};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::wrap::{unwrap_key, wrap_key, KEY_SIZE};
use crate::{MasterKey, Result, VaultError};

/// Table holding wrapped tenant key rows.
pub const TENANT_KEYS_TABLE: &str = "tenant_keys";

/// How long an unwrapped key may be served from memory.
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Lifecycle status of a tenant key row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Active,
    Revoked,
}

impl KeyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

/// A tenant key row, decoded from storage.
#[derive(Debug, Clone)]
pub struct TenantKey {
    pub id: String,
    pub tenant_id: String,
    pub key_version: i64,
    pub wrapped_key: String,
    pub status: KeyStatus,
    pub created_at: i64,
    pub revoked_at: Option<i64>,
}

impl TenantKey {
    fn from_row(row: &Row) -> Option<Self> {
        Some(Self {
            id: row.id.clone(),
            tenant_id: row.str("tenant_id")?.to_string(),
            key_version: row.int("key_version")?,
            wrapped_key: row.str("wrapped_key")?.to_string(),
            status: KeyStatus::parse(row.str("status")?)?,
            created_at: row.int("created_at")?,
            revoked_at: row.int("revoked_at"),
        })
    }
}

/// Vault construction knobs.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// TTL for cached unwrapped keys.
    pub cache_ttl: Duration,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

struct CacheEntry {
    key: Zeroizing<[u8; KEY_SIZE]>,
    key_id: String,
    expires_at: Instant,
}

/// Generates, wraps, caches, and rotates per-tenant data keys.
pub struct TenantKeyStore {
    store: Arc<RecordStore>,
    master: MasterKey,
    cache: DashMap<String, CacheEntry>,
    cache_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl TenantKeyStore {
    pub fn new(store: Arc<RecordStore>, master: MasterKey, config: VaultConfig) -> Self {
        Self::with_clock(store, master, config, Arc::new(SystemClock))
    }

    /// Construct with an explicit time source; `new` uses the wall clock.
    /// Key-row `created_at`/`revoked_at` timestamps come from this clock.
    pub fn with_clock(
        store: Arc<RecordStore>,
        master: MasterKey,
        config: VaultConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            master,
            cache: DashMap::new(),
            cache_ttl: config.cache_ttl,
            clock,
        }
    }

    /// The tenant's current active key, generated lazily if none exists.
    pub fn get_active_key(&self, tenant_id: &str) -> Result<(Zeroizing<[u8; KEY_SIZE]>, String)> {
        if let Some(entry) = self.cache.get(tenant_id) {
            if entry.expires_at > Instant::now() {
                return Ok((entry.key.clone(), entry.key_id.clone()));
            }
        }
        // Expired or missing: drop any stale entry, go to the store.
        self.cache.remove(tenant_id);

        match self.load_active_row(tenant_id) {
            Some(row) => {
                let key = unwrap_key(&self.master, &row.wrapped_key)?;
                self.cache_put(tenant_id, key.clone(), row.id.clone());
                Ok((key, row.id))
            }
            None => self.generate_new_key(tenant_id, None),
        }
    }

    /// Resolve a specific historical key by id. Revoked keys resolve too —
    /// old blobs must stay decryptable after rotation.
    pub fn get_key(&self, tenant_id: &str, key_id: &str) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        if let Some(entry) = self.cache.get(tenant_id) {
            if entry.key_id == key_id && entry.expires_at > Instant::now() {
                return Ok(entry.key.clone());
            }
        }

        let row = self
            .store
            .get(TENANT_KEYS_TABLE, key_id)
            .ok_or_else(|| VaultError::KeyNotFound(key_id.to_string()))?;
        let tk = TenantKey::from_row(&row).ok_or_else(|| VaultError::KeyNotFound(key_id.to_string()))?;
        if tk.tenant_id != tenant_id {
            // Cross-tenant key lookups are indistinguishable from missing.
            return Err(VaultError::KeyNotFound(key_id.to_string()));
        }
        unwrap_key(&self.master, &tk.wrapped_key)
    }

    /// Create a fresh data key, persist it as `active`, replace the cache
    /// entry. Picks the next monotonic version unless one is given.
    pub fn generate_new_key(
        &self,
        tenant_id: &str,
        version: Option<i64>,
    ) -> Result<(Zeroizing<[u8; KEY_SIZE]>, String)> {
        let mut dek = Zeroizing::new([0u8; KEY_SIZE]);
        rand::thread_rng().fill_bytes(dek.as_mut());
        let wrapped = wrap_key(&self.master, &dek)?;

        let version = version.unwrap_or_else(|| self.next_version(tenant_id));
        let key_id = Uuid::new_v4().to_string();

        let mut tx = self.store.begin();
        tx.insert(
            TENANT_KEYS_TABLE,
            Row::new(key_id.clone())
                .with("tenant_id", tenant_id)
                .with("key_version", version)
                .with("wrapped_key", wrapped)
                .with("status", KeyStatus::Active.as_str())
                .with("created_at", self.clock.now_ms())
                .with("revoked_at", Value::Null),
        )?;
        tx.commit();

        self.cache_put(tenant_id, dek.clone(), key_id.clone());
        tracing::info!(tenant = tenant_id, version, "generated new tenant data key");
        Ok((dek, key_id))
    }

    /// Revoke every active key and mint a replacement atomically. The cache
    /// entry is dropped first so no caller is served the outgoing key after
    /// the rows flip.
    pub fn rotate_key(&self, tenant_id: &str) -> Result<(Zeroizing<[u8; KEY_SIZE]>, String)> {
        self.cache.remove(tenant_id);

        let mut tx = self.store.begin();
        self.revoke_active_rows(tenant_id, &mut tx)?;

        let mut dek = Zeroizing::new([0u8; KEY_SIZE]);
        rand::thread_rng().fill_bytes(dek.as_mut());
        let wrapped = wrap_key(&self.master, &dek)?;
        let version = self.next_version(tenant_id);
        let key_id = Uuid::new_v4().to_string();
        tx.insert(
            TENANT_KEYS_TABLE,
            Row::new(key_id.clone())
                .with("tenant_id", tenant_id)
                .with("key_version", version)
                .with("wrapped_key", wrapped)
                .with("status", KeyStatus::Active.as_str())
                .with("created_at", self.clock.now_ms())
                .with("revoked_at", Value::Null),
        )?;
        tx.commit();

        self.cache_put(tenant_id, dek.clone(), key_id.clone());
        tracing::info!(tenant = tenant_id, version, "rotated tenant data key");
        Ok((dek, key_id))
    }

    /// Revoke all active keys with no replacement, inside the caller's
    /// transaction. Used by tenant purge so surviving ciphertext goes dark.
    pub fn revoke_tenant_keys(&self, tenant_id: &str, tx: &mut Tx<'_>) -> Result<usize> {
        self.cache.remove(tenant_id);
        self.revoke_active_rows(tenant_id, tx)
    }

    /// Every key row for the tenant, newest version first.
    pub fn list_keys(&self, tenant_id: &str) -> Vec<TenantKey> {
        let mut keys: Vec<TenantKey> = self
            .store
            .scan(TENANT_KEYS_TABLE, |r| r.str("tenant_id") == Some(tenant_id))
            .iter()
            .filter_map(TenantKey::from_row)
            .collect();
        keys.sort_by(|a, b| b.key_version.cmp(&a.key_version));
        keys
    }

    fn revoke_active_rows(&self, tenant_id: &str, tx: &mut Tx<'_>) -> Result<usize> {
        let active = self.store.scan(TENANT_KEYS_TABLE, |r| {
            r.str("tenant_id") == Some(tenant_id) && r.str("status") == Some("active")
        });
        for row in &active {
            tx.update(
                TENANT_KEYS_TABLE,
                &row.id,
                [
                    ("status".to_string(), Value::from(KeyStatus::Revoked.as_str())),
                    ("revoked_at".to_string(), Value::from(self.clock.now_ms())),
                ],
            )?;
        }
        Ok(active.len())
    }

    fn load_active_row(&self, tenant_id: &str) -> Option<TenantKey> {
        let mut active: Vec<TenantKey> = self
            .store
            .scan(TENANT_KEYS_TABLE, |r| {
                r.str("tenant_id") == Some(tenant_id) && r.str("status") == Some("active")
            })
            .iter()
            .filter_map(TenantKey::from_row)
            .collect();
        // The single-active invariant is application-enforced; if it was
        // ever violated, prefer the newest version deterministically.
        active.sort_by(|a, b| b.key_version.cmp(&a.key_version));
        active.into_iter().next()
    }

    fn next_version(&self, tenant_id: &str) -> i64 {
        self.store
            .scan(TENANT_KEYS_TABLE, |r| r.str("tenant_id") == Some(tenant_id))
            .iter()
            .filter_map(|r| r.int("key_version"))
            .max()
            .unwrap_or(0)
            + 1
    }

    fn cache_put(&self, tenant_id: &str, key: Zeroizing<[u8; KEY_SIZE]>, key_id: String) {
        self.cache.insert(
            tenant_id.to_string(),
            CacheEntry {
                key,
                key_id,
                expires_at: Instant::now() + self.cache_ttl,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use record_store::ManualClock;

    fn keystore() -> TenantKeyStore {
        let store = Arc::new(RecordStore::new());
        let master = MasterKey::from_hex(&"ab".repeat(32)).unwrap();
        TenantKeyStore::new(store, master, VaultConfig::default())
    }

    #[test]
    fn test_lazy_generation_on_first_use() {
        let ks = keystore();
        let (key, key_id) = ks.get_active_key("t-1").unwrap();
        assert_eq!(key.len(), KEY_SIZE);

        // Second call serves the same key (cache or store, same row).
        let (key2, key_id2) = ks.get_active_key("t-1").unwrap();
        assert_eq!(key.as_ref(), key2.as_ref());
        assert_eq!(key_id, key_id2);
        assert_eq!(ks.list_keys("t-1").len(), 1);
    }

    #[test]
    fn test_single_active_key_invariant() {
        let ks = keystore();
        ks.get_active_key("t-1").unwrap();
        ks.rotate_key("t-1").unwrap();
        ks.rotate_key("t-1").unwrap();

        let active: Vec<TenantKey> = ks
            .list_keys("t-1")
            .into_iter()
            .filter(|k| k.status == KeyStatus::Active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(ks.list_keys("t-1").len(), 3);
    }

    #[test]
    fn test_rotation_bumps_version_and_keeps_old_key_resolvable() {
        let ks = keystore();
        let (k1, id1) = ks.get_active_key("t-1").unwrap();
        let (k2, id2) = ks.rotate_key("t-1").unwrap();
        assert_ne!(id1, id2);
        assert_ne!(k1.as_ref(), k2.as_ref());

        let keys = ks.list_keys("t-1");
        assert_eq!(keys[0].key_version, 2);
        assert_eq!(keys[0].status, KeyStatus::Active);
        assert_eq!(keys[1].key_version, 1);
        assert_eq!(keys[1].status, KeyStatus::Revoked);
        assert!(keys[1].revoked_at.is_some());

        // The revoked key still resolves by id.
        let old = ks.get_key("t-1", &id1).unwrap();
        assert_eq!(old.as_ref(), k1.as_ref());
    }

    #[test]
    fn test_get_key_cross_tenant_is_not_found() {
        let ks = keystore();
        let (_, id1) = ks.get_active_key("t-1").unwrap();
        let err = ks.get_key("t-2", &id1).unwrap_err();
        assert!(matches!(err, VaultError::KeyNotFound(_)));
    }

    #[test]
    fn test_explicit_version_is_respected() {
        let ks = keystore();
        let (_, id) = ks.generate_new_key("t-1", Some(7)).unwrap();
        let keys = ks.list_keys("t-1");
        assert_eq!(keys[0].id, id);
        assert_eq!(keys[0].key_version, 7);

        // Auto-versioning continues past the explicit one.
        ks.rotate_key("t-1").unwrap();
        assert_eq!(ks.list_keys("t-1")[0].key_version, 8);
    }

    #[test]
    fn test_revoke_tenant_keys_leaves_no_active() {
        let ks = keystore();
        ks.get_active_key("t-1").unwrap();

        let store = Arc::clone(&ks.store);
        let mut tx = store.begin();
        let n = ks.revoke_tenant_keys("t-1", &mut tx).unwrap();
        tx.commit();
        assert_eq!(n, 1);
        assert!(ks
            .list_keys("t-1")
            .iter()
            .all(|k| k.status == KeyStatus::Revoked));

        // Next encryption mints a fresh key rather than serving a stale one.
        let (_, new_id) = ks.get_active_key("t-1").unwrap();
        assert_ne!(ks.list_keys("t-1").len(), 1);
        assert!(ks.list_keys("t-1").iter().any(|k| k.id == new_id));
    }

    #[test]
    fn test_cache_expiry_falls_back_to_store() {
        let store = Arc::new(RecordStore::new());
        let master = MasterKey::from_hex(&"ab".repeat(32)).unwrap();
        let ks = TenantKeyStore::new(
            store,
            master,
            VaultConfig {
                cache_ttl: Duration::from_millis(0),
            },
        );
        let (k1, id1) = ks.get_active_key("t-1").unwrap();
        // TTL of zero: every lookup re-reads and re-unwraps from the store.
        let (k2, id2) = ks.get_active_key("t-1").unwrap();
        assert_eq!(k1.as_ref(), k2.as_ref());
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_key_row_timestamps_come_from_the_clock() {
        let store = Arc::new(RecordStore::new());
        let master = MasterKey::from_hex(&"ab".repeat(32)).unwrap();
        let clock = Arc::new(ManualClock::new(5_000));
        let ks = TenantKeyStore::with_clock(
            store,
            master,
            VaultConfig::default(),
            Arc::clone(&clock) as Arc<dyn Clock>,
        );

        ks.get_active_key("t-1").unwrap();
        assert_eq!(ks.list_keys("t-1")[0].created_at, 5_000);

        clock.advance(2_500);
        ks.rotate_key("t-1").unwrap();
        let keys = ks.list_keys("t-1");
        assert_eq!(keys[0].created_at, 7_500);
        assert_eq!(keys[1].revoked_at, Some(7_500));
    }
}
