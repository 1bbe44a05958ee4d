//! Skip-locked row claiming and session-scoped advisory locks.
//!
//! `claim_one` mirrors `SELECT ... FOR UPDATE SKIP LOCKED LIMIT 1`:
//! competing workers each grab a different unlocked candidate without
//! blocking. Advisory locks serialize destructive work on one logical key
//! (here, a hash of the tenant id) across schedulers; both guards release
//! unconditionally on drop.

use std::sync::atomic::Ordering;

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::{RecordStore, Row};

/// A claimed row, exclusively held until the guard drops.
pub struct ClaimGuard<'a> {
    store: &'a RecordStore,
    claim_id: u64,
    row: Row,
    table: String,
}

impl ClaimGuard<'_> {
    pub fn row(&self) -> &Row {
        &self.row
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.store.release_locks(self.claim_id);
    }
}

impl RecordStore {
    /// Claim the first unlocked row matching the predicate, skipping rows
    /// locked by live transactions or other claims. Returns `None` when no
    /// unlocked candidate exists — callers treat that as "nothing to do",
    /// not an error.
    pub fn claim_one<F>(&self, table: &str, pred: F) -> Option<ClaimGuard<'_>>
    where
        F: Fn(&Row) -> bool,
    {
        let claim_id = self.next_tx.fetch_add(1, Ordering::SeqCst);
        let candidates = self.scan(table, pred);
        for row in candidates {
            if self.lock_row(table, &row.id, claim_id).is_ok() {
                // Re-read under the lock: the row may have changed or been
                // deleted between the scan and the claim.
                match self.get(table, &row.id) {
                    Some(current) => {
                        return Some(ClaimGuard {
                            store: self,
                            claim_id,
                            row: current,
                            table: table.to_string(),
                        });
                    }
                    None => self.release_locks(claim_id),
                }
            }
        }
        None
    }
}

/// Registry of cooperative session locks keyed by i64.
pub struct AdvisoryLocks {
    held: DashMap<i64, ()>,
}

impl Default for AdvisoryLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl AdvisoryLocks {
    pub fn new() -> Self {
        Self {
            held: DashMap::new(),
        }
    }

    /// Try to take the lock. `None` means another session holds it; the
    /// caller skips the work and retries on a later tick.
    pub fn try_lock(&self, key: i64) -> Option<AdvisoryGuard<'_>> {
        match self.held.entry(key) {
            dashmap::Entry::Occupied(_) => None,
            dashmap::Entry::Vacant(e) => {
                e.insert(());
                Some(AdvisoryGuard { locks: self, key })
            }
        }
    }

    pub fn is_held(&self, key: i64) -> bool {
        self.held.contains_key(&key)
    }
}

/// Holds one advisory lock; released on drop, success or failure alike.
pub struct AdvisoryGuard<'a> {
    locks: &'a AdvisoryLocks,
    key: i64,
}

impl AdvisoryGuard<'_> {
    pub fn key(&self) -> i64 {
        self.key
    }
}

impl Drop for AdvisoryGuard<'_> {
    fn drop(&mut self) {
        self.locks.held.remove(&self.key);
    }
}

/// Hash an arbitrary string into the i64 advisory key space.
pub fn advisory_key_for(s: &str) -> i64 {
    let digest = Sha256::digest(s.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}
