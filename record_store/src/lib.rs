//! Embedded transactional record store for the tenant lifecycle engine.
//!
//! Named tables of string-keyed rows with:
//! - ACID transactions with undo logging and row-level locks
//! - Skip-locked claiming (`claim_one`) for competing background workers
//! - Session-scoped advisory locks keyed by i64
//! - The shared `Clock` time sources every dependent crate stamps with
//!
//! Tables are created implicitly on first write. Reads run against the
//! current table state without taking locks; destructive flows are expected
//! to re-validate what they read inside a transaction before acting on it.

mod claim;
mod clock;
mod error;
mod transaction;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub use claim::{advisory_key_for, AdvisoryGuard, AdvisoryLocks, ClaimGuard};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, StoreError};
pub use transaction::{Tx, UndoEntry};

/// A single typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    Null,
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// True for `Null`, false for every concrete value.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// A stored row: a string id plus named field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: String,
    pub fields: HashMap<String, Value>,
}

impl Row {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: HashMap::new(),
        }
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.fields.get(name).and_then(Value::as_int)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.fields.get(name).and_then(Value::as_bool)
    }
}

pub(crate) type Table = RwLock<HashMap<String, Row>>;

/// In-process record store shared by all engine components.
pub struct RecordStore {
    pub(crate) tables: DashMap<String, Table>,
    /// (table, row id) -> owning transaction/claim id.
    pub(crate) row_locks: DashMap<(String, String), u64>,
    pub(crate) next_tx: AtomicU64,
    advisory: AdvisoryLocks,
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            row_locks: DashMap::new(),
            next_tx: AtomicU64::new(1),
            advisory: AdvisoryLocks::new(),
        }
    }

    /// Begin a transaction. Dropping the returned context without calling
    /// `commit` rolls every write back and releases its row locks.
    pub fn begin(&self) -> Tx<'_> {
        let tx_id = self.next_tx.fetch_add(1, Ordering::SeqCst);
        Tx::new(self, tx_id)
    }

    /// Fetch a row by id from committed table state.
    pub fn get(&self, table: &str, id: &str) -> Option<Row> {
        self.tables
            .get(table)
            .and_then(|t| t.read().get(id).cloned())
    }

    /// All rows matching the predicate, in unspecified order.
    pub fn scan<F>(&self, table: &str, pred: F) -> Vec<Row>
    where
        F: Fn(&Row) -> bool,
    {
        self.tables.get(table).map_or_else(Vec::new, |t| {
            t.read().values().filter(|r| pred(r)).cloned().collect()
        })
    }

    /// Count rows matching the predicate.
    pub fn count<F>(&self, table: &str, pred: F) -> usize
    where
        F: Fn(&Row) -> bool,
    {
        self.tables
            .get(table)
            .map_or(0, |t| t.read().values().filter(|r| pred(r)).count())
    }

    /// Session-scoped advisory lock registry.
    pub fn advisory(&self) -> &AdvisoryLocks {
        &self.advisory
    }

    pub(crate) fn table(&self, name: &str) -> dashmap::mapref::one::Ref<'_, String, Table> {
        self.tables
            .entry(name.to_string())
            .or_insert_with(|| RwLock::new(HashMap::new()))
            .downgrade()
    }

    /// Acquire the row lock for `tx_id`, or fail fast on conflict.
    /// Re-acquiring a lock the same owner already holds is a no-op.
    pub(crate) fn lock_row(&self, table: &str, id: &str, tx_id: u64) -> Result<()> {
        let key = (table.to_string(), id.to_string());
        match self.row_locks.entry(key) {
            dashmap::Entry::Occupied(e) if *e.get() == tx_id => Ok(()),
            dashmap::Entry::Occupied(_) => Err(StoreError::LockConflict {
                table: table.to_string(),
                id: id.to_string(),
            }),
            dashmap::Entry::Vacant(e) => {
                e.insert(tx_id);
                Ok(())
            }
        }
    }

    /// True if any live transaction or claim holds the row lock.
    pub(crate) fn is_row_locked(&self, table: &str, id: &str) -> bool {
        self.row_locks
            .contains_key(&(table.to_string(), id.to_string()))
    }

    pub(crate) fn release_locks(&self, tx_id: u64) {
        self.row_locks.retain(|_, owner| *owner != tx_id);
    }
}
