//! Transaction context with undo logging and row-level locks.
//!
//! Writes apply to table state immediately and append a compensating entry
//! to the undo log. Commit releases locks and discards the log; dropping an
//! uncommitted context replays the log in reverse, so a partial cascade can
//! never survive an error path.
//!
//! Row locks are acquired on first write to a row and held until commit or
//! rollback. Lock acquisition never blocks: a conflict is returned to the
//! caller as `StoreError::LockConflict` immediately.

use crate::{RecordStore, Result, Row, StoreError, Value};

/// Compensating action recorded for each write.
#[derive(Debug, Clone)]
pub enum UndoEntry {
    /// Undo an insert: remove the row.
    Inserted { table: String, id: String },
    /// Undo an update: restore the previous row image.
    Updated { table: String, row: Row },
    /// Undo a delete: restore the removed row.
    Deleted { table: String, row: Row },
}

/// An open transaction against a [`RecordStore`].
///
/// Passed explicitly to every helper that must share the atomic scope, so
/// cascade deletion and audit writes are statically tied to one commit.
pub struct Tx<'a> {
    store: &'a RecordStore,
    tx_id: u64,
    undo: Vec<UndoEntry>,
    active: bool,
}

impl<'a> Tx<'a> {
    pub(crate) fn new(store: &'a RecordStore, tx_id: u64) -> Self {
        Self {
            store,
            tx_id,
            undo: Vec::new(),
            active: true,
        }
    }

    pub fn id(&self) -> u64 {
        self.tx_id
    }

    fn ensure_active(&self) -> Result<()> {
        if self.active {
            Ok(())
        } else {
            Err(StoreError::TxClosed)
        }
    }

    /// Insert a new row. Fails with `Duplicate` if the id is taken.
    pub fn insert(&mut self, table: &str, row: Row) -> Result<()> {
        self.ensure_active()?;
        self.store.lock_row(table, &row.id, self.tx_id)?;

        let table_ref = self.store.table(table);
        let mut rows = table_ref.write();
        if rows.contains_key(&row.id) {
            return Err(StoreError::Duplicate {
                table: table.to_string(),
                id: row.id,
            });
        }
        self.undo.push(UndoEntry::Inserted {
            table: table.to_string(),
            id: row.id.clone(),
        });
        rows.insert(row.id.clone(), row);
        Ok(())
    }

    /// Patch named fields of an existing row.
    pub fn update(
        &mut self,
        table: &str,
        id: &str,
        patch: impl IntoIterator<Item = (String, Value)>,
    ) -> Result<()> {
        self.ensure_active()?;
        self.store.lock_row(table, id, self.tx_id)?;

        let table_ref = self.store.table(table);
        let mut rows = table_ref.write();
        let row = rows.get_mut(id).ok_or_else(|| StoreError::NotFound {
            table: table.to_string(),
            id: id.to_string(),
        })?;
        self.undo.push(UndoEntry::Updated {
            table: table.to_string(),
            row: row.clone(),
        });
        for (name, value) in patch {
            row.fields.insert(name, value);
        }
        Ok(())
    }

    /// Hard-delete a row.
    pub fn delete(&mut self, table: &str, id: &str) -> Result<()> {
        self.ensure_active()?;
        self.store.lock_row(table, id, self.tx_id)?;

        let table_ref = self.store.table(table);
        let mut rows = table_ref.write();
        let row = rows.remove(id).ok_or_else(|| StoreError::NotFound {
            table: table.to_string(),
            id: id.to_string(),
        })?;
        self.undo.push(UndoEntry::Deleted {
            table: table.to_string(),
            row,
        });
        Ok(())
    }

    /// Hard-delete every row matching the predicate; returns the count.
    pub fn delete_where<F>(&mut self, table: &str, pred: F) -> Result<usize>
    where
        F: Fn(&Row) -> bool,
    {
        self.ensure_active()?;
        let ids: Vec<String> = self
            .store
            .scan(table, &pred)
            .into_iter()
            .map(|r| r.id)
            .collect();
        for id in &ids {
            self.delete(table, id)?;
        }
        Ok(ids.len())
    }

    /// Read through to table state (sees this transaction's own writes).
    pub fn get(&self, table: &str, id: &str) -> Option<Row> {
        self.store.get(table, id)
    }

    /// Scan through to table state (sees this transaction's own writes).
    pub fn scan<F>(&self, table: &str, pred: F) -> Vec<Row>
    where
        F: Fn(&Row) -> bool,
    {
        self.store.scan(table, pred)
    }

    /// Make every write permanent and release row locks.
    pub fn commit(mut self) {
        self.undo.clear();
        self.active = false;
        self.store.release_locks(self.tx_id);
    }

    fn rollback(&mut self) {
        // Reverse order so earlier writes are restored last.
        while let Some(entry) = self.undo.pop() {
            match entry {
                UndoEntry::Inserted { table, id } => {
                    let table_ref = self.store.table(&table);
                    table_ref.write().remove(&id);
                }
                UndoEntry::Updated { table, row } | UndoEntry::Deleted { table, row } => {
                    let table_ref = self.store.table(&table);
                    table_ref.write().insert(row.id.clone(), row);
                }
            }
        }
        self.active = false;
        self.store.release_locks(self.tx_id);
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if self.active {
            self.rollback();
        }
    }
}
