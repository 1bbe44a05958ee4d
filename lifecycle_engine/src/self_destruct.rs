// SPDX-License-Identifier: MIT OR Apache-2.0
//! Single-record self-destruct state machine.
//!
//! ```text
//! armed ──disarm──▶ disarmed   (terminal)
//!   └────destroy──▶ destroyed  (terminal, cascades)
//! ```
//!
//! Arming is reversible until execution; `disarmed` and `destroyed` are
//! terminal. Every operation re-checks the tenant flag and re-validates
//! target ownership, because both can change between check and use and the
//! cost of a stale answer here is permanent data loss.

use std::sync::Arc;

use record_store::{RecordStore, Row, Value};
use uuid::Uuid;

use crate::audit::{ActorType, AuditAction, AuditEntry, AuditLog};
use crate::cascade::TargetTable;
use crate::scheduler::Clock;
use crate::{Flag, FlagStore, LifecycleError, Result};

/// Table holding self-destruct records.
pub const SELF_DESTRUCTS_TABLE: &str = "self_destructs";

/// Lifecycle state of a self-destruct record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfDestructStatus {
    Armed,
    Disarmed,
    Destroyed,
}

impl SelfDestructStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Armed => "armed",
            Self::Disarmed => "disarmed",
            Self::Destroyed => "destroyed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "armed" => Some(Self::Armed),
            "disarmed" => Some(Self::Disarmed),
            "destroyed" => Some(Self::Destroyed),
            _ => None,
        }
    }
}

/// A self-destruct record, decoded from storage.
#[derive(Debug, Clone)]
pub struct SelfDestructRecord {
    pub id: String,
    pub tenant_id: String,
    pub target_table: TargetTable,
    pub target_id: String,
    pub armed_by: String,
    pub reason: Option<String>,
    pub destruct_at: Option<i64>,
    pub status: SelfDestructStatus,
    pub armed_at: i64,
    pub disarmed_by: Option<String>,
    pub destroyed_by: Option<String>,
    pub destroyed_at: Option<i64>,
    pub metadata: serde_json::Value,
}

impl SelfDestructRecord {
    fn from_row(row: &Row) -> Option<Self> {
        Some(Self {
            id: row.id.clone(),
            tenant_id: row.str("tenant_id")?.to_string(),
            target_table: TargetTable::parse(row.str("target_table")?).ok()?,
            target_id: row.str("target_id")?.to_string(),
            armed_by: row.str("armed_by")?.to_string(),
            reason: row.str("reason").map(str::to_string),
            destruct_at: row.int("destruct_at"),
            status: SelfDestructStatus::parse(row.str("status")?)?,
            armed_at: row.int("armed_at")?,
            disarmed_by: row.str("disarmed_by").map(str::to_string),
            destroyed_by: row.str("destroyed_by").map(str::to_string),
            destroyed_at: row.int("destroyed_at"),
            metadata: row
                .str("metadata")
                .and_then(|m| serde_json::from_str(m).ok())
                .unwrap_or(serde_json::Value::Null),
        })
    }
}

/// Arms, disarms, and executes destruction of single records.
pub struct SelfDestructManager {
    store: Arc<RecordStore>,
    flags: Arc<dyn FlagStore>,
    clock: Arc<dyn Clock>,
}

impl SelfDestructManager {
    pub fn new(store: Arc<RecordStore>, flags: Arc<dyn FlagStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            flags,
            clock,
        }
    }

    /// Gate on the per-tenant feature flag. Callers still get re-checked by
    /// every other operation.
    pub fn is_enabled(&self, tenant_id: &str) -> bool {
        self.flags.is_enabled(tenant_id, Flag::SelfDestruct)
    }

    fn require_enabled(&self, tenant_id: &str) -> Result<()> {
        if self.is_enabled(tenant_id) {
            Ok(())
        } else {
            Err(LifecycleError::NotEnabled(Flag::SelfDestruct))
        }
    }

    /// Arm a target for destruction. Racing callers serialize on the target
    /// row lock, so exactly one armed record survives for a given target.
    #[allow(clippy::too_many_arguments)]
    pub fn arm(
        &self,
        tenant_id: &str,
        target_table: TargetTable,
        target_id: &str,
        armed_by: &str,
        reason: Option<String>,
        destruct_at: Option<i64>,
        metadata: serde_json::Value,
    ) -> Result<SelfDestructRecord> {
        self.require_enabled(tenant_id)?;

        let now = self.clock.now_ms();
        let mut tx = self.store.begin();
        // Touch the target row to take its lock first: the ownership and
        // duplicate checks below are then race-free against a concurrent
        // arm or deletion of the same target.
        tx.update(target_table.table_name(), target_id, std::iter::empty())
            .map_err(|e| match e {
                record_store::StoreError::NotFound { .. } => LifecycleError::TargetNotFound {
                    table: target_table.table_name().to_string(),
                    id: target_id.to_string(),
                },
                other => other.into(),
            })?;
        target_table.fetch_owned(&self.store, tenant_id, target_id)?;

        let dup = self.store.count(SELF_DESTRUCTS_TABLE, |r| {
            r.str("tenant_id") == Some(tenant_id)
                && r.str("target_table") == Some(target_table.table_name())
                && r.str("target_id") == Some(target_id)
                && r.str("status") == Some("armed")
        });
        if dup > 0 {
            return Err(LifecycleError::AlreadyArmed);
        }

        let id = Uuid::new_v4().to_string();
        let opt_str = |v: &Option<String>| v.clone().map_or(Value::Null, Value::Str);
        let opt_int = |v: Option<i64>| v.map_or(Value::Null, Value::Int);
        tx.insert(
            SELF_DESTRUCTS_TABLE,
            Row::new(id.clone())
                .with("tenant_id", tenant_id)
                .with("target_table", target_table.table_name())
                .with("target_id", target_id)
                .with("armed_by", armed_by)
                .with("reason", opt_str(&reason))
                .with("destruct_at", opt_int(destruct_at))
                .with("status", SelfDestructStatus::Armed.as_str())
                .with("armed_at", now)
                .with("disarmed_by", Value::Null)
                .with("destroyed_by", Value::Null)
                .with("destroyed_at", Value::Null)
                .with("metadata", metadata.to_string()),
        )?;
        AuditLog::append(
            &mut tx,
            AuditEntry::new(
                tenant_id,
                target_table.table_name(),
                target_id,
                AuditAction::SelfDestructArmed,
                armed_by,
                ActorType::User,
            )
            .reason(reason)
            .after(serde_json::json!({ "self_destruct_id": id, "destruct_at": destruct_at })),
            now,
        )?;
        tx.commit();

        let row = self.store.get(SELF_DESTRUCTS_TABLE, &id).ok_or_else(|| {
            LifecycleError::Storage("armed row vanished after commit".to_string())
        })?;
        SelfDestructRecord::from_row(&row)
            .ok_or_else(|| LifecycleError::Storage("malformed self-destruct row".to_string()))
    }

    /// Disarm an armed record. `NotFound` covers both a missing record and
    /// one that already left the `armed` state.
    pub fn disarm(
        &self,
        id: &str,
        tenant_id: &str,
        disarmed_by: &str,
        reason: Option<String>,
    ) -> Result<()> {
        self.require_enabled(tenant_id)?;

        let mut tx = self.store.begin();
        let record = self.fetch_armed(&mut tx, id, tenant_id)?;
        // The target may have been deleted independently since arming.
        record
            .target_table
            .fetch_owned(&self.store, tenant_id, &record.target_id)?;

        let now = self.clock.now_ms();
        tx.update(
            SELF_DESTRUCTS_TABLE,
            id,
            [
                ("status".to_string(), Value::from(SelfDestructStatus::Disarmed.as_str())),
                ("disarmed_by".to_string(), Value::from(disarmed_by)),
            ],
        )?;
        AuditLog::append(
            &mut tx,
            AuditEntry::new(
                tenant_id,
                record.target_table.table_name(),
                record.target_id.as_str(),
                AuditAction::SelfDestructDisarmed,
                disarmed_by,
                ActorType::User,
            )
            .reason(reason)
            .before(serde_json::json!({ "status": "armed" }))
            .after(serde_json::json!({ "status": "disarmed" })),
            now,
        )?;
        tx.commit();
        Ok(())
    }

    /// User-triggered immediate destruction.
    pub fn destroy_now(&self, id: &str, tenant_id: &str, destroyed_by: &str) -> Result<usize> {
        self.destroy(id, tenant_id, destroyed_by, ActorType::User)
    }

    /// Scheduler-triggered destruction; identical routine, system actor.
    pub fn destroy_now_system(&self, id: &str, tenant_id: &str) -> Result<usize> {
        self.destroy(id, tenant_id, "self-destruct-sweeper", ActorType::System)
    }

    /// The one transactional destruction routine both entry points share.
    /// A partial cascade can never be observed: any error aborts the whole
    /// transaction.
    fn destroy(
        &self,
        id: &str,
        tenant_id: &str,
        destroyed_by: &str,
        actor_type: ActorType,
    ) -> Result<usize> {
        self.require_enabled(tenant_id)?;

        let mut tx = self.store.begin();
        let record = self.fetch_armed(&mut tx, id, tenant_id)?;
        record
            .target_table
            .fetch_owned(&self.store, tenant_id, &record.target_id)?;

        let deleted = record.target_table.cascade_delete(&mut tx, &record.target_id)?;

        let now = self.clock.now_ms();
        tx.update(
            SELF_DESTRUCTS_TABLE,
            id,
            [
                ("status".to_string(), Value::from(SelfDestructStatus::Destroyed.as_str())),
                ("destroyed_by".to_string(), Value::from(destroyed_by)),
                ("destroyed_at".to_string(), Value::from(now)),
            ],
        )?;
        let action = match actor_type {
            ActorType::User => AuditAction::SelfDestructExecuted,
            ActorType::System => AuditAction::SweeperDestroy,
        };
        AuditLog::append(
            &mut tx,
            AuditEntry::new(
                tenant_id,
                record.target_table.table_name(),
                record.target_id.as_str(),
                action,
                destroyed_by,
                actor_type,
            )
            .metadata(serde_json::json!({ "rows_deleted": deleted })),
            now,
        )?;
        tx.commit();

        tracing::info!(
            tenant = tenant_id,
            target = record.target_id.as_str(),
            rows = deleted,
            "self-destruct executed"
        );
        Ok(deleted)
    }

    /// Hide armed-but-not-destroyed records from listing queries. No-ops
    /// without a scan when the feature is off or nothing is armed.
    pub fn filter_out_armed(
        &self,
        tenant_id: &str,
        target_table: TargetTable,
        ids: &[String],
    ) -> Vec<String> {
        if !self.is_enabled(tenant_id) {
            return ids.to_vec();
        }
        let armed: Vec<String> = self
            .store
            .scan(SELF_DESTRUCTS_TABLE, |r| {
                r.str("tenant_id") == Some(tenant_id)
                    && r.str("target_table") == Some(target_table.table_name())
                    && r.str("status") == Some("armed")
            })
            .into_iter()
            .filter_map(|r| r.str("target_id").map(str::to_string))
            .collect();
        if armed.is_empty() {
            return ids.to_vec();
        }
        ids.iter()
            .filter(|id| !armed.contains(id))
            .cloned()
            .collect()
    }

    /// Armed records due at or before `now`, oldest deadline first.
    pub fn due_records(&self, now_ms: i64) -> Vec<SelfDestructRecord> {
        let mut due: Vec<SelfDestructRecord> = self
            .store
            .scan(SELF_DESTRUCTS_TABLE, |r| {
                r.str("status") == Some("armed")
                    && r.int("destruct_at").is_some_and(|at| at <= now_ms)
            })
            .iter()
            .filter_map(SelfDestructRecord::from_row)
            .collect();
        due.sort_by_key(|r| r.destruct_at);
        due
    }

    /// Lock the record row inside the transaction, then re-read it there,
    /// so the armed-status check cannot race a concurrent transition.
    fn fetch_armed(
        &self,
        tx: &mut record_store::Tx<'_>,
        id: &str,
        tenant_id: &str,
    ) -> Result<SelfDestructRecord> {
        tx.update(SELF_DESTRUCTS_TABLE, id, std::iter::empty())
            .map_err(|e| match e {
                record_store::StoreError::NotFound { .. } => {
                    LifecycleError::NotFound(id.to_string())
                }
                other => other.into(),
            })?;
        let record = tx
            .get(SELF_DESTRUCTS_TABLE, id)
            .as_ref()
            .and_then(SelfDestructRecord::from_row)
            .filter(|r| r.tenant_id == tenant_id)
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        if record.status != SelfDestructStatus::Armed {
            return Err(LifecycleError::NotFound(id.to_string()));
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualClock;
    use crate::InMemoryFlags;

    fn setup() -> (Arc<RecordStore>, SelfDestructManager, Arc<ManualClock>) {
        let store = Arc::new(RecordStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let flags = Arc::new(InMemoryFlags::all_enabled());
        let manager = SelfDestructManager::new(
            Arc::clone(&store),
            flags,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );

        let mut tx = store.begin();
        tx.insert("customers", Row::new("c-1").with("tenant_id", "t-1"))
            .unwrap();
        tx.insert(
            "orders",
            Row::new("o-1").with("tenant_id", "t-1").with("customer_id", "c-1"),
        )
        .unwrap();
        tx.commit();
        (store, manager, clock)
    }

    fn arm_customer(manager: &SelfDestructManager) -> SelfDestructRecord {
        manager
            .arm(
                "t-1",
                TargetTable::Customer,
                "c-1",
                "alice",
                Some("gdpr".into()),
                None,
                serde_json::Value::Null,
            )
            .unwrap()
    }

    #[test]
    fn test_arm_creates_armed_record_and_audit() {
        let (store, manager, _) = setup();
        let record = arm_customer(&manager);
        assert_eq!(record.status, SelfDestructStatus::Armed);
        assert_eq!(record.armed_at, 1_000);

        let audit = AuditLog::for_action(&store, "t-1", AuditAction::SelfDestructArmed);
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].target_id, "c-1");
    }

    #[test]
    fn test_arm_requires_flag() {
        let store = Arc::new(RecordStore::new());
        let manager = SelfDestructManager::new(
            Arc::clone(&store),
            Arc::new(InMemoryFlags::new()),
            Arc::new(ManualClock::new(0)) as Arc<dyn Clock>,
        );
        let err = manager
            .arm(
                "t-1",
                TargetTable::Customer,
                "c-1",
                "alice",
                None,
                None,
                serde_json::Value::Null,
            )
            .unwrap_err();
        assert_eq!(err, LifecycleError::NotEnabled(Flag::SelfDestruct));
    }

    #[test]
    fn test_arm_missing_or_foreign_target() {
        let (_, manager, _) = setup();
        let err = manager
            .arm(
                "t-1",
                TargetTable::Customer,
                "ghost",
                "alice",
                None,
                None,
                serde_json::Value::Null,
            )
            .unwrap_err();
        assert!(matches!(err, LifecycleError::TargetNotFound { .. }));

        let err = manager
            .arm(
                "t-2",
                TargetTable::Customer,
                "c-1",
                "alice",
                None,
                None,
                serde_json::Value::Null,
            )
            .unwrap_err();
        assert!(matches!(err, LifecycleError::TargetNotFound { .. }));
    }

    #[test]
    fn test_arm_deleted_target_maps_to_target_not_found() {
        let (store, manager, _) = setup();
        let mut tx = store.begin();
        tx.delete("orders", "o-1").unwrap();
        tx.delete("customers", "c-1").unwrap();
        tx.commit();

        // The target row lock attempt finds nothing to lock; the caller
        // sees the domain error, not a raw storage one.
        let err = manager
            .arm(
                "t-1",
                TargetTable::Customer,
                "c-1",
                "alice",
                None,
                None,
                serde_json::Value::Null,
            )
            .unwrap_err();
        assert_eq!(
            err,
            LifecycleError::TargetNotFound {
                table: "customers".to_string(),
                id: "c-1".to_string(),
            }
        );
    }

    #[test]
    fn test_double_arm_rejected() {
        let (_, manager, _) = setup();
        arm_customer(&manager);
        let err = manager
            .arm(
                "t-1",
                TargetTable::Customer,
                "c-1",
                "bob",
                None,
                None,
                serde_json::Value::Null,
            )
            .unwrap_err();
        assert_eq!(err, LifecycleError::AlreadyArmed);
    }

    #[test]
    fn test_rearm_allowed_after_disarm() {
        let (_, manager, _) = setup();
        let record = arm_customer(&manager);
        manager.disarm(&record.id, "t-1", "bob", None).unwrap();
        // Disarmed is terminal for that record, but the target can be armed
        // again under a fresh record.
        let again = arm_customer(&manager);
        assert_ne!(again.id, record.id);
    }

    #[test]
    fn test_disarm_then_destroy_fails_without_side_effects() {
        let (store, manager, _) = setup();
        let record = arm_customer(&manager);
        manager.disarm(&record.id, "t-1", "bob", None).unwrap();

        let err = manager.destroy_now(&record.id, "t-1", "alice").unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(_)));
        assert!(store.get("customers", "c-1").is_some());

        // Destroyed is unreachable from disarmed; double-disarm also fails.
        let err = manager.disarm(&record.id, "t-1", "bob", None).unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(_)));
    }

    #[test]
    fn test_destroy_cascades_and_is_terminal() {
        let (store, manager, _) = setup();
        let record = arm_customer(&manager);
        let deleted = manager.destroy_now(&record.id, "t-1", "alice").unwrap();
        assert_eq!(deleted, 2); // customer + its order

        assert!(store.get("customers", "c-1").is_none());
        assert!(store.get("orders", "o-1").is_none());

        let row = store.get(SELF_DESTRUCTS_TABLE, &record.id).unwrap();
        assert_eq!(row.str("status"), Some("destroyed"));

        let err = manager.destroy_now(&record.id, "t-1", "alice").unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(_)));
    }

    #[test]
    fn test_system_destroy_audits_sweeper_action() {
        let (store, manager, _) = setup();
        let record = arm_customer(&manager);
        manager.destroy_now_system(&record.id, "t-1").unwrap();

        let audit = AuditLog::for_action(&store, "t-1", AuditAction::SweeperDestroy);
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].actor_type, "system");
    }

    #[test]
    fn test_destroy_rechecks_flag() {
        let store = Arc::new(RecordStore::new());
        let flags = Arc::new(InMemoryFlags::all_enabled());
        let manager = SelfDestructManager::new(
            Arc::clone(&store),
            Arc::clone(&flags) as Arc<dyn FlagStore>,
            Arc::new(ManualClock::new(0)) as Arc<dyn Clock>,
        );
        let mut tx = store.begin();
        tx.insert("customers", Row::new("c-1").with("tenant_id", "t-1"))
            .unwrap();
        tx.commit();

        let record = manager
            .arm(
                "t-1",
                TargetTable::Customer,
                "c-1",
                "alice",
                None,
                None,
                serde_json::Value::Null,
            )
            .unwrap();

        // Flag flipped off between arm and destroy.
        flags.set_override("t-1", Flag::SelfDestruct, false);
        let err = manager.destroy_now(&record.id, "t-1", "alice").unwrap_err();
        assert_eq!(err, LifecycleError::NotEnabled(Flag::SelfDestruct));
        assert!(store.get("customers", "c-1").is_some());
    }

    #[test]
    fn test_filter_out_armed() {
        let (_, manager, _) = setup();
        let ids = vec!["c-1".to_string(), "c-9".to_string()];

        // Nothing armed: passthrough.
        assert_eq!(manager.filter_out_armed("t-1", TargetTable::Customer, &ids), ids);

        arm_customer(&manager);
        let filtered = manager.filter_out_armed("t-1", TargetTable::Customer, &ids);
        assert_eq!(filtered, vec!["c-9".to_string()]);

        // Orders are unaffected by a customers arm.
        let order_ids = vec!["o-1".to_string()];
        assert_eq!(
            manager.filter_out_armed("t-1", TargetTable::Order, &order_ids),
            order_ids
        );
    }

    #[test]
    fn test_due_records_respects_deadline() {
        let (_, manager, clock) = setup();
        manager
            .arm(
                "t-1",
                TargetTable::Customer,
                "c-1",
                "alice",
                None,
                Some(5_000),
                serde_json::Value::Null,
            )
            .unwrap();

        assert!(manager.due_records(clock.now_ms()).is_empty());
        clock.advance(4_000);
        assert_eq!(manager.due_records(clock.now_ms()).len(), 1);
    }

    #[test]
    fn test_racing_arms_one_winner() {
        use std::thread;

        let (_, manager, _) = setup();
        let manager = Arc::new(manager);
        let mut handles = vec![];
        for i in 0..4 {
            let m = Arc::clone(&manager);
            handles.push(thread::spawn(move || {
                m.arm(
                    "t-1",
                    TargetTable::Customer,
                    "c-1",
                    &format!("caller-{i}"),
                    None,
                    None,
                    serde_json::Value::Null,
                )
                .is_ok()
            }));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);

        let armed = manager.store.count(SELF_DESTRUCTS_TABLE, |r| {
            r.str("status") == Some("armed")
        });
        assert_eq!(armed, 1);
    }
}
