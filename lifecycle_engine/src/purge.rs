// SPDX-License-Identifier: MIT OR Apache-2.0
//! Whole-tenant purge state machine.
//!
//! ```text
//! pending ──ack export──▶ pending(acked) ──schedule──▶ pending(scheduled)
//!    │                                                        │
//!    └───────────────cancel──────────────┐                 start
//!                                        ▼                    ▼
//!                                    canceled ◀──cancel── running ──▶ finished
//!                                                             └─────▶ failed
//! ```
//!
//! This is the most dangerous operation in the system: full, irreversible
//! destruction of a tenant and its keys. The `danger_purge` flag is checked
//! three times across the pipeline — request, start, execute — because the
//! chain spans an HTTP request, a confirmation step, and a scheduler tick
//! that may fire days later, and each stage must be independently safe.
//! There is no cancellation once `start` flips the status to `running`; a
//! failed purge is never auto-retried.

use std::sync::Arc;

use rand::RngCore;
use record_store::{advisory_key_for, RecordStore, Row, StoreError, Tx, Value};
use tenant_vault::TenantKeyStore;
use uuid::Uuid;

use crate::audit::{ActorType, AuditAction, AuditEntry, AuditLog};
use crate::cascade::TENANTS_TABLE;
use crate::scheduler::Clock;
use crate::{Flag, FlagStore, LifecycleError, Result};

/// Table holding purge operation rows.
pub const PURGE_OPERATIONS_TABLE: &str = "purge_operations";

/// Fixed manifest of tenant-scoped tables destroyed by a purge. The audit
/// log is deliberately absent: it is the forensic record of the purge.
pub const PURGE_MANIFEST: &[&str] = &[
    "customers",
    "orders",
    "order_items",
    "deliveries",
    "credit_accounts",
    "credit_transactions",
    "loyalty_accounts",
    "products",
    "self_destructs",
    tenant_vault::TENANT_KEYS_TABLE,
];

/// Lifecycle state of a purge operation. Strictly forward-moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeStatus {
    Pending,
    Running,
    Finished,
    Canceled,
    Failed,
}

impl PurgeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "finished" => Some(Self::Finished),
            "canceled" => Some(Self::Canceled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Pending and running operations block a new purge request.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// A purge operation row, decoded from storage.
#[derive(Debug, Clone)]
pub struct PurgeOperation {
    pub id: String,
    pub tenant_id: String,
    pub tenant_name: String,
    pub status: PurgeStatus,
    pub requested_by: String,
    pub requested_at: i64,
    pub export_acked_at: Option<i64>,
    pub scheduled_at: Option<i64>,
    pub confirmation_token: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub canceled_at: Option<i64>,
    pub records_destroyed: Option<i64>,
    pub tables_destroyed: Option<i64>,
    pub error_message: Option<String>,
}

impl PurgeOperation {
    fn from_row(row: &Row) -> Option<Self> {
        Some(Self {
            id: row.id.clone(),
            tenant_id: row.str("tenant_id")?.to_string(),
            tenant_name: row.str("tenant_name")?.to_string(),
            status: PurgeStatus::parse(row.str("status")?)?,
            requested_by: row.str("requested_by")?.to_string(),
            requested_at: row.int("requested_at")?,
            export_acked_at: row.int("export_acked_at"),
            scheduled_at: row.int("scheduled_at"),
            confirmation_token: row.str("confirmation_token").map(str::to_string),
            started_at: row.int("started_at"),
            completed_at: row.int("completed_at"),
            failed_at: row.int("failed_at"),
            canceled_at: row.int("canceled_at"),
            records_destroyed: row.int("records_destroyed"),
            tables_destroyed: row.int("tables_destroyed"),
            error_message: row.str("error_message").map(str::to_string),
        })
    }
}

/// Result of the destruction itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeStats {
    pub records_destroyed: i64,
    pub tables_destroyed: i64,
}

/// Drives the request → ack → schedule → execute pipeline.
pub struct PurgeManager {
    store: Arc<RecordStore>,
    flags: Arc<dyn FlagStore>,
    keys: Arc<TenantKeyStore>,
    clock: Arc<dyn Clock>,
}

impl PurgeManager {
    pub fn new(
        store: Arc<RecordStore>,
        flags: Arc<dyn FlagStore>,
        keys: Arc<TenantKeyStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            flags,
            keys,
            clock,
        }
    }

    fn require_enabled(&self, tenant_id: &str) -> Result<()> {
        if self.flags.is_enabled(tenant_id, Flag::DangerPurge) {
            Ok(())
        } else {
            Err(LifecycleError::NotEnabled(Flag::DangerPurge))
        }
    }

    /// Flag check one of three. Rejects while any pending/running purge
    /// exists for the tenant; the uniqueness check runs under a per-tenant
    /// request fence so racing requests produce exactly one operation.
    pub fn request(&self, tenant_id: &str, tenant_name: &str, requested_by: &str) -> Result<PurgeOperation> {
        self.request_inner(tenant_id, tenant_name, requested_by, ActorType::User,
            AuditAction::PurgeRequested)
    }

    /// Inactivity-enforcement entry point: identical semantics, system
    /// actor and a distinct audit action.
    pub fn request_system(&self, tenant_id: &str, tenant_name: &str) -> Result<PurgeOperation> {
        self.request_inner(
            tenant_id,
            tenant_name,
            "inactivity-sweeper",
            ActorType::System,
            AuditAction::InactivityPurgeRequested,
        )
    }

    fn request_inner(
        &self,
        tenant_id: &str,
        tenant_name: &str,
        requested_by: &str,
        actor_type: ActorType,
        action: AuditAction,
    ) -> Result<PurgeOperation> {
        self.require_enabled(tenant_id)?;

        // Racing requests serialize on this fence; the tenant row alone
        // cannot carry the race because a tenant may have no row yet.
        // Contention means another purge-shaped operation is in flight.
        let fence = advisory_key_for(&format!("purge-request:{tenant_id}"));
        let _guard = self
            .store
            .advisory()
            .try_lock(fence)
            .ok_or_else(|| LifecycleError::ActivePurgeExists(tenant_id.to_string()))?;

        let mut tx = self.store.begin();
        // Also take the tenant row lock when the row exists, so a request
        // cannot interleave with a purge execution deleting that row.
        if self.store.get(TENANTS_TABLE, tenant_id).is_some() {
            tx.update(TENANTS_TABLE, tenant_id, std::iter::empty())
                .map_err(|e| match e {
                    StoreError::LockConflict { .. } => {
                        LifecycleError::ActivePurgeExists(tenant_id.to_string())
                    }
                    other => other.into(),
                })?;
        }
        if self.active_operation(tenant_id).is_some() {
            return Err(LifecycleError::ActivePurgeExists(tenant_id.to_string()));
        }

        let now = self.clock.now_ms();
        let id = Uuid::new_v4().to_string();
        tx.insert(
            PURGE_OPERATIONS_TABLE,
            Row::new(id.clone())
                .with("tenant_id", tenant_id)
                .with("tenant_name", tenant_name)
                .with("status", PurgeStatus::Pending.as_str())
                .with("requested_by", requested_by)
                .with("requested_at", now)
                .with("export_acked_at", Value::Null)
                .with("scheduled_at", Value::Null)
                .with("confirmation_token", Value::Null)
                .with("started_at", Value::Null)
                .with("completed_at", Value::Null)
                .with("failed_at", Value::Null)
                .with("canceled_at", Value::Null)
                .with("records_destroyed", Value::Null)
                .with("tables_destroyed", Value::Null)
                .with("error_message", Value::Null),
        )?;
        AuditLog::append(
            &mut tx,
            AuditEntry::new(tenant_id, TENANTS_TABLE, tenant_id, action, requested_by, actor_type)
                .after(serde_json::json!({ "purge_id": id, "status": "pending" })),
            now,
        )?;
        tx.commit();

        self.operation(&id, tenant_id)
    }

    /// Stamp the export acknowledgement. Export-before-destroy is a hard
    /// safety requirement; later stages check for this timestamp
    /// independently of status.
    pub fn ack_export(&self, id: &str, tenant_id: &str, acked_by: &str) -> Result<()> {
        let mut tx = self.store.begin();
        let op = self.fetch_locked(&mut tx, id, tenant_id)?;
        if op.status != PurgeStatus::Pending {
            return Err(LifecycleError::InvalidTransition {
                from: op.status.as_str().to_string(),
                action: "ack_export".to_string(),
            });
        }
        if op.export_acked_at.is_some() {
            return Err(LifecycleError::InvalidTransition {
                from: "pending(acked)".to_string(),
                action: "ack_export".to_string(),
            });
        }

        let now = self.clock.now_ms();
        tx.update(
            PURGE_OPERATIONS_TABLE,
            id,
            [("export_acked_at".to_string(), Value::from(now))],
        )?;
        AuditLog::append(
            &mut tx,
            AuditEntry::new(
                tenant_id,
                TENANTS_TABLE,
                tenant_id,
                AuditAction::PurgeExportAcked,
                acked_by,
                ActorType::User,
            ),
            now,
        )?;
        tx.commit();
        Ok(())
    }

    /// Store the execution time and mint a confirmation token. Requires a
    /// prior export ack; leaves the status untouched.
    pub fn schedule(
        &self,
        id: &str,
        tenant_id: &str,
        scheduled_at: i64,
        scheduled_by: &str,
    ) -> Result<String> {
        let mut tx = self.store.begin();
        let op = self.fetch_locked(&mut tx, id, tenant_id)?;
        if op.status != PurgeStatus::Pending {
            return Err(LifecycleError::InvalidTransition {
                from: op.status.as_str().to_string(),
                action: "schedule".to_string(),
            });
        }
        if op.export_acked_at.is_none() {
            return Err(LifecycleError::ExportNotAcked);
        }
        if scheduled_at <= self.clock.now_ms() {
            return Err(LifecycleError::ScheduleInPast);
        }

        let mut token_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token_bytes);
        let token = hex::encode(token_bytes);

        let now = self.clock.now_ms();
        tx.update(
            PURGE_OPERATIONS_TABLE,
            id,
            [
                ("scheduled_at".to_string(), Value::from(scheduled_at)),
                ("confirmation_token".to_string(), Value::from(token.clone())),
            ],
        )?;
        AuditLog::append(
            &mut tx,
            AuditEntry::new(
                tenant_id,
                TENANTS_TABLE,
                tenant_id,
                AuditAction::PurgeScheduled,
                scheduled_by,
                ActorType::User,
            )
            .metadata(serde_json::json!({ "scheduled_at": scheduled_at })),
            now,
        )?;
        tx.commit();
        Ok(token)
    }

    /// Cancel from `pending` or `running` only; the last safe abort point
    /// is before `start` — a running executor is not interrupted, but a
    /// canceled row will refuse `complete`.
    pub fn cancel(
        &self,
        id: &str,
        tenant_id: &str,
        canceled_by: &str,
        reason: Option<String>,
    ) -> Result<()> {
        let mut tx = self.store.begin();
        let op = self.fetch_locked(&mut tx, id, tenant_id)?;
        if !op.status.is_active() {
            return Err(LifecycleError::InvalidTransition {
                from: op.status.as_str().to_string(),
                action: "cancel".to_string(),
            });
        }

        let now = self.clock.now_ms();
        tx.update(
            PURGE_OPERATIONS_TABLE,
            id,
            [
                ("status".to_string(), Value::from(PurgeStatus::Canceled.as_str())),
                ("canceled_at".to_string(), Value::from(now)),
            ],
        )?;
        AuditLog::append(
            &mut tx,
            AuditEntry::new(
                tenant_id,
                TENANTS_TABLE,
                tenant_id,
                AuditAction::PurgeCanceled,
                canceled_by,
                ActorType::User,
            )
            .reason(reason)
            .before(serde_json::json!({ "status": op.status.as_str() })),
            now,
        )?;
        tx.commit();
        Ok(())
    }

    /// Flag check two of three, plus an independent export-ack re-check.
    /// Requires `pending` with a scheduled time; flips to `running`.
    pub fn start(&self, id: &str, tenant_id: &str, actor: &str, actor_type: ActorType) -> Result<()> {
        self.require_enabled(tenant_id)?;

        let mut tx = self.store.begin();
        let op = self.fetch_locked(&mut tx, id, tenant_id)?;
        if op.status != PurgeStatus::Pending {
            return Err(LifecycleError::InvalidTransition {
                from: op.status.as_str().to_string(),
                action: "start".to_string(),
            });
        }
        if op.export_acked_at.is_none() {
            return Err(LifecycleError::ExportNotAcked);
        }
        if op.scheduled_at.is_none() {
            return Err(LifecycleError::NotScheduled);
        }

        let now = self.clock.now_ms();
        tx.update(
            PURGE_OPERATIONS_TABLE,
            id,
            [
                ("status".to_string(), Value::from(PurgeStatus::Running.as_str())),
                ("started_at".to_string(), Value::from(now)),
            ],
        )?;
        AuditLog::append(
            &mut tx,
            AuditEntry::new(
                tenant_id,
                TENANTS_TABLE,
                tenant_id,
                AuditAction::PurgeStarted,
                actor,
                actor_type,
            )
            .metadata(serde_json::json!({
                "purge_id": id,
                "tenant_name": op.tenant_name,
                "export_acked_at": op.export_acked_at,
                "scheduled_at": op.scheduled_at,
            })),
            now,
        )?;
        tx.commit();
        tracing::info!(tenant = tenant_id, purge = id, "purge started");
        Ok(())
    }

    /// Flag check three of three — this is the irreversible step. One
    /// transaction: revoke the tenant's keys first (anything that survives
    /// the deletes goes dark), then destroy the manifest tables and the
    /// tenant row itself.
    pub fn purge_tenant_now(&self, tenant_id: &str) -> Result<PurgeStats> {
        self.require_enabled(tenant_id)?;

        let mut tx = self.store.begin();
        self.keys.revoke_tenant_keys(tenant_id, &mut tx)?;

        let mut records: i64 = 0;
        for table in PURGE_MANIFEST {
            let n = tx.delete_where(table, |r| r.str("tenant_id") == Some(tenant_id))?;
            records += n as i64;
        }
        match tx.delete(TENANTS_TABLE, tenant_id) {
            Ok(()) => records += 1,
            // A tenant row may not exist in every deployment shape.
            Err(StoreError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        tx.commit();

        let stats = PurgeStats {
            records_destroyed: records,
            tables_destroyed: PURGE_MANIFEST.len() as i64,
        };
        tracing::info!(
            tenant = tenant_id,
            records = stats.records_destroyed,
            "tenant purged"
        );
        Ok(stats)
    }

    /// Terminal success; requires `running`.
    pub fn complete(&self, id: &str, tenant_id: &str, actor: &str, stats: PurgeStats) -> Result<()> {
        let mut tx = self.store.begin();
        let op = self.fetch_locked(&mut tx, id, tenant_id)?;
        if op.status != PurgeStatus::Running {
            return Err(LifecycleError::InvalidTransition {
                from: op.status.as_str().to_string(),
                action: "complete".to_string(),
            });
        }

        let now = self.clock.now_ms();
        tx.update(
            PURGE_OPERATIONS_TABLE,
            id,
            [
                ("status".to_string(), Value::from(PurgeStatus::Finished.as_str())),
                ("completed_at".to_string(), Value::from(now)),
                ("records_destroyed".to_string(), Value::from(stats.records_destroyed)),
                ("tables_destroyed".to_string(), Value::from(stats.tables_destroyed)),
            ],
        )?;
        AuditLog::append(
            &mut tx,
            AuditEntry::new(
                tenant_id,
                TENANTS_TABLE,
                tenant_id,
                AuditAction::PurgeCompleted,
                actor,
                ActorType::System,
            )
            .metadata(serde_json::json!({
                "records_destroyed": stats.records_destroyed,
                "tables_destroyed": stats.tables_destroyed,
            })),
            now,
        )?;
        tx.commit();
        Ok(())
    }

    /// Terminal failure; requires `running`. Marked for manual
    /// investigation — never auto-retried.
    pub fn fail(&self, id: &str, tenant_id: &str, actor: &str, error: &str) -> Result<()> {
        let mut tx = self.store.begin();
        let op = self.fetch_locked(&mut tx, id, tenant_id)?;
        if op.status != PurgeStatus::Running {
            return Err(LifecycleError::InvalidTransition {
                from: op.status.as_str().to_string(),
                action: "fail".to_string(),
            });
        }

        let now = self.clock.now_ms();
        tx.update(
            PURGE_OPERATIONS_TABLE,
            id,
            [
                ("status".to_string(), Value::from(PurgeStatus::Failed.as_str())),
                ("failed_at".to_string(), Value::from(now)),
                ("error_message".to_string(), Value::from(error)),
            ],
        )?;
        AuditLog::append(
            &mut tx,
            AuditEntry::new(
                tenant_id,
                TENANTS_TABLE,
                tenant_id,
                AuditAction::PurgeFailed,
                actor,
                ActorType::System,
            )
            .metadata(serde_json::json!({ "error": error })),
            now,
        )?;
        tx.commit();
        tracing::error!(tenant = tenant_id, purge = id, error, "purge failed");
        Ok(())
    }

    /// The tenant's active (pending/running) operation, if any.
    pub fn active_operation(&self, tenant_id: &str) -> Option<PurgeOperation> {
        self.store
            .scan(PURGE_OPERATIONS_TABLE, |r| {
                r.str("tenant_id") == Some(tenant_id)
                    && r.str("status")
                        .and_then(PurgeStatus::parse)
                        .is_some_and(PurgeStatus::is_active)
            })
            .iter()
            .filter_map(PurgeOperation::from_row)
            .next()
    }

    /// All operations for a tenant, newest first. Actor ids are returned
    /// raw; name resolution belongs to the read layer.
    pub fn list(&self, tenant_id: &str) -> Vec<PurgeOperation> {
        let mut ops: Vec<PurgeOperation> = self
            .store
            .scan(PURGE_OPERATIONS_TABLE, |r| r.str("tenant_id") == Some(tenant_id))
            .iter()
            .filter_map(PurgeOperation::from_row)
            .collect();
        ops.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        ops
    }

    /// Fetch one operation without locking.
    pub fn operation(&self, id: &str, tenant_id: &str) -> Result<PurgeOperation> {
        self.store
            .get(PURGE_OPERATIONS_TABLE, id)
            .as_ref()
            .and_then(PurgeOperation::from_row)
            .filter(|op| op.tenant_id == tenant_id)
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))
    }

    /// Operations due for execution: pending, acked, scheduled at or
    /// before `now`.
    pub fn due_operations(&self, now_ms: i64) -> Vec<PurgeOperation> {
        self.store
            .scan(PURGE_OPERATIONS_TABLE, |r| {
                r.str("status") == Some("pending")
                    && r.int("export_acked_at").is_some()
                    && r.int("scheduled_at").is_some_and(|at| at <= now_ms)
            })
            .iter()
            .filter_map(PurgeOperation::from_row)
            .collect()
    }

    /// Lock the operation row in-transaction and re-read it there, so the
    /// status guards cannot race a concurrent transition.
    fn fetch_locked(&self, tx: &mut Tx<'_>, id: &str, tenant_id: &str) -> Result<PurgeOperation> {
        tx.update(PURGE_OPERATIONS_TABLE, id, std::iter::empty())
            .map_err(|e| match e {
                StoreError::NotFound { .. } => LifecycleError::NotFound(id.to_string()),
                other => other.into(),
            })?;
        tx.get(PURGE_OPERATIONS_TABLE, id)
            .as_ref()
            .and_then(PurgeOperation::from_row)
            .filter(|op| op.tenant_id == tenant_id)
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))
    }
}
