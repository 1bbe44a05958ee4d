// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only audit log for destructive state transitions.
//!
//! Every transition of the self-destruct and purge state machines writes an
//! entry through the same transaction that performs the transition, so the
//! forensic record and the mutation commit or roll back together. Entries
//! are never updated or deleted; the purge manifest deliberately excludes
//! this table.

use record_store::{RecordStore, Row, Tx, Value};
use uuid::Uuid;

use crate::Result;

/// Table holding audit entries.
pub const AUDIT_LOG_TABLE: &str = "audit_log";

/// Who performed an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    User,
    System,
}

impl ActorType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
        }
    }
}

/// Auditable engine actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    SelfDestructArmed,
    SelfDestructDisarmed,
    SelfDestructExecuted,
    SweeperDestroy,
    PurgeRequested,
    PurgeExportAcked,
    PurgeScheduled,
    PurgeCanceled,
    PurgeStarted,
    PurgeCompleted,
    PurgeFailed,
    InactivityPurgeRequested,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SelfDestructArmed => "self_destruct_armed",
            Self::SelfDestructDisarmed => "self_destruct_disarmed",
            Self::SelfDestructExecuted => "self_destruct_executed",
            Self::SweeperDestroy => "sweeper_destroy",
            Self::PurgeRequested => "purge_requested",
            Self::PurgeExportAcked => "purge_export_acked",
            Self::PurgeScheduled => "purge_scheduled",
            Self::PurgeCanceled => "purge_canceled",
            Self::PurgeStarted => "purge_started",
            Self::PurgeCompleted => "purge_completed",
            Self::PurgeFailed => "purge_failed",
            Self::InactivityPurgeRequested => "inactivity_purge_requested",
        }
    }
}

/// One entry to be appended.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub tenant_id: String,
    pub target_table: String,
    pub target_id: String,
    pub action: AuditAction,
    pub actor: String,
    pub actor_type: ActorType,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub reason: Option<String>,
    pub metadata: serde_json::Value,
}

impl AuditEntry {
    pub fn new(
        tenant_id: impl Into<String>,
        target_table: impl Into<String>,
        target_id: impl Into<String>,
        action: AuditAction,
        actor: impl Into<String>,
        actor_type: ActorType,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            target_table: target_table.into(),
            target_id: target_id.into(),
            action,
            actor: actor.into(),
            actor_type,
            before: None,
            after: None,
            reason: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    #[must_use]
    pub fn before(mut self, before: serde_json::Value) -> Self {
        self.before = Some(before);
        self
    }

    #[must_use]
    pub fn after(mut self, after: serde_json::Value) -> Self {
        self.after = Some(after);
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A committed audit row, decoded for forensic queries.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub id: String,
    pub tenant_id: String,
    pub target_table: String,
    pub target_id: String,
    pub action: String,
    pub actor: String,
    pub actor_type: String,
    pub before: Option<String>,
    pub after: Option<String>,
    pub reason: Option<String>,
    pub metadata: String,
    pub created_at: i64,
}

impl AuditRecord {
    fn from_row(row: &Row) -> Option<Self> {
        Some(Self {
            id: row.id.clone(),
            tenant_id: row.str("tenant_id")?.to_string(),
            target_table: row.str("target_table")?.to_string(),
            target_id: row.str("target_id")?.to_string(),
            action: row.str("action")?.to_string(),
            actor: row.str("actor")?.to_string(),
            actor_type: row.str("actor_type")?.to_string(),
            before: row.str("before").map(str::to_string),
            after: row.str("after").map(str::to_string),
            reason: row.str("reason").map(str::to_string),
            metadata: row.str("metadata").unwrap_or("null").to_string(),
            created_at: row.int("created_at")?,
        })
    }
}

/// Writer/reader for the append-only audit table.
pub struct AuditLog;

impl AuditLog {
    /// Append an entry inside the caller's transaction.
    pub fn append(tx: &mut Tx<'_>, entry: AuditEntry, now_ms: i64) -> Result<()> {
        let opt = |v: Option<String>| v.map_or(Value::Null, Value::Str);
        tx.insert(
            AUDIT_LOG_TABLE,
            Row::new(Uuid::new_v4().to_string())
                .with("tenant_id", entry.tenant_id)
                .with("target_table", entry.target_table)
                .with("target_id", entry.target_id)
                .with("action", entry.action.as_str())
                .with("actor", entry.actor)
                .with("actor_type", entry.actor_type.as_str())
                .with("before", opt(entry.before.map(|v| v.to_string())))
                .with("after", opt(entry.after.map(|v| v.to_string())))
                .with("reason", opt(entry.reason))
                .with("metadata", entry.metadata.to_string())
                .with("created_at", now_ms),
        )?;
        Ok(())
    }

    /// All entries for a tenant, oldest first.
    pub fn for_tenant(store: &RecordStore, tenant_id: &str) -> Vec<AuditRecord> {
        let mut records: Vec<AuditRecord> = store
            .scan(AUDIT_LOG_TABLE, |r| r.str("tenant_id") == Some(tenant_id))
            .iter()
            .filter_map(AuditRecord::from_row)
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Entries for a tenant with a given action, oldest first.
    pub fn for_action(store: &RecordStore, tenant_id: &str, action: AuditAction) -> Vec<AuditRecord> {
        let mut records: Vec<AuditRecord> = store
            .scan(AUDIT_LOG_TABLE, |r| {
                r.str("tenant_id") == Some(tenant_id) && r.str("action") == Some(action.as_str())
            })
            .iter()
            .filter_map(AuditRecord::from_row)
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }
}
