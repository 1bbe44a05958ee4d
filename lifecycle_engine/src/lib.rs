// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tenant data lifecycle and secure destruction engine.
//!
//! Two irreversible-action state machines drive all destructive work:
//! - Self-destruct: a single record is armed for later (or immediate)
//!   deletion, with a disarm escape hatch until execution.
//! - Tenant purge: request → export acknowledgement → scheduling →
//!   execution, destroying a whole tenant and revoking its keys.
//!
//! Both re-verify their tenant feature flag at every stage: the pipeline
//! spans an interactive request, a confirmation step, and a scheduler tick
//! that may fire days later under a different code path, and each stage must
//! stay safe if any other check is bypassed by a race or a refactor. Every
//! transition is audit-logged inside the transaction it belongs to.

mod audit;
mod cascade;
mod flags;
mod purge;
mod scheduler;
mod self_destruct;

pub use audit::{AuditAction, AuditEntry, AuditLog, AuditRecord, ActorType, AUDIT_LOG_TABLE};
pub use cascade::{TargetTable, TENANTS_TABLE};
pub use flags::{Flag, FlagStore, InMemoryFlags};
pub use purge::{
    PurgeManager, PurgeOperation, PurgeStats, PurgeStatus, PURGE_MANIFEST, PURGE_OPERATIONS_TABLE,
};
pub use scheduler::{
    Clock, InactivitySweeper, ManualClock, PurgeRunner, SchedulerHandle, SelfDestructSweeper,
    SystemClock,
};
pub use self_destruct::{
    SelfDestructManager, SelfDestructRecord, SelfDestructStatus, SELF_DESTRUCTS_TABLE,
};

/// Engine error taxonomy.
///
/// Validation and state-machine guards surface synchronously to the caller;
/// scheduler-triggered failures are caught per item and logged so the loops
/// survive indefinitely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// The tenant feature flag for this operation is off.
    NotEnabled(Flag),
    /// Target record missing or owned by another tenant. Never destroy.
    TargetNotFound { table: String, id: String },
    /// A live armed record already exists for this exact target.
    AlreadyArmed,
    /// No such record, or not in the state the operation requires.
    NotFound(String),
    /// State-machine guard violated; no mutation performed.
    InvalidTransition { from: String, action: String },
    /// A pending or running purge already exists for the tenant.
    ActivePurgeExists(String),
    /// Purge stage requires a prior export acknowledgement.
    ExportNotAcked,
    /// Purge stage requires a scheduled execution time.
    NotScheduled,
    /// Purge execution time must lie in the future.
    ScheduleInPast,
    /// Target table name outside the closed allow-list.
    UnknownTargetTable(String),
    /// Storage-layer failure (including row lock conflicts).
    Storage(String),
    /// Key management failure (already opaque at the vault boundary).
    Vault(String),
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotEnabled(flag) => write!(f, "feature not enabled: {}", flag.key()),
            Self::TargetNotFound { table, id } => {
                write!(f, "target not found: {table}/{id}")
            }
            Self::AlreadyArmed => write!(f, "target is already armed for self-destruct"),
            Self::NotFound(id) => write!(f, "record not found or not in required state: {id}"),
            Self::InvalidTransition { from, action } => {
                write!(f, "invalid transition: cannot {action} from {from}")
            }
            Self::ActivePurgeExists(tenant) => {
                write!(f, "an active purge already exists for tenant {tenant}")
            }
            Self::ExportNotAcked => write!(f, "export has not been acknowledged"),
            Self::NotScheduled => write!(f, "purge has not been scheduled"),
            Self::ScheduleInPast => write!(f, "scheduled time must be in the future"),
            Self::UnknownTargetTable(name) => write!(f, "unknown target table: {name}"),
            Self::Storage(msg) => write!(f, "storage error: {msg}"),
            Self::Vault(msg) => write!(f, "vault error: {msg}"),
        }
    }
}

impl std::error::Error for LifecycleError {}

impl From<record_store::StoreError> for LifecycleError {
    fn from(e: record_store::StoreError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<tenant_vault::VaultError> for LifecycleError {
    fn from(e: tenant_vault::VaultError) -> Self {
        Self::Vault(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = LifecycleError::NotEnabled(Flag::DangerPurge);
        assert_eq!(e.to_string(), "feature not enabled: danger_purge");

        let e = LifecycleError::InvalidTransition {
            from: "finished".into(),
            action: "cancel".into(),
        };
        assert_eq!(e.to_string(), "invalid transition: cannot cancel from finished");
    }

    #[test]
    fn test_store_error_maps_to_storage() {
        let e: LifecycleError = record_store::StoreError::TxClosed.into();
        assert!(matches!(e, LifecycleError::Storage(_)));
    }
}
