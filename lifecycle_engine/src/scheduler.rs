// SPDX-License-Identifier: MIT OR Apache-2.0
//! Background coordination: clocks, polling loops, and the three sweepers.
//!
//! Several engine instances may run the same sweepers against shared
//! storage. Coordination is lock-based, not leader-based: due work is
//! claimed row by row (`claim_one`) and fenced with advisory locks, so any
//! number of instances can poll concurrently and each due item executes
//! exactly once. A sweeper tick never aborts on a bad item; failures are
//! logged per item and the loop moves on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use record_store::{advisory_key_for, RecordStore};

use crate::cascade::TENANTS_TABLE;
use crate::purge::PurgeManager;
use crate::self_destruct::SelfDestructManager;
use crate::{ActorType, Flag, FlagStore};

pub use record_store::{Clock, ManualClock, SystemClock};

/// One background polling loop: a named thread calling a tick closure at a
/// fixed interval until stopped.
pub struct SchedulerHandle {
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for SchedulerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerHandle {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    /// Spawn the polling thread. Returns false (and does nothing) when the
    /// loop is already running.
    pub fn start<F>(&self, interval: Duration, mut tick: F) -> bool
    where
        F: FnMut() + Send + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let running = Arc::clone(&self.running);
        let handle = std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                tick();
                // Sleep in short slices so stop() stays responsive even
                // with long poll intervals.
                let mut slept = Duration::ZERO;
                while slept < interval && running.load(Ordering::SeqCst) {
                    let step = (interval - slept).min(Duration::from_millis(25));
                    std::thread::sleep(step);
                    slept += step;
                }
            }
        });
        *self.thread.lock() = Some(handle);
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signal the loop to stop and wait for the thread to exit.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Executes due self-destruct records.
pub struct SelfDestructSweeper {
    store: Arc<RecordStore>,
    manager: Arc<SelfDestructManager>,
    clock: Arc<dyn Clock>,
}

impl SelfDestructSweeper {
    pub fn new(
        store: Arc<RecordStore>,
        manager: Arc<SelfDestructManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            manager,
            clock,
        }
    }

    /// One pass over due records. Each record is fenced by a per-record
    /// advisory lock so concurrent sweeper instances never double-execute;
    /// a record another instance holds is simply skipped until next tick.
    /// Returns the number of records destroyed.
    pub fn tick(&self) -> usize {
        let now = self.clock.now_ms();
        let mut destroyed = 0;
        for record in self.manager.due_records(now) {
            let key = advisory_key_for(&format!("self-destruct:{}", record.id));
            let Some(_guard) = self.store.advisory().try_lock(key) else {
                continue;
            };
            match self.manager.destroy_now_system(&record.id, &record.tenant_id) {
                Ok(rows) => {
                    destroyed += 1;
                    tracing::debug!(
                        record = record.id.as_str(),
                        tenant = record.tenant_id.as_str(),
                        rows,
                        "sweeper destroyed record"
                    );
                }
                // NotFound / NotEnabled are normal here: the record was
                // disarmed, executed elsewhere, or the flag went off since
                // the scan.
                Err(e) => {
                    tracing::warn!(
                        record = record.id.as_str(),
                        tenant = record.tenant_id.as_str(),
                        error = %e,
                        "sweeper skipped record"
                    );
                }
            }
        }
        destroyed
    }
}

/// Executes due purge operations.
pub struct PurgeRunner {
    store: Arc<RecordStore>,
    manager: Arc<PurgeManager>,
    clock: Arc<dyn Clock>,
}

impl PurgeRunner {
    pub fn new(store: Arc<RecordStore>, manager: Arc<PurgeManager>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            manager,
            clock,
        }
    }

    /// One pass: claim one due operation, fence the tenant with an advisory
    /// lock, then run the start → destroy → complete pipeline. The claim
    /// guard is dropped before `start` so the manager's own transaction can
    /// write the operation row; `start` re-validates status under its row
    /// lock, which keeps the handoff safe. Returns true when an operation
    /// was executed (finished or failed).
    pub fn tick(&self) -> bool {
        let now = self.clock.now_ms();
        let claimed = self.store.claim_one(crate::purge::PURGE_OPERATIONS_TABLE, |r| {
            r.str("status") == Some("pending")
                && r.int("export_acked_at").is_some()
                && r.int("scheduled_at").is_some_and(|at| at <= now)
        });
        let Some(claim) = claimed else {
            return false;
        };
        let (op_id, tenant_id) = {
            let row = claim.row();
            let Some(tenant) = row.str("tenant_id") else {
                return false;
            };
            (row.id.clone(), tenant.to_string())
        };

        // One purge per tenant across all runner instances.
        let key = advisory_key_for(&format!("tenant-purge:{tenant_id}"));
        let Some(_lock) = self.store.advisory().try_lock(key) else {
            return false;
        };
        drop(claim);

        if let Err(e) = self.manager.start(&op_id, &tenant_id, "purge-runner", ActorType::System) {
            tracing::warn!(purge = op_id.as_str(), tenant = tenant_id.as_str(), error = %e,
                "purge not started");
            return false;
        }
        match self.manager.purge_tenant_now(&tenant_id) {
            Ok(stats) => {
                if let Err(e) = self.manager.complete(&op_id, &tenant_id, "purge-runner", stats) {
                    tracing::error!(purge = op_id.as_str(), error = %e, "purge completion failed");
                }
            }
            Err(e) => {
                tracing::error!(purge = op_id.as_str(), tenant = tenant_id.as_str(), error = %e,
                    "purge execution failed");
                if let Err(e2) =
                    self.manager.fail(&op_id, &tenant_id, "purge-runner", &e.to_string())
                {
                    tracing::error!(purge = op_id.as_str(), error = %e2, "purge fail-mark failed");
                }
            }
        }
        true
    }
}

/// Requests purges for tenants gone quiet past the retention window.
pub struct InactivitySweeper {
    store: Arc<RecordStore>,
    manager: Arc<PurgeManager>,
    flags: Arc<dyn FlagStore>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl InactivitySweeper {
    pub fn new(
        store: Arc<RecordStore>,
        manager: Arc<PurgeManager>,
        flags: Arc<dyn FlagStore>,
        clock: Arc<dyn Clock>,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            manager,
            flags,
            clock,
            retention,
        }
    }

    /// One pass over tenants. A tenant qualifies when its auto-delete flag
    /// is on, its last activity is older than the retention window, and no
    /// purge is already active. Qualifying tenants get a system purge
    /// request; the resulting operation still requires the normal export
    /// acknowledgement and scheduling before anything is destroyed.
    /// Returns the number of requests created.
    pub fn tick(&self) -> usize {
        let cutoff = self.clock.now_ms() - self.retention.as_millis() as i64;
        let mut requested = 0;
        let idle = self.store.scan(TENANTS_TABLE, |r| {
            r.int("last_activity_at").is_some_and(|at| at <= cutoff)
        });
        for tenant in idle {
            if !self.flags.is_enabled(&tenant.id, Flag::InactivityAutoDelete) {
                continue;
            }
            if self.manager.active_operation(&tenant.id).is_some() {
                continue;
            }
            let name = tenant.str("name").unwrap_or(&tenant.id).to_string();
            match self.manager.request_system(&tenant.id, &name) {
                Ok(op) => {
                    requested += 1;
                    tracing::info!(
                        tenant = tenant.id.as_str(),
                        purge = op.id.as_str(),
                        "inactivity purge requested"
                    );
                }
                Err(e) => {
                    tracing::warn!(tenant = tenant.id.as_str(), error = %e,
                        "inactivity purge request failed");
                }
            }
        }
        requested
    }
}
