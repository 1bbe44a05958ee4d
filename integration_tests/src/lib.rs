// SPDX-License-Identifier: MIT OR Apache-2.0
//! Integration test helpers for the tenant lifecycle engine.
//!
//! Builds fully wired engine stacks (store, vault, flags, managers) on a
//! manual clock so multi-stage scenarios are deterministic.

use std::sync::Arc;

use lifecycle_engine::{
    Clock, FlagStore, InMemoryFlags, ManualClock, PurgeManager, SelfDestructManager,
};
use record_store::{RecordStore, Row};
use tenant_vault::{FieldCodec, MasterKey, TenantKeyStore, VaultConfig};

/// A complete engine stack over one shared in-process store.
pub struct TestEnv {
    pub store: Arc<RecordStore>,
    pub flags: Arc<InMemoryFlags>,
    pub clock: Arc<ManualClock>,
    pub keys: Arc<TenantKeyStore>,
    pub codec: FieldCodec,
    pub self_destructs: Arc<SelfDestructManager>,
    pub purges: Arc<PurgeManager>,
}

/// Deterministic test master key.
pub fn test_master_key() -> MasterKey {
    MasterKey::from_hex(&"5c".repeat(32)).expect("test master key")
}

/// Build a stack with every feature flag on and the clock at `start_ms`.
pub fn env_at(start_ms: i64) -> TestEnv {
    let store = Arc::new(RecordStore::new());
    let flags = Arc::new(InMemoryFlags::all_enabled());
    let clock = Arc::new(ManualClock::new(start_ms));
    let keys = Arc::new(TenantKeyStore::with_clock(
        Arc::clone(&store),
        test_master_key(),
        VaultConfig::default(),
        Arc::clone(&clock) as Arc<dyn Clock>,
    ));
    let codec = FieldCodec::new(Arc::clone(&keys));
    let self_destructs = Arc::new(SelfDestructManager::new(
        Arc::clone(&store),
        Arc::clone(&flags) as Arc<dyn FlagStore>,
        Arc::clone(&clock) as Arc<dyn Clock>,
    ));
    let purges = Arc::new(PurgeManager::new(
        Arc::clone(&store),
        Arc::clone(&flags) as Arc<dyn FlagStore>,
        Arc::clone(&keys),
        Arc::clone(&clock) as Arc<dyn Clock>,
    ));

    TestEnv {
        store,
        flags,
        clock,
        keys,
        codec,
        self_destructs,
        purges,
    }
}

pub fn env() -> TestEnv {
    env_at(1_000_000)
}

/// Insert a tenant row with the given last-activity timestamp.
pub fn seed_tenant(env: &TestEnv, tenant_id: &str, name: &str, last_activity_at: i64) {
    let mut tx = env.store.begin();
    tx.insert(
        lifecycle_engine::TENANTS_TABLE,
        Row::new(tenant_id)
            .with("name", name)
            .with("last_activity_at", last_activity_at),
    )
    .expect("seed tenant");
    tx.commit();
}

/// Insert a customer with one order, an order item, a delivery, a credit
/// account with two transactions, and a loyalty account. Returns the ids of
/// every row created, customer first.
pub fn seed_customer_graph(env: &TestEnv, tenant_id: &str, customer_id: &str) -> Vec<String> {
    let mut ids = vec![customer_id.to_string()];
    let mut tx = env.store.begin();
    tx.insert(
        "customers",
        Row::new(customer_id).with("tenant_id", tenant_id),
    )
    .expect("seed customer");

    let order_id = format!("{customer_id}-o1");
    tx.insert(
        "orders",
        Row::new(order_id.as_str())
            .with("tenant_id", tenant_id)
            .with("customer_id", customer_id),
    )
    .expect("seed order");
    ids.push(order_id.clone());

    for (table, id) in [
        ("order_items", format!("{order_id}-i1")),
        ("deliveries", format!("{order_id}-d1")),
    ] {
        tx.insert(
            table,
            Row::new(id.as_str())
                .with("tenant_id", tenant_id)
                .with("order_id", order_id.as_str()),
        )
        .expect("seed order child");
        ids.push(id);
    }

    for (table, id) in [
        ("credit_accounts", format!("{customer_id}-ca")),
        ("credit_transactions", format!("{customer_id}-ct1")),
        ("credit_transactions", format!("{customer_id}-ct2")),
        ("loyalty_accounts", format!("{customer_id}-la")),
    ] {
        tx.insert(
            table,
            Row::new(id.as_str())
                .with("tenant_id", tenant_id)
                .with("customer_id", customer_id),
        )
        .expect("seed customer child");
        ids.push(id);
    }
    tx.commit();
    ids
}

/// Walk a purge from request through schedule, returning the operation id.
/// The clock ticks between stages so the audit trail orders unambiguously.
pub fn schedule_purge(env: &TestEnv, tenant_id: &str, name: &str, at_ms: i64) -> String {
    let op = env
        .purges
        .request(tenant_id, name, "owner")
        .expect("purge request");
    env.clock.advance(1);
    env.purges
        .ack_export(&op.id, tenant_id, "owner")
        .expect("export ack");
    env.clock.advance(1);
    env.purges
        .schedule(&op.id, tenant_id, at_ms, "owner")
        .expect("schedule");
    env.clock.advance(1);
    op.id
}

/// Install a compact tracing subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .try_init();
}
