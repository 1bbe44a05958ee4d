// SPDX-License-Identifier: MIT OR Apache-2.0
//! Closed allow-list of self-destruct targets and their cascade graphs.
//!
//! Target tables are a tagged enum, not free-form strings: an unrecognized
//! name is rejected at the boundary, never deep inside deletion logic. Each
//! variant carries the typed cascade so a customer's whole owned data graph
//! (credit history, loyalty account, orders with their items and deliveries)
//! disappears in the same transaction as the customer row.

use record_store::{RecordStore, Row, Tx};

use crate::{LifecycleError, Result};

/// Table holding tenant rows (purge deletes from here last).
pub const TENANTS_TABLE: &str = "tenants";

/// The tables a self-destruct may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetTable {
    Customer,
    Order,
}

impl TargetTable {
    /// Parse a wire table name, rejecting anything outside the allow-list.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "customers" => Ok(Self::Customer),
            "orders" => Ok(Self::Order),
            other => Err(LifecycleError::UnknownTargetTable(other.to_string())),
        }
    }

    pub fn table_name(self) -> &'static str {
        match self {
            Self::Customer => "customers",
            Self::Order => "orders",
        }
    }

    /// Fetch the target row and verify it belongs to the tenant. A missing
    /// row and a cross-tenant row are indistinguishable to the caller.
    pub fn fetch_owned(self, store: &RecordStore, tenant_id: &str, target_id: &str) -> Result<Row> {
        store
            .get(self.table_name(), target_id)
            .filter(|row| row.str("tenant_id") == Some(tenant_id))
            .ok_or_else(|| LifecycleError::TargetNotFound {
                table: self.table_name().to_string(),
                id: target_id.to_string(),
            })
    }

    /// Hard-delete the target and everything it owns, inside the caller's
    /// transaction. Returns the number of rows removed.
    pub fn cascade_delete(self, tx: &mut Tx<'_>, target_id: &str) -> Result<usize> {
        match self {
            Self::Customer => cascade_customer(tx, target_id),
            Self::Order => cascade_order(tx, target_id),
        }
    }
}

fn cascade_customer(tx: &mut Tx<'_>, customer_id: &str) -> Result<usize> {
    let mut deleted = 0;
    deleted += tx.delete_where("credit_transactions", |r| {
        r.str("customer_id") == Some(customer_id)
    })?;
    deleted += tx.delete_where("credit_accounts", |r| {
        r.str("customer_id") == Some(customer_id)
    })?;
    deleted += tx.delete_where("loyalty_accounts", |r| {
        r.str("customer_id") == Some(customer_id)
    })?;

    // Orders own their line items and deliveries; remove those before the
    // order rows themselves.
    let order_ids: Vec<String> = tx
        .scan("orders", |r| r.str("customer_id") == Some(customer_id))
        .into_iter()
        .map(|r| r.id)
        .collect();
    for order_id in &order_ids {
        deleted += cascade_order(tx, order_id)?;
    }

    tx.delete("customers", customer_id)?;
    Ok(deleted + 1)
}

fn cascade_order(tx: &mut Tx<'_>, order_id: &str) -> Result<usize> {
    let mut deleted = 0;
    deleted += tx.delete_where("order_items", |r| r.str("order_id") == Some(order_id))?;
    deleted += tx.delete_where("deliveries", |r| r.str("order_id") == Some(order_id))?;
    tx.delete("orders", order_id)?;
    Ok(deleted + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use record_store::RecordStore;

    fn seed_customer_graph(store: &RecordStore) {
        let mut tx = store.begin();
        tx.insert("customers", Row::new("c-1").with("tenant_id", "t-1"))
            .unwrap();
        tx.insert(
            "credit_accounts",
            Row::new("ca-1").with("tenant_id", "t-1").with("customer_id", "c-1"),
        )
        .unwrap();
        for i in 0..2 {
            tx.insert(
                "credit_transactions",
                Row::new(format!("ct-{i}"))
                    .with("tenant_id", "t-1")
                    .with("customer_id", "c-1"),
            )
            .unwrap();
        }
        tx.insert(
            "loyalty_accounts",
            Row::new("la-1").with("tenant_id", "t-1").with("customer_id", "c-1"),
        )
        .unwrap();
        tx.insert(
            "orders",
            Row::new("o-1").with("tenant_id", "t-1").with("customer_id", "c-1"),
        )
        .unwrap();
        tx.insert(
            "order_items",
            Row::new("oi-1").with("tenant_id", "t-1").with("order_id", "o-1"),
        )
        .unwrap();
        tx.insert(
            "deliveries",
            Row::new("d-1").with("tenant_id", "t-1").with("order_id", "o-1"),
        )
        .unwrap();
        // Unrelated customer that must survive.
        tx.insert("customers", Row::new("c-2").with("tenant_id", "t-1"))
            .unwrap();
        tx.commit();
    }

    #[test]
    fn test_parse_rejects_unknown_tables() {
        assert_eq!(TargetTable::parse("customers").unwrap(), TargetTable::Customer);
        assert_eq!(TargetTable::parse("orders").unwrap(), TargetTable::Order);
        assert!(matches!(
            TargetTable::parse("audit_log").unwrap_err(),
            LifecycleError::UnknownTargetTable(_)
        ));
        assert!(matches!(
            TargetTable::parse("tenants'; DROP TABLE tenants;--").unwrap_err(),
            LifecycleError::UnknownTargetTable(_)
        ));
    }

    #[test]
    fn test_fetch_owned_rejects_cross_tenant() {
        let store = RecordStore::new();
        seed_customer_graph(&store);

        assert!(TargetTable::Customer.fetch_owned(&store, "t-1", "c-1").is_ok());
        let err = TargetTable::Customer
            .fetch_owned(&store, "t-other", "c-1")
            .unwrap_err();
        assert!(matches!(err, LifecycleError::TargetNotFound { .. }));
    }

    #[test]
    fn test_customer_cascade_removes_owned_graph() {
        let store = RecordStore::new();
        seed_customer_graph(&store);

        let mut tx = store.begin();
        let deleted = TargetTable::Customer.cascade_delete(&mut tx, "c-1").unwrap();
        tx.commit();

        // customer + credit account + 2 transactions + loyalty + order +
        // item + delivery = 8 rows.
        assert_eq!(deleted, 8);
        assert!(store.get("customers", "c-1").is_none());
        assert_eq!(store.count("credit_transactions", |_| true), 0);
        assert_eq!(store.count("orders", |_| true), 0);
        assert_eq!(store.count("order_items", |_| true), 0);
        assert_eq!(store.count("deliveries", |_| true), 0);
        // The unrelated customer survives.
        assert!(store.get("customers", "c-2").is_some());
    }

    #[test]
    fn test_order_cascade_leaves_customer() {
        let store = RecordStore::new();
        seed_customer_graph(&store);

        let mut tx = store.begin();
        let deleted = TargetTable::Order.cascade_delete(&mut tx, "o-1").unwrap();
        tx.commit();

        assert_eq!(deleted, 3);
        assert!(store.get("customers", "c-1").is_some());
        assert!(store.get("orders", "o-1").is_none());
    }
}
