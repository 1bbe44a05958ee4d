// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tenant-overridable feature flags consumed by the engine.
//!
//! The engine only reads flags; resolution order is tenant override first,
//! then the global default, then off. Destructive operations re-check their
//! flag at every stage rather than trusting an earlier check, because flags
//! can change between check and use.

use dashmap::DashMap;

/// The flags this engine consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    /// Per-record self-destruct feature.
    SelfDestruct,
    /// Whole-tenant purge feature.
    DangerPurge,
    /// Field-level encryption of sensitive columns.
    Encryption,
    /// Automatic purge requests for inactive tenants.
    InactivityAutoDelete,
}

impl Flag {
    /// Wire key in the external flag store.
    pub fn key(self) -> &'static str {
        match self {
            Self::SelfDestruct => "self_destruct_enabled",
            Self::DangerPurge => "danger_purge",
            Self::Encryption => "encryption_enabled",
            Self::InactivityAutoDelete => "inactivity_auto_delete",
        }
    }
}

/// Read-side interface to the external flag store.
pub trait FlagStore: Send + Sync {
    fn is_enabled(&self, tenant_id: &str, flag: Flag) -> bool;
}

/// In-memory flag store: global defaults plus per-tenant overrides.
pub struct InMemoryFlags {
    defaults: DashMap<Flag, bool>,
    overrides: DashMap<(String, Flag), bool>,
}

impl Default for InMemoryFlags {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFlags {
    /// All flags off until set.
    pub fn new() -> Self {
        Self {
            defaults: DashMap::new(),
            overrides: DashMap::new(),
        }
    }

    /// Everything on; the usual test fixture.
    pub fn all_enabled() -> Self {
        let flags = Self::new();
        for f in [
            Flag::SelfDestruct,
            Flag::DangerPurge,
            Flag::Encryption,
            Flag::InactivityAutoDelete,
        ] {
            flags.set_default(f, true);
        }
        flags
    }

    pub fn set_default(&self, flag: Flag, enabled: bool) {
        self.defaults.insert(flag, enabled);
    }

    pub fn set_override(&self, tenant_id: &str, flag: Flag, enabled: bool) {
        self.overrides.insert((tenant_id.to_string(), flag), enabled);
    }

    pub fn clear_override(&self, tenant_id: &str, flag: Flag) {
        self.overrides.remove(&(tenant_id.to_string(), flag));
    }
}

impl FlagStore for InMemoryFlags {
    fn is_enabled(&self, tenant_id: &str, flag: Flag) -> bool {
        if let Some(v) = self.overrides.get(&(tenant_id.to_string(), flag)) {
            return *v;
        }
        self.defaults.get(&flag).map_or(false, |v| *v)
    }
}
