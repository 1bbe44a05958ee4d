// SPDX-License-Identifier: MIT OR Apache-2.0
//! Process-wide master key loading and validation.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Result, VaultError};

/// Environment variable holding the hex-encoded master key.
pub const MASTER_KEY_ENV: &str = "TENANT_MASTER_KEY";

/// Minimum decoded master key length in bytes.
pub const MIN_MASTER_KEY_BYTES: usize = 32;

/// The process master key. Never persisted, never logged; zeroized on drop.
///
/// All tenant data keys are wrapped under keys derived from this value, so
/// the process must refuse to start without it.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: Vec<u8>,
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

impl MasterKey {
    /// Parse a hex-encoded master key, requiring at least 32 decoded bytes.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str.trim())
            .map_err(|_| VaultError::InvalidMasterKey("not valid hex".into()))?;
        if bytes.len() < MIN_MASTER_KEY_BYTES {
            return Err(VaultError::InvalidMasterKey(format!(
                "need at least {MIN_MASTER_KEY_BYTES} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    /// Load the master key from `TENANT_MASTER_KEY`. Startup fails here if
    /// the variable is absent or malformed.
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(MASTER_KEY_ENV)
            .map_err(|_| VaultError::InvalidMasterKey(format!("{MASTER_KEY_ENV} is not set")))?;
        Self::from_hex(&raw)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}
