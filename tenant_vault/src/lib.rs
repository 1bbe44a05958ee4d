// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-tenant envelope encryption for sensitive CRM fields.
//!
//! Each tenant gets its own AES-256 data key, generated lazily on first use
//! and stored only in wrapped form: the data key is encrypted under a
//! wrapping key derived from the process master key via HKDF-SHA256, then
//! persisted as a versioned JSON blob. Field values are encrypted with the
//! tenant's active data key and AES-256-GCM, with the tenant id bound as
//! additional authenticated data so a blob cannot be replayed into another
//! tenant's rows.
//!
//! Security properties:
//! - AES-256-GCM authenticated encryption (96-bit nonce, 128-bit tag)
//! - Fresh random nonce per encryption; nonces never repeat per key
//! - Key rotation keeps revoked keys decryptable by key id
//! - Legacy CBC blobs are read-only: the current code can never produce one
//! - Every cryptographic failure is reported as one opaque error

mod codec;
mod keystore;
mod master;
mod wrap;

pub use codec::{EncryptedBlob, FieldCodec, BLOB_ALGORITHM, BLOB_VERSION, LEGACY_BLOB_VERSION};
pub use keystore::{KeyStatus, TenantKey, TenantKeyStore, VaultConfig, TENANT_KEYS_TABLE};
pub use master::{MasterKey, MASTER_KEY_ENV, MIN_MASTER_KEY_BYTES};
pub use wrap::{unwrap_key, wrap_key, WrappedKey, KEY_SIZE, NONCE_SIZE, SALT_SIZE, TAG_SIZE};

/// Errors surfaced by the vault.
///
/// `CryptoFailure` is deliberately opaque: structural problems, bad tags,
/// wrong keys, and malformed blobs all collapse into the same message so the
/// error channel cannot be used as a decryption oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    /// Master key missing, non-hex, or too short.
    InvalidMasterKey(String),
    /// Encryption or decryption failed. No further detail, by contract.
    CryptoFailure,
    /// No key row for the requested tenant/key id.
    KeyNotFound(String),
    /// Storage error from the record store.
    StorageError(String),
}

impl std::fmt::Display for VaultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMasterKey(msg) => write!(f, "invalid master key: {msg}"),
            Self::CryptoFailure => write!(f, "encryption/decryption failed"),
            Self::KeyNotFound(id) => write!(f, "tenant key not found: {id}"),
            Self::StorageError(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for VaultError {}

impl From<record_store::StoreError> for VaultError {
    fn from(e: record_store::StoreError) -> Self {
        Self::StorageError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
