// SPDX-License-Identifier: MIT OR Apache-2.0
//! Field-level encryption: versioned blobs with tenant-bound AAD.
//!
//! Blob format, stored inline in place of a plaintext column:
//!
//! ```text
//! { "version": "2.0", "algorithm": "aes-256-gcm", "keyId": <uuid>,
//!   "iv": <b64 12B>, "ciphertext": <b64>, "authTag": <b64 16B> }
//! ```
//!
//! Legacy blobs carry `"version": "1.0"` and/or omit `authTag`; they were
//! written with AES-256-CBC and no authentication. Decrypting one logs a
//! warning so the data can be tracked for re-encryption, and the current
//! writer can never produce that shape.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::wrap::{NONCE_SIZE, TAG_SIZE};
use crate::{Result, TenantKeyStore, VaultError};

/// Current blob format version.
pub const BLOB_VERSION: &str = "2.0";
/// Legacy (CBC, unauthenticated) blob version.
pub const LEGACY_BLOB_VERSION: &str = "1.0";
/// Current blob cipher.
pub const BLOB_ALGORITHM: &str = "aes-256-gcm";

const LEGACY_IV_SIZE: usize = 16;

type LegacyCbcDec = cbc::Decryptor<aes::Aes256>;

/// A versioned encrypted field value. Immutable once created; a decrypt
/// failure is terminal for the value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedBlob {
    pub version: String,
    pub algorithm: String,
    pub key_id: String,
    pub iv: String,
    pub ciphertext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_tag: Option<String>,
}

impl EncryptedBlob {
    /// True for pre-migration blobs that must take the CBC read path.
    pub fn is_legacy(&self) -> bool {
        self.version == LEGACY_BLOB_VERSION || self.auth_tag.is_none()
    }
}

/// Encrypts and decrypts field values for the request layer, resolving
/// tenant keys through the [`TenantKeyStore`].
pub struct FieldCodec {
    keys: Arc<TenantKeyStore>,
}

impl FieldCodec {
    pub fn new(keys: Arc<TenantKeyStore>) -> Self {
        Self { keys }
    }

    /// Encrypt a field under the tenant's active key. The tenant id is
    /// bound as AAD so the blob cannot be replayed into another tenant.
    pub fn encrypt(&self, tenant_id: &str, plaintext: &str) -> Result<EncryptedBlob> {
        let (key, key_id) = self.keys.get_active_key(tenant_id)?;
        let cipher =
            Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_| VaultError::CryptoFailure)?;

        // Fresh random nonce per call; never reused for a given key.
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: tenant_id.as_bytes(),
                },
            )
            .map_err(|_| VaultError::CryptoFailure)?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);

        Ok(EncryptedBlob {
            version: BLOB_VERSION.to_string(),
            algorithm: BLOB_ALGORITHM.to_string(),
            key_id,
            iv: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
            auth_tag: Some(BASE64.encode(tag)),
        })
    }

    /// Decrypt a blob, branching on its format version. The key is resolved
    /// by id — old data may be under a rotated-out key.
    pub fn decrypt(&self, tenant_id: &str, blob: &EncryptedBlob) -> Result<String> {
        if blob.is_legacy() {
            return self.decrypt_legacy(tenant_id, blob);
        }
        if blob.version != BLOB_VERSION || blob.algorithm != BLOB_ALGORITHM {
            // Silently-upgraded or foreign blobs are rejected outright.
            return Err(VaultError::CryptoFailure);
        }
        let tag_b64 = blob.auth_tag.as_ref().ok_or(VaultError::CryptoFailure)?;
        let nonce = decode_exact(&blob.iv, NONCE_SIZE)?;
        let tag = decode_exact(tag_b64, TAG_SIZE)?;
        let mut sealed = BASE64
            .decode(&blob.ciphertext)
            .map_err(|_| VaultError::CryptoFailure)?;
        sealed.extend_from_slice(&tag);

        let key = self.keys.get_key(tenant_id, &blob.key_id).map_err(opaque)?;
        let cipher =
            Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_| VaultError::CryptoFailure)?;
        let plain = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &sealed,
                    aad: tenant_id.as_bytes(),
                },
            )
            .map_err(|_| VaultError::CryptoFailure)?;

        String::from_utf8(plain).map_err(|_| VaultError::CryptoFailure)
    }

    /// Null-safe encrypt: `None` passes through without touching the cipher.
    pub fn encrypt_opt(&self, tenant_id: &str, plaintext: Option<&str>) -> Result<Option<EncryptedBlob>> {
        plaintext.map(|p| self.encrypt(tenant_id, p)).transpose()
    }

    /// Null-safe decrypt: `None` passes through without touching the cipher.
    pub fn decrypt_opt(
        &self,
        tenant_id: &str,
        blob: Option<&EncryptedBlob>,
    ) -> Result<Option<String>> {
        blob.map(|b| self.decrypt(tenant_id, b)).transpose()
    }

    /// Legacy CBC read path. Same key-resolution as the current format,
    /// no authentication: a migration shim, not a permanent mode.
    fn decrypt_legacy(&self, tenant_id: &str, blob: &EncryptedBlob) -> Result<String> {
        let iv = decode_exact(&blob.iv, LEGACY_IV_SIZE)?;
        let ciphertext = BASE64
            .decode(&blob.ciphertext)
            .map_err(|_| VaultError::CryptoFailure)?;
        let key = self.keys.get_key(tenant_id, &blob.key_id).map_err(opaque)?;

        let plain = LegacyCbcDec::new_from_slices(key.as_ref(), &iv)
            .map_err(|_| VaultError::CryptoFailure)?
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| VaultError::CryptoFailure)?;

        tracing::warn!(
            tenant = tenant_id,
            key_id = blob.key_id.as_str(),
            "decrypted legacy-format field blob; flag for re-encryption"
        );
        String::from_utf8(plain).map_err(|_| VaultError::CryptoFailure)
    }
}

/// Collapse key-resolution failures into the opaque crypto error so the
/// decrypt path leaks nothing about why it failed.
fn opaque(e: VaultError) -> VaultError {
    match e {
        VaultError::StorageError(msg) => VaultError::StorageError(msg),
        _ => VaultError::CryptoFailure,
    }
}

fn decode_exact(b64: &str, len: usize) -> Result<Vec<u8>> {
    let bytes = BASE64.decode(b64).map_err(|_| VaultError::CryptoFailure)?;
    if bytes.len() != len {
        return Err(VaultError::CryptoFailure);
    }
    Ok(bytes)
}
