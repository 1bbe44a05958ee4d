// SPDX-License-Identifier: MIT OR Apache-2.0
//! Data key wrapping: HKDF-SHA256 derivation plus AES-256-GCM.
//!
//! Wrapped-key blob (persisted per tenant key row):
//!
//! ```text
//! { "version": "2.0", "algorithm": "aes-256-gcm", "salt": <b64 32B>,
//!   "iv": <b64 12B>, "ciphertext": <b64>, "authTag": <b64 16B> }
//! ```
//!
//! Legacy wrapped keys (pre-versioning) are a single base64 string of
//! `iv(16B) || ciphertext` under AES-256-CBC with a SHA-256 digest of the
//! master key. That path is unwrap-only: nothing here can produce one.
//! Unwrapping fails closed on any structural or tag mismatch — a garbage
//! key is never returned.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::{MasterKey, Result, VaultError};

/// AES-256 data key size in bytes.
pub const KEY_SIZE: usize = 32;
/// AES-GCM nonce size (96 bits).
pub const NONCE_SIZE: usize = 12;
/// AES-GCM authentication tag size (128 bits).
pub const TAG_SIZE: usize = 16;
/// HKDF salt size for wrap-key derivation.
pub const SALT_SIZE: usize = 32;

/// Current wrapped-key format version.
const WRAP_VERSION: &str = "2.0";
/// Current wrapping cipher.
const WRAP_ALGORITHM: &str = "aes-256-gcm";
/// Fixed, versioned HKDF context for wrap-key derivation.
const WRAP_CONTEXT: &[u8] = b"tenant-vault/key-wrap/v2";
/// Fixed AAD label binding the ciphertext to its purpose.
const WRAP_AAD: &[u8] = b"tenant-data-key";
/// Legacy CBC iv size.
const LEGACY_IV_SIZE: usize = 16;

type LegacyCbcDec = cbc::Decryptor<aes::Aes256>;

/// Serialized wrapped-key blob, current format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKey {
    pub version: String,
    pub algorithm: String,
    pub salt: String,
    pub iv: String,
    pub ciphertext: String,
    pub auth_tag: String,
}

/// Derive the wrapping key for one salt from the process master key.
fn derive_wrapping_key(master: &MasterKey, salt: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), master.as_bytes());
    let mut kek = Zeroizing::new([0u8; KEY_SIZE]);
    hk.expand(WRAP_CONTEXT, kek.as_mut())
        .map_err(|_| VaultError::CryptoFailure)?;
    Ok(kek)
}

/// Wrap a 32-byte data key under the master key, returning the JSON blob.
pub fn wrap_key(master: &MasterKey, data_key: &[u8; KEY_SIZE]) -> Result<String> {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let kek = derive_wrapping_key(master, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(kek.as_ref()).map_err(|_| VaultError::CryptoFailure)?;
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: data_key,
                aad: WRAP_AAD,
            },
        )
        .map_err(|_| VaultError::CryptoFailure)?;

    // aes-gcm appends the tag; the blob stores it as a separate field.
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);
    let blob = WrappedKey {
        version: WRAP_VERSION.to_string(),
        algorithm: WRAP_ALGORITHM.to_string(),
        salt: BASE64.encode(salt),
        iv: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
        auth_tag: BASE64.encode(tag),
    };
    serde_json::to_string(&blob).map_err(|_| VaultError::CryptoFailure)
}

/// Unwrap a persisted key blob, current or legacy format.
pub fn unwrap_key(master: &MasterKey, blob: &str) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    match serde_json::from_str::<WrappedKey>(blob) {
        Ok(wrapped) => unwrap_current(master, &wrapped),
        // Not JSON at all: pre-versioning blobs are a bare base64 string.
        Err(_) => unwrap_legacy(master, blob),
    }
}

fn unwrap_current(master: &MasterKey, wrapped: &WrappedKey) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    if wrapped.version != WRAP_VERSION || wrapped.algorithm != WRAP_ALGORITHM {
        return Err(VaultError::CryptoFailure);
    }
    let salt = decode_exact(&wrapped.salt, SALT_SIZE)?;
    let nonce = decode_exact(&wrapped.iv, NONCE_SIZE)?;
    let ciphertext = BASE64
        .decode(&wrapped.ciphertext)
        .map_err(|_| VaultError::CryptoFailure)?;
    let tag = decode_exact(&wrapped.auth_tag, TAG_SIZE)?;

    let kek = derive_wrapping_key(master, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(kek.as_ref()).map_err(|_| VaultError::CryptoFailure)?;

    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);
    let plain = cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &sealed,
                aad: WRAP_AAD,
            },
        )
        .map_err(|_| VaultError::CryptoFailure)?;

    key_from_plain(&plain)
}

/// Legacy unwrap: AES-256-CBC under SHA-256(master), no authentication.
/// Kept only so pre-migration key rows stay readable.
fn unwrap_legacy(master: &MasterKey, blob: &str) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let raw = BASE64
        .decode(blob.trim())
        .map_err(|_| VaultError::CryptoFailure)?;
    if raw.len() <= LEGACY_IV_SIZE {
        return Err(VaultError::CryptoFailure);
    }
    let (iv, ciphertext) = raw.split_at(LEGACY_IV_SIZE);
    let legacy_kek = Sha256::digest(master.as_bytes());

    let plain = LegacyCbcDec::new_from_slices(&legacy_kek, iv)
        .map_err(|_| VaultError::CryptoFailure)?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| VaultError::CryptoFailure)?;

    tracing::warn!("unwrapped a legacy-format tenant key; schedule it for rotation");
    key_from_plain(&plain)
}

fn key_from_plain(plain: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    if plain.len() != KEY_SIZE {
        return Err(VaultError::CryptoFailure);
    }
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(plain);
    Ok(key)
}

fn decode_exact(b64: &str, len: usize) -> Result<Vec<u8>> {
    let bytes = BASE64.decode(b64).map_err(|_| VaultError::CryptoFailure)?;
    if bytes.len() != len {
        return Err(VaultError::CryptoFailure);
    }
    Ok(bytes)
}
