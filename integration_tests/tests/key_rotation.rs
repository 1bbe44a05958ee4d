// SPDX-License-Identifier: MIT OR Apache-2.0
//! Key rotation scenarios across the vault and codec together.

use integration_tests::{env, init_tracing};
use tenant_vault::{KeyStatus, VaultError};

#[test]
fn test_rotation_keeps_old_blobs_readable() {
    init_tracing();
    let env = env();

    let card = env.codec.encrypt("t-1", "4111-1111-1111-1111").unwrap();
    let (_, new_key_id) = env.keys.rotate_key("t-1").unwrap();
    assert_ne!(card.key_id, new_key_id);

    // New writes pick up the new key immediately.
    let email = env.codec.encrypt("t-1", "a@example.com").unwrap();
    assert_eq!(email.key_id, new_key_id);

    // The pre-rotation blob still decrypts through its historical key id.
    assert_eq!(env.codec.decrypt("t-1", &card).unwrap(), "4111-1111-1111-1111");
    assert_eq!(env.codec.decrypt("t-1", &email).unwrap(), "a@example.com");
}

#[test]
fn test_repeated_rotation_grows_key_history() {
    let env = env();

    let mut blobs = vec![env.codec.encrypt("t-1", "v0").unwrap()];
    for i in 1..4 {
        env.keys.rotate_key("t-1").unwrap();
        blobs.push(env.codec.encrypt("t-1", &format!("v{i}")).unwrap());
    }

    let keys = env.keys.list_keys("t-1");
    assert_eq!(keys.len(), 4);
    assert_eq!(
        keys.iter().filter(|k| k.status == KeyStatus::Active).count(),
        1
    );
    // Newest first, versions monotonic.
    assert_eq!(keys[0].key_version, 4);
    assert_eq!(keys[3].key_version, 1);

    for (i, blob) in blobs.iter().enumerate() {
        assert_eq!(env.codec.decrypt("t-1", blob).unwrap(), format!("v{i}"));
    }
}

#[test]
fn test_tenants_never_share_keys() {
    let env = env();

    let a = env.codec.encrypt("t-a", "shared plaintext").unwrap();
    let b = env.codec.encrypt("t-b", "shared plaintext").unwrap();
    assert_ne!(a.key_id, b.key_id);

    // Neither tenant can read the other's blob, and the error says nothing
    // about why.
    assert_eq!(env.codec.decrypt("t-b", &a).unwrap_err(), VaultError::CryptoFailure);
    assert_eq!(env.codec.decrypt("t-a", &b).unwrap_err(), VaultError::CryptoFailure);
    assert_eq!(
        VaultError::CryptoFailure.to_string(),
        "encryption/decryption failed"
    );
}
