//! Tests for the hybrid decryption pipeline and id generation

mod common;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use common::HybridEncryptor;
use oastwatch::crypto::{self, CryptoCore};
use oastwatch::error::EngineError;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};

fn initialized_core() -> CryptoCore {
    let core = CryptoCore::new();
    core.initialize_keys().expect("key generation");
    core
}

// ── public key export ──

#[test]
fn exported_key_is_doubly_encoded_pem() {
    let core = initialized_core();
    let wire = core.export_public_key_pem().expect("export");

    let pem_bytes = BASE64.decode(&wire).expect("outer base64 layer");
    let pem = String::from_utf8(pem_bytes).expect("pem utf8");
    assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
    assert!(pem.trim_end().ends_with("-----END PUBLIC KEY-----"));

    let key = RsaPublicKey::from_public_key_pem(&pem).expect("spki parse");
    assert_eq!(key.e(), &BigUint::from(65537u32));
    assert_eq!(key.n().bits(), 2048);
}

#[test]
fn export_is_stable_across_calls() {
    let core = initialized_core();
    let first = core.export_public_key_pem().expect("export");
    let second = core.export_public_key_pem().expect("export");
    assert_eq!(first, second);
}

#[test]
fn initialize_is_idempotent() {
    let core = initialized_core();
    let before = core.export_public_key_pem().expect("export");
    core.initialize_keys().expect("second init");
    let after = core.export_public_key_pem().expect("export");
    assert_eq!(before, after, "re-initialization must not replace the keypair");
}

// ── hybrid round trip ──

#[test]
fn decrypt_round_trips_plaintext() {
    let core = initialized_core();
    let encryptor = HybridEncryptor::new(&core.export_public_key_pem().expect("export"));

    for size in [1usize, 15, 16, 17, 255, 1024] {
        let plaintext: Vec<u8> = (0..size).map(|i| b'a' + (i % 26) as u8).collect();
        let message = encryptor.secure_message(&plaintext);
        let decrypted = core
            .decrypt_interaction(&encryptor.wrapped_key(), &message)
            .expect("decrypt");
        assert_eq!(decrypted.as_bytes(), plaintext.as_slice(), "size {size}");
    }
}

#[test]
fn short_aes_key_is_right_padded() {
    let core = initialized_core();
    let key31: Vec<u8> = (0..31u8).collect();
    let encryptor =
        HybridEncryptor::with_key(&core.export_public_key_pem().expect("export"), key31);

    let message = encryptor.secure_message(b"padded key still works");
    let decrypted = core
        .decrypt_interaction(&encryptor.wrapped_key(), &message)
        .expect("decrypt with 31-byte key");
    assert_eq!(decrypted, "padded key still works");
}

#[test]
fn long_aes_key_is_truncated() {
    let core = initialized_core();
    let key33: Vec<u8> = (0..33u8).collect();
    let encryptor =
        HybridEncryptor::with_key(&core.export_public_key_pem().expect("export"), key33);

    let message = encryptor.secure_message(b"truncated key still works");
    let decrypted = core
        .decrypt_interaction(&encryptor.wrapped_key(), &message)
        .expect("decrypt with 33-byte key");
    assert_eq!(decrypted, "truncated key still works");
}

// ── failure taxonomy ──

#[test]
fn decrypt_before_initialization_fails() {
    let core = CryptoCore::new();
    let result = core.decrypt_interaction("aGVsbG8=", "aGVsbG8=");
    assert!(matches!(result, Err(EngineError::KeysNotInitialized)));
}

#[test]
fn tampered_key_blob_reports_invalid_padding() {
    let core = initialized_core();
    let garbage = BASE64.encode([0x42u8; 256]);
    let message = BASE64.encode([0u8; 32]);
    let result = core.decrypt_interaction(&garbage, &message);
    assert!(matches!(result, Err(EngineError::InvalidPadding)));
}

#[test]
fn truncated_message_reports_invalid_length() {
    let core = initialized_core();
    let encryptor = HybridEncryptor::new(&core.export_public_key_pem().expect("export"));
    let short = BASE64.encode([0u8; 10]);
    let result = core.decrypt_interaction(&encryptor.wrapped_key(), &short);
    assert!(matches!(result, Err(EngineError::InvalidLength(10))));
}

#[test]
fn non_utf8_plaintext_reports_invalid_utf8() {
    let core = initialized_core();
    let encryptor = HybridEncryptor::new(&core.export_public_key_pem().expect("export"));
    let message = encryptor.secure_message(&[0xff, 0xfe, 0x90, 0x80]);
    let result = core.decrypt_interaction(&encryptor.wrapped_key(), &message);
    assert!(matches!(result, Err(EngineError::InvalidUtf8)));
}

#[test]
fn malformed_base64_is_rejected() {
    let core = initialized_core();
    let result = core.decrypt_interaction("!!!not-base64!!!", "aGVsbG8=");
    assert!(matches!(result, Err(EngineError::Base64Error(_))));
}

// ── component serialization ──

#[test]
fn components_restore_bit_identical_keypair() {
    let original = initialized_core();
    let components = original.export_components().expect("export components");

    let restored = CryptoCore::new();
    restored
        .install_keypair(&components)
        .expect("install components");

    assert_eq!(
        original.export_public_key_pem().expect("export"),
        restored.export_public_key_pem().expect("export"),
        "public key must re-export bit-identically after restore"
    );

    // The restored private half must decrypt payloads encrypted to the
    // original public key.
    let encryptor = HybridEncryptor::new(&original.export_public_key_pem().expect("export"));
    let message = encryptor.secure_message(b"restored key decrypts");
    let decrypted = restored
        .decrypt_interaction(&encryptor.wrapped_key(), &message)
        .expect("decrypt with restored key");
    assert_eq!(decrypted, "restored key decrypts");
}

#[test]
fn corrupt_components_are_rejected() {
    let core = CryptoCore::new();
    let components = oastwatch::crypto::KeypairComponents {
        n: "not-a-number".to_string(),
        e: "65537".to_string(),
        d: "1".to_string(),
        p: "1".to_string(),
        q: "1".to_string(),
        dp: String::new(),
        dq: String::new(),
        qi: String::new(),
    };
    assert!(matches!(
        core.install_keypair(&components),
        Err(EngineError::PersistenceCorrupted(_))
    ));
}

// ── random id generation ──

#[test]
fn zero_length_id_is_empty() {
    assert_eq!(crypto::generate_random_id(0, false), "");
    assert_eq!(crypto::generate_random_id(0, true), "");
}

#[test]
fn letters_only_ids_contain_no_digits() {
    for _ in 0..50 {
        let id = crypto::generate_random_id(40, true);
        assert!(
            id.chars().all(|c| c.is_ascii_lowercase()),
            "unexpected character in {id}"
        );
    }
}

#[test]
fn default_alphabet_is_lowercase_alphanumeric() {
    for _ in 0..50 {
        let id = crypto::generate_random_id(40, false);
        assert!(
            id.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()),
            "unexpected character in {id}"
        );
    }
}

#[test]
fn ids_are_unique() {
    let ids: Vec<String> = (0..200).map(|_| crypto::generate_random_id(20, false)).collect();
    let unique: std::collections::HashSet<&String> = ids.iter().collect();
    assert_eq!(ids.len(), unique.len(), "generated ids should be unique");
}
