//! Common test utilities
#![allow(dead_code)]

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use oastwatch::config::EngineConfig;
use oastwatch::persistence::SecretStore;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{BigUint, Oaep, RsaPublicKey};
use serde_json::json;
use sha2::Sha256;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

type Aes256CfbEnc = cfb_mode::Encryptor<aes::Aes256>;

/// Engine configuration used across tests.
pub fn test_config() -> EngineConfig {
    EngineConfig::default()
}

/// Mounts a 200 on `POST /register`.
pub async fn mount_register_ok(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/register"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"message": "registration successful"})),
        )
        .mount(server)
        .await;
}

/// Mounts a 200 with an empty batch on `GET /poll`.
pub async fn mount_poll_empty(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/poll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [], "aes_key": ""})))
        .mount(server)
        .await;
}

/// Mounts a 200 on `POST /deregister`.
pub async fn mount_deregister_ok(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/deregister"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message": "deregistered"})))
        .mount(server)
        .await;
}

/// Mounts a one-shot encrypted batch on `GET /poll` that outranks any
/// fallback mock.
pub async fn mount_poll_batch(server: &MockServer, encryptor: &HybridEncryptor, messages: &[String]) {
    Mock::given(method("GET"))
        .and(path("/poll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(encryptor.poll_body(messages)))
        .with_priority(1)
        .up_to_n_times(1)
        .mount(server)
        .await;
}

/// Counts requests the mock server received for a path.
pub async fn request_count(server: &MockServer, url_path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == url_path)
        .count()
}

/// Rebuilds the engine's public key from the persisted component record
/// and returns it in the doubly-encoded wire form.
pub async fn engine_public_key_b64(store: &dyn SecretStore) -> String {
    let bytes = store
        .get("RSA_KEYS")
        .await
        .expect("store read")
        .expect("keypair persisted");
    let components: serde_json::Value = serde_json::from_slice(&bytes).expect("keypair json");
    let n = BigUint::parse_bytes(components["n"].as_str().expect("n").as_bytes(), 10).expect("n");
    let e = BigUint::parse_bytes(components["e"].as_str().expect("e").as_bytes(), 10).expect("e");
    let key = RsaPublicKey::new(n, e).expect("public key");
    let pem = key.to_public_key_pem(LineEnding::LF).expect("pem");
    BASE64.encode(pem.as_bytes())
}

/// Mirror of the server side of the hybrid scheme: wraps a random AES key
/// with the client's RSA public key and produces IV-prefixed CFB
/// ciphertexts, exactly as `/poll` reports them.
pub struct HybridEncryptor {
    public_key: RsaPublicKey,
    aes_key: Vec<u8>,
}

impl HybridEncryptor {
    /// `public_key_b64_pem` is the doubly-encoded wire form.
    pub fn new(public_key_b64_pem: &str) -> Self {
        let mut aes_key = vec![0u8; 32];
        OsRng.fill_bytes(&mut aes_key);
        Self::with_key(public_key_b64_pem, aes_key)
    }

    /// Uses a caller-chosen key, e.g. a 31- or 33-byte one for the
    /// padding/truncation boundaries.
    pub fn with_key(public_key_b64_pem: &str, aes_key: Vec<u8>) -> Self {
        let pem =
            String::from_utf8(BASE64.decode(public_key_b64_pem).expect("outer base64"))
                .expect("pem utf8");
        let public_key = RsaPublicKey::from_public_key_pem(&pem).expect("pem parse");
        Self {
            public_key,
            aes_key,
        }
    }

    /// Base64 of the RSA-OAEP-wrapped AES key.
    pub fn wrapped_key(&self) -> String {
        let wrapped = self
            .public_key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &self.aes_key)
            .expect("oaep encrypt");
        BASE64.encode(wrapped)
    }

    /// Base64 of IV || AES-256-CFB ciphertext for one secure message.
    /// The cipher key is the AES key brought to 32 bytes the same way the
    /// decrypting side does it.
    pub fn secure_message(&self, plaintext: &[u8]) -> String {
        let mut iv = [0u8; 16];
        OsRng.fill_bytes(&mut iv);
        let mut key = self.aes_key.clone();
        key.resize(32, 0);
        let mut buf = plaintext.to_vec();
        Aes256CfbEnc::new_from_slices(&key, &iv)
            .expect("cipher init")
            .encrypt(&mut buf);
        let mut out = iv.to_vec();
        out.extend_from_slice(&buf);
        BASE64.encode(out)
    }

    /// A full `/poll` response body carrying the given secure messages.
    pub fn poll_body(&self, messages: &[String]) -> serde_json::Value {
        json!({ "data": messages, "aes_key": self.wrapped_key() })
    }
}

/// A plausible decrypted interaction document for the given full id.
pub fn interaction_json(full_id: &str, protocol: &str) -> String {
    json!({
        "protocol": protocol,
        "unique-id": full_id,
        "full-id": full_id,
        "raw-request": "GET / HTTP/1.1\nHost: target\n",
        "raw-response": "HTTP/1.1 200 OK\n",
        "remote-address": "198.51.100.7",
        "timestamp": "2026-08-02T10:00:00Z"
    })
    .to_string()
}
