//! Hybrid decryption primitives for Interactsh interactions
//!
//! Interactsh servers encrypt each interaction with a random AES-256 key
//! and wrap that key with the RSA public key the client presented at
//! registration. This module owns the process-wide RSA-2048 keypair and
//! implements the unwrap-then-decrypt pipeline.

use crate::error::{EngineError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use rand::rngs::OsRng;
use rand::Rng;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::OnceLock;
use tracing::debug;

const RSA_BITS: usize = 2048;
const AES_KEY_LEN: usize = 32;
const AES_IV_LEN: usize = 16;

/// Lowercase letters followed by digits; ids are sampled uniformly from a
/// prefix of this table.
const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const LETTER_COUNT: usize = 26;

type Aes256CfbDec = cfb_mode::Decryptor<aes::Aes256>;

/// Serialized form of the keypair: every component as a decimal string, so
/// the record survives any store that can hold UTF-8 bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeypairComponents {
    pub n: String,
    pub e: String,
    pub d: String,
    pub p: String,
    pub q: String,
    #[serde(default)]
    pub dp: String,
    #[serde(default)]
    pub dq: String,
    #[serde(default)]
    pub qi: String,
}

#[derive(Debug)]
struct RsaKeypair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

/// Process-wide keypair holder. Write-once: either `initialize_keys`
/// generates a fresh keypair or `install_keypair` restores a persisted
/// one, and every later read is lock-free.
#[derive(Default, Debug)]
pub struct CryptoCore {
    keys: OnceLock<RsaKeypair>,
}

impl CryptoCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates an RSA-2048 keypair with e = 65537 if none is present.
    /// Idempotent.
    pub fn initialize_keys(&self) -> Result<()> {
        if self.keys.get().is_some() {
            return Ok(());
        }
        let private = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
            .map_err(|e| EngineError::KeyGeneration(e.to_string()))?;
        let public = RsaPublicKey::from(&private);
        if self.keys.set(RsaKeypair { private, public }).is_err() {
            debug!("keypair already initialized by a concurrent caller");
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.keys.get().is_some()
    }

    /// Restores a keypair from its persisted decimal components. The CRT
    /// parameters are recomputed rather than trusted from the record.
    pub fn install_keypair(&self, components: &KeypairComponents) -> Result<()> {
        if self.keys.get().is_some() {
            debug!("keypair already present, ignoring install");
            return Ok(());
        }
        let n = parse_decimal(&components.n)?;
        let e = parse_decimal(&components.e)?;
        let d = parse_decimal(&components.d)?;
        let p = parse_decimal(&components.p)?;
        let q = parse_decimal(&components.q)?;
        let mut private = RsaPrivateKey::from_components(n, e, d, vec![p, q])
            .map_err(|e| EngineError::PersistenceCorrupted(format!("rsa components: {e}")))?;
        private
            .precompute()
            .map_err(|e| EngineError::PersistenceCorrupted(format!("rsa precompute: {e}")))?;
        let public = RsaPublicKey::from(&private);
        if self.keys.set(RsaKeypair { private, public }).is_err() {
            debug!("keypair already installed by a concurrent caller");
        }
        Ok(())
    }

    /// Serializes the keypair for persistence.
    pub fn export_components(&self) -> Result<KeypairComponents> {
        let keys = self.keypair()?;
        let mut primes = keys.private.primes().iter();
        let p = primes.next().map(ToString::to_string).unwrap_or_default();
        let q = primes.next().map(ToString::to_string).unwrap_or_default();
        Ok(KeypairComponents {
            n: keys.private.n().to_string(),
            e: keys.private.e().to_string(),
            d: keys.private.d().to_string(),
            p,
            q,
            dp: keys.private.dp().map(ToString::to_string).unwrap_or_default(),
            dq: keys.private.dq().map(ToString::to_string).unwrap_or_default(),
            qi: keys
                .private
                .qinv()
                .map(ToString::to_string)
                .unwrap_or_default(),
        })
    }

    /// Exports the public key in the Interactsh wire format: SPKI DER,
    /// wrapped in a PEM document, then the whole PEM text Base64-encoded
    /// once more. The protocol transmits the doubly-encoded form.
    pub fn export_public_key_pem(&self) -> Result<String> {
        let keys = self.keypair()?;
        let pem = keys
            .public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| EngineError::PemMalformed(e.to_string()))?;
        Ok(BASE64.encode(pem.as_bytes()))
    }

    /// Unwraps a server-encrypted AES key with RSA-OAEP (SHA-256, MGF1/
    /// SHA-256, empty label).
    pub fn decrypt_aes_key(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let keys = self.keypair()?;
        keys.private
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|_| EngineError::InvalidPadding)
    }

    /// Decrypts one interaction payload.
    ///
    /// The first 16 bytes of the decoded secure message are the IV, the
    /// remainder the AES-256-CFB ciphertext. Servers have historically
    /// shipped symmetric keys of varying lengths, so the unwrapped key is
    /// right-padded with zeros to 32 bytes or truncated to 32.
    pub fn decrypt_interaction(
        &self,
        encrypted_aes_key_b64: &str,
        secure_message_b64: &str,
    ) -> Result<String> {
        let wrapped_key = BASE64.decode(encrypted_aes_key_b64)?;
        let mut aes_key = self.decrypt_aes_key(&wrapped_key)?;
        aes_key.resize(AES_KEY_LEN, 0);

        let message = BASE64.decode(secure_message_b64)?;
        if message.len() < AES_IV_LEN {
            return Err(EngineError::InvalidLength(message.len()));
        }
        let (iv, ciphertext) = message.split_at(AES_IV_LEN);

        let mut plaintext = ciphertext.to_vec();
        Aes256CfbDec::new_from_slices(&aes_key, iv)
            .map_err(|_| EngineError::InvalidKeyLength)?
            .decrypt(&mut plaintext);

        String::from_utf8(plaintext).map_err(|_| EngineError::InvalidUtf8)
    }

    fn keypair(&self) -> Result<&RsaKeypair> {
        self.keys.get().ok_or(EngineError::KeysNotInitialized)
    }
}

/// Generates a random identifier from the OS CSPRNG, uniform over
/// lowercase letters plus digits, or letters alone when `letters_only`.
pub fn generate_random_id(length: usize, letters_only: bool) -> String {
    let span = if letters_only {
        LETTER_COUNT
    } else {
        ID_ALPHABET.len()
    };
    let mut rng = OsRng;
    (0..length)
        .map(|_| ID_ALPHABET[rng.gen_range(0..span)] as char)
        .collect()
}

fn parse_decimal(value: &str) -> Result<BigUint> {
    BigUint::parse_bytes(value.as_bytes(), 10)
        .ok_or_else(|| EngineError::PersistenceCorrupted(format!("not a decimal integer: {value}")))
}
