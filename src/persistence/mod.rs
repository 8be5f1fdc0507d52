//! Durable session and keypair storage
//!
//! Credentials live in a confidential key-value store supplied by the
//! host; the engine never writes them anywhere else. Two records exist:
//! the serialized RSA keypair and the array of client sessions.

pub mod state;

use crate::crypto::{CryptoCore, KeypairComponents};
use crate::error::{EngineError, Result};
use crate::models::ClientSession;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Store key for the serialized RSA keypair.
pub const RSA_KEYS: &str = "RSA_KEYS";
/// Store key for the JSON array of client sessions.
pub const CLIENT_SESSIONS: &str = "CLIENT_SESSIONS";

/// Confidential byte-level key-value store, implemented by the host over
/// whatever encrypted substrate it owns.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory [`SecretStore`] for tests and hosts without a durable
/// confidential substrate.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// Whether `load_or_generate_keypair` found a usable persisted keypair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeypairDisposition {
    Generated,
    Resumed,
}

/// Typed access to the two confidential records.
#[derive(Clone)]
pub struct SessionVault {
    store: Arc<dyn SecretStore>,
}

impl SessionVault {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// Installs the persisted keypair into `crypto`, or generates and
    /// persists a fresh one. A corrupted record is logged and replaced,
    /// never fatal.
    pub async fn load_or_generate_keypair(
        &self,
        crypto: &CryptoCore,
    ) -> Result<KeypairDisposition> {
        if let Some(bytes) = self.store.get(RSA_KEYS).await? {
            match serde_json::from_slice::<KeypairComponents>(&bytes)
                .map_err(|e| EngineError::PersistenceCorrupted(e.to_string()))
                .and_then(|components| crypto.install_keypair(&components))
            {
                Ok(()) => {
                    debug!("resumed persisted RSA keypair");
                    return Ok(KeypairDisposition::Resumed);
                }
                Err(e) => {
                    warn!("persisted keypair unusable, generating a new one: {e}");
                }
            }
        }

        crypto.initialize_keys()?;
        let components = crypto.export_components()?;
        let bytes = serde_json::to_vec(&components)?;
        self.store.put(RSA_KEYS, &bytes).await?;
        debug!("generated and persisted a new RSA keypair");
        Ok(KeypairDisposition::Generated)
    }

    /// Upserts a session, keyed by `server_url`.
    pub async fn save_session(&self, session: &ClientSession) -> Result<()> {
        let mut sessions = self.load_sessions().await?;
        match sessions
            .iter_mut()
            .find(|s| s.server_url == session.server_url)
        {
            Some(existing) => *existing = session.clone(),
            None => sessions.push(session.clone()),
        }
        self.write_sessions(&sessions).await
    }

    /// Returns every persisted session. A corrupted record yields an
    /// empty list after a warning.
    pub async fn load_sessions(&self) -> Result<Vec<ClientSession>> {
        let Some(bytes) = self.store.get(CLIENT_SESSIONS).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_slice(&bytes) {
            Ok(sessions) => Ok(sessions),
            Err(e) => {
                warn!("persisted sessions corrupted, starting empty: {e}");
                Ok(Vec::new())
            }
        }
    }

    pub async fn delete_session(&self, server_url: &str) -> Result<()> {
        let mut sessions = self.load_sessions().await?;
        let before = sessions.len();
        sessions.retain(|s| s.server_url != server_url);
        if sessions.len() != before {
            self.write_sessions(&sessions).await?;
        }
        Ok(())
    }

    pub async fn clear_sessions(&self) -> Result<()> {
        self.store.delete(CLIENT_SESSIONS).await
    }

    async fn write_sessions(&self, sessions: &[ClientSession]) -> Result<()> {
        let bytes = serde_json::to_vec(sessions)?;
        self.store.put(CLIENT_SESSIONS, &bytes).await
    }
}
