//! Non-confidential engine state, persisted as one JSON file

use crate::error::{EngineError, Result};
use crate::models::EngineState;
use std::path::PathBuf;
use tracing::warn;

/// Reads and writes the engine state file (interaction log, URL registry,
/// counter, filter). Credentials never pass through here.
#[derive(Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Loads the persisted state. A missing or corrupted file yields the
    /// default empty state after a warning.
    pub async fn load(&self) -> EngineState {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return EngineState::default(),
            Err(e) => {
                warn!("failed to read state file {}: {e}", self.path.display());
                return EngineState::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    "state file {} corrupted, starting empty: {e}",
                    self.path.display()
                );
                EngineState::default()
            }
        }
    }

    pub async fn save(&self, state: &EngineState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|e| EngineError::PersistenceWrite(format!("{}: {e}", self.path.display())))
    }
}
