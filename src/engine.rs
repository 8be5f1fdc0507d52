//! External interface facade
//!
//! The typed surface the host calls. Every operation delegates to the
//! [`InteractionManager`]; events flow back through a broadcast channel
//! so any number of host views can subscribe.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::manager::InteractionManager;
use crate::models::{ActiveUrl, EngineEvent, EngineStatus, Interaction, MintedUrl};
use crate::persistence::SecretStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

/// The interaction client engine.
///
/// Construct one per process with the host's confidential store and a
/// path for the non-confidential state file, then drive it through
/// [`start`](Engine::start) / [`stop`](Engine::stop) and the operation
/// surface below.
pub struct Engine {
    manager: InteractionManager,
}

impl Engine {
    pub fn new(secret_store: Arc<dyn SecretStore>, state_path: impl Into<PathBuf>) -> Self {
        Self {
            manager: InteractionManager::new(secret_store, state_path),
        }
    }

    /// Subscribes to engine events (`DataChanged`, `UrlGenerated`, ...).
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.manager.subscribe()
    }

    /// Loads the keypair, restores persisted sessions, and begins
    /// background polling for each of them.
    pub async fn start(&self, config: EngineConfig) -> Result<()> {
        self.manager.start(config).await
    }

    /// Closes every client. Idempotent; persisted sessions survive so a
    /// later `start` resumes them.
    pub async fn stop(&self) -> Result<()> {
        self.manager.stop().await
    }

    /// Mints a disposable subdomain under `server_url`, registering with
    /// the server on first use.
    pub async fn generate_url(&self, server_url: &str, tag: Option<String>) -> Result<MintedUrl> {
        self.manager.generate_url(server_url, tag).await
    }

    /// Forces one poll pass on every client.
    pub async fn poll(&self, notify: bool) -> Result<()> {
        self.manager.poll(notify).await
    }

    /// Eagerly registers a client per URL, in parallel. Returns the
    /// number of successful registrations.
    pub async fn initialize_clients(&self, server_urls: &[String]) -> Result<usize> {
        self.manager.initialize_clients(server_urls).await
    }

    pub async fn get_interactions(&self) -> Result<Vec<Interaction>> {
        self.manager.get_interactions().await
    }

    pub async fn get_new_interactions(&self, since_index: usize) -> Result<Vec<Interaction>> {
        self.manager.get_new_interactions(since_index).await
    }

    pub async fn delete_interaction(&self, unique_id: &str) -> Result<usize> {
        self.manager.delete_interaction(unique_id).await
    }

    pub async fn delete_interactions(&self, unique_ids: &[String]) -> Result<usize> {
        self.manager.delete_interactions(unique_ids).await
    }

    pub async fn clear_interactions(&self) -> Result<()> {
        self.manager.clear_interactions().await
    }

    pub async fn clear_all_data(&self) -> Result<()> {
        self.manager.clear_all_data().await
    }

    pub async fn get_active_urls(&self) -> Result<Vec<ActiveUrl>> {
        self.manager.get_active_urls().await
    }

    /// Returns false when the id is unknown.
    pub async fn set_url_active(&self, unique_id: &str, active: bool) -> Result<bool> {
        self.manager.set_url_active(unique_id, active).await
    }

    pub async fn remove_url(&self, unique_id: &str) -> Result<bool> {
        self.manager.remove_url(unique_id).await
    }

    pub async fn clear_urls(&self) -> Result<()> {
        self.manager.clear_urls().await
    }

    pub async fn set_interaction_tag(&self, unique_id: &str, tag: Option<String>) -> Result<bool> {
        self.manager.set_interaction_tag(unique_id, tag).await
    }

    /// Opaque passthrough; the engine stores and rebroadcasts the filter
    /// without interpreting it.
    pub async fn set_filter(&self, filter: String) -> Result<()> {
        self.manager.set_filter(filter).await
    }

    pub async fn get_filter(&self) -> Result<String> {
        self.manager.get_filter().await
    }

    pub async fn set_filter_enabled(&self, enabled: bool) -> Result<()> {
        self.manager.set_filter_enabled(enabled).await
    }

    pub async fn get_filter_enabled(&self) -> Result<bool> {
        self.manager.get_filter_enabled().await
    }

    pub async fn set_selected_row_id(&self, unique_id: Option<String>) -> Result<()> {
        self.manager.set_selected_row_id(unique_id).await
    }

    pub async fn get_selected_row_id(&self) -> Result<Option<String>> {
        self.manager.get_selected_row_id().await
    }

    pub async fn get_client_count(&self) -> Result<usize> {
        self.manager.get_client_count().await
    }

    /// Valid before `start`; answers `is_started = false` then.
    pub async fn get_status(&self) -> EngineStatus {
        self.manager.get_status().await
    }
}
