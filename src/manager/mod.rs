//! Multi-server session manager
//!
//! Owns one [`ProtocolClient`] per server, the ActiveUrl registry, the
//! interaction log, and a dispatcher task that drains the clients'
//! signal channel. All mutable state sits behind a single lock; clients
//! only ever hold the channel handle back to the manager.

use crate::config::EngineConfig;
use crate::crypto::CryptoCore;
use crate::error::{EngineError, Result};
use crate::models::{
    ActiveUrl, EngineEvent, EngineState, EngineStatus, Interaction, MintedUrl,
};
use crate::persistence::state::StateStore;
use crate::persistence::{KeypairDisposition, SecretStore, SessionVault};
use crate::protocol::wire::WireInteraction;
use crate::protocol::{ClientSignal, ProtocolClient};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

struct ManagerInner {
    started: bool,
    config: EngineConfig,
    clients: HashMap<String, ProtocolClient>,
    signal_tx: Option<mpsc::UnboundedSender<ClientSignal>>,
    state: EngineState,
}

/// Lifecycle owner for every protocol client and the shared engine state.
pub struct InteractionManager {
    crypto: Arc<CryptoCore>,
    vault: SessionVault,
    state_store: StateStore,
    events: broadcast::Sender<EngineEvent>,
    inner: Arc<Mutex<ManagerInner>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl InteractionManager {
    pub fn new(secret_store: Arc<dyn SecretStore>, state_path: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            crypto: Arc::new(CryptoCore::new()),
            vault: SessionVault::new(secret_store),
            state_store: StateStore::new(state_path),
            events,
            inner: Arc::new(Mutex::new(ManagerInner {
                started: false,
                config: EngineConfig::default(),
                clients: HashMap::new(),
                signal_tx: None,
                state: EngineState::default(),
            })),
            dispatcher: Mutex::new(None),
        }
    }

    /// Subscribes to engine events. Every subscriber sees every event.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Loads (or generates) the keypair, restores persisted state and
    /// sessions, and spawns the signal dispatcher.
    pub async fn start(&self, config: EngineConfig) -> Result<()> {
        config.validate()?;
        let mut inner = self.inner.lock().await;
        if inner.started {
            return Err(EngineError::AlreadyStarted);
        }
        // The keypair is persisted before any session that depends on it.
        let disposition = self.vault.load_or_generate_keypair(&self.crypto).await?;
        inner.state = self.state_store.load().await;
        inner.config = config;

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        inner.signal_tx = Some(signal_tx.clone());
        let handle = tokio::spawn(dispatch_signals(
            signal_rx,
            Arc::clone(&self.inner),
            self.vault.clone(),
            self.state_store.clone(),
            self.events.clone(),
        ));
        *self.dispatcher.lock().await = Some(handle);

        if disposition == KeypairDisposition::Resumed {
            let sessions = match self.vault.load_sessions().await {
                Ok(sessions) => sessions,
                Err(e) => {
                    warn!("failed to load persisted sessions: {e}");
                    Vec::new()
                }
            };
            let config = inner.config.clone();
            let mut dead = Vec::new();
            for session in sessions {
                let server_url = session.server_url.clone();
                match ProtocolClient::resume(
                    session,
                    &config,
                    Arc::clone(&self.crypto),
                    signal_tx.clone(),
                ) {
                    Ok(mut client) => {
                        if let Err(e) = client.start_polling() {
                            warn!("failed to start polling for {server_url}: {e}");
                        }
                        inner.clients.insert(server_url, client);
                    }
                    Err(e) => {
                        warn!("failed to restore session for {server_url}: {e}");
                        dead.push(server_url);
                    }
                }
            }
            // A session that cannot be restored would otherwise be retried
            // on every start.
            for server_url in dead {
                if let Err(e) = self.vault.delete_session(&server_url).await {
                    warn!("failed to delete unrestorable session {server_url}: {e}");
                }
            }
        }

        inner.started = true;
        info!("engine started with {} restored client(s)", inner.clients.len());
        Ok(())
    }

    /// Stops polling and closes every client, then shuts the dispatcher
    /// down. All clients are attempted even when some fail; the first
    /// deregistration failure is reported after the sweep. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let clients = {
            let mut inner = self.inner.lock().await;
            if !inner.started {
                return Ok(());
            }
            inner.started = false;
            inner.signal_tx = None;
            std::mem::take(&mut inner.clients)
        };

        let mut first_failure = None;
        for (server_url, mut client) in clients {
            if let Err(e) = client.stop_polling().await {
                warn!("failed to stop polling for {server_url}: {e}");
            }
            if let Err(e) = client.close().await {
                warn!("failed to close client for {server_url}: {e}");
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
        }

        // Every sender is gone now, so the dispatcher drains and exits.
        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("signal dispatcher ended abnormally: {e}");
            }
        }
        info!("engine stopped");
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Mints a subdomain under `server_url`, registering the server
    /// lazily on first use.
    pub async fn generate_url(&self, server_url: &str, tag: Option<String>) -> Result<MintedUrl> {
        let mut inner = self.inner.lock().await;
        if !inner.started {
            return Err(EngineError::NotStarted);
        }
        let key = server_url.trim_end_matches('/').to_string();

        let minted = match inner.clients.get(&key) {
            Some(client) => client.generate_url()?,
            None => {
                let signals = inner.signal_tx.clone().ok_or(EngineError::NotStarted)?;
                let config = inner.config.clone();
                let mut client =
                    ProtocolClient::register(&key, &config, Arc::clone(&self.crypto), signals)
                        .await?;
                // Credentials reach the store before the first URL that
                // depends on them exists.
                self.vault.save_session(client.session()).await?;
                client.start_polling()?;
                let minted = client.generate_url()?;
                inner.clients.insert(key.clone(), client);
                minted
            }
        };

        inner.state.active_urls.push(ActiveUrl {
            url: minted.url.clone(),
            unique_id: minted.unique_id.clone(),
            created_at: Utc::now(),
            is_active: true,
            server_url: key,
            tag,
        });
        self.state_store.save(&inner.state).await?;
        drop(inner);
        self.emit(EngineEvent::UrlGenerated(minted.url.clone()));
        Ok(minted)
    }

    /// Forces one poll pass on every client. Expired clients are removed
    /// after the sweep; other failures are logged and skipped.
    pub async fn poll(&self, notify: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.started {
            return Err(EngineError::NotStarted);
        }

        let mut batch = Vec::new();
        let mut expired = Vec::new();
        for (server_url, client) in &inner.clients {
            match client.force_poll().await {
                Ok(items) => batch.extend(items),
                Err(EngineError::SessionExpired) => {
                    warn!("session for {server_url} expired during poll");
                    expired.push(server_url.clone());
                }
                Err(e) => warn!("poll failed for {server_url}: {e}"),
            }
        }
        for server_url in &expired {
            inner.clients.remove(server_url);
        }

        let appended = append_interactions(&mut inner.state, batch);
        if appended > 0 {
            self.state_store.save(&inner.state).await?;
        }
        drop(inner);

        for server_url in &expired {
            if let Err(e) = self.vault.delete_session(server_url).await {
                warn!("failed to delete expired session {server_url}: {e}");
            }
        }
        if notify && appended > 0 {
            self.emit(EngineEvent::DataChanged);
        }
        Ok(())
    }

    /// Registers a client for each URL in parallel so the first mint on
    /// any of them is instantaneous. Returns the number of successes.
    pub async fn initialize_clients(&self, server_urls: &[String]) -> Result<usize> {
        let (config, signals, existing) = {
            let inner = self.inner.lock().await;
            if !inner.started {
                return Err(EngineError::NotStarted);
            }
            let signals = inner.signal_tx.clone().ok_or(EngineError::NotStarted)?;
            let existing: Vec<String> = inner.clients.keys().cloned().collect();
            (inner.config.clone(), signals, existing)
        };

        let mut registrations = JoinSet::new();
        let mut seen = existing;
        for server_url in server_urls {
            let key = server_url.trim_end_matches('/').to_string();
            if seen.contains(&key) {
                continue;
            }
            seen.push(key.clone());
            let config = config.clone();
            let signals = signals.clone();
            let crypto = Arc::clone(&self.crypto);
            registrations.spawn(async move {
                let result = ProtocolClient::register(&key, &config, crypto, signals).await;
                (key, result)
            });
        }

        let mut registered = Vec::new();
        while let Some(joined) = registrations.join_next().await {
            match joined {
                Ok((key, Ok(client))) => registered.push((key, client)),
                Ok((key, Err(e))) => warn!("failed to initialize client for {key}: {e}"),
                Err(e) => warn!("registration task failed: {e}"),
            }
        }

        let mut inner = self.inner.lock().await;
        let mut successes = 0;
        for (key, mut client) in registered {
            if inner.clients.contains_key(&key) {
                debug!("client for {key} appeared concurrently, dropping duplicate");
                continue;
            }
            if let Err(e) = self.vault.save_session(client.session()).await {
                warn!("failed to persist session for {key}: {e}");
                continue;
            }
            if let Err(e) = client.start_polling() {
                warn!("failed to start polling for {key}: {e}");
            }
            inner.clients.insert(key, client);
            successes += 1;
        }
        Ok(successes)
    }

    pub async fn get_interactions(&self) -> Result<Vec<Interaction>> {
        let inner = self.started_inner().await?;
        Ok(inner.state.interactions.clone())
    }

    /// Returns the interactions appended at or after `since_index`.
    pub async fn get_new_interactions(&self, since_index: usize) -> Result<Vec<Interaction>> {
        let inner = self.started_inner().await?;
        Ok(inner
            .state
            .interactions
            .get(since_index..)
            .unwrap_or_default()
            .to_vec())
    }

    pub async fn delete_interaction(&self, unique_id: &str) -> Result<usize> {
        self.delete_interactions(&[unique_id.to_string()]).await
    }

    pub async fn delete_interactions(&self, unique_ids: &[String]) -> Result<usize> {
        let mut inner = self.started_inner().await?;
        let before = inner.state.interactions.len();
        inner
            .state
            .interactions
            .retain(|i| !unique_ids.contains(&i.unique_id));
        let removed = before - inner.state.interactions.len();
        if removed > 0 {
            self.state_store.save(&inner.state).await?;
            drop(inner);
            self.emit(EngineEvent::DataChanged);
        }
        Ok(removed)
    }

    pub async fn clear_interactions(&self) -> Result<()> {
        let mut inner = self.started_inner().await?;
        inner.state.interactions.clear();
        self.state_store.save(&inner.state).await?;
        drop(inner);
        self.emit(EngineEvent::DataChanged);
        Ok(())
    }

    /// Clears interactions and URLs and resets the interaction counter,
    /// so the next interaction is numbered 1 again.
    pub async fn clear_all_data(&self) -> Result<()> {
        let mut inner = self.started_inner().await?;
        inner.state.interactions.clear();
        inner.state.active_urls.clear();
        inner.state.interaction_counter = 0;
        self.state_store.save(&inner.state).await?;
        drop(inner);
        self.emit(EngineEvent::DataChanged);
        self.emit(EngineEvent::UrlsChanged);
        Ok(())
    }

    pub async fn get_active_urls(&self) -> Result<Vec<ActiveUrl>> {
        let inner = self.started_inner().await?;
        Ok(inner.state.active_urls.clone())
    }

    /// Enables or disables a minted URL. Returns false when the id is
    /// unknown; a no-op toggle emits no event.
    pub async fn set_url_active(&self, unique_id: &str, active: bool) -> Result<bool> {
        let mut inner = self.started_inner().await?;
        let Some(url) = inner
            .state
            .active_urls
            .iter_mut()
            .find(|u| u.unique_id == unique_id)
        else {
            return Ok(false);
        };
        if url.is_active == active {
            return Ok(true);
        }
        url.is_active = active;
        self.state_store.save(&inner.state).await?;
        drop(inner);
        self.emit(EngineEvent::UrlsChanged);
        Ok(true)
    }

    pub async fn remove_url(&self, unique_id: &str) -> Result<bool> {
        let mut inner = self.started_inner().await?;
        let before = inner.state.active_urls.len();
        inner.state.active_urls.retain(|u| u.unique_id != unique_id);
        if inner.state.active_urls.len() == before {
            return Ok(false);
        }
        self.state_store.save(&inner.state).await?;
        drop(inner);
        self.emit(EngineEvent::UrlsChanged);
        Ok(true)
    }

    pub async fn clear_urls(&self) -> Result<()> {
        let mut inner = self.started_inner().await?;
        inner.state.active_urls.clear();
        self.state_store.save(&inner.state).await?;
        drop(inner);
        self.emit(EngineEvent::UrlsChanged);
        Ok(())
    }

    pub async fn set_interaction_tag(&self, unique_id: &str, tag: Option<String>) -> Result<bool> {
        let mut inner = self.started_inner().await?;
        let Some(interaction) = inner
            .state
            .interactions
            .iter_mut()
            .find(|i| i.unique_id == unique_id)
        else {
            return Ok(false);
        };
        interaction.tag = tag;
        self.state_store.save(&inner.state).await?;
        drop(inner);
        self.emit(EngineEvent::DataChanged);
        Ok(true)
    }

    /// Stores the opaque filter string and rebroadcasts it; the engine
    /// never interprets it.
    pub async fn set_filter(&self, filter: String) -> Result<()> {
        let mut inner = self.started_inner().await?;
        inner.state.filter = filter.clone();
        self.state_store.save(&inner.state).await?;
        drop(inner);
        self.emit(EngineEvent::FilterChanged(filter));
        Ok(())
    }

    pub async fn get_filter(&self) -> Result<String> {
        let inner = self.started_inner().await?;
        Ok(inner.state.filter.clone())
    }

    pub async fn set_filter_enabled(&self, enabled: bool) -> Result<()> {
        let mut inner = self.started_inner().await?;
        inner.state.filter_enabled = enabled;
        self.state_store.save(&inner.state).await?;
        drop(inner);
        self.emit(EngineEvent::FilterEnabledChanged(enabled));
        Ok(())
    }

    pub async fn get_filter_enabled(&self) -> Result<bool> {
        let inner = self.started_inner().await?;
        Ok(inner.state.filter_enabled)
    }

    /// Session-only selection, never persisted.
    pub async fn set_selected_row_id(&self, unique_id: Option<String>) -> Result<()> {
        let mut inner = self.started_inner().await?;
        inner.state.selected_row_id = unique_id.clone();
        drop(inner);
        self.emit(EngineEvent::RowSelected(unique_id));
        Ok(())
    }

    pub async fn get_selected_row_id(&self) -> Result<Option<String>> {
        let inner = self.started_inner().await?;
        Ok(inner.state.selected_row_id.clone())
    }

    pub async fn get_client_count(&self) -> Result<usize> {
        let inner = self.started_inner().await?;
        Ok(inner.clients.len())
    }

    /// The one operation valid before `start`.
    pub async fn get_status(&self) -> EngineStatus {
        let inner = self.inner.lock().await;
        EngineStatus {
            is_started: inner.started,
            interaction_count: inner.state.interactions.len(),
            client_count: inner.clients.len(),
            request_count: inner
                .clients
                .values()
                .map(ProtocolClient::request_count)
                .sum(),
        }
    }

    async fn started_inner(&self) -> Result<tokio::sync::MutexGuard<'_, ManagerInner>> {
        let inner = self.inner.lock().await;
        if !inner.started {
            return Err(EngineError::NotStarted);
        }
        Ok(inner)
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine; the host may not be listening yet.
        let _ = self.events.send(event);
    }
}

/// Drains client signals: appends attributed interactions and removes
/// expired sessions from the map and the store.
async fn dispatch_signals(
    mut signals: mpsc::UnboundedReceiver<ClientSignal>,
    inner: Arc<Mutex<ManagerInner>>,
    vault: SessionVault,
    state_store: StateStore,
    events: broadcast::Sender<EngineEvent>,
) {
    while let Some(signal) = signals.recv().await {
        match signal {
            ClientSignal::Interactions { server_url, items } => {
                let mut inner = inner.lock().await;
                let appended = append_interactions(&mut inner.state, items);
                if appended == 0 {
                    continue;
                }
                debug!("appended {appended} interaction(s) from {server_url}");
                if let Err(e) = state_store.save(&inner.state).await {
                    warn!("failed to persist state: {e}");
                }
                drop(inner);
                let _ = events.send(EngineEvent::DataChanged);
            }
            ClientSignal::SessionExpired { server_url } => {
                let mut inner = inner.lock().await;
                if inner.clients.remove(&server_url).is_some() {
                    info!("removed expired session for {server_url}");
                }
                drop(inner);
                if let Err(e) = vault.delete_session(&server_url).await {
                    warn!("failed to delete expired session {server_url}: {e}");
                }
            }
        }
    }
}

/// Attributes each wire interaction to the most recently minted URL whose
/// unique id prefixes (or equals) the reported full id, and appends it to
/// the log. Unmatched or disabled hits are dropped silently.
fn append_interactions(state: &mut EngineState, items: Vec<WireInteraction>) -> usize {
    let mut appended = 0;
    for item in items {
        let attribution = state
            .active_urls
            .iter()
            .rev()
            .find(|u| item.full_id.starts_with(&u.unique_id))
            .map(|u| (u.is_active, u.tag.clone(), u.server_url.clone()));
        match attribution {
            Some((true, tag, server_url)) => {
                state.interaction_counter += 1;
                let unique_id = format!(
                    "int_{}_{}",
                    Utc::now().timestamp_millis(),
                    state.interaction_counter
                );
                state.interactions.push(Interaction {
                    protocol: item.protocol.to_lowercase(),
                    unique_id,
                    full_id: item.full_id,
                    q_type: item.q_type,
                    raw_request: item.raw_request,
                    raw_response: item.raw_response,
                    remote_address: item.remote_address.unwrap_or_default(),
                    timestamp: item
                        .timestamp
                        .unwrap_or_else(|| Utc::now().to_rfc3339()),
                    tag,
                    server_url,
                });
                appended += 1;
            }
            Some((false, ..)) => {
                debug!("matching URL disabled, dropping interaction {}", item.full_id);
            }
            None => {
                debug!("no active URL for interaction {}, dropping", item.full_id);
            }
        }
    }
    appended
}
