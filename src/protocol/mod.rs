//! Per-server Interactsh protocol client
//!
//! One [`ProtocolClient`] owns the registered identity for a single
//! server and runs its polling loop as a background task. Decrypted
//! interactions and expiry signals travel back to the owner over an
//! mpsc handle, never through a back-reference.

pub mod wire;

use crate::config::EngineConfig;
use crate::crypto::{self, CryptoCore};
use crate::error::{EngineError, Result};
use crate::http::HttpClient;
use crate::models::{ClientSession, MintedUrl};
use reqwest::StatusCode;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;
use self::wire::{DeregisterRequest, PollResponse, RegisterRequest, WireInteraction};

const STATE_IDLE: u8 = 0;
const STATE_POLLING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Lifecycle state of a protocol client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Polling,
    Closed,
}

impl ClientState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_POLLING => ClientState::Polling,
            STATE_CLOSED => ClientState::Closed,
            _ => ClientState::Idle,
        }
    }

    fn as_raw(self) -> u8 {
        match self {
            ClientState::Idle => STATE_IDLE,
            ClientState::Polling => STATE_POLLING,
            ClientState::Closed => STATE_CLOSED,
        }
    }
}

/// Signals a client posts back to its owner.
#[derive(Debug)]
pub enum ClientSignal {
    /// A poll iteration produced decrypted interactions.
    Interactions {
        server_url: String,
        items: Vec<WireInteraction>,
    },
    /// The server answered 400: it has forgotten this session.
    SessionExpired { server_url: String },
}

/// Everything a polling iteration needs, cheap to clone into the
/// background task.
#[derive(Clone)]
struct PollContext {
    http: HttpClient,
    session: ClientSession,
    crypto: Arc<CryptoCore>,
    signals: mpsc::UnboundedSender<ClientSignal>,
    interval: Duration,
    /// Serializes loop ticks against `force_poll` so at most one poll per
    /// server is in flight.
    gate: Arc<Mutex<()>>,
    /// Shared with the owning client; the loop writes Idle on expiry.
    state: Arc<AtomicU8>,
}

/// Interactsh protocol state machine for exactly one server.
#[derive(Debug)]
pub struct ProtocolClient {
    session: ClientSession,
    server_host: String,
    nonce_length: usize,
    http: HttpClient,
    crypto: Arc<CryptoCore>,
    signals: mpsc::UnboundedSender<ClientSignal>,
    interval: Duration,
    gate: Arc<Mutex<()>>,
    state: Arc<AtomicU8>,
    cancel: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl ProtocolClient {
    /// New-session mode: mints fresh credentials and registers them with
    /// the server. Any non-200 fails with `RegistrationFailed` carrying
    /// the body text.
    pub async fn register(
        server_url: &str,
        config: &EngineConfig,
        crypto: Arc<CryptoCore>,
        signals: mpsc::UnboundedSender<ClientSignal>,
    ) -> Result<Self> {
        let session = ClientSession {
            server_url: server_url.trim_end_matches('/').to_string(),
            correlation_id: crypto::generate_random_id(config.correlation_id_length, false),
            secret_key: crypto::generate_random_id(config.correlation_id_nonce_length, false),
            token: config.token.clone(),
        };
        let client = Self::from_session(session, config, crypto, signals)?;

        let body = RegisterRequest {
            public_key: client.crypto.export_public_key_pem()?,
            secret_key: client.session.secret_key.clone(),
            correlation_id: client.session.correlation_id.clone(),
        };
        let response = client
            .http
            .post_json(&format!("{}/register", client.session.server_url), &body)
            .await?;
        if response.status() != StatusCode::OK {
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::RegistrationFailed(text));
        }
        debug!(
            "registered correlation id {} with {}",
            client.session.correlation_id, client.session.server_url
        );
        Ok(client)
    }

    /// Resumed mode: reattaches to a session registered in a prior
    /// process lifetime under the same RSA key. No network round trip.
    pub fn resume(
        session: ClientSession,
        config: &EngineConfig,
        crypto: Arc<CryptoCore>,
        signals: mpsc::UnboundedSender<ClientSignal>,
    ) -> Result<Self> {
        Self::from_session(session, config, crypto, signals)
    }

    fn from_session(
        session: ClientSession,
        config: &EngineConfig,
        crypto: Arc<CryptoCore>,
        signals: mpsc::UnboundedSender<ClientSignal>,
    ) -> Result<Self> {
        let server_host = parse_server_host(&session.server_url)?;
        let http = HttpClient::new(config.http_timeout(), session.token.clone())?;
        Ok(Self {
            session,
            server_host,
            nonce_length: config.correlation_id_nonce_length,
            http,
            crypto,
            signals,
            interval: config.polling_interval(),
            gate: Arc::new(Mutex::new(())),
            state: Arc::new(AtomicU8::new(STATE_IDLE)),
            cancel: None,
            task: None,
        })
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ClientState) {
        self.state.store(state.as_raw(), Ordering::Release);
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    pub fn server_url(&self) -> &str {
        &self.session.server_url
    }

    /// Spawns the background polling loop.
    pub fn start_polling(&mut self) -> Result<()> {
        match self.state() {
            ClientState::Idle => {}
            ClientState::Polling => return Err(EngineError::ClientAlreadyPolling),
            ClientState::Closed => return Err(EngineError::ClientClosed),
        }
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let context = PollContext {
            http: self.http.clone(),
            session: self.session.clone(),
            crypto: Arc::clone(&self.crypto),
            signals: self.signals.clone(),
            interval: self.interval,
            gate: Arc::clone(&self.gate),
            state: Arc::clone(&self.state),
        };
        self.task = Some(tokio::spawn(run_poll_loop(context, cancel_rx)));
        self.cancel = Some(cancel_tx);
        self.set_state(ClientState::Polling);
        Ok(())
    }

    /// Stops the polling loop and waits for an in-flight iteration to
    /// finish. Idempotent.
    pub async fn stop_polling(&mut self) -> Result<()> {
        if self.state() != ClientState::Polling {
            return Ok(());
        }
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(true);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("polling task for {} ended abnormally: {e}", self.session.server_url);
            }
        }
        self.set_state(ClientState::Idle);
        Ok(())
    }

    /// Runs one poll iteration immediately. Valid only while polling;
    /// `SessionExpired` propagates to the caller.
    pub async fn force_poll(&self) -> Result<Vec<WireInteraction>> {
        if self.state() != ClientState::Polling {
            return Err(EngineError::ClientNotPolling);
        }
        let _gate = self.gate.lock().await;
        poll_session(&self.http, &self.session, &self.crypto).await
    }

    /// Mints a fresh subdomain under this server.
    pub fn generate_url(&self) -> Result<MintedUrl> {
        if self.state() == ClientState::Closed {
            return Err(EngineError::ClientClosed);
        }
        let nonce = crypto::generate_random_id(self.nonce_length, false);
        let unique_id = format!("{}{}", self.session.correlation_id, nonce);
        Ok(MintedUrl {
            url: format!("https://{}.{}", unique_id, self.server_host),
            unique_id,
        })
    }

    /// Deregisters the session. The state becomes `Closed` only on
    /// success; a failed attempt leaves the client `Idle` for a retry.
    pub async fn close(&mut self) -> Result<()> {
        match self.state() {
            ClientState::Idle => {}
            ClientState::Polling => return Err(EngineError::ClientAlreadyPolling),
            ClientState::Closed => return Err(EngineError::ClientClosed),
        }
        let body = DeregisterRequest {
            correlation_id: self.session.correlation_id.clone(),
            secret_key: self.session.secret_key.clone(),
        };
        let response = self
            .http
            .post_json(&format!("{}/deregister", self.session.server_url), &body)
            .await?;
        if response.status() != StatusCode::OK {
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::DeregistrationFailed(text));
        }
        self.set_state(ClientState::Closed);
        debug!("deregistered from {}", self.session.server_url);
        Ok(())
    }

    /// Requests this client has made, registration included.
    pub fn request_count(&self) -> u64 {
        self.http.request_count()
    }
}

/// Extracts the host component used to build minted URLs.
fn parse_server_host(server_url: &str) -> Result<String> {
    let parsed = Url::parse(server_url)?;
    parsed
        .host_str()
        .map(str::to_string)
        .ok_or_else(|| EngineError::InvalidServerUrl(server_url.to_string()))
}

/// The polling loop: poll, report, sleep the full interval, repeat.
/// Cancellation is observed between iterations and at the sleep boundary;
/// `SessionExpired` is the only error that terminates the loop, and it
/// drops the shared client state back to Idle before signaling the owner.
async fn run_poll_loop(context: PollContext, mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        let outcome = {
            let _gate = context.gate.lock().await;
            poll_session(&context.http, &context.session, &context.crypto).await
        };
        match outcome {
            Ok(items) => {
                if !items.is_empty()
                    && context
                        .signals
                        .send(ClientSignal::Interactions {
                            server_url: context.session.server_url.clone(),
                            items,
                        })
                        .is_err()
                {
                    debug!("signal receiver gone, stopping poll loop");
                    return;
                }
            }
            Err(EngineError::SessionExpired) => {
                warn!(
                    "session for {} expired server-side, stopping poll loop",
                    context.session.server_url
                );
                // The client is Idle again before the owner hears about
                // the expiry.
                context.state.store(STATE_IDLE, Ordering::Release);
                let _ = context.signals.send(ClientSignal::SessionExpired {
                    server_url: context.session.server_url.clone(),
                });
                return;
            }
            Err(e) => {
                warn!("poll against {} failed: {e}", context.session.server_url);
            }
        }
        tokio::select! {
            // Only `stop_polling` touches the channel, and dropping the
            // client closes it; either way the loop is done.
            _ = cancel.changed() => return,
            _ = tokio::time::sleep(context.interval) => {}
        }
    }
}

/// One `GET /poll` round trip plus per-item decryption. Undecryptable or
/// unparsable items are logged and skipped; they never abort the batch.
async fn poll_session(
    http: &HttpClient,
    session: &ClientSession,
    crypto: &CryptoCore,
) -> Result<Vec<WireInteraction>> {
    let url = format!(
        "{}/poll?id={}&secret={}",
        session.server_url, session.correlation_id, session.secret_key
    );
    let response = http.get(&url).await?;
    match response.status() {
        StatusCode::OK => {}
        StatusCode::UNAUTHORIZED => return Err(EngineError::AuthFailure),
        StatusCode::BAD_REQUEST => return Err(EngineError::SessionExpired),
        status => {
            return Err(EngineError::TransientPollError(format!(
                "unexpected status {status}"
            )))
        }
    }
    let body: PollResponse = response.json().await?;

    let mut items = Vec::new();
    let (Some(data), Some(aes_key)) = (body.data, body.aes_key) else {
        return Ok(items);
    };
    for secure_message in &data {
        let decoded = crypto
            .decrypt_interaction(&aes_key, secure_message)
            .and_then(|plaintext| {
                serde_json::from_str::<WireInteraction>(&plaintext).map_err(EngineError::from)
            });
        match decoded {
            Ok(item) => items.push(item),
            Err(e) => warn!(
                "skipping undecryptable interaction from {}: {e}",
                session.server_url
            ),
        }
    }
    Ok(items)
}
