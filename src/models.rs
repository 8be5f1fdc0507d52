//! Core data models for the interaction engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-server protocol identity, registered once and persisted so that
/// subdomains minted in a prior run keep receiving interactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSession {
    /// Server base URL, unique key in the session store.
    pub server_url: String,
    /// Random identifier every minted subdomain begins with.
    pub correlation_id: String,
    /// Shared secret presented when polling.
    pub secret_key: String,
    /// Optional bearer authorization token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// A minted subdomain the engine is listening for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveUrl {
    /// Full https URL handed to the host.
    pub url: String,
    /// Correlation identifier concatenated with a fresh nonce.
    pub unique_id: String,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
    /// Back reference to the owning session.
    pub server_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// An observed external hit, decrypted and attributed to an [`ActiveUrl`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    /// Lowercased protocol name ("http", "dns", "smtp", ...).
    pub protocol: String,
    /// Engine-minted monotonic id, `int_<ms>_<counter>`.
    pub unique_id: String,
    /// Server-provided correlation payload for this hit.
    pub full_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    pub remote_address: String,
    /// ISO-8601 timestamp as reported by the server.
    pub timestamp: String,
    /// Copied from the attributing [`ActiveUrl`] at ingestion time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub server_url: String,
}

/// Process-wide engine state, persisted as a single JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineState {
    #[serde(default)]
    pub interactions: Vec<Interaction>,
    #[serde(default)]
    pub active_urls: Vec<ActiveUrl>,
    #[serde(default)]
    pub interaction_counter: u64,
    #[serde(default)]
    pub filter: String,
    #[serde(default)]
    pub filter_enabled: bool,
    /// Session-only, never written to disk.
    #[serde(skip)]
    pub selected_row_id: Option<String>,
}

/// A freshly minted URL returned from `generate_url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MintedUrl {
    pub url: String,
    pub unique_id: String,
}

/// Events rebroadcast to every host subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    DataChanged,
    UrlGenerated(String),
    FilterChanged(String),
    FilterEnabledChanged(bool),
    UrlsChanged,
    RowSelected(Option<String>),
}

/// Snapshot answered by `get_status`, valid even before `start`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub is_started: bool,
    pub interaction_count: usize,
    pub client_count: usize,
    /// HTTP requests made by the live clients, registrations included.
    pub request_count: u64,
}
