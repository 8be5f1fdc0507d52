//! Error types for the interaction engine

use thiserror::Error;

/// Main error type for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine not started")]
    NotStarted,

    #[error("engine already started")]
    AlreadyStarted,

    #[error("polling interval out of range: {0} ms (allowed 5000..=3600000)")]
    InvalidPollingInterval(u64),

    #[error("invalid server URL '{0}': no host")]
    InvalidServerUrl(String),

    #[error("RSA keypair not initialized")]
    KeysNotInitialized,

    #[error("RSA key generation failed: {0}")]
    KeyGeneration(String),

    #[error("OAEP decryption failed")]
    InvalidPadding,

    #[error("invalid cipher key or IV length")]
    InvalidKeyLength,

    #[error("encrypted payload too short: {0} bytes")]
    InvalidLength(usize),

    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("PEM encoding failed: {0}")]
    PemMalformed(String),

    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    #[error("deregistration failed: {0}")]
    DeregistrationFailed(String),

    #[error("server rejected session credentials (401)")]
    AuthFailure,

    #[error("server no longer knows this session (400)")]
    SessionExpired,

    #[error("transient poll error: {0}")]
    TransientPollError(String),

    #[error("client is not polling")]
    ClientNotPolling,

    #[error("client is already polling")]
    ClientAlreadyPolling,

    #[error("client is closed")]
    ClientClosed,

    #[error("persistence read failed: {0}")]
    PersistenceRead(String),

    #[error("persistence write failed: {0}")]
    PersistenceWrite(String),

    #[error("persisted record corrupted: {0}")]
    PersistenceCorrupted(String),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
