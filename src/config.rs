//! Engine configuration

use crate::error::{EngineError, Result};
use serde::Deserialize;
use std::time::Duration;

/// Lower bound for the polling interval (5 seconds).
pub const MIN_POLLING_INTERVAL_MS: u64 = 5_000;
/// Upper bound for the polling interval (1 hour).
pub const MAX_POLLING_INTERVAL_MS: u64 = 3_600_000;

/// Typed configuration the host hands to [`crate::engine::Engine::start`].
///
/// Missing fields deserialize to their defaults, so a host can pass a
/// partial JSON object and only override what it cares about.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Optional bearer token sent as the `Authorization` header on every
    /// request to servers that require it.
    pub token: Option<String>,
    /// Delay between polling iterations, per server.
    pub polling_interval_ms: u64,
    /// Length of the per-server correlation identifier.
    pub correlation_id_length: usize,
    /// Length of the per-mint nonce (also used for the secret key).
    pub correlation_id_nonce_length: usize,
    /// Timeout applied to every HTTP call.
    pub http_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            token: None,
            polling_interval_ms: 5_000,
            correlation_id_length: 20,
            correlation_id_nonce_length: 13,
            http_timeout_secs: 10,
        }
    }
}

impl EngineConfig {
    /// Validates the configuration, rejecting out-of-range polling intervals.
    pub fn validate(&self) -> Result<()> {
        if self.polling_interval_ms < MIN_POLLING_INTERVAL_MS
            || self.polling_interval_ms > MAX_POLLING_INTERVAL_MS
        {
            return Err(EngineError::InvalidPollingInterval(self.polling_interval_ms));
        }
        Ok(())
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
