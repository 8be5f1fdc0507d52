//! Interactsh v1 wire format
//!
//! Field names reproduce the server's JSON exactly; note the mixed
//! conventions (`correlation-id` on register, `correlationID` on
//! deregister) that the protocol itself carries.

use serde::{Deserialize, Serialize};

/// Body of `POST /register`.
#[derive(Debug, Serialize)]
pub struct RegisterRequest {
    /// Base64 of the PEM text, which itself wraps Base64 SPKI DER.
    #[serde(rename = "public-key")]
    pub public_key: String,
    #[serde(rename = "secret-key")]
    pub secret_key: String,
    #[serde(rename = "correlation-id")]
    pub correlation_id: String,
}

/// Body of `POST /deregister`.
#[derive(Debug, Serialize)]
pub struct DeregisterRequest {
    #[serde(rename = "correlationID")]
    pub correlation_id: String,
    #[serde(rename = "secretKey")]
    pub secret_key: String,
}

/// Body of a 200 response to `GET /poll`.
#[derive(Debug, Deserialize)]
pub struct PollResponse {
    /// One Base64 secure message per interaction.
    #[serde(default)]
    pub data: Option<Vec<String>>,
    /// Base64 of the RSA-wrapped AES key for this batch.
    #[serde(default)]
    pub aes_key: Option<String>,
}

/// One decrypted interaction as the server reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct WireInteraction {
    pub protocol: String,
    #[serde(rename = "unique-id")]
    pub unique_id: String,
    #[serde(rename = "full-id")]
    pub full_id: String,
    #[serde(rename = "q-type", default)]
    pub q_type: Option<String>,
    #[serde(rename = "raw-request", default)]
    pub raw_request: Option<String>,
    #[serde(rename = "raw-response", default)]
    pub raw_response: Option<String>,
    #[serde(rename = "remote-address", default)]
    pub remote_address: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}
