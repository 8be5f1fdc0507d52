//! HTTP client wrapper with timeout, authorization, and request tracking

use crate::error::Result;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Thin wrapper around [`reqwest::Client`] that applies the configured
/// timeout, attaches the optional `Authorization` token, and counts
/// outgoing requests.
#[derive(Clone, Debug)]
pub struct HttpClient {
    client: Client,
    auth_token: Option<String>,
    request_count: Arc<AtomicU64>,
}

impl HttpClient {
    /// Creates a new client with the given per-request timeout.
    pub fn new(timeout: Duration, auth_token: Option<String>) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            auth_token,
            request_count: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Sends a GET request.
    pub async fn get(&self, url: &str) -> Result<Response> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        let mut req = self
            .client
            .get(url)
            .header(CONTENT_TYPE, "application/json");
        if let Some(ref token) = self.auth_token {
            req = req.header(AUTHORIZATION, token.as_str());
        }
        Ok(req.send().await?)
    }

    /// Sends a POST request with a JSON body.
    pub async fn post_json<T: Serialize>(&self, url: &str, body: &T) -> Result<Response> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        let mut req = self.client.post(url).json(body);
        if let Some(ref token) = self.auth_token {
            req = req.header(AUTHORIZATION, token.as_str());
        }
        Ok(req.send().await?)
    }

    /// Returns the total number of requests made through this client.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }
}
