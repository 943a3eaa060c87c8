//! Archive download seam
//!
//! The materializer talks to the network only through `Fetcher`, so tests
//! and offline embedders can swap in `StubFetcher` with canned responses.

use async_trait::async_trait;
use bytes::Bytes;
use quay_core::{QuayError, Result};
use std::collections::HashMap;
use tracing::debug;

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `url` fully into memory. Non-2xx responses are errors.
    async fn fetch(&self, url: &str) -> Result<Bytes>;
}

/// Real downloads over reqwest, capped at a configured size
pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl HttpFetcher {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            max_bytes,
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        debug!(url = %url, "fetching archive");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| QuayError::Materialize(format!("GET {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(QuayError::Materialize(format!(
                "GET {} returned {}",
                url, status
            )));
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(QuayError::Materialize(format!(
                    "archive is {} bytes, limit is {}",
                    length, self.max_bytes
                )));
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| QuayError::Materialize(format!("reading {} failed: {}", url, e)))?;

        // Content-Length is advisory; enforce the cap on what actually arrived
        if body.len() as u64 > self.max_bytes {
            return Err(QuayError::Materialize(format!(
                "archive is {} bytes, limit is {}",
                body.len(),
                self.max_bytes
            )));
        }
        Ok(body)
    }
}

/// Canned-response fetcher for tests and offline use
#[derive(Default)]
pub struct StubFetcher {
    responses: HashMap<String, Bytes>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        self.responses.insert(url.into(), body.into());
        self
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        self.responses.get(url).cloned().ok_or_else(|| {
            QuayError::Materialize(format!("GET {} returned 404 Not Found", url))
        })
    }
}
