//! HTTP Fetcher Adapter
//!
//! Implements the [`Fetcher`] port over HTTP(S) with `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::cache::{FetchOutcome, FetchRequest, Fetcher};
use crate::error::{Error, FetchFailure, Result};

/// HTTP fetcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpFetcherConfig {
    /// User-Agent header sent with every request
    pub user_agent: String,
    /// TCP connect timeout
    pub connect_timeout_secs: u64,
    /// Responses larger than this are rejected
    pub max_payload_bytes: u64,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("imgtier/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_secs: 10,
            max_payload_bytes: 32 * 1024 * 1024,
        }
    }
}

/// Fetches image payloads over HTTP(S)
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_payload_bytes: u64,
}

impl HttpFetcher {
    /// Create a fetcher; the per-request timeout comes from each [`FetchRequest`]
    pub fn new(config: &HttpFetcherConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_payload_bytes: config.max_payload_bytes,
        })
    }

    fn classify(request: &FetchRequest, err: reqwest::Error) -> FetchFailure {
        if err.is_timeout() {
            FetchFailure::Timeout {
                locator: request.locator.clone(),
                timeout_ms: request.timeout.as_millis() as u64,
            }
        } else {
            FetchFailure::transport(&request.locator, err)
        }
    }

    fn too_large(&self, request: &FetchRequest, len: u64) -> FetchFailure {
        FetchFailure::decode(
            &request.locator,
            format!("payload of {} bytes exceeds limit of {}", len, self.max_payload_bytes),
        )
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self, request), fields(locator = %request.locator, priority = %request.priority))]
    async fn fetch(&self, request: &FetchRequest) -> FetchOutcome {
        let response = self
            .client
            .get(&request.locator)
            .timeout(request.timeout)
            .send()
            .await
            .map_err(|e| Self::classify(request, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchFailure::Status {
                locator: request.locator.clone(),
                status: status.as_u16(),
            });
        }

        if let Some(len) = response.content_length() {
            if len > self.max_payload_bytes {
                return Err(self.too_large(request, len));
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Self::classify(request, e))?;
        if body.len() as u64 > self.max_payload_bytes {
            return Err(self.too_large(request, body.len() as u64));
        }

        debug!(size = body.len(), "HTTP fetch completed");
        Ok(body)
    }
}
