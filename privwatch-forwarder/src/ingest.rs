//! HTTP client for the collector's ingest endpoint.

use std::time::Duration;

use tracing::error;

use privwatch_shared::wire::{AlertWire, IngestResponse};

/// POST timeout for one ingest attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Why an ingest attempt failed.
#[derive(Debug)]
pub enum IngestError {
    /// 401/403: bad credentials, retrying is pointless.
    Unauthorized,
    /// Any other HTTP error status.
    Status(u16, String),
    /// Connection, TLS or body errors.
    Transport(String),
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestError::Unauthorized => write!(f, "unauthorized (invalid API key)"),
            IngestError::Status(code, body) => write!(f, "HTTP {}: {}", code, body),
            IngestError::Transport(e) => write!(f, "{}", e),
        }
    }
}

/// Posting seam; the HTTP implementation is swapped out in tests.
pub trait IngestClient {
    /// Ship one batch. Returns the number of alerts the collector inserted.
    fn post(&self, batch: &[AlertWire]) -> Result<u64, IngestError>;
}

/// Real collector client.
pub struct HttpIngest {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
}

impl HttpIngest {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, IngestError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| IngestError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/alerts/ingest", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
        })
    }
}

impl IngestClient for HttpIngest {
    fn post(&self, batch: &[AlertWire]) -> Result<u64, IngestError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("X-API-Key", &self.api_key)
            .json(batch)
            .send()
            .map_err(|e| IngestError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            error!("HTTP {} from collector", status.as_u16());
            return Err(IngestError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(IngestError::Status(status.as_u16(), body));
        }

        let body: IngestResponse = response
            .json()
            .map_err(|e| IngestError::Transport(e.to_string()))?;
        Ok(body.inserted)
    }
}
