// ABOUTME: Fetch capability used by the pagination driver and its reqwest implementation
// ABOUTME: Also parses OData response pages into records and a continuation link

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{ReplicationError, Result};

/// An opaque listing record.
pub type Record = Map<String, Value>;

/// Raw HTTP outcome handed back by a [`Fetcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Statuses worth retrying under the pacing policy.
    pub fn is_transient(&self) -> bool {
        self.status == 429 || (500..600).contains(&self.status)
    }
}

/// Transport-level failure; always treated as transient by the driver.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct FetchError {
    pub message: String,
    pub timed_out: bool,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: true,
        }
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn get(&self, url: &str, auth_header: &str) -> Result<FetchResponse, FetchError>;
}

/// One page of an OData collection response.
#[derive(Debug, Clone, Deserialize)]
pub struct Page {
    pub value: Vec<Record>,
    #[serde(rename = "@odata.nextLink", default)]
    pub next_link: Option<String>,
}

impl Page {
    pub fn parse(url: &str, body: &str) -> Result<Self> {
        let raw: Value =
            serde_json::from_str(body).map_err(|e| ReplicationError::MalformedResponse {
                url: url.to_string(),
                message: format!("body is not JSON: {}", e),
            })?;

        if raw.get("value").is_none() {
            return Err(ReplicationError::MalformedResponse {
                url: url.to_string(),
                message: "response has no 'value' collection".to_string(),
            });
        }

        let mut page: Page =
            serde_json::from_value(raw).map_err(|e| ReplicationError::MalformedResponse {
                url: url.to_string(),
                message: format!("unexpected page shape: {}", e),
            })?;

        // An empty link means the same as no link
        if page.next_link.as_deref().is_some_and(|l| l.trim().is_empty()) {
            page.next_link = None;
        }

        Ok(page)
    }
}

/// [`Fetcher`] backed by a pooled reqwest client.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mls-replicator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                ReplicationError::Configuration(format!("failed to create HTTP client: {}", e))
            })?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get(&self, url: &str, auth_header: &str) -> Result<FetchResponse, FetchError> {
        let response = self
            .client
            .get(url)
            .header("Authorization", auth_header)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::timeout(format!("request timed out: {}", e))
                } else {
                    FetchError::new(format!("request failed: {}", e))
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::new(format!("failed to read response body: {}", e)))?;

        Ok(FetchResponse { status, body })
    }
}
