use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cdc_core::{DocumentIndex, Error, Result};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSearchConfig {
    /// Base URL of the search service
    #[serde(default = "default_url")]
    pub url: String,

    /// Index the events are written to
    #[serde(default = "default_index")]
    pub index: String,

    /// Optional username for basic authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password for basic authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Per-request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_index() -> String {
    "cdc".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for OpenSearchConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            index: default_index(),
            username: None,
            password: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Writes documents through the `_doc` API. Stateless apart from the
/// connection pool, so one instance is shared by every claim.
pub struct OpenSearchIndex {
    config: OpenSearchConfig,
    client: reqwest::Client,
    base_url: String,
}

impl OpenSearchIndex {
    pub fn new(config: OpenSearchConfig) -> Result<Self> {
        let base = Url::parse(&config.url).map_err(|e| {
            Error::Configuration(format!("Invalid OpenSearch URL '{}': {}", config.url, e))
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Connection(format!("Failed to init opensearch client: {}", e)))?;

        Ok(Self {
            base_url: base.as_str().trim_end_matches('/').to_string(),
            config,
            client,
        })
    }

    /// `id` must already be escaped for use as a path segment. Dot segments
    /// are rejected since URL normalisation would resolve them away.
    pub fn document_url(&self, index: &str, id: &str) -> Result<Url> {
        if is_dot_segment(id) {
            return Err(Error::InvalidDocumentId(id.to_string()));
        }
        let raw = format!("{}/{}/_doc/{}", self.base_url, index, id);
        Url::parse(&raw)
            .map_err(|e| Error::Configuration(format!("Invalid document URL '{}': {}", raw, e)))
    }
}

/// `.` and `..`, literal or percent-encoded
fn is_dot_segment(id: &str) -> bool {
    let lowered = id.to_ascii_lowercase();
    matches!(
        lowered.as_str(),
        "." | "%2e" | ".." | ".%2e" | "%2e." | "%2e%2e"
    )
}

#[async_trait]
impl DocumentIndex for OpenSearchIndex {
    async fn upsert(&self, index: &str, id: &str, body: Bytes) -> Result<()> {
        let url = self.document_url(index, id)?;
        debug!("PUT {}", url);

        let mut request = self
            .client
            .put(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(ref username) = self.config.username {
            request = request.basic_auth(username, self.config.password.as_ref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Connection(format!("Failed to index the request: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                "Not ok status {} received while indexing {}: {}",
                status, id, body
            );
            return Err(Error::Index {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
