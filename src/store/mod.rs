//! Charm store access
//!
//! [`CharmSource`] is the seam to the remote catalog: one method fetching a
//! single entity document and one issuing a batch metadata query. The
//! production implementation is [`CharmStoreClient`] over the charm store v4
//! HTTP API; tests substitute in-memory fakes.
//!
//! The single-flight cache over a `CharmSource` lives in [`cache`].

pub mod cache;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::error::{BundleError, Result};

pub use cache::{BatchHandle, CharmStoreCache, FetchCallback, FetchOutcome, MetadataHandle};

/// Default charm store API endpoint
pub const CHARM_STORE_URL: &str = "https://api.jujucharms.com/v4";

/// A remote catalog answering charm metadata queries
#[async_trait]
pub trait CharmSource: Send + Sync + 'static {
    /// Fetch the entity document for exactly one charm id
    ///
    /// Implementations must treat any result count other than one as a
    /// fetch failure.
    async fn fetch_one(&self, id: &str) -> Result<JsonValue>;

    /// Fetch entity documents for several ids in one query, returning the
    /// raw response map
    async fn fetch_many(&self, ids: &[String]) -> Result<JsonValue>;
}

/// HTTP client for the charm store v4 API
pub struct CharmStoreClient {
    http: reqwest::Client,
    base_url: String,
}

impl CharmStoreClient {
    pub fn new() -> Self {
        CharmStoreClient::with_base_url(CHARM_STORE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        CharmStoreClient {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn meta_any(&self, query: &str) -> Result<JsonValue> {
        let url = format!(
            "{}/meta/any?include=charm-metadata&{query}",
            self.base_url
        );
        debug!(%url, "charm store query");
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(BundleError::FetchFailed {
                reason: format!("metadata loading failed: status={} url={url}", response.status()),
            });
        }
        Ok(response.json().await?)
    }
}

impl Default for CharmStoreClient {
    fn default() -> Self {
        CharmStoreClient::new()
    }
}

#[async_trait]
impl CharmSource for CharmStoreClient {
    async fn fetch_one(&self, id: &str) -> Result<JsonValue> {
        let body = self.meta_any(&format!("id={id}")).await?;
        let map = body.as_object().ok_or_else(|| BundleError::FetchFailed {
            reason: "charm store response is not an object".to_string(),
        })?;
        if map.len() != 1 {
            return Err(BundleError::UnexpectedResults { count: map.len() });
        }
        map.values()
            .next()
            .cloned()
            .ok_or(BundleError::UnexpectedResults { count: 0 })
    }

    async fn fetch_many(&self, ids: &[String]) -> Result<JsonValue> {
        let query = ids
            .iter()
            .map(|id| format!("id={id}"))
            .collect::<Vec<_>>()
            .join("&");
        self.meta_any(&query).await
    }
}
