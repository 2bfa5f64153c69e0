//! Search-API adapter consumed by the web-search collector.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A single search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    /// Result title
    pub title: String,
    /// Result URL
    pub url: String,
    /// Snippet/description
    pub snippet: String,
    /// Provider relevance signal in [0, 1], when available
    pub relevance: Option<f64>,
}

/// External search API client.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Run `query` against the provider, localized to `locale`
    /// (BCP 47 tag, e.g. "fr-SN").
    async fn search(&self, query: &str, locale: &str) -> Result<Vec<SearchHit>>;
}
