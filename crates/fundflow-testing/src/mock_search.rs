//! Mock search provider.

use async_trait::async_trait;
use parking_lot::Mutex;

use fundflow::adapters::{SearchHit, SearchProvider};
use fundflow::Result;

/// Mock search provider returning a fixed hit list and recording the
/// queries it was asked.
pub struct MockSearchProvider {
    hits: Mutex<Vec<SearchHit>>,
    queries: Mutex<Vec<(String, String)>>,
}

impl MockSearchProvider {
    /// Provider returning no hits.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hits: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Set the hits returned for every query.
    #[must_use]
    pub fn with_hits(self, hits: Vec<SearchHit>) -> Self {
        *self.hits.lock() = hits;
        self
    }

    /// The `(query, locale)` pairs seen so far.
    #[must_use]
    pub fn queries(&self) -> Vec<(String, String)> {
        self.queries.lock().clone()
    }
}

impl Default for MockSearchProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SearchProvider for MockSearchProvider {
    async fn search(&self, query: &str, locale: &str) -> Result<Vec<SearchHit>> {
        self.queries
            .lock()
            .push((query.to_string(), locale.to_string()));
        Ok(self.hits.lock().clone())
    }
}
