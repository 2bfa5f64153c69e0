//! Mock HTTP fetcher.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use fundflow::adapters::{FetchResponse, HttpFetcher};
use fundflow::{Error, Result};

/// Mock fetcher backed by a URL-to-response map. Unmapped URLs return 404;
/// URLs registered as failing return a transient error.
pub struct MockFetcher {
    responses: Mutex<HashMap<String, (u16, String)>>,
    failures: Mutex<HashMap<String, u32>>,
    fetched: Mutex<Vec<String>>,
}

impl MockFetcher {
    /// Empty fetcher (every fetch is a 404).
    #[must_use]
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            fetched: Mutex::new(Vec::new()),
        }
    }

    /// Map `url` to a 200 response with `body`.
    #[must_use]
    pub fn with_page(self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.responses.lock().insert(url.into(), (200, body.into()));
        self
    }

    /// Map `url` to an arbitrary status/body.
    #[must_use]
    pub fn with_response(
        self,
        url: impl Into<String>,
        status: u16,
        body: impl Into<String>,
    ) -> Self {
        self.responses
            .lock()
            .insert(url.into(), (status, body.into()));
        self
    }

    /// Make the next `n` fetches of `url` fail with a transient error
    /// before any mapped response is served.
    pub fn fail_url(&self, url: impl Into<String>, n: u32) {
        self.failures.lock().insert(url.into(), n);
    }

    /// URLs fetched so far, in order.
    #[must_use]
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().clone()
    }
}

impl Default for MockFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpFetcher for MockFetcher {
    async fn fetch(
        &self,
        url: &str,
        _headers: &HashMap<String, String>,
        _timeout: Duration,
    ) -> Result<FetchResponse> {
        self.fetched.lock().push(url.to_string());

        let mut failures = self.failures.lock();
        if let Some(remaining) = failures.get_mut(url) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::transient("http.fetch", "injected failure"));
            }
        }
        drop(failures);

        let responses = self.responses.lock();
        match responses.get(url) {
            Some((status, body)) => Ok(FetchResponse {
                status: *status,
                body: body.clone(),
            }),
            None => Ok(FetchResponse {
                status: 404,
                body: String::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mapped_page_and_default_404() {
        let fetcher = MockFetcher::new().with_page("https://a.example/", "<html/>");
        let ok = fetcher
            .fetch("https://a.example/", &HashMap::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ok.status, 200);
        let missing = fetcher
            .fetch("https://b.example/", &HashMap::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(missing.status, 404);
        assert_eq!(fetcher.fetched().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_injection_then_success() {
        let fetcher = MockFetcher::new().with_page("https://a.example/", "ok");
        fetcher.fail_url("https://a.example/", 1);
        assert!(fetcher
            .fetch("https://a.example/", &HashMap::new(), Duration::from_secs(1))
            .await
            .is_err());
        assert!(fetcher
            .fetch("https://a.example/", &HashMap::new(), Duration::from_secs(1))
            .await
            .is_ok());
    }
}
