//! HTTP-fetch adapter with per-host rate limiting.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::error::{Error, Result};
use crate::ratelimit::DomainRateLimiter;
use crate::{DEFAULT_HTTP_CONNECT_TIMEOUT, DEFAULT_HTTP_REQUEST_TIMEOUT};

/// Response from a fetch.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub body: String,
}

/// Plain HTTP fetch, used by the deep crawler and the scrape workers.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// Fetch `url` with the given headers, bounded by `timeout`.
    async fn fetch(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<FetchResponse>;
}

/// Production fetcher: `reqwest` client with explicit timeouts, a
/// configurable user-agent and per-host token buckets.
pub struct ReqwestFetcher {
    client: reqwest::Client,
    domains: DomainRateLimiter,
}

impl ReqwestFetcher {
    /// Fetcher with the given user-agent and per-host per-minute quota.
    #[must_use]
    pub fn new(user_agent: &str, host_quota_per_minute: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_REQUEST_TIMEOUT)
            .connect_timeout(DEFAULT_HTTP_CONNECT_TIMEOUT)
            .user_agent(user_agent)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            domains: DomainRateLimiter::new(host_quota_per_minute),
        }
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<FetchResponse> {
        let parsed = Url::parse(url)
            .map_err(|e| Error::SchemaViolation(format!("invalid fetch URL '{url}': {e}")))?;
        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(Error::SchemaViolation(format!(
                    "scheme '{scheme}' not allowed (only http/https)"
                )))
            }
        }

        if let Some(host) = parsed.host_str() {
            let admission = self.domains.try_acquire(host);
            if !admission.allowed {
                return Err(Error::transient(
                    "http.fetch",
                    format!(
                        "per-host rate limit for {host}; retry in {:?}",
                        admission.wait_hint.unwrap_or_default()
                    ),
                ));
            }
        }

        let mut request = self.client.get(parsed).timeout(timeout);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::DeadlineExceeded {
                    operation: "http.fetch".to_string(),
                    deadline: timeout,
                }
            } else if e.is_connect() {
                Error::transient("http.fetch", e.to_string())
            } else {
                Error::permanent("http.fetch", e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| Error::transient("http.fetch", e.to_string()))?;
        Ok(FetchResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_invalid_url_before_fetching() {
        let fetcher = ReqwestFetcher::new("fundflow-test", 60);
        let err = fetcher
            .fetch("not a url", &HashMap::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SchemaViolation(_)));
    }

    #[tokio::test]
    async fn test_rejects_non_http_scheme_before_fetching() {
        let fetcher = ReqwestFetcher::new("fundflow-test", 60);
        let err = fetcher
            .fetch(
                "file:///etc/passwd",
                &HashMap::new(),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("scheme"));
    }

    #[tokio::test]
    async fn test_per_host_rate_limit_is_transient() {
        let fetcher = ReqwestFetcher::new("fundflow-test", 0);
        let err = fetcher
            .fetch(
                "https://example.com/",
                &HashMap::new(),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
