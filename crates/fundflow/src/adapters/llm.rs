//! LLM adapter: extraction, classification tagging and legitimacy scoring.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::record::InclusionFlags;

/// Tags produced by the classification call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassifyTags {
    /// Sector tags
    pub sectors: Vec<String>,
    /// Geography tags (countries/regions)
    pub geography: Vec<String>,
    /// Inclusion flags (gender/youth/rural)
    pub inclusion: InclusionFlags,
    /// Funding-stage guess
    pub stage: Option<String>,
    /// Detected language (ISO 639-1)
    pub language: Option<String>,
    /// Structured-completeness score in [0, 1]
    pub completeness: f64,
}

/// Shared LLM client with an internal connection pool.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Extract structured fields from cleaned text according to `schema`.
    async fn extract(&self, text: &str, schema: &serde_json::Value) -> Result<serde_json::Value>;

    /// Tag a candidate's text with sectors, geography, inclusion flags,
    /// stage and a completeness score.
    async fn classify(&self, text: &str) -> Result<ClassifyTags>;

    /// Legitimacy score for a candidate, in [0, 1].
    async fn score(&self, candidate_json: &serde_json::Value) -> Result<f64>;
}

/// Number of retries the LLM adapter gets on transient errors.
const LLM_MAX_RETRIES: u32 = 2;

/// Run an LLM call with up to two retries on transient errors, per the
/// adapter contract.
pub async fn llm_retry<T, F, Fut>(operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_err: Option<Error> = None;
    for attempt in 0..=LLM_MAX_RETRIES {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < LLM_MAX_RETRIES => {
                warn!(
                    operation = %operation,
                    attempt = attempt + 1,
                    error = %e,
                    "transient LLM error, retrying"
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    // Unreachable: the loop returns on the final attempt either way.
    Err(last_err.unwrap_or_else(|| Error::InternalInvariant("llm retry loop".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_llm_retry_succeeds_after_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = llm_retry("classify", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::transient("llm.classify", "503"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_llm_retry_gives_up_after_two_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = llm_retry("classify", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::transient("llm.classify", "503")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_llm_retry_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = llm_retry("classify", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::permanent("llm.classify", "401")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
