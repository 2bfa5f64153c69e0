//! Configurable mock LLM client.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use fundflow::adapters::{ClassifyTags, LlmClient};
use fundflow::{Error, Result};

/// Mock LLM with canned responses and transient-failure injection.
pub struct MockLlm {
    tags: Mutex<ClassifyTags>,
    score: Mutex<f64>,
    extraction: Mutex<serde_json::Value>,
    transient_failures: AtomicU32,
    calls: AtomicU32,
}

impl MockLlm {
    /// Mock returning neutral defaults: empty tags with completeness 0.8,
    /// legitimacy 0.9, empty extraction.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tags: Mutex::new(ClassifyTags {
                completeness: 0.8,
                ..ClassifyTags::default()
            }),
            score: Mutex::new(0.9),
            extraction: Mutex::new(serde_json::json!({})),
            transient_failures: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    /// Set the classification tags returned by `classify`.
    #[must_use]
    pub fn with_tags(self, tags: ClassifyTags) -> Self {
        *self.tags.lock() = tags;
        self
    }

    /// Set the legitimacy score returned by `score`.
    #[must_use]
    pub fn with_score(self, score: f64) -> Self {
        *self.score.lock() = score;
        self
    }

    /// Set the structured value returned by `extract`.
    #[must_use]
    pub fn with_extraction(self, value: serde_json::Value) -> Self {
        *self.extraction.lock() = value;
        self
    }

    /// Make the next `n` calls fail with a transient error.
    pub fn fail_next_calls(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Total calls across all three operations.
    #[must_use]
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check_failure(&self, operation: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::transient(operation, "injected failure"));
        }
        Ok(())
    }
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn extract(&self, _text: &str, _schema: &serde_json::Value) -> Result<serde_json::Value> {
        self.check_failure("llm.extract")?;
        Ok(self.extraction.lock().clone())
    }

    async fn classify(&self, _text: &str) -> Result<ClassifyTags> {
        self.check_failure("llm.classify")?;
        Ok(self.tags.lock().clone())
    }

    async fn score(&self, _candidate: &serde_json::Value) -> Result<f64> {
        self.check_failure("llm.score")?;
        Ok(*self.score.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_canned_responses() {
        let llm = MockLlm::new().with_score(0.42);
        assert_eq!(llm.score(&serde_json::json!({})).await.unwrap(), 0.42);
        let tags = llm.classify("text").await.unwrap();
        assert_eq!(tags.completeness, 0.8);
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_failure_injection_then_recovery() {
        let llm = MockLlm::new();
        llm.fail_next_calls(1);
        assert!(llm.classify("text").await.is_err());
        assert!(llm.classify("text").await.is_ok());
    }
}
