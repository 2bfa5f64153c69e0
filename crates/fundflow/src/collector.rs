//! The collector contract.
//!
//! A collector is one long-running task producing [`CandidateRecord`]s into
//! the router. The context it runs under carries the shutdown signal, the
//! router's backpressure hint and the shared health/rate registries, so
//! every collector gets uniform admission, content-hash dedupe and outcome
//! reporting without reimplementing them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{Error, Result};
use crate::health::{Outcome, SourceHealthRegistry};
use crate::record::{CandidateRecord, CollectorKind};
use crate::router::RouterHandle;

/// A source of candidate records. Implementations live in
/// `fundflow-collectors`.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Which collector this is.
    fn id(&self) -> CollectorKind;

    /// Run until the context's shutdown signal flips. Emission order must
    /// be stable: records are submitted in the order they were produced.
    async fn run(&self, ctx: CollectorContext) -> Result<()>;
}

/// Bound on remembered content-hashes per collector.
const SEEN_CAPACITY: usize = 50_000;

/// Bounded set of content-hashes already emitted, so re-ingesting an
/// identical raw payload is dropped before it reaches the router.
pub struct SeenHashes {
    hashes: Mutex<HashSet<String>>,
}

impl SeenHashes {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hashes: Mutex::new(HashSet::new()),
        }
    }

    /// Record `hash`; returns false when it was already present.
    pub fn insert(&self, hash: &str) -> bool {
        let mut hashes = self.hashes.lock();
        if hashes.contains(hash) {
            return false;
        }
        if hashes.len() >= SEEN_CAPACITY {
            hashes.clear(); // coarse reset; re-emission is caught downstream
        }
        hashes.insert(hash.to_string())
    }
}

impl Default for SeenHashes {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a collector needs to participate in the pipeline.
#[derive(Clone)]
pub struct CollectorContext {
    /// Producer handle into the router
    pub router: RouterHandle,
    /// Shared health/rate registry
    pub health: Arc<SourceHealthRegistry>,
    /// Flips to true on shutdown
    pub shutdown: watch::Receiver<bool>,
}

impl CollectorContext {
    /// True once shutdown has been requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Wait for a rate-limit token before an outbound call, respecting the
    /// breaker. Returns an error if the breaker stays open past `patience`
    /// or shutdown arrives first.
    pub async fn acquire(&self, id: CollectorKind, patience: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + patience;
        let mut shutdown = self.shutdown.clone();
        loop {
            let admission = self.health.try_acquire(id);
            if admission.allowed {
                return Ok(());
            }
            let wait = admission
                .wait_hint
                .unwrap_or(Duration::from_millis(250))
                .min(Duration::from_secs(5));
            if tokio::time::Instant::now() + wait > deadline {
                return Err(Error::BreakerOpen {
                    collector: id.as_str().to_string(),
                    wait_hint: admission.wait_hint.unwrap_or(wait),
                });
            }
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Err(Error::InternalInvariant("shutdown".to_string()));
                    }
                }
            }
        }
    }

    /// Submit a record, honoring backpressure: a full queue suspends the
    /// collector until the router's hint clears, an open breaker is
    /// surfaced to the caller, and a duplicate content-hash is dropped
    /// silently.
    pub async fn emit(&self, seen: &SeenHashes, record: CandidateRecord) -> Result<bool> {
        if !seen.insert(&record.content_hash) {
            debug!(
                collector = %record.collector,
                content_hash = %record.content_hash,
                "duplicate content hash dropped at collector"
            );
            return Ok(false);
        }

        self.submit_with_backpressure(record).await?;
        Ok(true)
    }

    /// Submit without the content-hash check. Enriched records re-entering
    /// the router use this: their dedupe identity is the park they replace,
    /// not their page content.
    pub async fn submit_with_backpressure(&self, record: CandidateRecord) -> Result<()> {
        let mut hint = self.router.suspend_hint();
        let mut shutdown = self.shutdown.clone();
        loop {
            match self.router.submit(record.clone()) {
                Ok(()) => return Ok(()),
                Err(Error::QueueFull { .. }) => {
                    // Shed: pause until the router's suspend hint clears.
                    while *hint.borrow() {
                        if *shutdown.borrow() {
                            return Err(Error::InternalInvariant("shutdown".to_string()));
                        }
                        tokio::select! {
                            changed = hint.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            _ = shutdown.changed() => {}
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Report an outcome for this collector.
    pub fn report(&self, id: CollectorKind, outcome: &Outcome) {
        self.health.record_outcome(id, outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, RateLimitConfig, RouterConfig};
    use crate::record::{ExtractedFields, RawPayload};

    fn context(
        tier_capacity: usize,
    ) -> (
        CollectorContext,
        crate::router::RouterDispatcher,
        watch::Sender<bool>,
    ) {
        let health = Arc::new(SourceHealthRegistry::new(
            &BreakerConfig::default(),
            &RateLimitConfig {
                quota_per_minute: 6000,
            },
        ));
        let (router, dispatcher) =
            crate::router::channel(&RouterConfig { tier_capacity }, Arc::clone(&health));
        let (shutdown_tx, shutdown) = watch::channel(false);
        (
            CollectorContext {
                router,
                health,
                shutdown,
            },
            dispatcher,
            shutdown_tx,
        )
    }

    fn record(title: &str) -> CandidateRecord {
        CandidateRecord::new(
            CollectorKind::Rss,
            RawPayload::Text(title.to_string()),
            ExtractedFields {
                title: title.to_string(),
                ..ExtractedFields::default()
            },
            vec![],
        )
    }

    #[test]
    fn test_seen_hashes_dedupe() {
        let seen = SeenHashes::new();
        assert!(seen.insert("abc"));
        assert!(!seen.insert("abc"));
        assert!(seen.insert("def"));
    }

    #[tokio::test]
    async fn test_emit_drops_duplicate_content_silently() {
        let (ctx, _dispatcher, _shutdown_tx) = context(8);
        let seen = SeenHashes::new();
        let rec = record("same payload");
        assert!(ctx.emit(&seen, rec.clone()).await.unwrap());
        // Identical payload -> identical content-hash -> dropped, no error.
        assert!(!ctx.emit(&seen, rec).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_respects_open_breaker() {
        let (ctx, _dispatcher, _shutdown_tx) = context(8);
        for _ in 0..5 {
            ctx.report(
                CollectorKind::Rss,
                &Outcome::HardFailure("down".to_string()),
            );
        }
        let err = ctx
            .acquire(CollectorKind::Rss, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BreakerOpen { .. }));
    }
}
