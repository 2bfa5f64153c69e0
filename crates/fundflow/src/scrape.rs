// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Scrape-Queue Manager: a worker pool over the persisted scrape queue.
//!
//! Workers claim the highest-priority ready request, honor per-domain
//! token buckets, and fetch with the pipeline's HTTP deadline. Successful
//! fetches flow to the deep-crawl collector for extraction; exhausted
//! requests release their subscribed candidates so the classifier can
//! forward them unenriched. Retries use exponential backoff with jitter
//! to avoid thundering herds against a recovering site.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::adapters::HttpFetcher;
use crate::config::{ScrapeConfig, TimeoutConfig};
use crate::metrics;
use crate::queue::{PersistedQueue, StoredScrapeRequest};
use crate::ratelimit::DomainRateLimiter;

/// A successfully fetched scrape request, ready for extraction.
#[derive(Debug)]
pub struct ScrapeFetched {
    /// The claimed request
    pub request: StoredScrapeRequest,
    /// HTTP status of the fetch
    pub status: u16,
    /// Response body
    pub body: String,
    /// Candidate hashes subscribed to this URL
    pub subscribers: Vec<String>,
}

/// The scrape worker pool.
pub struct ScrapeQueueManager {
    queue: PersistedQueue,
    fetcher: Arc<dyn HttpFetcher>,
    domains: Arc<DomainRateLimiter>,
    config: ScrapeConfig,
    timeouts: TimeoutConfig,
    /// Successful fetches, consumed by the deep-crawl collector
    fetched_tx: mpsc::Sender<ScrapeFetched>,
    /// Candidate hashes released by final failures, consumed by the
    /// pipeline to un-park candidates
    released_tx: mpsc::Sender<Vec<String>>,
}

impl ScrapeQueueManager {
    /// Build a manager over the shared queue and fetcher.
    #[must_use]
    pub fn new(
        queue: PersistedQueue,
        fetcher: Arc<dyn HttpFetcher>,
        config: ScrapeConfig,
        timeouts: TimeoutConfig,
        fetched_tx: mpsc::Sender<ScrapeFetched>,
        released_tx: mpsc::Sender<Vec<String>>,
    ) -> Self {
        let domains = Arc::new(DomainRateLimiter::new(config.domain_quota_per_minute));
        Self {
            queue,
            fetcher,
            domains,
            config,
            timeouts,
            fetched_tx,
            released_tx,
        }
    }

    /// Spawn the worker pool; workers run until `shutdown` flips to true.
    #[must_use]
    pub fn spawn_workers(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.config.workers.max(1))
            .map(|i| {
                let manager = Arc::clone(&self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    manager.worker_loop(&format!("scrape-worker-{i}"), shutdown).await;
                })
            })
            .collect()
    }

    async fn worker_loop(&self, worker_id: &str, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                debug!(worker = worker_id, "scrape worker shutting down");
                break;
            }
            let claimed = match self.queue.scrape_claim_next_ready(worker_id).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(worker = worker_id, error = %e, "claim failed; backing off");
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };
            let Some(request) = claimed else {
                // Idle: wait for the poll interval or shutdown.
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };
            self.process(worker_id, request).await;
        }
    }

    async fn process(&self, worker_id: &str, request: StoredScrapeRequest) {
        // Per-domain politeness: a denied claim is deferred, not failed,
        // and does not consume an attempt.
        let admission = self.domains.try_acquire(&request.host);
        if !admission.allowed {
            let wait = admission.wait_hint.unwrap_or(self.config.poll_interval);
            let at = Utc::now().timestamp() + wait.as_secs().max(1) as i64;
            if let Err(e) = self
                .queue
                .scrape_defer(request.id, "per-domain rate limit", at)
                .await
            {
                warn!(worker = worker_id, error = %e, "defer failed");
            }
            return;
        }

        debug!(
            worker = worker_id,
            url = %request.url,
            attempt = request.attempts,
            "fetching scrape target"
        );
        let result = self
            .fetcher
            .fetch(&request.url, &Default::default(), self.timeouts.http)
            .await;

        match result {
            Ok(response) if (200..300).contains(&response.status) => {
                match self.queue.scrape_complete(request.id).await {
                    Ok(subscribers) => {
                        metrics::SCRAPE_REQUESTS_TOTAL
                            .with_label_values(&["completed"])
                            .inc();
                        let fetched = ScrapeFetched {
                            request,
                            status: response.status,
                            body: response.body,
                            subscribers,
                        };
                        if self.fetched_tx.send(fetched).await.is_err() {
                            warn!("deep-crawl consumer closed; dropping fetched page");
                        }
                    }
                    Err(e) => warn!(worker = worker_id, error = %e, "complete failed"),
                }
            }
            Ok(response) => {
                self.handle_failure(&request, format!("HTTP {}", response.status))
                    .await;
            }
            Err(e) => {
                self.handle_failure(&request, e.to_string()).await;
            }
        }
    }

    async fn handle_failure(&self, request: &StoredScrapeRequest, error: String) {
        if request.attempts >= request.max_attempts {
            warn!(
                url = %request.url,
                attempts = request.attempts,
                error = %error,
                "scrape attempts exhausted; releasing parked candidates"
            );
            metrics::SCRAPE_REQUESTS_TOTAL
                .with_label_values(&["failed"])
                .inc();
            match self.queue.scrape_fail(request.id, &error).await {
                Ok(subscribers) if !subscribers.is_empty() => {
                    let _ = self.released_tx.send(subscribers).await;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "failed to mark scrape request failed"),
            }
            return;
        }

        let delay = backoff_delay(&self.config, request.attempts);
        let at = Utc::now().timestamp() + delay.as_secs() as i64;
        debug!(
            url = %request.url,
            attempt = request.attempts,
            delay_secs = delay.as_secs(),
            error = %error,
            "scrape failed, retrying"
        );
        metrics::SCRAPE_REQUESTS_TOTAL
            .with_label_values(&["retrying"])
            .inc();
        if let Err(e) = self.queue.scrape_retry(request.id, &error, at).await {
            warn!(error = %e, "failed to reschedule scrape request");
        }
    }
}

/// Exponential backoff with jitter: `base * 2^(attempt-1)`, capped, then
/// +/- `jitter_frac`.
#[must_use]
pub fn backoff_delay(config: &ScrapeConfig, attempt: u32) -> Duration {
    let exp = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    let base = config
        .backoff_base
        .as_secs_f64()
        .min(config.backoff_cap.as_secs_f64());
    let delay = (base * exp as f64).min(config.backoff_cap.as_secs_f64());
    // Jitter in [-jitter_frac, +jitter_frac] to prevent thundering herd.
    let jitter = 1.0 + config.jitter_frac * (rand::thread_rng().gen::<f64>() * 2.0 - 1.0);
    Duration::from_secs_f64((delay * jitter).max(0.0))
}
