//! Pipeline wiring: one task per stage, bounded channels between stages,
//! a shared shutdown signal.
//!
//! ```text
//! Collectors -> Router -> Classifier -> Deduplicator -> Validator -> Publisher
//!                              |  ^
//!                              v  |
//!                         Scrape Queue -> (deep-crawl collector)
//! ```
//!
//! Every bounded channel is a backpressure point; every stage receives the
//! shutdown watch and lets its in-flight record complete before exiting.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::adapters::{HttpFetcher, LlmClient, OpportunityStore, VectorIndex};
use crate::classify::{Classifier, ClassifyDecision};
use crate::collector::CollectorContext;
use crate::config::PipelineConfig;
use crate::dedup::{DedupOutcome, DedupVerdict, DeduplicationEngine};
use crate::error::Result;
use crate::health::{Outcome, SourceHealthRegistry};
use crate::metrics;
use crate::publish::{PublishOutcome, Publisher};
use crate::queue::PersistedQueue;
use crate::record::CandidateRecord;
use crate::router::RouterHandle;
use crate::scrape::{ScrapeFetched, ScrapeQueueManager};
use crate::validate::{Validation, ValidationTier, Validator};

/// Capacity of the inter-stage channels.
const STAGE_CHANNEL_CAPACITY: usize = 64;
/// How often the park sweeper looks for expired enrichment waits.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// External collaborators injected into the pipeline.
#[derive(Clone)]
pub struct Adapters {
    /// Opportunity store
    pub store: Arc<dyn OpportunityStore>,
    /// Embedding/vector index
    pub vector: Arc<dyn VectorIndex>,
    /// LLM client
    pub llm: Arc<dyn LlmClient>,
    /// HTTP fetcher for scrape workers
    pub fetcher: Arc<dyn HttpFetcher>,
}

/// A running pipeline.
pub struct Pipeline {
    health: Arc<SourceHealthRegistry>,
    router: RouterHandle,
    queue: PersistedQueue,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    fetched_rx: Option<mpsc::Receiver<ScrapeFetched>>,
}

impl Pipeline {
    /// Spawn every stage task and return the running pipeline.
    pub async fn spawn(config: PipelineConfig, adapters: Adapters) -> Result<Pipeline> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let health = Arc::new(SourceHealthRegistry::new(
            &config.breaker,
            &config.rate_limit,
        ));
        let queue = PersistedQueue::open(config.queue_db_path.clone()).await?;

        let (router, dispatcher) = crate::router::channel(&config.router, Arc::clone(&health));

        let classifier = Arc::new(Classifier::new(
            Arc::clone(&adapters.llm),
            queue.clone(),
            config.classifier.clone(),
            config.timeouts.clone(),
        ));
        let engine = Arc::new(DeduplicationEngine::new(
            Arc::clone(&adapters.store),
            Arc::clone(&adapters.vector),
            config.dedup.clone(),
            config.timeouts.clone(),
        ));
        let validator = Arc::new(Validator::new(
            Arc::clone(&adapters.llm),
            Arc::clone(&health),
            config.validator.clone(),
            config.timeouts.clone(),
        ));
        let publisher = Arc::new(Publisher::new(
            Arc::clone(&adapters.store),
            Arc::clone(&adapters.vector),
            queue.clone(),
            router.clone(),
            config.publish.clone(),
            config.timeouts.clone(),
        ));

        let (classify_tx, classify_rx) = mpsc::channel::<CandidateRecord>(STAGE_CHANNEL_CAPACITY);
        let (dedup_tx, dedup_rx) = mpsc::channel::<CandidateRecord>(STAGE_CHANNEL_CAPACITY);
        let (validate_tx, validate_rx) =
            mpsc::channel::<(CandidateRecord, DedupOutcome)>(STAGE_CHANNEL_CAPACITY);
        let (publish_tx, publish_rx) =
            mpsc::channel::<(CandidateRecord, DedupOutcome, Validation)>(STAGE_CHANNEL_CAPACITY);
        let (fetched_tx, fetched_rx) = mpsc::channel::<ScrapeFetched>(STAGE_CHANNEL_CAPACITY);
        let (released_tx, released_rx) = mpsc::channel::<Vec<String>>(STAGE_CHANNEL_CAPACITY);

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(
            dispatcher.run(classify_tx, shutdown_rx.clone()),
        ));

        tasks.push(tokio::spawn(classify_stage(
            Arc::clone(&classifier),
            Arc::clone(&health),
            classify_rx,
            dedup_tx.clone(),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(park_sweeper(
            Arc::clone(&classifier),
            dedup_tx.clone(),
            released_rx,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(dedup_stage(
            engine,
            dedup_rx,
            validate_tx,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(validate_stage(
            validator,
            Arc::clone(&health),
            validate_rx,
            publish_tx,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(publish_stage(
            publisher,
            Arc::clone(&health),
            publish_rx,
            shutdown_rx.clone(),
        )));

        let manager = Arc::new(ScrapeQueueManager::new(
            queue.clone(),
            Arc::clone(&adapters.fetcher),
            config.scrape.clone(),
            config.timeouts.clone(),
            fetched_tx,
            released_tx,
        ));
        tasks.extend(manager.spawn_workers(shutdown_rx.clone()));
        tasks.push(health.spawn_decay_ticker(shutdown_rx));

        info!(tasks = tasks.len(), "pipeline started");
        Ok(Pipeline {
            health,
            router,
            queue,
            shutdown_tx,
            tasks,
            fetched_rx: Some(fetched_rx),
        })
    }

    /// Producer handle for collectors.
    #[must_use]
    pub fn router_handle(&self) -> RouterHandle {
        self.router.clone()
    }

    /// Shared health registry.
    #[must_use]
    pub fn health(&self) -> Arc<SourceHealthRegistry> {
        Arc::clone(&self.health)
    }

    /// The persisted queues (scrape/review/dead-letter).
    #[must_use]
    pub fn queue(&self) -> PersistedQueue {
        self.queue.clone()
    }

    /// Context for running a collector against this pipeline.
    #[must_use]
    pub fn collector_context(&self) -> CollectorContext {
        CollectorContext {
            router: self.router.clone(),
            health: Arc::clone(&self.health),
            shutdown: self.shutdown_tx.subscribe(),
        }
    }

    /// Take the stream of successfully fetched scrape targets. The
    /// deep-crawl collector consumes this exactly once.
    pub fn take_scrape_fetched(&mut self) -> Option<mpsc::Receiver<ScrapeFetched>> {
        self.fetched_rx.take()
    }

    /// Signal shutdown and wait for every stage to finish its in-flight
    /// record.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        self.queue.close().await;
        info!("pipeline stopped");
    }
}

async fn classify_stage(
    classifier: Arc<Classifier>,
    health: Arc<SourceHealthRegistry>,
    mut rx: mpsc::Receiver<CandidateRecord>,
    dedup_tx: mpsc::Sender<CandidateRecord>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let record = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() { break; }
                continue;
            }
            record = rx.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };
        let collector = record.collector;
        let timer = std::time::Instant::now();
        match classifier.process(record).await {
            Ok(ClassifyDecision::Forwarded(candidate)) => {
                if dedup_tx.send(*candidate).await.is_err() {
                    break;
                }
            }
            Ok(ClassifyDecision::Rejected { reason }) => {
                health.record_outcome(collector, &Outcome::Rejected(reason));
            }
            Ok(ClassifyDecision::Parked | ClassifyDecision::Dropped { .. }) => {}
            Err(e) => {
                warn!(error = %e, "classification failed");
                health.record_outcome(collector, &Outcome::SoftFailure(e.to_string()));
            }
        }
        metrics::STAGE_LATENCY_SECONDS
            .with_label_values(&["classify"])
            .observe(timer.elapsed().as_secs_f64());
    }
    debug!("classify stage stopped");
}

/// Forwards expired parks and scrape-failure releases into dedup.
async fn park_sweeper(
    classifier: Arc<Classifier>,
    dedup_tx: mpsc::Sender<CandidateRecord>,
    mut released_rx: mpsc::Receiver<Vec<String>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        let released = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() { break; }
                continue;
            }
            hashes = released_rx.recv() => match hashes {
                Some(hashes) => classifier.release(&hashes),
                None => break,
            },
            _ = tick.tick() => classifier.release_expired(),
        };
        for candidate in released {
            if dedup_tx.send(candidate).await.is_err() {
                return;
            }
        }
    }
    debug!("park sweeper stopped");
}

async fn dedup_stage(
    engine: Arc<DeduplicationEngine>,
    mut rx: mpsc::Receiver<CandidateRecord>,
    validate_tx: mpsc::Sender<(CandidateRecord, DedupOutcome)>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let record = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() { break; }
                continue;
            }
            record = rx.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };
        let timer = std::time::Instant::now();
        let outcome = match engine.evaluate(&record).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // A corpus read failure must not stall the stage: treat the
                // record as unique and let the publisher's DuplicateKey
                // contract catch any true collision.
                warn!(content_hash = %record.content_hash, error = %e, "dedup corpus read failed; assuming unique");
                DedupOutcome {
                    verdict: DedupVerdict::Unique,
                    best: None,
                    matches: vec![],
                    resolved_org: None,
                }
            }
        };
        metrics::STAGE_LATENCY_SECONDS
            .with_label_values(&["dedup"])
            .observe(timer.elapsed().as_secs_f64());
        if validate_tx.send((record, outcome)).await.is_err() {
            break;
        }
    }
    debug!("dedup stage stopped");
}

async fn validate_stage(
    validator: Arc<Validator>,
    health: Arc<SourceHealthRegistry>,
    mut rx: mpsc::Receiver<(CandidateRecord, DedupOutcome)>,
    publish_tx: mpsc::Sender<(CandidateRecord, DedupOutcome, Validation)>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (record, dedup) = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() { break; }
                continue;
            }
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        let collector = record.collector;
        let timer = std::time::Instant::now();
        match validator.validate(&record, &dedup).await {
            Ok(validation) => {
                metrics::STAGE_LATENCY_SECONDS
                    .with_label_values(&["validate"])
                    .observe(timer.elapsed().as_secs_f64());
                if validation.tier == ValidationTier::Reject {
                    metrics::STAGE_RECORDS_TOTAL
                        .with_label_values(&["validate", "rejected"])
                        .inc();
                    health.record_outcome(
                        collector,
                        &Outcome::Rejected(validation.reasons.join(",")),
                    );
                    continue;
                }
                if publish_tx.send((record, dedup, validation)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(content_hash = %record.content_hash, error = %e, "validation failed");
                health.record_outcome(collector, &Outcome::SoftFailure(e.to_string()));
            }
        }
    }
    debug!("validate stage stopped");
}

async fn publish_stage(
    publisher: Arc<Publisher>,
    health: Arc<SourceHealthRegistry>,
    mut rx: mpsc::Receiver<(CandidateRecord, DedupOutcome, Validation)>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (record, dedup, validation) = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() { break; }
                continue;
            }
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        let collector = record.collector;
        let timer = std::time::Instant::now();
        let outcome = publisher.publish(record, &dedup, &validation).await;
        let latency = timer.elapsed();
        metrics::STAGE_LATENCY_SECONDS
            .with_label_values(&["publish"])
            .observe(latency.as_secs_f64());
        match outcome {
            PublishOutcome::Inserted { .. } | PublishOutcome::Merged { .. } => {
                health.record_outcome(
                    collector,
                    &Outcome::Success {
                        latency,
                        quality_hint: Some(validation.confidence),
                    },
                );
            }
            PublishOutcome::Reviewed { .. } => {
                // Review items are a success for the source, with a
                // conservative quality hint until an operator adjudicates.
                health.record_outcome(
                    collector,
                    &Outcome::Success {
                        latency,
                        quality_hint: Some(0.5),
                    },
                );
            }
            PublishOutcome::Requeued | PublishOutcome::DeadLettered => {
                health.record_outcome(
                    collector,
                    &Outcome::SoftFailure("store write failed".to_string()),
                );
            }
        }
    }
    debug!("publish stage stopped");
}
