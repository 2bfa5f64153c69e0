//! Publisher: the only component that writes to the external store.
//!
//! Auto-approved records are inserted (or merged when their dedup-hash is
//! already published); review-tier records go to the persisted review
//! queue; candidates whose store writes ultimately fail are requeued at
//! low priority and dead-lettered once their pipeline attempts run out.
//! Writes are serialized per dedup-hash so concurrent insert/merge for the
//! same semantic record cannot interleave; different hashes publish in
//! parallel.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{AuditEntry, OpportunityPatch, OpportunityStore, OrganizationAttrs, VectorIndex};
use crate::config::{PublishConfig, TimeoutConfig};
use crate::dead_letter::DeadLetterEntry;
use crate::dedup::{DedupOutcome, DedupVerdict};
use crate::error::{Error, Result};
use crate::metrics;
use crate::queue::PersistedQueue;
use crate::record::{
    CandidateRecord, OpportunityRecord, OpportunityStatus, Priority, VerificationStatus,
};
use crate::router::RouterHandle;
use crate::validate::{Validation, ValidationTier};

/// Terminal routing of one candidate through the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Inserted as a new opportunity
    Inserted {
        /// Store-assigned id
        id: String,
    },
    /// Merged into an existing opportunity
    Merged {
        /// Target opportunity id
        id: String,
    },
    /// Appended to the review queue
    Reviewed {
        /// Review-queue row id
        review_id: i64,
    },
    /// Store failure; requeued to the router at low priority
    Requeued,
    /// Pipeline attempts exhausted; written to the dead-letter sink
    DeadLettered,
}

/// The publish stage.
pub struct Publisher {
    store: Arc<dyn OpportunityStore>,
    vector: Arc<dyn VectorIndex>,
    queue: PersistedQueue,
    router: RouterHandle,
    config: PublishConfig,
    timeouts: TimeoutConfig,
    /// Per-dedup-hash write serialization.
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl Publisher {
    /// Build a publisher over the store, vector index and persisted queues.
    #[must_use]
    pub fn new(
        store: Arc<dyn OpportunityStore>,
        vector: Arc<dyn VectorIndex>,
        queue: PersistedQueue,
        router: RouterHandle,
        config: PublishConfig,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            store,
            vector,
            queue,
            router,
            config,
            timeouts,
            locks: DashMap::new(),
        }
    }

    /// Publish a validated candidate: insert, merge or enqueue for review.
    pub async fn publish(
        &self,
        candidate: CandidateRecord,
        dedup: &DedupOutcome,
        validation: &Validation,
    ) -> PublishOutcome {
        match self.try_publish(&candidate, dedup, validation).await {
            Ok(outcome) => outcome,
            Err(e) => self.handle_failure(candidate, &e).await,
        }
    }

    async fn try_publish(
        &self,
        candidate: &CandidateRecord,
        dedup: &DedupOutcome,
        validation: &Validation,
    ) -> Result<PublishOutcome> {
        if validation.tier == ValidationTier::Review {
            return self.enqueue_review(candidate, dedup, validation).await;
        }

        // Semantic key; candidates without the fields for a full signature
        // fall back to their content identity so the per-hash lock still
        // serializes them.
        let dedup_hash = candidate
            .dedup_hash()
            .unwrap_or_else(|| candidate.content_hash.clone());

        let lock = Arc::clone(
            &self
                .locks
                .entry(dedup_hash.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .value(),
        );
        let _guard = lock.lock().await;

        // A hard duplicate verdict goes straight to a merge with the
        // strongest match.
        if dedup.verdict == DedupVerdict::Duplicate {
            if let Some(best) = &dedup.best {
                let id = best.existing_id.clone();
                self.merge(candidate, &id, validation).await?;
                return Ok(PublishOutcome::Merged { id });
            }
        }

        let opportunity = self.build_opportunity(candidate, dedup, validation, &dedup_hash).await?;
        match self
            .with_store_retry("store.insert", || async {
                self.store.insert_opportunity(&opportunity).await
            })
            .await
        {
            Ok(id) => {
                self.audit("insert", &id, "auto-approved by validator").await;
                self.upsert_embedding(&id, candidate).await;
                info!(
                    opportunity_id = %id,
                    dedup_hash = %dedup_hash,
                    confidence = validation.confidence,
                    "opportunity published"
                );
                metrics::STAGE_RECORDS_TOTAL
                    .with_label_values(&["publish", "inserted"])
                    .inc();
                Ok(PublishOutcome::Inserted { id })
            }
            Err(Error::DuplicateKey(_)) => {
                // Lost the race (or dedup missed a just-published record):
                // redirect to a merge with the published holder of the hash.
                let existing = self
                    .with_store_retry("store.find_by_dedup_hash", || async {
                        self.store.find_by_dedup_hash(&dedup_hash).await
                    })
                    .await?
                    .ok_or_else(|| {
                        Error::InternalInvariant(format!(
                            "dedup-hash {dedup_hash} reported duplicate but is not findable"
                        ))
                    })?;
                self.merge(candidate, &existing.id, validation).await?;
                Ok(PublishOutcome::Merged { id: existing.id })
            }
            Err(e) => Err(e),
        }
    }

    async fn merge(
        &self,
        candidate: &CandidateRecord,
        existing_id: &str,
        validation: &Validation,
    ) -> Result<()> {
        let patch = OpportunityPatch {
            add_source_urls: candidate.source_urls.clone(),
            add_merged_from: vec![candidate.content_hash.clone()],
            // The store applies confidence monotonically: it never
            // decreases an already-published record's confidence.
            confidence: Some(validation.confidence),
        };
        self.with_store_retry("store.merge", || async {
            self.store.merge_opportunity(existing_id, &patch).await
        })
        .await?;
        self.audit(
            "merge",
            existing_id,
            &format!("duplicate of candidate {}", candidate.content_hash),
        )
        .await;
        metrics::STAGE_RECORDS_TOTAL
            .with_label_values(&["publish", "merged"])
            .inc();
        debug!(
            opportunity_id = %existing_id,
            candidate = %candidate.content_hash,
            "merged duplicate candidate"
        );
        Ok(())
    }

    async fn enqueue_review(
        &self,
        candidate: &CandidateRecord,
        dedup: &DedupOutcome,
        validation: &Validation,
    ) -> Result<PublishOutcome> {
        let payload = serde_json::json!({
            "candidate": candidate,
            "confidence": validation.confidence,
            "dedup_verdict": dedup.verdict.as_str(),
            "best_match": dedup.best,
        });
        let review_id = self
            .queue
            .review_enqueue(payload, validation.reasons.clone())
            .await?;
        self.audit(
            "enqueue_review",
            &candidate.content_hash,
            &validation.reasons.join(","),
        )
        .await;
        metrics::STAGE_RECORDS_TOTAL
            .with_label_values(&["publish", "reviewed"])
            .inc();
        Ok(PublishOutcome::Reviewed { review_id })
    }

    async fn build_opportunity(
        &self,
        candidate: &CandidateRecord,
        dedup: &DedupOutcome,
        validation: &Validation,
        dedup_hash: &str,
    ) -> Result<OpportunityRecord> {
        let organization_id = match &dedup.resolved_org {
            Some(resolved) => resolved.id.clone(),
            None => {
                let attrs = OrganizationAttrs {
                    name: candidate
                        .fields
                        .primary_organization()
                        .unwrap_or("unknown")
                        .to_string(),
                    country: candidate.fields.geography.first().cloned(),
                };
                self.with_store_retry("store.find_or_create_organization", || async {
                    self.store.find_or_create_organization(&attrs).await
                })
                .await?
            }
        };

        Ok(OpportunityRecord {
            id: Uuid::new_v4().to_string(),
            dedup_hash: dedup_hash.to_string(),
            organization_id,
            fields: candidate.fields.clone(),
            source_urls: candidate.source_urls.clone(),
            merged_from: vec![candidate.content_hash.clone()],
            verification: VerificationStatus::Unverified,
            confidence: validation.confidence,
            equity_annotations: equity_annotations(candidate),
            status: OpportunityStatus::Active,
            published_at: Utc::now(),
        })
    }

    /// Store failure path: requeue at low priority with one more attempt
    /// consumed; dead-letter once the pipeline attempt budget is gone.
    async fn handle_failure(&self, mut candidate: CandidateRecord, error: &Error) -> PublishOutcome {
        candidate.attempts += 1;
        if candidate.attempts >= self.config.max_pipeline_attempts {
            return self.dead_letter(candidate, error).await;
        }
        candidate.priority = Priority::Low;
        warn!(
            content_hash = %candidate.content_hash,
            attempts = candidate.attempts,
            error = %error,
            "publish failed; requeueing at low priority"
        );
        match self.router.submit(candidate.clone()) {
            Ok(()) => PublishOutcome::Requeued,
            Err(submit_err) => {
                warn!(error = %submit_err, "requeue failed; dead-lettering");
                self.dead_letter(candidate, error).await
            }
        }
    }

    async fn dead_letter(&self, candidate: CandidateRecord, error: &Error) -> PublishOutcome {
        let stage = "publish";
        metrics::DEAD_LETTER_TOTAL.with_label_values(&[stage]).inc();
        let entry = DeadLetterEntry::new(candidate, stage, error);
        warn!(
            candidate = %entry.candidate_hash,
            trace_id = %entry.trace_id,
            error = %entry.error,
            "candidate dead-lettered"
        );
        if let Err(e) = self.queue.dead_letter_put(entry).await {
            warn!(error = %e, "dead-letter write failed; record context is lost");
        }
        PublishOutcome::DeadLettered
    }

    async fn audit(&self, action: &str, subject: &str, reason: &str) {
        let entry = AuditEntry::publisher(action, subject, reason);
        if let Err(e) = self.store.append_audit_log(&entry).await {
            warn!(action, subject, error = %e, "audit log write failed");
        }
    }

    /// Best-effort embedding upsert so future semantic dedup sees this
    /// record. Failures only log.
    async fn upsert_embedding(&self, id: &str, candidate: &CandidateRecord) {
        let text = format!(
            "{} {}",
            candidate.fields.title, candidate.fields.description
        );
        if text.trim().is_empty() {
            return;
        }
        let embedded =
            match tokio::time::timeout(self.timeouts.embedding, self.vector.embed(&text)).await {
                Ok(Ok(vector)) => vector,
                Ok(Err(e)) => {
                    debug!(error = %e, "embedding upsert skipped");
                    return;
                }
                Err(_) => return,
            };
        let metadata = serde_json::json!({ "content_hash": candidate.content_hash });
        if let Ok(Err(e)) = tokio::time::timeout(
            self.timeouts.embedding,
            self.vector.upsert(id, &embedded, metadata),
        )
        .await
        {
            debug!(error = %e, "vector upsert failed");
        }
    }

    async fn with_store_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match tokio::time::timeout(self.timeouts.store, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if e.is_transient() && attempt < self.config.store_retry_attempts => {
                    let exp = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                    let delay = Duration::from_millis(
                        self.config
                            .store_retry_base
                            .as_millis()
                            .saturating_mul(u128::from(exp))
                            .min(self.config.store_retry_cap.as_millis())
                            as u64,
                    );
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient store error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(Error::DeadlineExceeded {
                        operation: operation.to_string(),
                        deadline: self.timeouts.store,
                    })
                }
            }
        }
    }
}

fn equity_annotations(candidate: &CandidateRecord) -> Vec<String> {
    let mut annotations = Vec::new();
    let inclusion = &candidate.fields.inclusion;
    if inclusion.gender {
        annotations.push("inclusion:gender".to_string());
    }
    if inclusion.youth {
        annotations.push("inclusion:youth".to_string());
    }
    if inclusion.rural {
        annotations.push("inclusion:rural".to_string());
    }
    for geo in &candidate.fields.geography {
        annotations.push(format!("geography:{}", geo.to_lowercase()));
    }
    annotations
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::config::{BreakerConfig, RateLimitConfig, RouterConfig};
    use crate::dedup::{DedupStrategy, DuplicateMatch};
    use crate::health::SourceHealthRegistry;
    use crate::record::{CollectorKind, ExtractedFields, RawPayload};

    /// In-memory store honoring the DuplicateKey contract.
    struct MemoryStore {
        by_hash: Mutex<HashMap<String, OpportunityRecord>>,
        merges: Mutex<Vec<(String, OpportunityPatch)>>,
        audits: Mutex<Vec<AuditEntry>>,
        insert_failures: AtomicU32,
    }

    impl MemoryStore {
        fn new() -> Self {
            Self {
                by_hash: Mutex::new(HashMap::new()),
                merges: Mutex::new(Vec::new()),
                audits: Mutex::new(Vec::new()),
                insert_failures: AtomicU32::new(0),
            }
        }

        fn failing_inserts(n: u32) -> Self {
            let store = Self::new();
            store.insert_failures.store(n, Ordering::SeqCst);
            store
        }
    }

    #[async_trait]
    impl OpportunityStore for MemoryStore {
        async fn find_by_dedup_hash(&self, hash: &str) -> Result<Option<OpportunityRecord>> {
            Ok(self.by_hash.lock().get(hash).cloned())
        }

        async fn find_recent_in_window(&self, _days: u32) -> Result<Vec<OpportunityRecord>> {
            Ok(self.by_hash.lock().values().cloned().collect())
        }

        async fn find_or_create_organization(&self, attrs: &OrganizationAttrs) -> Result<String> {
            Ok(format!("org-{}", attrs.name.to_lowercase().replace(' ', "-")))
        }

        async fn insert_opportunity(&self, opportunity: &OpportunityRecord) -> Result<String> {
            if self
                .insert_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::transient("store.insert", "connection reset"));
            }
            let mut by_hash = self.by_hash.lock();
            if by_hash.contains_key(&opportunity.dedup_hash) {
                return Err(Error::DuplicateKey(opportunity.dedup_hash.clone()));
            }
            by_hash.insert(opportunity.dedup_hash.clone(), opportunity.clone());
            Ok(opportunity.id.clone())
        }

        async fn merge_opportunity(&self, id: &str, patch: &OpportunityPatch) -> Result<()> {
            let mut by_hash = self.by_hash.lock();
            let record = by_hash
                .values_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| Error::permanent("store.merge", "not found"))?;
            for url in &patch.add_source_urls {
                if !record.source_urls.contains(url) {
                    record.source_urls.push(url.clone());
                }
            }
            record.merged_from.extend(patch.add_merged_from.clone());
            if let Some(confidence) = patch.confidence {
                record.confidence = record.confidence.max(confidence);
            }
            self.merges.lock().push((id.to_string(), patch.clone()));
            Ok(())
        }

        async fn append_audit_log(&self, entry: &AuditEntry) -> Result<()> {
            self.audits.lock().push(entry.clone());
            Ok(())
        }
    }

    struct NoVectors;

    #[async_trait]
    impl VectorIndex for NoVectors {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(Error::permanent("vector.embed", "disabled"))
        }
        async fn upsert(&self, _id: &str, _v: &[f32], _m: serde_json::Value) -> Result<()> {
            Ok(())
        }
        async fn query_top_k(
            &self,
            _v: &[f32],
            _k: usize,
            _f: Option<serde_json::Value>,
        ) -> Result<Vec<(String, f32)>> {
            Ok(vec![])
        }
    }

    fn candidate(urls: Vec<&str>) -> CandidateRecord {
        CandidateRecord::new(
            CollectorKind::Rss,
            RawPayload::Text("body".to_string()),
            ExtractedFields {
                title: "Foo Ltd raises $5M".to_string(),
                description: "Round coverage".to_string(),
                amount_usd: Some(5_000_000.0),
                transaction_date: NaiveDate::from_ymd_opt(2026, 1, 15),
                organizations: vec!["Foo Ltd".to_string()],
                stage: Some("series a".to_string()),
                ..ExtractedFields::default()
            },
            urls.into_iter().map(str::to_string).collect(),
        )
    }

    fn unique() -> DedupOutcome {
        DedupOutcome {
            verdict: DedupVerdict::Unique,
            best: None,
            matches: vec![],
            resolved_org: None,
        }
    }

    fn auto_validation() -> Validation {
        Validation {
            confidence: 0.9,
            tier: ValidationTier::AutoApprove,
            reasons: vec![],
            legitimacy: 0.9,
        }
    }

    async fn publisher(store: Arc<MemoryStore>) -> (Publisher, PersistedQueue) {
        publisher_with_config(store, PublishConfig::default()).await
    }

    async fn publisher_with_config(
        store: Arc<MemoryStore>,
        config: PublishConfig,
    ) -> (Publisher, PersistedQueue) {
        let queue = PersistedQueue::open(None).await.unwrap();
        let health = Arc::new(SourceHealthRegistry::new(
            &BreakerConfig::default(),
            &RateLimitConfig::default(),
        ));
        let (router, _dispatcher) = crate::router::channel(&RouterConfig::default(), health);
        let publisher = Publisher::new(
            store,
            Arc::new(NoVectors),
            queue.clone(),
            router,
            config,
            TimeoutConfig::default(),
        );
        (publisher, queue)
    }

    #[tokio::test]
    async fn test_insert_then_same_hash_merges() {
        let store = Arc::new(MemoryStore::new());
        let (publisher, _queue) = publisher(Arc::clone(&store)).await;

        let first = candidate(vec!["https://a.example/1"]);
        let outcome = publisher.publish(first, &unique(), &auto_validation()).await;
        let PublishOutcome::Inserted { id } = outcome else {
            panic!("expected insert, got {outcome:?}");
        };

        // Textually different, semantically identical: same dedup-hash.
        let second = candidate(vec!["https://b.example/2"]);
        let outcome = publisher
            .publish(second, &unique(), &auto_validation())
            .await;
        assert_eq!(outcome, PublishOutcome::Merged { id: id.clone() });

        let by_hash = store.by_hash.lock();
        let record = by_hash.values().next().unwrap();
        assert_eq!(record.source_urls.len(), 2);
        assert_eq!(record.merged_from.len(), 2);
    }

    #[tokio::test]
    async fn test_merge_confidence_is_monotonic() {
        let store = Arc::new(MemoryStore::new());
        let (publisher, _queue) = publisher(Arc::clone(&store)).await;

        publisher
            .publish(
                candidate(vec!["https://a.example/1"]),
                &unique(),
                &auto_validation(),
            )
            .await;
        let low_confidence = Validation {
            confidence: 0.2,
            tier: ValidationTier::AutoApprove,
            reasons: vec![],
            legitimacy: 0.2,
        };
        publisher
            .publish(
                candidate(vec!["https://b.example/2"]),
                &unique(),
                &low_confidence,
            )
            .await;

        let by_hash = store.by_hash.lock();
        let record = by_hash.values().next().unwrap();
        assert_eq!(record.confidence, 0.9);
    }

    #[tokio::test]
    async fn test_duplicate_verdict_merges_into_best_match() {
        let store = Arc::new(MemoryStore::new());
        let (publisher, _queue) = publisher(Arc::clone(&store)).await;

        let first = candidate(vec!["https://a.example/1"]);
        let PublishOutcome::Inserted { id } = publisher
            .publish(first, &unique(), &auto_validation())
            .await
        else {
            panic!("expected insert");
        };

        let dedup = DedupOutcome {
            verdict: DedupVerdict::Duplicate,
            best: Some(DuplicateMatch {
                strategy: DedupStrategy::OrgFundingMatch,
                existing_id: id.clone(),
                existing_dedup_hash: "whatever".to_string(),
                score: 0.92,
            }),
            matches: vec![],
            resolved_org: None,
        };
        let outcome = publisher
            .publish(candidate(vec!["https://c.example/3"]), &dedup, &auto_validation())
            .await;
        assert_eq!(outcome, PublishOutcome::Merged { id });
        assert_eq!(store.merges.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_review_tier_goes_to_review_queue() {
        let store = Arc::new(MemoryStore::new());
        let (publisher, queue) = publisher(Arc::clone(&store)).await;

        let validation = Validation {
            confidence: 0.78,
            tier: ValidationTier::Review,
            reasons: vec!["medium_confidence".to_string()],
            legitimacy: 0.8,
        };
        let outcome = publisher
            .publish(candidate(vec!["https://a.example/1"]), &unique(), &validation)
            .await;
        assert!(matches!(outcome, PublishOutcome::Reviewed { .. }));
        assert!(store.by_hash.lock().is_empty());

        let items = queue.review_list_pending(10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].reasons, vec!["medium_confidence".to_string()]);
    }

    #[tokio::test]
    async fn test_transient_insert_failure_is_retried() {
        let store = Arc::new(MemoryStore::failing_inserts(2));
        let config = PublishConfig {
            store_retry_base: Duration::from_millis(1),
            ..PublishConfig::default()
        };
        let (publisher, _queue) = publisher_with_config(Arc::clone(&store), config).await;

        let outcome = publisher
            .publish(candidate(vec!["https://a.example/1"]), &unique(), &auto_validation())
            .await;
        assert!(matches!(outcome, PublishOutcome::Inserted { .. }));
    }

    #[tokio::test]
    async fn test_exhausted_attempts_dead_letter() {
        let store = Arc::new(MemoryStore::failing_inserts(u32::MAX));
        let config = PublishConfig {
            store_retry_base: Duration::from_millis(1),
            ..PublishConfig::default()
        };
        let (publisher, queue) = publisher_with_config(Arc::clone(&store), config).await;

        let mut record = candidate(vec!["https://a.example/1"]);
        record.attempts = 2; // one short of the pipeline budget
        let outcome = publisher.publish(record, &unique(), &auto_validation()).await;
        assert_eq!(outcome, PublishOutcome::DeadLettered);

        let rows = queue.dead_letter_list(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entry.stage, "publish");
    }

    #[tokio::test]
    async fn test_store_failure_requeues_at_low_priority() {
        let store = Arc::new(MemoryStore::failing_inserts(u32::MAX));
        let config = PublishConfig {
            store_retry_base: Duration::from_millis(1),
            ..PublishConfig::default()
        };
        let (publisher, _queue) = publisher_with_config(Arc::clone(&store), config).await;

        let record = candidate(vec!["https://a.example/1"]);
        assert_eq!(record.attempts, 0);
        let outcome = publisher.publish(record, &unique(), &auto_validation()).await;
        assert_eq!(outcome, PublishOutcome::Requeued);
    }

    #[tokio::test]
    async fn test_audit_log_written_on_insert_and_merge() {
        let store = Arc::new(MemoryStore::new());
        let (publisher, _queue) = publisher(Arc::clone(&store)).await;

        publisher
            .publish(candidate(vec!["https://a.example/1"]), &unique(), &auto_validation())
            .await;
        publisher
            .publish(candidate(vec!["https://b.example/2"]), &unique(), &auto_validation())
            .await;

        let audits = store.audits.lock();
        assert!(audits.iter().any(|a| a.action == "insert"));
        assert!(audits.iter().any(|a| a.action == "merge"));
    }
}
