//! Two-stage content classifier.
//!
//! Stage 1 is deterministic pattern matching over title + description:
//! press-release language ("announces funding", "receives investment")
//! without any application language ("apply for", "application deadline")
//! marks the record an announcement and rejects it before any external
//! call is made. Stage 2 asks the LLM for sector/geography/inclusion tags
//! and a structured-completeness score; incomplete records with a source
//! URL are parked and a scrape request is queued for enrichment.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use regex::RegexSet;
use tracing::{debug, warn};

use crate::adapters::{llm_retry, ClassifyTags, LlmClient};
use crate::config::{ClassifierConfig, TimeoutConfig};
use crate::error::Result;
use crate::metrics;
use crate::queue::{NewScrapeRequest, PersistedQueue};
use crate::record::{CandidateKind, CandidateRecord};

/// Rejection reason for records that describe completed funding rather
/// than an open opportunity.
pub const REASON_NOT_AN_OPPORTUNITY: &str = "not-an-opportunity";

/// Compiled stage-1 pattern sets.
pub struct ClassifierPatterns {
    announcement: RegexSet,
    opportunity: RegexSet,
}

impl Default for ClassifierPatterns {
    fn default() -> Self {
        // The announcement set matches press-release phrasing; the
        // opportunity set matches application phrasing. A record matching
        // the first without the second never reaches the LLM.
        #[allow(clippy::expect_used)] // static patterns, validated by tests
        let announcement = RegexSet::new([
            r"(?i)announc\w*\s+(?:\w+\s+){0,4}(funding|grant|investment|round)",
            r"(?i)receives?\s+(?:\w+\s+){0,3}funding",
            r"(?i)rais(?:es?|ed)\s+(?:\$|usd|€|£)?\s?\d",
            r"(?i)secur(?:es?|ed)\s+(?:\w+\s+){0,3}(funding|investment|round)",
            r"(?i)clos(?:es?|ed)\s+(?:a\s+|its\s+)?(?:\$\d+\w*\s+)?(seed|series|funding|round)",
        ])
        .expect("announcement patterns compile");
        #[allow(clippy::expect_used)]
        let opportunity = RegexSet::new([
            r"(?i)apply\s+(for|to|now|by)",
            r"(?i)applications?\s+(deadline|open|close|due)",
            r"(?i)accepting\s+applications",
            r"(?i)call\s+for\s+(proposals|applications|submissions)",
            r"(?i)deadline\s*(:|is|of)",
            r"(?i)submit\s+(your|an?)\s+(application|proposal)",
        ])
        .expect("opportunity patterns compile");
        Self {
            announcement,
            opportunity,
        }
    }
}

impl ClassifierPatterns {
    /// Stage-1 verdict: true when the text is announcement-only.
    #[must_use]
    pub fn is_announcement_only(&self, text: &str) -> bool {
        self.announcement.is_match(text) && !self.opportunity.is_match(text)
    }
}

/// What the classifier decided about one candidate.
#[derive(Debug)]
pub enum ClassifyDecision {
    /// Rejected at stage 1 or by schema; reason is operator-visible
    Rejected {
        /// Rejection reason
        reason: String,
    },
    /// Passed both stages; continue to deduplication
    Forwarded(Box<CandidateRecord>),
    /// Parked awaiting enrichment; a scrape request was queued
    Parked,
    /// Dropped without effect (e.g. enrichment for a park that already
    /// timed out and was forwarded)
    Dropped {
        /// Why the record was dropped
        reason: String,
    },
}

struct ParkedCandidate {
    candidate: CandidateRecord,
    deadline: Instant,
}

/// The classifier stage. Owns the parked-candidate map; enrichment results
/// re-enter as new `Enriched` candidates and are matched back to their
/// parks by content-hash, never by pointer.
pub struct Classifier {
    patterns: ClassifierPatterns,
    llm: Arc<dyn LlmClient>,
    config: ClassifierConfig,
    timeouts: TimeoutConfig,
    queue: PersistedQueue,
    parked: DashMap<String, ParkedCandidate>,
}

impl Classifier {
    /// Build a classifier over the given LLM adapter and scrape queue.
    #[must_use]
    pub fn new(
        llm: Arc<dyn LlmClient>,
        queue: PersistedQueue,
        config: ClassifierConfig,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            patterns: ClassifierPatterns::default(),
            llm,
            config,
            timeouts,
            queue,
            parked: DashMap::new(),
        }
    }

    /// Classify one candidate.
    pub async fn process(&self, candidate: CandidateRecord) -> Result<ClassifyDecision> {
        if let CandidateKind::Enriched {
            source_content_hash,
        } = &candidate.kind
        {
            return Ok(self.absorb_enrichment(source_content_hash.clone(), candidate));
        }

        let text = format!(
            "{} {}",
            candidate.fields.title, candidate.fields.description
        );
        if self.patterns.is_announcement_only(&text) {
            debug!(
                content_hash = %candidate.content_hash,
                title = %candidate.fields.title,
                "stage-1 rejected announcement"
            );
            metrics::STAGE_RECORDS_TOTAL
                .with_label_values(&["classify", "rejected"])
                .inc();
            return Ok(ClassifyDecision::Rejected {
                reason: REASON_NOT_AN_OPPORTUNITY.to_string(),
            });
        }

        let (candidate, llm_completeness) = self.tag(candidate).await;
        // The LLM's structured-completeness estimate, floored by plain
        // field presence so a fully-populated record never parks.
        let completeness = llm_completeness
            .unwrap_or(0.0)
            .max(field_completeness(&candidate));

        // Strict less-than: a record exactly at the threshold is forwarded.
        if completeness < self.config.enrichment_threshold {
            if let Some(url) = candidate.source_urls.first().cloned() {
                return self.park(candidate, url).await;
            }
        }

        metrics::STAGE_RECORDS_TOTAL
            .with_label_values(&["classify", "forwarded"])
            .inc();
        Ok(ClassifyDecision::Forwarded(Box::new(candidate)))
    }

    /// Stage 2: LLM tagging. A failed call (after the adapter's retries)
    /// leaves the candidate untagged rather than stalling the pipeline.
    async fn tag(&self, candidate: CandidateRecord) -> (CandidateRecord, Option<f64>) {
        let text = format!(
            "{} {}",
            candidate.fields.title, candidate.fields.description
        );
        let llm = Arc::clone(&self.llm);
        let deadline = self.timeouts.llm;
        let tags = match tokio::time::timeout(
            deadline,
            llm_retry("llm.classify", || {
                let llm = Arc::clone(&llm);
                let text = text.clone();
                async move { llm.classify(&text).await }
            }),
        )
        .await
        {
            Ok(Ok(tags)) => tags,
            Ok(Err(e)) => {
                warn!(content_hash = %candidate.content_hash, error = %e, "classification tagging failed; forwarding untagged");
                return (candidate, None);
            }
            Err(_) => {
                warn!(content_hash = %candidate.content_hash, deadline = ?deadline, "classification tagging timed out; forwarding untagged");
                return (candidate, None);
            }
        };
        let completeness = tags.completeness.clamp(0.0, 1.0);
        (apply_tags(candidate, &tags), Some(completeness))
    }

    async fn park(&self, candidate: CandidateRecord, url: String) -> Result<ClassifyDecision> {
        let hash = candidate.content_hash.clone();
        let request = NewScrapeRequest {
            url,
            priority: candidate.priority,
            collector: candidate.collector,
            candidate_hash: hash.clone(),
            requested_fields: vec![
                "amount".to_string(),
                "deadline".to_string(),
                "organization".to_string(),
                "stage".to_string(),
            ],
            max_attempts: 3,
        };
        self.queue.scrape_enqueue(request).await?;
        self.parked.insert(
            hash.clone(),
            ParkedCandidate {
                candidate,
                deadline: Instant::now() + self.config.enrichment_timeout,
            },
        );
        debug!(content_hash = %hash, "candidate parked for enrichment");
        metrics::STAGE_RECORDS_TOTAL
            .with_label_values(&["classify", "parked"])
            .inc();
        Ok(ClassifyDecision::Parked)
    }

    /// An enriched candidate replaces its parked original outright; if the
    /// park already timed out and was forwarded, the enrichment is dropped
    /// (the latest state that actually made it downstream wins).
    fn absorb_enrichment(
        &self,
        source_content_hash: String,
        enriched: CandidateRecord,
    ) -> ClassifyDecision {
        match self.parked.remove(&source_content_hash) {
            Some(_) => {
                metrics::STAGE_RECORDS_TOTAL
                    .with_label_values(&["classify", "enriched"])
                    .inc();
                ClassifyDecision::Forwarded(Box::new(enriched))
            }
            None => {
                debug!(
                    source_content_hash = %source_content_hash,
                    "enrichment arrived after park release; dropping"
                );
                ClassifyDecision::Dropped {
                    reason: "enrichment-after-release".to_string(),
                }
            }
        }
    }

    /// Release parks whose enrichment deadline has passed; they are
    /// forwarded with the fields they have.
    pub fn release_expired(&self) -> Vec<CandidateRecord> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .parked
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|hash| self.parked.remove(&hash))
            .map(|(hash, parked)| {
                warn!(content_hash = %hash, "enrichment timed out; forwarding as-is");
                parked.candidate
            })
            .collect()
    }

    /// Release specific parks (scrape failed for good); forwarded
    /// unenriched.
    pub fn release(&self, candidate_hashes: &[String]) -> Vec<CandidateRecord> {
        candidate_hashes
            .iter()
            .filter_map(|hash| self.parked.remove(hash))
            .map(|(_, parked)| parked.candidate)
            .collect()
    }

    /// Number of candidates currently parked.
    #[must_use]
    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }
}

/// Plain field-presence completeness in [0, 1].
#[must_use]
pub fn field_completeness(candidate: &CandidateRecord) -> f64 {
    let fields = &candidate.fields;
    let present = [
        !fields.title.is_empty(),
        !fields.description.is_empty(),
        fields.amount_usd.is_some(),
        fields.deadline.is_some() || fields.transaction_date.is_some(),
        !fields.organizations.is_empty(),
        !fields.sectors.is_empty(),
        !fields.geography.is_empty(),
        fields.stage.is_some(),
    ];
    let count = present.iter().filter(|p| **p).count();
    count as f64 / present.len() as f64
}

fn apply_tags(mut candidate: CandidateRecord, tags: &ClassifyTags) -> CandidateRecord {
    let fields = &mut candidate.fields;
    if fields.sectors.is_empty() {
        fields.sectors = tags.sectors.clone();
    }
    if fields.geography.is_empty() {
        fields.geography = tags.geography.clone();
    }
    if fields.stage.is_none() {
        fields.stage = tags.stage.clone();
    }
    fields.inclusion.gender |= tags.inclusion.gender;
    fields.inclusion.youth |= tags.inclusion.youth;
    fields.inclusion.rural |= tags.inclusion.rural;
    if candidate.language.is_none() {
        candidate.language = tags.language.clone();
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::time::Duration;

    use crate::record::{CollectorKind, ExtractedFields, InclusionFlags, RawPayload};

    struct StubLlm {
        tags: ClassifyTags,
    }

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn extract(
            &self,
            _text: &str,
            _schema: &serde_json::Value,
        ) -> Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }

        async fn classify(&self, _text: &str) -> Result<ClassifyTags> {
            Ok(self.tags.clone())
        }

        async fn score(&self, _candidate: &serde_json::Value) -> Result<f64> {
            Ok(0.9)
        }
    }

    fn rich_fields() -> ExtractedFields {
        ExtractedFields {
            title: "Apply for the AI Growth Grant".to_string(),
            description: "Application deadline: 30 September".to_string(),
            amount_usd: Some(50_000.0),
            deadline: NaiveDate::from_ymd_opt(2026, 9, 30),
            transaction_date: None,
            organizations: vec!["Example Foundation".to_string()],
            geography: vec!["Kenya".to_string()],
            sectors: vec!["ai".to_string()],
            stage: Some("grant".to_string()),
            inclusion: InclusionFlags::default(),
        }
    }

    fn candidate(fields: ExtractedFields, urls: Vec<String>) -> CandidateRecord {
        CandidateRecord::new(
            CollectorKind::Rss,
            RawPayload::Text(fields.description.clone()),
            fields,
            urls,
        )
    }

    async fn classifier(tags: ClassifyTags) -> Classifier {
        let queue = PersistedQueue::open(None).await.unwrap();
        Classifier::new(
            Arc::new(StubLlm { tags }),
            queue,
            ClassifierConfig::default(),
            TimeoutConfig::default(),
        )
    }

    #[test]
    fn test_stage1_announcement_without_opportunity_language() {
        let patterns = ClassifierPatterns::default();
        assert!(patterns.is_announcement_only("Startup X announces $2M Series A"));
        assert!(patterns.is_announcement_only("Acme receives funding from DFC"));
        assert!(patterns.is_announcement_only("Foo Ltd raises $5M"));
        assert!(patterns.is_announcement_only("Bar secures seed investment"));
    }

    #[test]
    fn test_stage1_opportunity_language_passes() {
        let patterns = ClassifierPatterns::default();
        assert!(!patterns.is_announcement_only(
            "Fund announces grant program - apply by 30 September"
        ));
        assert!(!patterns.is_announcement_only("Accelerator accepting applications"));
        assert!(!patterns.is_announcement_only("Call for proposals: AI for agriculture"));
        assert!(!patterns.is_announcement_only("Neutral headline about AI in Africa"));
    }

    #[tokio::test]
    async fn test_announcement_is_rejected_before_llm() {
        let c = classifier(ClassifyTags::default()).await;
        let fields = ExtractedFields {
            title: "Startup X announces $2M Series A".to_string(),
            description: "Press release".to_string(),
            ..ExtractedFields::default()
        };
        let decision = c.process(candidate(fields, vec![])).await.unwrap();
        match decision {
            ClassifyDecision::Rejected { reason } => {
                assert_eq!(reason, REASON_NOT_AN_OPPORTUNITY);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_complete_candidate_is_forwarded() {
        let c = classifier(ClassifyTags::default()).await;
        let decision = c
            .process(candidate(
                rich_fields(),
                vec!["https://example.org/grant".to_string()],
            ))
            .await
            .unwrap();
        assert!(matches!(decision, ClassifyDecision::Forwarded(_)));
        assert_eq!(c.parked_len(), 0);
    }

    #[tokio::test]
    async fn test_incomplete_candidate_with_url_is_parked() {
        let c = classifier(ClassifyTags::default()).await;
        let fields = ExtractedFields {
            title: "Grant program for African AI startups".to_string(),
            description: String::new(),
            ..ExtractedFields::default()
        };
        let decision = c
            .process(candidate(
                fields,
                vec!["https://example.org/grant".to_string()],
            ))
            .await
            .unwrap();
        assert!(matches!(decision, ClassifyDecision::Parked));
        assert_eq!(c.parked_len(), 1);
    }

    #[tokio::test]
    async fn test_completeness_exactly_at_threshold_is_not_parked() {
        // Threshold is a strict less-than: an LLM completeness of exactly
        // 0.5 forwards even when fields are sparse and a URL is present.
        let tags = ClassifyTags {
            completeness: 0.5,
            ..ClassifyTags::default()
        };
        let c = classifier(tags).await;
        let fields = ExtractedFields {
            title: "Grant program".to_string(),
            ..ExtractedFields::default()
        };
        let decision = c
            .process(candidate(
                fields,
                vec!["https://example.org/grant".to_string()],
            ))
            .await
            .unwrap();
        assert!(matches!(decision, ClassifyDecision::Forwarded(_)));
        assert_eq!(c.parked_len(), 0);
    }

    #[tokio::test]
    async fn test_incomplete_candidate_without_url_is_forwarded() {
        let c = classifier(ClassifyTags::default()).await;
        let fields = ExtractedFields {
            title: "Grant program".to_string(),
            ..ExtractedFields::default()
        };
        let decision = c.process(candidate(fields, vec![])).await.unwrap();
        assert!(matches!(decision, ClassifyDecision::Forwarded(_)));
    }

    #[tokio::test]
    async fn test_llm_tags_are_applied() {
        let tags = ClassifyTags {
            sectors: vec!["fintech".to_string()],
            geography: vec!["Nigeria".to_string()],
            inclusion: InclusionFlags {
                gender: true,
                youth: false,
                rural: false,
            },
            stage: Some("seed".to_string()),
            language: Some("en".to_string()),
            completeness: 0.9,
        };
        let c = classifier(tags).await;
        let fields = ExtractedFields {
            title: "Seed funding applications open for women-led startups".to_string(),
            description: "Apply by 1 December. $100,000 for Nigerian fintechs.".to_string(),
            amount_usd: Some(100_000.0),
            deadline: NaiveDate::from_ymd_opt(2026, 12, 1),
            organizations: vec!["Fund Y".to_string()],
            ..ExtractedFields::default()
        };
        let decision = c
            .process(candidate(fields, vec!["https://fundy.example/apply".to_string()]))
            .await
            .unwrap();
        let ClassifyDecision::Forwarded(forwarded) = decision else {
            panic!("expected forwarded");
        };
        assert_eq!(forwarded.fields.sectors, vec!["fintech".to_string()]);
        assert_eq!(forwarded.fields.stage.as_deref(), Some("seed"));
        assert!(forwarded.fields.inclusion.gender);
        assert_eq!(forwarded.language.as_deref(), Some("en"));
    }

    #[tokio::test]
    async fn test_enrichment_replaces_parked_candidate() {
        let c = classifier(ClassifyTags::default()).await;
        let fields = ExtractedFields {
            title: "Grant program".to_string(),
            ..ExtractedFields::default()
        };
        let original = candidate(fields, vec!["https://example.org/grant".to_string()]);
        let original_hash = original.content_hash.clone();
        c.process(original.clone()).await.unwrap();
        assert_eq!(c.parked_len(), 1);

        let enriched = CandidateRecord::enriched_from(
            &original,
            RawPayload::Html("<html>full</html>".to_string()),
            rich_fields(),
            vec![],
        );
        let decision = c.process(enriched).await.unwrap();
        let ClassifyDecision::Forwarded(forwarded) = decision else {
            panic!("expected forwarded enrichment");
        };
        assert_eq!(c.parked_len(), 0);
        match forwarded.kind {
            CandidateKind::Enriched {
                ref source_content_hash,
            } => assert_eq!(source_content_hash, &original_hash),
            CandidateKind::Raw => panic!("expected enriched"),
        }
    }

    #[tokio::test]
    async fn test_late_enrichment_is_dropped() {
        let c = classifier(ClassifyTags::default()).await;
        let original = candidate(rich_fields(), vec![]);
        let enriched = CandidateRecord::enriched_from(
            &original,
            RawPayload::Html("<html/>".to_string()),
            rich_fields(),
            vec![],
        );
        // Nothing parked under the original's hash.
        let decision = c.process(enriched).await.unwrap();
        assert!(matches!(decision, ClassifyDecision::Dropped { .. }));
    }

    #[tokio::test]
    async fn test_expired_parks_are_released_as_is() {
        let queue = PersistedQueue::open(None).await.unwrap();
        let c = Classifier::new(
            Arc::new(StubLlm {
                tags: ClassifyTags::default(),
            }),
            queue,
            ClassifierConfig {
                enrichment_threshold: 0.5,
                enrichment_timeout: Duration::from_millis(0),
            },
            TimeoutConfig::default(),
        );
        let fields = ExtractedFields {
            title: "Grant program".to_string(),
            ..ExtractedFields::default()
        };
        c.process(candidate(
            fields,
            vec!["https://example.org/grant".to_string()],
        ))
        .await
        .unwrap();
        assert_eq!(c.parked_len(), 1);

        let released = c.release_expired();
        assert_eq!(released.len(), 1);
        assert_eq!(c.parked_len(), 0);
    }

    #[tokio::test]
    async fn test_release_by_hash_for_failed_scrapes() {
        let c = classifier(ClassifyTags::default()).await;
        let fields = ExtractedFields {
            title: "Grant program".to_string(),
            ..ExtractedFields::default()
        };
        let record = candidate(fields, vec!["https://example.org/grant".to_string()]);
        let hash = record.content_hash.clone();
        c.process(record).await.unwrap();

        let released = c.release(&[hash]);
        assert_eq!(released.len(), 1);
        assert_eq!(c.parked_len(), 0);
    }
}
