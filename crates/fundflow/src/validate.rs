//! AI validator: weighted confidence scoring and confidence-tiered routing.
//!
//! The confidence score combines dedup-adjusted uniqueness, the origin
//! collector's quality score, structured completeness, an LLM legitimacy
//! check and the presence of verifiable fields. Equity signals are carried
//! as annotations only - they never multiply the score.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::adapters::{llm_retry, LlmClient};
use crate::classify::field_completeness;
use crate::config::{TimeoutConfig, ValidatorConfig};
use crate::dedup::{DedupOutcome, DedupVerdict};
use crate::error::Result;
use crate::health::SourceHealthRegistry;
use crate::record::CandidateRecord;

/// Review reason attached when the score lands in the review band.
pub const REASON_MEDIUM_CONFIDENCE: &str = "medium_confidence";
/// Review reason attached when dedup returned LikelyDuplicate.
pub const REASON_LIKELY_DUPLICATE: &str = "likely_duplicate";
/// Rejection reason below the review floor.
pub const REASON_LOW_CONFIDENCE: &str = "low_confidence";

/// Where the validator routes a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValidationTier {
    /// Publish without human review
    AutoApprove,
    /// Human adjudication required
    Review,
    /// Dropped with a reason
    Reject,
}

/// Validator output carried to the publisher.
#[derive(Debug, Clone, Serialize)]
pub struct Validation {
    /// Weighted confidence in [0, 1]
    pub confidence: f64,
    /// Routing tier
    pub tier: ValidationTier,
    /// Reasons behind a Review/Reject tier
    pub reasons: Vec<String>,
    /// Raw LLM legitimacy score
    pub legitimacy: f64,
}

/// The validation stage.
pub struct Validator {
    llm: Arc<dyn LlmClient>,
    health: Arc<SourceHealthRegistry>,
    config: ValidatorConfig,
    timeouts: TimeoutConfig,
}

impl Validator {
    /// Build a validator over the LLM adapter and health registry.
    #[must_use]
    pub fn new(
        llm: Arc<dyn LlmClient>,
        health: Arc<SourceHealthRegistry>,
        config: ValidatorConfig,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            llm,
            health,
            config,
            timeouts,
        }
    }

    /// Score a candidate and decide its tier.
    pub async fn validate(
        &self,
        candidate: &CandidateRecord,
        dedup: &DedupOutcome,
    ) -> Result<Validation> {
        let weights = self.config.weights.normalized();

        let uniqueness = 1.0 - dedup.aggregate_score();
        let source_quality = self.health.snapshot(candidate.collector).quality_score;
        let completeness = field_completeness(candidate);
        let legitimacy = self.legitimacy(candidate).await;
        let verifiable = verifiable_fields(candidate);

        let confidence = (weights.uniqueness * uniqueness
            + weights.source_quality * source_quality
            + weights.completeness * completeness
            + weights.legitimacy * legitimacy
            + weights.verifiable * verifiable)
            .clamp(0.0, 1.0);

        // A hard duplicate always routes to the publisher, which performs
        // the merge; a likely duplicate goes to review no matter how well
        // it scores.
        let (tier, reasons) = if dedup.verdict == DedupVerdict::Duplicate {
            (ValidationTier::AutoApprove, vec![])
        } else if dedup.verdict == DedupVerdict::LikelyDuplicate {
            let mut reasons = vec![REASON_LIKELY_DUPLICATE.to_string()];
            if confidence < self.config.auto_approve {
                reasons.push(REASON_MEDIUM_CONFIDENCE.to_string());
            }
            (ValidationTier::Review, reasons)
        } else if confidence >= self.config.auto_approve {
            (ValidationTier::AutoApprove, vec![])
        } else if confidence >= self.config.review_floor {
            (
                ValidationTier::Review,
                vec![REASON_MEDIUM_CONFIDENCE.to_string()],
            )
        } else {
            (
                ValidationTier::Reject,
                vec![REASON_LOW_CONFIDENCE.to_string()],
            )
        };

        debug!(
            content_hash = %candidate.content_hash,
            confidence,
            tier = ?tier,
            uniqueness,
            source_quality,
            completeness,
            legitimacy,
            verifiable,
            "validated candidate"
        );

        Ok(Validation {
            confidence,
            tier,
            reasons,
            legitimacy,
        })
    }

    /// LLM legitimacy check with the pipeline's LLM deadline. Falls back to
    /// a neutral 0.5 if the call cannot complete.
    async fn legitimacy(&self, candidate: &CandidateRecord) -> f64 {
        let json = match serde_json::to_value(candidate) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "candidate not serializable for legitimacy check");
                return 0.5;
            }
        };
        let llm = Arc::clone(&self.llm);
        match tokio::time::timeout(
            self.timeouts.llm,
            llm_retry("llm.score", || {
                let llm = Arc::clone(&llm);
                let json = json.clone();
                async move { llm.score(&json).await }
            }),
        )
        .await
        {
            Ok(Ok(score)) => score.clamp(0.0, 1.0),
            Ok(Err(e)) => {
                warn!(content_hash = %candidate.content_hash, error = %e, "legitimacy check failed; using neutral score");
                0.5
            }
            Err(_) => {
                warn!(content_hash = %candidate.content_hash, "legitimacy check timed out; using neutral score");
                0.5
            }
        }
    }
}

/// Fraction of verifiable fields present: a parseable deadline or
/// transaction date, a parseable amount, and at least one source URL.
#[must_use]
pub fn verifiable_fields(candidate: &CandidateRecord) -> f64 {
    let fields = &candidate.fields;
    let checks = [
        fields.deadline.is_some() || fields.transaction_date.is_some(),
        fields.amount_usd.is_some(),
        !candidate.source_urls.is_empty(),
    ];
    let present = checks.iter().filter(|c| **c).count();
    present as f64 / checks.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::time::Duration;

    use crate::adapters::ClassifyTags;
    use crate::config::{BreakerConfig, RateLimitConfig, ValidatorWeights};
    use crate::health::Outcome;
    use crate::record::{CollectorKind, ExtractedFields, RawPayload};

    struct FixedScoreLlm {
        score: f64,
    }

    #[async_trait]
    impl LlmClient for FixedScoreLlm {
        async fn extract(
            &self,
            _text: &str,
            _schema: &serde_json::Value,
        ) -> Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }

        async fn classify(&self, _text: &str) -> Result<ClassifyTags> {
            Ok(ClassifyTags::default())
        }

        async fn score(&self, _candidate: &serde_json::Value) -> Result<f64> {
            Ok(self.score)
        }
    }

    fn health() -> Arc<SourceHealthRegistry> {
        Arc::new(SourceHealthRegistry::new(
            &BreakerConfig::default(),
            &RateLimitConfig::default(),
        ))
    }

    fn unique_outcome() -> DedupOutcome {
        DedupOutcome {
            verdict: DedupVerdict::Unique,
            best: None,
            matches: vec![],
            resolved_org: None,
        }
    }

    fn likely_outcome() -> DedupOutcome {
        DedupOutcome {
            verdict: DedupVerdict::LikelyDuplicate,
            best: None,
            matches: vec![],
            resolved_org: None,
        }
    }

    fn rich_candidate() -> CandidateRecord {
        CandidateRecord::new(
            CollectorKind::Rss,
            RawPayload::Text("body".to_string()),
            ExtractedFields {
                title: "Apply for the AI Growth Grant".to_string(),
                description: "Grants for African AI startups".to_string(),
                amount_usd: Some(50_000.0),
                deadline: NaiveDate::from_ymd_opt(2026, 9, 30),
                organizations: vec!["Example Foundation".to_string()],
                geography: vec!["Kenya".to_string()],
                sectors: vec!["ai".to_string()],
                stage: Some("grant".to_string()),
                ..ExtractedFields::default()
            },
            vec!["https://example.org/grant".to_string()],
        )
    }

    fn validator(llm_score: f64, registry: Arc<SourceHealthRegistry>) -> Validator {
        Validator::new(
            Arc::new(FixedScoreLlm { score: llm_score }),
            registry,
            ValidatorConfig::default(),
            TimeoutConfig::default(),
        )
    }

    /// Registry with a high quality score for Rss so tier tests can reach
    /// the auto-approve band.
    fn warmed_health() -> Arc<SourceHealthRegistry> {
        let registry = health();
        for _ in 0..60 {
            registry.record_outcome(
                CollectorKind::Rss,
                &Outcome::Success {
                    latency: Duration::from_millis(10),
                    quality_hint: Some(1.0),
                },
            );
        }
        registry
    }

    #[tokio::test]
    async fn test_high_scoring_unique_record_auto_approves() {
        let v = validator(1.0, warmed_health());
        let validation = v
            .validate(&rich_candidate(), &unique_outcome())
            .await
            .unwrap();
        assert!(validation.confidence >= 0.85, "{}", validation.confidence);
        assert_eq!(validation.tier, ValidationTier::AutoApprove);
        assert!(validation.reasons.is_empty());
    }

    #[tokio::test]
    async fn test_likely_duplicate_forces_review_despite_high_score() {
        let v = validator(1.0, warmed_health());
        let validation = v
            .validate(&rich_candidate(), &likely_outcome())
            .await
            .unwrap();
        assert_eq!(validation.tier, ValidationTier::Review);
        assert!(validation
            .reasons
            .contains(&REASON_LIKELY_DUPLICATE.to_string()));
    }

    #[tokio::test]
    async fn test_sparse_candidate_is_rejected() {
        let v = validator(0.0, health());
        let sparse = CandidateRecord::new(
            CollectorKind::WebSearch,
            RawPayload::Text(String::new()),
            ExtractedFields::default(),
            vec![],
        );
        let validation = v.validate(&sparse, &unique_outcome()).await.unwrap();
        assert_eq!(validation.tier, ValidationTier::Reject);
        assert_eq!(validation.reasons, vec![REASON_LOW_CONFIDENCE.to_string()]);
    }

    #[tokio::test]
    async fn test_score_exactly_at_auto_approve_publishes() {
        // Degenerate weights isolate the legitimacy component so the
        // confidence equals the LLM score exactly.
        let config = ValidatorConfig {
            weights: ValidatorWeights {
                uniqueness: 0.0,
                source_quality: 0.0,
                completeness: 0.0,
                legitimacy: 1.0,
                verifiable: 0.0,
            },
            ..ValidatorConfig::default()
        };
        let v = Validator::new(
            Arc::new(FixedScoreLlm { score: 0.85 }),
            health(),
            config,
            TimeoutConfig::default(),
        );
        let validation = v
            .validate(&rich_candidate(), &unique_outcome())
            .await
            .unwrap();
        assert_eq!(validation.confidence, 0.85);
        assert_eq!(validation.tier, ValidationTier::AutoApprove);
    }

    #[tokio::test]
    async fn test_score_exactly_at_review_floor_goes_to_review() {
        let config = ValidatorConfig {
            weights: ValidatorWeights {
                uniqueness: 0.0,
                source_quality: 0.0,
                completeness: 0.0,
                legitimacy: 1.0,
                verifiable: 0.0,
            },
            ..ValidatorConfig::default()
        };
        let v = Validator::new(
            Arc::new(FixedScoreLlm { score: 0.65 }),
            health(),
            config,
            TimeoutConfig::default(),
        );
        let validation = v
            .validate(&rich_candidate(), &unique_outcome())
            .await
            .unwrap();
        assert_eq!(validation.confidence, 0.65);
        assert_eq!(validation.tier, ValidationTier::Review);
        assert_eq!(
            validation.reasons,
            vec![REASON_MEDIUM_CONFIDENCE.to_string()]
        );
    }

    #[tokio::test]
    async fn test_hard_duplicate_routes_to_publisher_despite_low_score() {
        use crate::dedup::{DedupStrategy, DuplicateMatch};
        let v = validator(0.0, health());
        let dedup = DedupOutcome {
            verdict: DedupVerdict::Duplicate,
            best: Some(DuplicateMatch {
                strategy: DedupStrategy::TemporalCluster,
                existing_id: "opp-1".to_string(),
                existing_dedup_hash: "h".to_string(),
                score: 0.95,
            }),
            matches: vec![],
            resolved_org: None,
        };
        let validation = v.validate(&rich_candidate(), &dedup).await.unwrap();
        // Low confidence, but the record must still reach the publisher so
        // the merge can happen.
        assert_eq!(validation.tier, ValidationTier::AutoApprove);
    }

    #[test]
    fn test_verifiable_fields_fractions() {
        assert_eq!(verifiable_fields(&rich_candidate()), 1.0);
        let sparse = CandidateRecord::new(
            CollectorKind::Rss,
            RawPayload::Text(String::new()),
            ExtractedFields::default(),
            vec![],
        );
        assert_eq!(verifiable_fields(&sparse), 0.0);
    }
}
