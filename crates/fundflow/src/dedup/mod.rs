//! Seven-strategy deduplication engine.
//!
//! Every strategy that clears its threshold contributes a
//! [`DuplicateMatch`]; the aggregate score is the maximum of the
//! per-strategy normalized scores and decides the verdict. Canonical
//! organization resolution is a prerequisite for the signature, temporal,
//! org-funding and announcement-chain strategies - a candidate whose
//! organization cannot be resolved simply skips those.

pub mod org;
pub mod similarity;

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::adapters::{OpportunityStore, VectorIndex};
use crate::config::{DedupConfig, TimeoutConfig};
use crate::error::Result;
use crate::metrics;
use crate::record::{CandidateRecord, OpportunityRecord};

/// The seven detection strategies, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DedupStrategy {
    /// Dedup-hash collision with a published record
    ExactSignature,
    /// Token-sort edit-distance on normalized titles within 90 days
    TitleSimilarity,
    /// TF-IDF cosine over description text
    ContentSimilarity,
    /// Embedding-space cosine via the vector index
    SemanticSimilarity,
    /// Same organization, amount within 5 %, arrival within 72 h
    TemporalCluster,
    /// Same organization, amount within 10 %, 180 days, different URLs
    OrgFundingMatch,
    /// >= 3 distinct source URLs for one funding event within 14 days
    AnnouncementChain,
}

impl DedupStrategy {
    /// Stable label for metrics and review-queue reasons.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupStrategy::ExactSignature => "exact-signature",
            DedupStrategy::TitleSimilarity => "title-similarity",
            DedupStrategy::ContentSimilarity => "content-similarity",
            DedupStrategy::SemanticSimilarity => "semantic-similarity",
            DedupStrategy::TemporalCluster => "temporal-cluster",
            DedupStrategy::OrgFundingMatch => "org-funding-match",
            DedupStrategy::AnnouncementChain => "announcement-chain",
        }
    }
}

/// Normalized score carried by structural (non-textual) strategy matches.
const EXACT_SIGNATURE_SCORE: f64 = 1.0;
const ANNOUNCEMENT_CHAIN_SCORE: f64 = 0.97;
const TEMPORAL_CLUSTER_SCORE: f64 = 0.95;
const ORG_FUNDING_SCORE: f64 = 0.92;

/// One strategy's match against one published record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateMatch {
    /// Strategy that fired
    pub strategy: DedupStrategy,
    /// Id of the matched published opportunity
    pub existing_id: String,
    /// Dedup-hash of the matched record
    pub existing_dedup_hash: String,
    /// Normalized similarity score in [0, 1]
    pub score: f64,
}

/// Aggregate verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DedupVerdict {
    /// Aggregate score >= hard threshold; publisher merges
    Duplicate,
    /// Aggregate in the review band; forced to human review
    LikelyDuplicate,
    /// Below the review band
    Unique,
}

impl DedupVerdict {
    /// Stable label for metrics and review reasons.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupVerdict::Duplicate => "duplicate",
            DedupVerdict::LikelyDuplicate => "likely-duplicate",
            DedupVerdict::Unique => "unique",
        }
    }
}

/// Everything the validator and publisher need to know about duplication.
#[derive(Debug, Clone)]
pub struct DedupOutcome {
    /// Aggregate verdict
    pub verdict: DedupVerdict,
    /// Strongest match, when any strategy fired
    pub best: Option<DuplicateMatch>,
    /// All matches above their strategy thresholds
    pub matches: Vec<DuplicateMatch>,
    /// Canonical organization, when resolution succeeded
    pub resolved_org: Option<org::ResolvedOrg>,
}

impl DedupOutcome {
    /// Aggregate score: the max of the per-strategy normalized scores.
    #[must_use]
    pub fn aggregate_score(&self) -> f64 {
        self.best.as_ref().map_or(0.0, |m| m.score)
    }
}

/// The deduplication engine. Reads the recent corpus through the store
/// adapter and the embedding space through the vector adapter; never
/// writes.
pub struct DeduplicationEngine {
    store: Arc<dyn OpportunityStore>,
    vector: Arc<dyn VectorIndex>,
    config: DedupConfig,
    timeouts: TimeoutConfig,
}

impl DeduplicationEngine {
    /// Build an engine over the given adapters.
    #[must_use]
    pub fn new(
        store: Arc<dyn OpportunityStore>,
        vector: Arc<dyn VectorIndex>,
        config: DedupConfig,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            store,
            vector,
            config,
            timeouts,
        }
    }

    /// Evaluate a candidate against the recent corpus.
    pub async fn evaluate(&self, candidate: &CandidateRecord) -> Result<DedupOutcome> {
        let corpus = self
            .store
            .find_recent_in_window(self.config.corpus_window_days)
            .await?;

        let resolved_org = candidate.fields.primary_organization().and_then(|name| {
            org::resolve(
                name,
                candidate.fields.geography.first().map(String::as_str),
                &corpus,
                self.config.org_match_threshold,
            )
        });

        let mut matches = Vec::new();
        // Resolution gates the signature, temporal, org-funding and chain
        // strategies.
        if resolved_org.is_some() {
            self.exact_signature(candidate, &mut matches).await?;
        }
        self.title_similarity(candidate, &corpus, &mut matches);
        self.content_similarity(candidate, &corpus, &mut matches);
        self.semantic_similarity(candidate, &corpus, &mut matches)
            .await;
        if let Some(org) = &resolved_org {
            self.temporal_cluster(candidate, org, &corpus, &mut matches);
            self.org_funding_match(candidate, org, &corpus, &mut matches);
            self.announcement_chain(candidate, org, &corpus, &mut matches);
        }

        let best = matches
            .iter()
            .max_by(|a, b| a.score.total_cmp(&b.score))
            .cloned();
        let score = best.as_ref().map_or(0.0, |m| m.score);
        let verdict = if score >= self.config.hard_threshold {
            DedupVerdict::Duplicate
        } else if score >= self.config.likely_floor {
            DedupVerdict::LikelyDuplicate
        } else {
            DedupVerdict::Unique
        };

        debug!(
            content_hash = %candidate.content_hash,
            verdict = verdict.as_str(),
            score,
            matches = matches.len(),
            "dedup evaluated"
        );
        metrics::DEDUP_VERDICTS_TOTAL
            .with_label_values(&[verdict.as_str()])
            .inc();

        Ok(DedupOutcome {
            verdict,
            best,
            matches,
            resolved_org,
        })
    }

    /// Strategy 1: the candidate's dedup-hash is already published.
    async fn exact_signature(
        &self,
        candidate: &CandidateRecord,
        matches: &mut Vec<DuplicateMatch>,
    ) -> Result<()> {
        let Some(hash) = candidate.dedup_hash() else {
            return Ok(());
        };
        if let Some(existing) = self.store.find_by_dedup_hash(&hash).await? {
            matches.push(DuplicateMatch {
                strategy: DedupStrategy::ExactSignature,
                existing_id: existing.id,
                existing_dedup_hash: existing.dedup_hash,
                score: EXACT_SIGNATURE_SCORE,
            });
        }
        Ok(())
    }

    /// Strategy 2: near-identical titles within the title window.
    fn title_similarity(
        &self,
        candidate: &CandidateRecord,
        corpus: &[OpportunityRecord],
        matches: &mut Vec<DuplicateMatch>,
    ) {
        if candidate.fields.title.is_empty() {
            return;
        }
        let window = ChronoDuration::days(self.config.title_window_days);
        for record in corpus {
            if candidate.arrived_at - record.published_at > window {
                continue;
            }
            let score =
                similarity::token_sort_ratio(&candidate.fields.title, &record.fields.title);
            if score >= self.config.title_ratio {
                matches.push(DuplicateMatch {
                    strategy: DedupStrategy::TitleSimilarity,
                    existing_id: record.id.clone(),
                    existing_dedup_hash: record.dedup_hash.clone(),
                    score,
                });
            }
        }
    }

    /// Strategy 3: TF-IDF cosine over description text.
    fn content_similarity(
        &self,
        candidate: &CandidateRecord,
        corpus: &[OpportunityRecord],
        matches: &mut Vec<DuplicateMatch>,
    ) {
        if candidate.fields.description.is_empty() {
            return;
        }
        let descriptions: Vec<&str> = corpus
            .iter()
            .map(|r| r.fields.description.as_str())
            .collect();
        for record in corpus {
            if record.fields.description.is_empty() {
                continue;
            }
            let score = similarity::tfidf_cosine(
                &candidate.fields.description,
                &record.fields.description,
                &descriptions,
            );
            if score >= self.config.tfidf_cosine {
                matches.push(DuplicateMatch {
                    strategy: DedupStrategy::ContentSimilarity,
                    existing_id: record.id.clone(),
                    existing_dedup_hash: record.dedup_hash.clone(),
                    score,
                });
            }
        }
    }

    /// Strategy 4: cosine in the embedding space. A vector-index failure
    /// skips the strategy rather than failing the evaluation.
    async fn semantic_similarity(
        &self,
        candidate: &CandidateRecord,
        corpus: &[OpportunityRecord],
        matches: &mut Vec<DuplicateMatch>,
    ) {
        let text = format!(
            "{} {}",
            candidate.fields.title, candidate.fields.description
        );
        if text.trim().is_empty() {
            return;
        }
        let embedded = tokio::time::timeout(self.timeouts.embedding, self.vector.embed(&text));
        let vector = match embedded.await {
            Ok(Ok(vector)) => vector,
            Ok(Err(e)) => {
                warn!(error = %e, "embedding failed; skipping semantic strategy");
                return;
            }
            Err(_) => {
                warn!(deadline = ?self.timeouts.embedding, "embedding timed out; skipping semantic strategy");
                return;
            }
        };
        let hits = match tokio::time::timeout(
            self.timeouts.embedding,
            self.vector.query_top_k(&vector, 5, None),
        )
        .await
        {
            Ok(Ok(hits)) => hits,
            Ok(Err(e)) => {
                warn!(error = %e, "vector query failed; skipping semantic strategy");
                return;
            }
            Err(_) => return,
        };
        for (id, score) in hits {
            let score = f64::from(score);
            if score < self.config.embedding_cosine {
                continue;
            }
            if let Some(record) = corpus.iter().find(|r| r.id == id) {
                matches.push(DuplicateMatch {
                    strategy: DedupStrategy::SemanticSimilarity,
                    existing_id: record.id.clone(),
                    existing_dedup_hash: record.dedup_hash.clone(),
                    score: score.clamp(0.0, 1.0),
                });
            }
        }
    }

    /// Strategy 5: same org, amount within 5 %, arrival within 72 h.
    fn temporal_cluster(
        &self,
        candidate: &CandidateRecord,
        org: &org::ResolvedOrg,
        corpus: &[OpportunityRecord],
        matches: &mut Vec<DuplicateMatch>,
    ) {
        let Some(amount) = candidate.fields.amount_usd else {
            return;
        };
        let window = ChronoDuration::hours(self.config.temporal_window_hours);
        for record in corpus {
            if record.organization_id != org.id {
                continue;
            }
            let Some(existing_amount) = record.fields.amount_usd else {
                continue;
            };
            if !amounts_within(amount, existing_amount, self.config.temporal_amount_tolerance) {
                continue;
            }
            if (candidate.arrived_at - record.published_at).abs() > window {
                continue;
            }
            matches.push(DuplicateMatch {
                strategy: DedupStrategy::TemporalCluster,
                existing_id: record.id.clone(),
                existing_dedup_hash: record.dedup_hash.clone(),
                score: TEMPORAL_CLUSTER_SCORE,
            });
        }
    }

    /// Strategy 6: same org, amount within 10 %, 180 days, different URLs.
    fn org_funding_match(
        &self,
        candidate: &CandidateRecord,
        org: &org::ResolvedOrg,
        corpus: &[OpportunityRecord],
        matches: &mut Vec<DuplicateMatch>,
    ) {
        let Some(amount) = candidate.fields.amount_usd else {
            return;
        };
        let window = ChronoDuration::days(self.config.org_window_days);
        for record in corpus {
            if record.organization_id != org.id {
                continue;
            }
            let Some(existing_amount) = record.fields.amount_usd else {
                continue;
            };
            if !amounts_within(amount, existing_amount, self.config.org_amount_tolerance) {
                continue;
            }
            if (candidate.arrived_at - record.published_at).abs() > window {
                continue;
            }
            let shares_url = record
                .source_urls
                .iter()
                .any(|url| candidate.source_urls.contains(url));
            if shares_url {
                continue; // same URL is the exact-signature/title territory
            }
            matches.push(DuplicateMatch {
                strategy: DedupStrategy::OrgFundingMatch,
                existing_id: record.id.clone(),
                existing_dedup_hash: record.dedup_hash.clone(),
                score: ORG_FUNDING_SCORE,
            });
        }
    }

    /// Strategy 7: announcement-chain detection. Three or more distinct
    /// source URLs for one (organization, amount, round) cluster within
    /// the chain window collapse onto the earliest published member.
    fn announcement_chain(
        &self,
        candidate: &CandidateRecord,
        org: &org::ResolvedOrg,
        corpus: &[OpportunityRecord],
        matches: &mut Vec<DuplicateMatch>,
    ) {
        let Some(amount) = candidate.fields.amount_usd else {
            return;
        };
        let stage = candidate
            .fields
            .stage
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or_default();
        let window = ChronoDuration::days(self.config.chain_window_days);

        let cluster: Vec<&OpportunityRecord> = corpus
            .iter()
            .filter(|record| {
                record.organization_id == org.id
                    && record.fields.amount_usd.is_some_and(|a| {
                        amounts_within(amount, a, self.config.temporal_amount_tolerance)
                    })
                    && record
                        .fields
                        .stage
                        .as_deref()
                        .map(str::to_lowercase)
                        .unwrap_or_default()
                        == stage
                    && (candidate.arrived_at - record.published_at).abs() <= window
            })
            .collect();
        if cluster.is_empty() {
            return;
        }

        let mut distinct_urls: std::collections::HashSet<&str> = cluster
            .iter()
            .flat_map(|record| record.source_urls.iter().map(String::as_str))
            .collect();
        for url in &candidate.source_urls {
            distinct_urls.insert(url.as_str());
        }
        if distinct_urls.len() < self.config.chain_min_urls {
            return;
        }

        // Collapse onto the earliest member of the chain.
        if let Some(canonical) = cluster
            .iter()
            .min_by_key(|record| record.published_at)
        {
            matches.push(DuplicateMatch {
                strategy: DedupStrategy::AnnouncementChain,
                existing_id: canonical.id.clone(),
                existing_dedup_hash: canonical.dedup_hash.clone(),
                score: ANNOUNCEMENT_CHAIN_SCORE,
            });
        }
    }
}

fn amounts_within(a: f64, b: f64, tolerance: f64) -> bool {
    if a == 0.0 && b == 0.0 {
        return true;
    }
    let reference = a.abs().max(b.abs());
    (a - b).abs() <= reference * tolerance
}
