//! Pipeline configuration.
//!
//! Every threshold the pipeline consults is a config field with the
//! documented default; `PipelineConfig::from_env()` overrides the common
//! operational knobs from the environment. Components receive their own
//! sub-config by value so they can be constructed in isolation for tests.

use std::path::PathBuf;
use std::time::Duration;

use crate::env_vars::{
    env_f64_or_default, env_string, env_string_or_default, env_u64_or_default,
    env_usize_or_default, FUNDFLOW_ADMIN_ADDR, FUNDFLOW_AUTO_APPROVE,
    FUNDFLOW_BREAKER_COOL_DOWN_SECS, FUNDFLOW_DEDUP_HARD_THRESHOLD,
    FUNDFLOW_DEDUP_LIKELY_FLOOR, FUNDFLOW_ENRICHMENT_THRESHOLD,
    FUNDFLOW_ENRICHMENT_TIMEOUT_SECS, FUNDFLOW_QUEUE_DB_PATH, FUNDFLOW_REVIEW_FLOOR,
    FUNDFLOW_ROUTER_CAPACITY, FUNDFLOW_SCRAPE_WORKERS, FUNDFLOW_USER_AGENT,
};

/// Router queue configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Capacity of each priority tier's bounded queue (default: 256)
    pub tier_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { tier_capacity: 256 }
    }
}

/// Circuit breaker timing configuration.
///
/// Per-collector failure thresholds are a property of the collector kind
/// (see [`crate::record::CollectorKind::breaker_threshold`]); this struct
/// carries only the shared timing knobs.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Cool-down before a half-open probe is admitted (default: 60 s)
    pub cool_down: Duration,
    /// Cap on the doubled cool-down after a failed probe (default: 10 min)
    pub max_cool_down: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            cool_down: Duration::from_secs(60),
            max_cool_down: Duration::from_secs(600),
        }
    }
}

/// Token bucket configuration for collector admission
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Per-minute request quota per collector (default: 60). Bucket
    /// capacity equals the quota; refill is quota/60 per second.
    pub quota_per_minute: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            quota_per_minute: 60,
        }
    }
}

/// Content classifier configuration
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Structured-completeness floor below which enrichment is requested
    /// (default: 0.5, strict less-than)
    pub enrichment_threshold: f64,
    /// How long a parked candidate waits for enrichment before being
    /// forwarded with the fields it has (default: 10 min)
    pub enrichment_timeout: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enrichment_threshold: 0.5,
            enrichment_timeout: Duration::from_secs(600),
        }
    }
}

/// Scrape-queue manager configuration
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    /// Worker pool size (default: 4)
    pub workers: usize,
    /// Attempts before a request is marked failed (default: 3)
    pub max_attempts: u32,
    /// Base delay for exponential backoff (default: 30 s)
    pub backoff_base: Duration,
    /// Backoff cap (default: 10 min)
    pub backoff_cap: Duration,
    /// Jitter fraction applied to each delay, +/- (default: 0.2)
    pub jitter_frac: f64,
    /// Per-domain fetch quota per minute (default: 30)
    pub domain_quota_per_minute: u64,
    /// Idle poll interval when the queue is empty (default: 500 ms)
    pub poll_interval: Duration,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(600),
            jitter_frac: 0.2,
            domain_quota_per_minute: 30,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Deduplication engine configuration
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Token-sort edit-distance ratio floor for title matches (default: 0.85)
    pub title_ratio: f64,
    /// Window for title matches, in days (default: 90)
    pub title_window_days: i64,
    /// TF-IDF cosine floor for content matches (default: 0.80)
    pub tfidf_cosine: f64,
    /// Embedding-space cosine floor for semantic matches (default: 0.88)
    pub embedding_cosine: f64,
    /// Amount tolerance for temporal clustering (default: +/-5 %)
    pub temporal_amount_tolerance: f64,
    /// Window for temporal clustering, in hours (default: 72)
    pub temporal_window_hours: i64,
    /// Amount tolerance for organization-funding matches (default: +/-10 %)
    pub org_amount_tolerance: f64,
    /// Window for organization-funding matches, in days (default: 180)
    pub org_window_days: i64,
    /// Distinct source URLs required for an announcement chain (default: 3)
    pub chain_min_urls: usize,
    /// Window for announcement-chain detection, in days (default: 14)
    pub chain_window_days: i64,
    /// Aggregate score at or above which the verdict is Duplicate (default: 0.90)
    pub hard_threshold: f64,
    /// Aggregate score at or above which the verdict is LikelyDuplicate
    /// (default: 0.75)
    pub likely_floor: f64,
    /// How far back the dedup corpus reaches, in days (default: 180)
    pub corpus_window_days: u32,
    /// Normalized-name similarity floor for canonical organization
    /// resolution (default: 0.82)
    pub org_match_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            title_ratio: 0.85,
            title_window_days: 90,
            tfidf_cosine: 0.80,
            embedding_cosine: 0.88,
            temporal_amount_tolerance: 0.05,
            temporal_window_hours: 72,
            org_amount_tolerance: 0.10,
            org_window_days: 180,
            chain_min_urls: 3,
            chain_window_days: 14,
            hard_threshold: 0.90,
            likely_floor: 0.75,
            corpus_window_days: 180,
            org_match_threshold: 0.82,
        }
    }
}

/// Validator scoring weights. Must sum to 1.0; `normalized()` rescales.
#[derive(Debug, Clone)]
pub struct ValidatorWeights {
    /// Weight of dedup-adjusted uniqueness
    pub uniqueness: f64,
    /// Weight of the origin collector's quality score
    pub source_quality: f64,
    /// Weight of classifier structured-completeness
    pub completeness: f64,
    /// Weight of the LLM legitimacy check
    pub legitimacy: f64,
    /// Weight of verifiable-field presence
    pub verifiable: f64,
}

impl Default for ValidatorWeights {
    fn default() -> Self {
        Self {
            uniqueness: 0.30,
            source_quality: 0.20,
            completeness: 0.20,
            legitimacy: 0.20,
            verifiable: 0.10,
        }
    }
}

impl ValidatorWeights {
    /// Weights rescaled to sum to 1.0 (guards against hand-edited configs).
    #[must_use]
    pub fn normalized(&self) -> ValidatorWeights {
        let sum = self.uniqueness
            + self.source_quality
            + self.completeness
            + self.legitimacy
            + self.verifiable;
        if sum <= 0.0 || !sum.is_finite() {
            return ValidatorWeights::default();
        }
        ValidatorWeights {
            uniqueness: self.uniqueness / sum,
            source_quality: self.source_quality / sum,
            completeness: self.completeness / sum,
            legitimacy: self.legitimacy / sum,
            verifiable: self.verifiable / sum,
        }
    }
}

/// AI validator configuration
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Score at or above which a record auto-publishes (default: 0.85)
    pub auto_approve: f64,
    /// Score at or above which a record goes to review; below it, reject
    /// (default: 0.65)
    pub review_floor: f64,
    /// Component weights
    pub weights: ValidatorWeights,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            auto_approve: 0.85,
            review_floor: 0.65,
            weights: ValidatorWeights::default(),
        }
    }
}

/// Publisher retry configuration
#[derive(Debug, Clone)]
pub struct PublishConfig {
    /// Store-write retry attempts (default: 3)
    pub store_retry_attempts: u32,
    /// Base delay for store-write backoff (default: 500 ms)
    pub store_retry_base: Duration,
    /// Store-write backoff cap (default: 10 s)
    pub store_retry_cap: Duration,
    /// Attempts a candidate gets across the whole pipeline before it is
    /// dead-lettered (default: 3)
    pub max_pipeline_attempts: u32,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            store_retry_attempts: 3,
            store_retry_base: Duration::from_millis(500),
            store_retry_cap: Duration::from_secs(10),
            max_pipeline_attempts: 3,
        }
    }
}

/// Per-call deadlines for external calls
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// LLM call deadline (default: 30 s)
    pub llm: Duration,
    /// Embedding call deadline (default: 10 s)
    pub embedding: Duration,
    /// HTTP fetch deadline (default: 30 s)
    pub http: Duration,
    /// Store write deadline (default: 10 s)
    pub store: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            llm: Duration::from_secs(30),
            embedding: Duration::from_secs(10),
            http: Duration::from_secs(30),
            store: Duration::from_secs(10),
        }
    }
}

/// Top-level pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Router queue sizing
    pub router: RouterConfig,
    /// Breaker timing
    pub breaker: BreakerConfig,
    /// Collector admission quotas
    pub rate_limit: RateLimitConfig,
    /// Classifier thresholds
    pub classifier: ClassifierConfig,
    /// Scrape-queue manager
    pub scrape: ScrapeConfig,
    /// Dedup thresholds
    pub dedup: DedupConfig,
    /// Validator tiers and weights
    pub validator: ValidatorConfig,
    /// Publisher retries
    pub publish: PublishConfig,
    /// External-call deadlines
    pub timeouts: TimeoutConfig,
    /// SQLite path for the persisted queues; `None` = in-memory (data lost
    /// on restart; the queue logs a warning)
    pub queue_db_path: Option<PathBuf>,
    /// Operator control endpoint bind address
    pub admin_addr: String,
    /// User agent for outbound fetches
    pub user_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            breaker: BreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            classifier: ClassifierConfig::default(),
            scrape: ScrapeConfig::default(),
            dedup: DedupConfig::default(),
            validator: ValidatorConfig::default(),
            publish: PublishConfig::default(),
            timeouts: TimeoutConfig::default(),
            queue_db_path: None,
            admin_addr: "127.0.0.1:8920".to_string(),
            user_agent: concat!("fundflow/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables, falling back to the
    /// documented defaults for anything unset.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            router: RouterConfig {
                tier_capacity: env_usize_or_default(
                    FUNDFLOW_ROUTER_CAPACITY,
                    defaults.router.tier_capacity,
                ),
            },
            breaker: BreakerConfig {
                cool_down: Duration::from_secs(env_u64_or_default(
                    FUNDFLOW_BREAKER_COOL_DOWN_SECS,
                    defaults.breaker.cool_down.as_secs(),
                )),
                ..BreakerConfig::default()
            },
            rate_limit: defaults.rate_limit,
            classifier: ClassifierConfig {
                enrichment_threshold: env_f64_or_default(
                    FUNDFLOW_ENRICHMENT_THRESHOLD,
                    defaults.classifier.enrichment_threshold,
                ),
                enrichment_timeout: Duration::from_secs(env_u64_or_default(
                    FUNDFLOW_ENRICHMENT_TIMEOUT_SECS,
                    defaults.classifier.enrichment_timeout.as_secs(),
                )),
            },
            scrape: ScrapeConfig {
                workers: env_usize_or_default(FUNDFLOW_SCRAPE_WORKERS, defaults.scrape.workers),
                ..ScrapeConfig::default()
            },
            dedup: DedupConfig {
                hard_threshold: env_f64_or_default(
                    FUNDFLOW_DEDUP_HARD_THRESHOLD,
                    defaults.dedup.hard_threshold,
                ),
                likely_floor: env_f64_or_default(
                    FUNDFLOW_DEDUP_LIKELY_FLOOR,
                    defaults.dedup.likely_floor,
                ),
                ..DedupConfig::default()
            },
            validator: ValidatorConfig {
                auto_approve: env_f64_or_default(
                    FUNDFLOW_AUTO_APPROVE,
                    defaults.validator.auto_approve,
                ),
                review_floor: env_f64_or_default(
                    FUNDFLOW_REVIEW_FLOOR,
                    defaults.validator.review_floor,
                ),
                weights: defaults.validator.weights,
            },
            publish: defaults.publish,
            timeouts: defaults.timeouts,
            queue_db_path: env_string(FUNDFLOW_QUEUE_DB_PATH).map(PathBuf::from),
            admin_addr: env_string_or_default(FUNDFLOW_ADMIN_ADDR, &defaults.admin_addr),
            user_agent: env_string_or_default(FUNDFLOW_USER_AGENT, &defaults.user_agent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_thresholds() {
        let config = PipelineConfig::default();
        assert_eq!(config.classifier.enrichment_threshold, 0.5);
        assert_eq!(config.classifier.enrichment_timeout, Duration::from_secs(600));
        assert_eq!(config.dedup.hard_threshold, 0.90);
        assert_eq!(config.dedup.likely_floor, 0.75);
        assert_eq!(config.validator.auto_approve, 0.85);
        assert_eq!(config.validator.review_floor, 0.65);
        assert_eq!(config.breaker.cool_down, Duration::from_secs(60));
        assert_eq!(config.breaker.max_cool_down, Duration::from_secs(600));
        assert_eq!(config.scrape.workers, 4);
        assert_eq!(config.scrape.max_attempts, 3);
        assert_eq!(config.publish.max_pipeline_attempts, 3);
    }

    #[test]
    fn test_timeout_defaults() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.llm, Duration::from_secs(30));
        assert_eq!(timeouts.embedding, Duration::from_secs(10));
        assert_eq!(timeouts.http, Duration::from_secs(30));
        assert_eq!(timeouts.store, Duration::from_secs(10));
    }

    #[test]
    fn test_weights_normalize_to_unit_sum() {
        let weights = ValidatorWeights {
            uniqueness: 3.0,
            source_quality: 2.0,
            completeness: 2.0,
            legitimacy: 2.0,
            verifiable: 1.0,
        }
        .normalized();
        let sum = weights.uniqueness
            + weights.source_quality
            + weights.completeness
            + weights.legitimacy
            + weights.verifiable;
        assert!((sum - 1.0).abs() < 1e-9);
        assert!((weights.uniqueness - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_weights_fall_back_to_default() {
        let weights = ValidatorWeights {
            uniqueness: 0.0,
            source_quality: 0.0,
            completeness: 0.0,
            legitimacy: 0.0,
            verifiable: 0.0,
        }
        .normalized();
        assert_eq!(weights.uniqueness, ValidatorWeights::default().uniqueness);
    }
}
