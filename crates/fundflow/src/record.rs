//! Core data model: candidate records, published opportunities, and the
//! bit-exact content/dedup hash formats.
//!
//! A [`CandidateRecord`] is immutable after creation; enrichment produces a
//! replacement record (never a mutation) that back-references the original
//! by content-hash. Ownership follows queue membership: whichever component
//! currently holds a record on its queue owns it.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Record priority; router tiers drain High before Normal before Low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Priority {
    /// Requeued/failed work
    Low,
    /// Default for feed- and search-sourced records
    #[default]
    Normal,
    /// User submissions and underserved-region hits
    High,
}

impl Priority {
    /// Stable label for metrics and persisted queue rows.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }

    /// Numeric rank for SQL ordering (higher drains first).
    #[must_use]
    pub fn rank(&self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }
}

/// The four collectors feeding the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectorKind {
    /// RSS/Atom feed poller
    Rss,
    /// External search API rotation
    WebSearch,
    /// Pushed records from the admission endpoint
    UserSubmission,
    /// On-demand deep crawler fed by the scrape queue
    DeepCrawl,
}

impl CollectorKind {
    /// All collectors, in registry order.
    pub const ALL: [CollectorKind; 4] = [
        CollectorKind::Rss,
        CollectorKind::WebSearch,
        CollectorKind::UserSubmission,
        CollectorKind::DeepCrawl,
    ];

    /// Stable identifier used in logs, metrics and the admin API.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectorKind::Rss => "rss",
            CollectorKind::WebSearch => "web-search",
            CollectorKind::UserSubmission => "user-submission",
            CollectorKind::DeepCrawl => "deep-crawl",
        }
    }

    /// Consecutive hard failures that open this collector's breaker.
    #[must_use]
    pub fn breaker_threshold(&self) -> u32 {
        match self {
            CollectorKind::Rss => 5,
            CollectorKind::WebSearch => 3,
            CollectorKind::UserSubmission => 2,
            CollectorKind::DeepCrawl => 3,
        }
    }
}

impl std::str::FromStr for CollectorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rss" => Ok(CollectorKind::Rss),
            "web-search" => Ok(CollectorKind::WebSearch),
            "user-submission" => Ok(CollectorKind::UserSubmission),
            "deep-crawl" => Ok(CollectorKind::DeepCrawl),
            other => Err(format!("unknown collector id '{other}'")),
        }
    }
}

impl std::fmt::Display for CollectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw payload carried by a candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RawPayload {
    /// Plain text (feed summaries, search snippets)
    Text(String),
    /// Fetched HTML awaiting extraction
    Html(String),
    /// Already-structured data (user submissions)
    Structured(serde_json::Value),
}

impl RawPayload {
    /// Text view of the payload for hashing and pattern matching.
    #[must_use]
    pub fn as_text(&self) -> std::borrow::Cow<'_, str> {
        match self {
            RawPayload::Text(t) | RawPayload::Html(t) => std::borrow::Cow::Borrowed(t),
            RawPayload::Structured(v) => std::borrow::Cow::Owned(v.to_string()),
        }
    }
}

/// Equity-aware inclusion flags detected by the classifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionFlags {
    /// Women-focused funding
    pub gender: bool,
    /// Youth-focused funding
    pub youth: bool,
    /// Rural/underserved-area funding
    pub rural: bool,
}

/// Fields extracted from a candidate's payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedFields {
    /// Opportunity or announcement title
    pub title: String,
    /// Longer description text
    pub description: String,
    /// Funding amount normalized to USD, when parseable
    pub amount_usd: Option<f64>,
    /// Application deadline, when parseable
    pub deadline: Option<NaiveDate>,
    /// Transaction/announcement date, when known
    pub transaction_date: Option<NaiveDate>,
    /// Organization names mentioned (first entry is the primary)
    pub organizations: Vec<String>,
    /// Geography tags (countries/regions)
    pub geography: Vec<String>,
    /// Sector tags
    pub sectors: Vec<String>,
    /// Funding stage (e.g. "seed", "series a", "grant")
    pub stage: Option<String>,
    /// Inclusion flags
    pub inclusion: InclusionFlags,
}

impl ExtractedFields {
    /// Primary organization name, if any.
    #[must_use]
    pub fn primary_organization(&self) -> Option<&str> {
        self.organizations.first().map(String::as_str)
    }
}

/// Raw vs enriched candidate, kept as an explicit tagged variant so the
/// classifier can route scrape results back to a parked original by id
/// rather than by pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateKind {
    /// First sighting from a collector
    Raw,
    /// Produced by the deep crawler for a previously-parked candidate
    Enriched {
        /// Content-hash of the candidate that requested the crawl
        source_content_hash: String,
    },
}

/// A unit of work flowing through the pipeline before publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRecord {
    /// SHA-256 of the canonical form; identifies the raw input
    pub content_hash: String,
    /// Originating collector
    pub collector: CollectorKind,
    /// Source URLs fingerprinting this record
    pub source_urls: Vec<String>,
    /// Raw payload
    pub payload: RawPayload,
    /// Extracted fields (sparse until classification/enrichment)
    pub fields: ExtractedFields,
    /// Detected language (ISO 639-1), when known
    pub language: Option<String>,
    /// Arrival timestamp
    pub arrived_at: DateTime<Utc>,
    /// Queue priority
    pub priority: Priority,
    /// Pipeline attempts consumed so far
    pub attempts: u32,
    /// Raw or enriched
    pub kind: CandidateKind,
}

impl CandidateRecord {
    /// Build a new raw candidate, computing its content-hash from the
    /// canonical form of the given fields and URLs.
    #[must_use]
    pub fn new(
        collector: CollectorKind,
        payload: RawPayload,
        fields: ExtractedFields,
        source_urls: Vec<String>,
    ) -> Self {
        let content_hash = content_hash(&payload, &fields, &source_urls);
        Self {
            content_hash,
            collector,
            source_urls,
            payload,
            fields,
            language: None,
            arrived_at: Utc::now(),
            priority: Priority::Normal,
            attempts: 0,
            kind: CandidateKind::Raw,
        }
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the detected language.
    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Build an enriched record that back-references a parked candidate by
    /// content-hash (never by pointer; the classifier resolves the id).
    #[must_use]
    pub fn enriched(
        source_content_hash: String,
        priority: Priority,
        payload: RawPayload,
        fields: ExtractedFields,
        source_urls: Vec<String>,
    ) -> Self {
        let content_hash = content_hash(&payload, &fields, &source_urls);
        Self {
            content_hash,
            collector: CollectorKind::DeepCrawl,
            source_urls,
            payload,
            fields,
            language: None,
            arrived_at: Utc::now(),
            priority,
            attempts: 0,
            kind: CandidateKind::Enriched {
                source_content_hash,
            },
        }
    }

    /// Build the enriched replacement for this candidate, carrying a
    /// back-reference to it and re-deriving the content-hash from the
    /// enriched payload.
    #[must_use]
    pub fn enriched_from(
        original: &CandidateRecord,
        payload: RawPayload,
        fields: ExtractedFields,
        extra_urls: Vec<String>,
    ) -> Self {
        let mut source_urls = original.source_urls.clone();
        for url in extra_urls {
            if !source_urls.contains(&url) {
                source_urls.push(url);
            }
        }
        let mut record = Self::enriched(
            original.content_hash.clone(),
            original.priority,
            payload,
            fields,
            source_urls,
        );
        record.language = original.language.clone();
        record.attempts = original.attempts;
        record
    }

    /// Semantic dedup-hash for this candidate, when the fields needed to
    /// form one are present.
    #[must_use]
    pub fn dedup_hash(&self) -> Option<String> {
        let org = self.fields.primary_organization()?;
        let amount = self.fields.amount_usd?;
        let date = self
            .fields
            .transaction_date
            .or(self.fields.deadline)?;
        Some(dedup_hash(
            org,
            amount,
            date,
            self.fields.stage.as_deref().unwrap_or(""),
        ))
    }
}

/// Verification status of a published opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VerificationStatus {
    /// Published without human review
    #[default]
    Unverified,
    /// Confirmed by an operator
    Verified,
    /// Flagged as contested
    Disputed,
}

/// Lifecycle status of a published opportunity. Records are never deleted;
/// they are soft-deprecated via this status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OpportunityStatus {
    /// Live
    #[default]
    Active,
    /// Soft-deleted
    Deprecated,
}

/// A published funding opportunity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpportunityRecord {
    /// Store-assigned id
    pub id: String,
    /// Semantic-identity hash (distinct from any candidate content-hash)
    pub dedup_hash: String,
    /// Canonical organization id
    pub organization_id: String,
    /// Extracted fields at publish time
    pub fields: ExtractedFields,
    /// All source URLs observed for this opportunity
    pub source_urls: Vec<String>,
    /// Content-hashes of candidates merged into this record
    pub merged_from: Vec<String>,
    /// Verification status
    pub verification: VerificationStatus,
    /// Confidence score; monotonically non-decreasing across merges
    pub confidence: f64,
    /// Equity-aware annotations (inclusion/geography signals)
    pub equity_annotations: Vec<String>,
    /// Lifecycle status
    pub status: OpportunityStatus,
    /// Publication timestamp
    pub published_at: DateTime<Utc>,
}

/// Unit separator used by the canonical content-hash form.
const CANONICAL_SEP: char = '\x1f';

/// Content-hash: SHA-256 over the canonical form of a record - fields
/// concatenated in fixed order, separated by `\x1f`.
#[must_use]
pub fn content_hash(
    payload: &RawPayload,
    fields: &ExtractedFields,
    source_urls: &[String],
) -> String {
    let mut canonical = String::new();
    canonical.push_str(&fields.title);
    canonical.push(CANONICAL_SEP);
    canonical.push_str(&fields.description);
    canonical.push(CANONICAL_SEP);
    if let Some(amount) = fields.amount_usd {
        canonical.push_str(&format!("{amount:.2}"));
    }
    canonical.push(CANONICAL_SEP);
    if let Some(deadline) = fields.deadline {
        canonical.push_str(&deadline.format("%Y-%m-%d").to_string());
    }
    canonical.push(CANONICAL_SEP);
    canonical.push_str(&fields.organizations.join(","));
    canonical.push(CANONICAL_SEP);
    canonical.push_str(&source_urls.join(","));
    canonical.push(CANONICAL_SEP);
    canonical.push_str(&payload.as_text());

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Dedup-hash: SHA-256 over a JSON object with keys sorted alphabetically
/// (`amount`, `date`, `org_name`, `stage`), values lowercased and trimmed,
/// amount rounded to two decimals, date formatted `YYYY-MM-DD`.
#[must_use]
pub fn dedup_hash(org_name: &str, amount_usd: f64, date: NaiveDate, stage: &str) -> String {
    // serde_json serializes map keys in sorted order, which is exactly the
    // alphabetical layout the hash format requires.
    let json = serde_json::json!({
        "amount": format!("{amount_usd:.2}"),
        "date": date.format("%Y-%m-%d").to_string(),
        "org_name": org_name.trim().to_lowercase(),
        "stage": stage.trim().to_lowercase(),
    })
    .to_string();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    hex::encode(hasher.finalize())
}
