//! Opportunity store adapter.
//!
//! All operations are idempotent by dedup-hash (opportunities) or natural
//! key (organizations); the publisher relies on `insert_opportunity`
//! failing with [`crate::Error::DuplicateKey`] on a hash collision to
//! redirect concurrent same-hash inserts into merges.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::record::OpportunityRecord;

/// Natural-key attributes for organization resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationAttrs {
    /// Organization name as extracted
    pub name: String,
    /// Country hint, when known (used as the fuzzy-match tie-break)
    pub country: Option<String>,
}

/// Patch applied by a merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpportunityPatch {
    /// Source URLs to append (deduplicated by the store)
    pub add_source_urls: Vec<String>,
    /// Candidate content-hashes to append to `merged_from`
    pub add_merged_from: Vec<String>,
    /// New confidence, only applied if greater than the stored value
    pub confidence: Option<f64>,
}

/// Audit-log entry written on every publisher mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Acting component ("publisher", "operator")
    pub actor: String,
    /// Operation ("insert", "merge", "enqueue_review", "reprocess")
    pub action: String,
    /// Affected opportunity id or dedup-hash
    pub subject: String,
    /// Why the action happened
    pub reason: String,
    /// When it happened
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    /// Entry from the publisher for `action` on `subject`.
    #[must_use]
    pub fn publisher(action: &str, subject: &str, reason: &str) -> Self {
        Self {
            actor: "publisher".to_string(),
            action: action.to_string(),
            subject: subject.to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        }
    }
}

/// The persistent opportunity catalog. Only the publisher writes to it;
/// the dedup engine reads the recent corpus through it.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    /// Look up a published record by dedup-hash.
    async fn find_by_dedup_hash(&self, hash: &str) -> Result<Option<OpportunityRecord>>;

    /// The dedup corpus: records published within the last `days` days.
    async fn find_recent_in_window(&self, days: u32) -> Result<Vec<OpportunityRecord>>;

    /// Resolve (or create) a canonical organization, idempotent by natural
    /// key.
    async fn find_or_create_organization(&self, attrs: &OrganizationAttrs) -> Result<String>;

    /// Insert a new opportunity. Fails with [`crate::Error::DuplicateKey`]
    /// when the dedup-hash is already published.
    async fn insert_opportunity(&self, opportunity: &OpportunityRecord) -> Result<String>;

    /// Apply a merge patch to an existing opportunity.
    async fn merge_opportunity(&self, id: &str, patch: &OpportunityPatch) -> Result<()>;

    /// Append an audit-log entry.
    async fn append_audit_log(&self, entry: &AuditEntry) -> Result<()>;
}
