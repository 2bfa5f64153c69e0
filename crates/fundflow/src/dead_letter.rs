// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Dead-letter entries for candidates that exhausted their pipeline
//! attempts.
//!
//! Entries carry enough context for forensic analysis and replay: the
//! failing stage, the error and its kind, the full candidate payload, and
//! a trace id for log correlation. Storage lives in the persisted queue
//! (see [`crate::queue`]); operators reprocess entries through the admin
//! surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::CandidateRecord;

/// A candidate that could not complete the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Content-hash of the failed candidate
    pub candidate_hash: String,
    /// Stage that gave up ("router", "classify", "dedup", "validate", "publish")
    pub stage: String,
    /// Error message describing why processing failed
    pub error: String,
    /// Error classification (transient_external, permanent_external, ...)
    pub error_kind: String,
    /// Full candidate, JSON-serialized for replay
    pub candidate: CandidateRecord,
    /// Unique trace ID for correlating logs
    pub trace_id: String,
    /// When the entry was written
    pub created_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Build an entry for a candidate failing at `stage`.
    #[must_use]
    pub fn new(candidate: CandidateRecord, stage: &str, error: &crate::Error) -> Self {
        Self {
            candidate_hash: candidate.content_hash.clone(),
            stage: stage.to_string(),
            error: error.to_string(),
            error_kind: error_kind_label(error).to_string(),
            candidate,
            trace_id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Stable label for an error's kind, used in dead-letter rows and metrics.
#[must_use]
pub fn error_kind_label(error: &crate::Error) -> &'static str {
    use crate::Error;
    match error {
        Error::TransientExternal { .. } => "transient_external",
        Error::PermanentExternal { .. } => "permanent_external",
        Error::DeadlineExceeded { .. } => "deadline_exceeded",
        Error::SchemaViolation(_) => "schema_violation",
        Error::DuplicateContent(_) => "duplicate_content",
        Error::DuplicateKey(_) => "duplicate_key",
        Error::QueueFull { .. } => "queue_full",
        Error::BreakerOpen { .. } => "breaker_open",
        Error::InternalInvariant(_) => "internal_invariant",
        Error::Database(_) => "database",
        _ => "other",
    }
}
