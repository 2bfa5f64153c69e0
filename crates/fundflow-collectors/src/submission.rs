//! User-submission collector.
//!
//! Records pushed through the admission endpoint arrive on a channel; the
//! collector validates their schema, attaches the submitter identity and
//! emits them at high priority. Schema violations are rejected with a
//! reason and count as soft failures against the source.

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use fundflow::collector::{Collector, CollectorContext, SeenHashes};
use fundflow::health::Outcome;
use fundflow::record::{CandidateRecord, CollectorKind, ExtractedFields, Priority, RawPayload};
use fundflow::{Error, Result};

/// A pushed submission, as received by the admission endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    /// Opportunity title
    pub title: String,
    /// Description text
    pub description: String,
    /// Canonical URL for the opportunity
    pub url: String,
    /// Funding amount in USD, when known
    pub amount_usd: Option<f64>,
    /// Application deadline, when known
    pub deadline: Option<NaiveDate>,
    /// Organization offering the funding
    pub organization: Option<String>,
    /// Identity of the submitter (operator-visible, not authenticated here)
    pub submitter: String,
}

impl Submission {
    fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::SchemaViolation("submission missing title".to_string()));
        }
        if self.url.trim().is_empty() {
            return Err(Error::SchemaViolation("submission missing url".to_string()));
        }
        if url::Url::parse(&self.url).is_err() {
            return Err(Error::SchemaViolation(format!(
                "submission url '{}' is not a valid URL",
                self.url
            )));
        }
        if self.submitter.trim().is_empty() {
            return Err(Error::SchemaViolation(
                "submission missing submitter identity".to_string(),
            ));
        }
        Ok(())
    }
}

/// Producer side handed to the admission endpoint.
#[derive(Clone)]
pub struct SubmissionHandle {
    tx: mpsc::Sender<Submission>,
}

impl SubmissionHandle {
    /// Push a submission into the collector. Errors when the collector has
    /// shut down.
    pub async fn submit(&self, submission: Submission) -> Result<()> {
        self.tx
            .send(submission)
            .await
            .map_err(|_| Error::InternalInvariant("submission collector closed".to_string()))
    }
}

/// User-submission collector.
pub struct UserSubmissionCollector {
    rx: Mutex<Option<mpsc::Receiver<Submission>>>,
    seen: SeenHashes,
}

impl UserSubmissionCollector {
    /// Create the collector and its admission handle.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, SubmissionHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                rx: Mutex::new(Some(rx)),
                seen: SeenHashes::new(),
            },
            SubmissionHandle { tx },
        )
    }

    fn to_candidate(submission: &Submission) -> CandidateRecord {
        let fields = ExtractedFields {
            title: submission.title.clone(),
            description: submission.description.clone(),
            amount_usd: submission.amount_usd,
            deadline: submission.deadline,
            organizations: submission
                .organization
                .iter()
                .cloned()
                .collect(),
            ..ExtractedFields::default()
        };
        let payload = serde_json::json!({
            "submission": submission,
            "submitter": submission.submitter,
        });
        CandidateRecord::new(
            CollectorKind::UserSubmission,
            RawPayload::Structured(payload),
            fields,
            vec![submission.url.clone()],
        )
        .with_priority(Priority::High)
    }
}

#[async_trait]
impl Collector for UserSubmissionCollector {
    fn id(&self) -> CollectorKind {
        CollectorKind::UserSubmission
    }

    async fn run(&self, ctx: CollectorContext) -> Result<()> {
        let mut rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| Error::InternalInvariant("submission collector already running".to_string()))?;
        let mut shutdown = ctx.shutdown.clone();

        loop {
            let submission = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() { return Ok(()); }
                    continue;
                }
                submission = rx.recv() => match submission {
                    Some(submission) => submission,
                    None => return Ok(()),
                },
            };

            if let Err(e) = submission.validate() {
                warn!(submitter = %submission.submitter, error = %e, "submission rejected");
                ctx.report(
                    CollectorKind::UserSubmission,
                    &Outcome::Rejected(e.to_string()),
                );
                continue;
            }

            let started = std::time::Instant::now();
            let record = Self::to_candidate(&submission);
            match ctx.emit(&self.seen, record).await {
                Ok(true) => {
                    ctx.report(
                        CollectorKind::UserSubmission,
                        &Outcome::Success {
                            latency: started.elapsed(),
                            quality_hint: None,
                        },
                    );
                }
                Ok(false) => {
                    debug!(submitter = %submission.submitter, "duplicate submission dropped");
                }
                Err(e) => {
                    warn!(error = %e, "submission emission failed");
                    ctx.report(
                        CollectorKind::UserSubmission,
                        &Outcome::SoftFailure(e.to_string()),
                    );
                }
            }
        }
    }
}
