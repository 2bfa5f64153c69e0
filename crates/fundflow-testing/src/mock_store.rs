//! In-memory opportunity store honoring the publisher's contracts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use fundflow::adapters::{AuditEntry, OpportunityPatch, OpportunityStore, OrganizationAttrs};
use fundflow::record::OpportunityRecord;
use fundflow::{Error, Result};

/// In-memory store. Inserts fail with [`Error::DuplicateKey`] on a
/// dedup-hash collision; merges apply source URLs, merged-from entries and
/// monotonic confidence exactly like the production catalog.
pub struct MockStore {
    records: Mutex<HashMap<String, OpportunityRecord>>,
    organizations: Mutex<HashMap<String, String>>,
    audits: Mutex<Vec<AuditEntry>>,
    /// Remaining writes that fail with a transient error (failure injection)
    transient_failures: AtomicU32,
}

impl MockStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            organizations: Mutex::new(HashMap::new()),
            audits: Mutex::new(Vec::new()),
            transient_failures: AtomicU32::new(0),
        }
    }

    /// Make the next `n` writes fail with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// All published records.
    #[must_use]
    pub fn records(&self) -> Vec<OpportunityRecord> {
        self.records.lock().values().cloned().collect()
    }

    /// A published record by id.
    #[must_use]
    pub fn record_by_id(&self, id: &str) -> Option<OpportunityRecord> {
        self.records.lock().values().find(|r| r.id == id).cloned()
    }

    /// Audit-log entries written so far.
    #[must_use]
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audits.lock().clone()
    }

    /// Seed a published record directly (for dedup corpus fixtures).
    pub fn seed(&self, record: OpportunityRecord) {
        self.records
            .lock()
            .insert(record.dedup_hash.clone(), record);
    }

    fn take_failure(&self) -> bool {
        self.transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OpportunityStore for MockStore {
    async fn find_by_dedup_hash(&self, hash: &str) -> Result<Option<OpportunityRecord>> {
        Ok(self.records.lock().get(hash).cloned())
    }

    async fn find_recent_in_window(&self, days: u32) -> Result<Vec<OpportunityRecord>> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(days));
        Ok(self
            .records
            .lock()
            .values()
            .filter(|r| r.published_at >= cutoff)
            .cloned()
            .collect())
    }

    async fn find_or_create_organization(&self, attrs: &OrganizationAttrs) -> Result<String> {
        let key = attrs.name.trim().to_lowercase();
        let mut orgs = self.organizations.lock();
        let next_id = format!("org-{}", orgs.len() + 1);
        Ok(orgs.entry(key).or_insert(next_id).clone())
    }

    async fn insert_opportunity(&self, opportunity: &OpportunityRecord) -> Result<String> {
        if self.take_failure() {
            return Err(Error::transient("store.insert", "injected failure"));
        }
        let mut records = self.records.lock();
        if records.contains_key(&opportunity.dedup_hash) {
            return Err(Error::DuplicateKey(opportunity.dedup_hash.clone()));
        }
        records.insert(opportunity.dedup_hash.clone(), opportunity.clone());
        Ok(opportunity.id.clone())
    }

    async fn merge_opportunity(&self, id: &str, patch: &OpportunityPatch) -> Result<()> {
        if self.take_failure() {
            return Err(Error::transient("store.merge", "injected failure"));
        }
        let mut records = self.records.lock();
        let record = records
            .values_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::permanent("store.merge", format!("no opportunity {id}")))?;
        for url in &patch.add_source_urls {
            if !record.source_urls.contains(url) {
                record.source_urls.push(url.clone());
            }
        }
        record.merged_from.extend(patch.add_merged_from.clone());
        if let Some(confidence) = patch.confidence {
            // Monotonic: merges never lower a published confidence.
            record.confidence = record.confidence.max(confidence);
        }
        Ok(())
    }

    async fn append_audit_log(&self, entry: &AuditEntry) -> Result<()> {
        self.audits.lock().push(entry.clone());
        Ok(())
    }
}
