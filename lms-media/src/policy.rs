//! What happens after a step fails mid-sequence: retried storage deletes, the
//! orphan ledger, and the out-of-band sweep that reconciles storage with the
//! documents that reference it.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lms_blob::MultipartBlobStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// Exponential backoff: attempt `n` waits `base * 2^(n-1)`, capped at `max_backoff`
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first; 1 disables retrying
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A single attempt
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    /// Wait before the retry that follows failed attempt `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds or attempts run out, returning the last error
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    let wait = self.backoff_for(attempt);
                    debug!("Attempt {} failed: {}; retrying in {:?}", attempt, e, wait);
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CleanupPolicy {
    /// Retry applied to deletes of superseded or released objects
    pub delete_retry: RetryPolicy,
    /// Whether objects left without a reference are written to the ledger
    pub record_orphans: bool,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            delete_retry: RetryPolicy::default(),
            record_orphans: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanReason {
    /// Upload completed but the document write failed
    PersistFailed,
    /// The document moved on but the old object could not be deleted
    DeleteFailed,
    /// The operation was dropped between upload and document write
    Cancelled,
}

impl fmt::Display for OrphanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            OrphanReason::PersistFailed => "persist failed",
            OrphanReason::DeleteFailed => "delete failed",
            OrphanReason::Cancelled => "cancelled",
        };
        f.write_str(reason)
    }
}

/// A storage object that may have no document referencing it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanRecord {
    pub key: String,
    pub reason: OrphanReason,
    pub detected_at: DateTime<Utc>,
}

impl OrphanRecord {
    pub fn new<S: Into<String>>(key: S, reason: OrphanReason) -> Self {
        Self {
            key: key.into(),
            reason,
            detected_at: Utc::now(),
        }
    }
}

/// Where orphan records go. Synchronous so it can be written from `Drop`.
pub trait OrphanLedger: Send + Sync {
    /// Record an orphan; a later record for the same key replaces the earlier one
    fn record(&self, record: OrphanRecord);

    fn pending(&self) -> Vec<OrphanRecord>;

    /// Forget `key` once it has been deleted or found referenced
    fn resolve(&self, key: &str);
}

#[derive(Debug, Clone, Default)]
pub struct MemoryOrphanLedger {
    records: Arc<Mutex<BTreeMap<String, OrphanRecord>>>,
}

impl MemoryOrphanLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<OrphanRecord> {
        self.records.lock().get(key).cloned()
    }
}

impl OrphanLedger for MemoryOrphanLedger {
    fn record(&self, record: OrphanRecord) {
        self.records.lock().insert(record.key.clone(), record);
    }

    fn pending(&self) -> Vec<OrphanRecord> {
        self.records.lock().values().cloned().collect()
    }

    fn resolve(&self, key: &str) {
        self.records.lock().remove(key);
    }
}

/// Outcome of a reconcile or sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Keys removed from storage
    pub deleted: Vec<String>,
    /// Ledger entries dropped because a live document references them
    pub adopted: Vec<String>,
    /// Unreferenced objects left alone because they are younger than the grace period
    pub skipped_recent: Vec<String>,
    /// Keys whose delete failed; they stay in the ledger
    pub failed: Vec<String>,
}

/// Deletes storage objects that no live document references.
///
/// Runs out of band, never inside a lifecycle operation. The caller supplies
/// the set of keys referenced by live documents.
pub struct OrphanSweeper {
    store: Arc<dyn MultipartBlobStore>,
    ledger: Arc<dyn OrphanLedger>,
    retry: RetryPolicy,
    grace: chrono::Duration,
}

impl OrphanSweeper {
    pub fn new(store: Arc<dyn MultipartBlobStore>, ledger: Arc<dyn OrphanLedger>) -> Self {
        Self {
            store,
            ledger,
            retry: RetryPolicy::none(),
            grace: chrono::Duration::hours(1),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Objects modified within `grace` are never swept; an upload whose
    /// document write is still in flight looks exactly like an orphan.
    pub fn with_grace(mut self, grace: chrono::Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Settle every ledger entry: delete it from storage, or drop it from the
    /// ledger when a live document references it after all.
    #[instrument(skip_all, fields(pending = tracing::field::Empty))]
    pub async fn reconcile(&self, referenced: &HashSet<String>) -> SweepReport {
        let pending = self.ledger.pending();
        tracing::Span::current().record("pending", pending.len());

        let mut report = SweepReport::default();
        for record in pending {
            if referenced.contains(&record.key) {
                debug!("Orphan {} is referenced again, dropping it", record.key);
                self.ledger.resolve(&record.key);
                report.adopted.push(record.key);
                continue;
            }
            self.delete_into(&record.key, &mut report).await;
        }

        info!(
            "Reconciled orphan ledger: {} deleted, {} adopted, {} failed",
            report.deleted.len(),
            report.adopted.len(),
            report.failed.len()
        );
        report
    }

    /// List every object under `namespace` and delete the unreferenced ones
    /// that are older than the grace period.
    #[instrument(skip_all, fields(namespace = %namespace))]
    pub async fn sweep(
        &self,
        namespace: &str,
        referenced: &HashSet<String>,
    ) -> lms_blob::BlobResult<SweepReport> {
        let prefix = match namespace.trim_matches('/') {
            "" => String::new(),
            ns => format!("{}/", ns),
        };
        let objects = self.store.list(&prefix).await?;
        let cutoff = (Utc::now() - self.grace).timestamp();

        let mut report = SweepReport::default();
        for object in objects {
            if referenced.contains(&object.key) {
                continue;
            }
            if object.last_modified.map_or(true, |modified| modified > cutoff) {
                report.skipped_recent.push(object.key);
                continue;
            }
            self.delete_into(&object.key, &mut report).await;
        }

        info!(
            "Swept {}: {} deleted, {} too recent, {} failed",
            namespace,
            report.deleted.len(),
            report.skipped_recent.len(),
            report.failed.len()
        );
        Ok(report)
    }

    async fn delete_into(&self, key: &str, report: &mut SweepReport) {
        let store = &self.store;
        match self.retry.retry(|_| store.delete(key)).await {
            Ok(()) => {
                self.ledger.resolve(key);
                report.deleted.push(key.to_string());
            }
            Err(e) => {
                warn!("Failed to delete orphan {}: {}", key, e);
                report.failed.push(key.to_string());
            }
        }
    }
}
