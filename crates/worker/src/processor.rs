//! Per-item processing: analyze, record, finalize.
//!
//! Recording policy for one work item:
//!
//! | analyzer result           | recorded as                         |
//! |---------------------------|-------------------------------------|
//! | success                   | completed, with the record          |
//! | error, fallback available | completed, with the degraded record |
//! | error, no fallback        | failed                              |
//!
//! A timeout is just another analyzer error. Every path ends in a progress
//! write, so an item is never left unaccounted for.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use greenops_core::config::WorkerConfig;
use greenops_core::{ItemOutcome, JobStatus, ProgressUpdate, WorkItem};
use greenops_store::{JobStore, StoreError};

use crate::analyzer::{AnalyzerError, AnalyzerRegistry};
use crate::error::WorkerError;

/// Backoff for transient store errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    Fallback,
    Failed,
}

/// What happened to the progress write.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Recorded(ProgressUpdate),
    /// The item had already been recorded by an earlier delivery.
    Duplicate(ProgressUpdate),
    /// The store will never accept this item (unknown or expired job,
    /// index out of range).
    Dropped { reason: String },
    /// Recording failed and may succeed on redelivery.
    Unrecorded { error: String },
}

impl Disposition {
    /// Whether the queue message can be deleted.
    pub fn should_ack(&self) -> bool {
        !matches!(self, Disposition::Unrecorded { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ProcessReport {
    pub job_id: String,
    pub item_index: u32,
    pub outcome: OutcomeKind,
    pub disposition: Disposition,
    /// Job status after recording and finalization, when known.
    pub job_status: Option<JobStatus>,
}

pub struct ItemProcessor {
    store: Arc<dyn JobStore>,
    registry: Arc<AnalyzerRegistry>,
    analyzer_timeout: Duration,
    invocation_timeout: Duration,
    retry: RetryPolicy,
}

impl ItemProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<AnalyzerRegistry>,
        analyzer_timeout: Duration,
        invocation_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            analyzer_timeout,
            invocation_timeout,
            retry: RetryPolicy::default(),
        }
    }

    /// Build the analyzer registry from `config` and wrap it. Fails on a
    /// malformed analyzer URL.
    pub fn from_config(
        store: Arc<dyn JobStore>,
        config: &WorkerConfig,
    ) -> Result<Self, WorkerError> {
        let registry = AnalyzerRegistry::from_config(config)?;
        if registry.is_empty() {
            warn!("No ANALYZER_URL configured: every item will be recorded as failed");
        }
        Ok(Self::new(
            store,
            Arc::new(registry),
            config.analyzer_timeout(),
            config.invocation_timeout(),
        ))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn process(&self, item: WorkItem) -> ProcessReport {
        let deadline = Instant::now() + self.invocation_timeout;

        let (outcome, kind) = self.analyze(&item, deadline).await;
        let disposition = self.record(&item, outcome, deadline).await;

        let mut job_status = match &disposition {
            Disposition::Recorded(u) | Disposition::Duplicate(u) => Some(u.status),
            _ => None,
        };

        // The write that converged the job normally finalized it already;
        // this covers jobs that converged while still Pending.
        if let Disposition::Recorded(update) | Disposition::Duplicate(update) = &disposition {
            if update.is_converged() && !update.status.is_terminal() {
                match self.store.finalize_if_converged(&item.job_id).await {
                    Ok(job) => job_status = Some(job.status),
                    Err(e) => warn!(job_id = %item.job_id, error = %e, "Finalization check failed"),
                }
            }
        }

        ProcessReport {
            job_id: item.job_id,
            item_index: item.item_index,
            outcome: kind,
            disposition,
            job_status,
        }
    }

    async fn analyze(&self, item: &WorkItem, deadline: Instant) -> (ItemOutcome, OutcomeKind) {
        let analyzer = match self.registry.get(&item.item_type) {
            Ok(a) => a,
            Err(e) => {
                warn!(
                    job_id = %item.job_id,
                    item_index = item.item_index,
                    item_type = %item.item_type,
                    "No analyzer for item type"
                );
                return (ItemOutcome::failed(e.to_string()), OutcomeKind::Failed);
            }
        };

        let budget = self.analyzer_timeout.min(deadline.saturating_duration_since(Instant::now()));
        let result = match tokio::time::timeout(budget, analyzer.analyze(item)).await {
            Ok(result) => result,
            Err(_) => Err(AnalyzerError::Timeout(budget)),
        };

        match result {
            Ok(record) => {
                debug!(job_id = %item.job_id, item_index = item.item_index, "Analysis succeeded");
                (ItemOutcome::Succeeded(Some(record.for_item(item))), OutcomeKind::Success)
            }
            Err(err) => match analyzer.fallback(item, &err) {
                Some(record) => {
                    warn!(
                        job_id = %item.job_id,
                        item_index = item.item_index,
                        item_type = %item.item_type,
                        error = %err,
                        "Analysis failed, recording degraded result"
                    );
                    (ItemOutcome::Succeeded(Some(record.for_item(item))), OutcomeKind::Fallback)
                }
                None => {
                    warn!(
                        job_id = %item.job_id,
                        item_index = item.item_index,
                        item_type = %item.item_type,
                        error = %err,
                        "Analysis failed"
                    );
                    (ItemOutcome::failed(err.to_string()), OutcomeKind::Failed)
                }
            },
        }
    }

    async fn record(
        &self,
        item: &WorkItem,
        mut outcome: ItemOutcome,
        deadline: Instant,
    ) -> Disposition {
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 1u32;

        loop {
            match self.store.update_job_progress(&item.job_id, item.item_index, &outcome).await {
                Ok(update) if update.applied => {
                    debug!(
                        job_id = %item.job_id,
                        item_index = item.item_index,
                        processed = update.processed_items(),
                        total = update.total_items,
                        "Progress recorded"
                    );
                    return Disposition::Recorded(update);
                }
                Ok(update) => {
                    info!(
                        job_id = %item.job_id,
                        item_index = item.item_index,
                        "Item already recorded, skipping"
                    );
                    return Disposition::Duplicate(update);
                }
                Err(StoreError::Encoding(e)) if outcome.is_success() => {
                    warn!(
                        job_id = %item.job_id,
                        item_index = item.item_index,
                        error = %e,
                        "Result not storable, counting item as failed"
                    );
                    outcome = ItemOutcome::failed(format!("result could not be encoded: {e}"));
                }
                Err(e @ (StoreError::NotFound(_) | StoreError::InvalidItem { .. })) => {
                    warn!(
                        job_id = %item.job_id,
                        item_index = item.item_index,
                        error = %e,
                        "Dropping item the store will not accept"
                    );
                    return Disposition::Dropped { reason: e.to_string() };
                }
                Err(e) if e.is_retryable() && Instant::now() + backoff < deadline => {
                    warn!(
                        job_id = %item.job_id,
                        item_index = item.item_index,
                        attempt,
                        error = %e,
                        "Transient store error, retrying in {:?}",
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.retry.max_backoff);
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        job_id = %item.job_id,
                        item_index = item.item_index,
                        attempt,
                        error = %e,
                        "Could not record outcome"
                    );
                    return Disposition::Unrecorded { error: e.to_string() };
                }
            }
        }
    }
}
