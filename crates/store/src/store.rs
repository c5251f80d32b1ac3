//! Job store trait and the shared finalization routine.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use greenops_core::{ItemOutcome, Job, JobStatus, ProgressUpdate};

use crate::error::StoreError;

/// Durable record of job metadata, progress counters and results.
///
/// Implementations must make [`JobStore::update_job_progress`] a single
/// atomic store operation: many workers call it concurrently for the same
/// job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Allocate a new `Pending` job with zeroed counters and no results.
    async fn create_job(
        &self,
        resource_types: BTreeSet<String>,
        total_items: u32,
    ) -> Result<Job, StoreError>;

    /// Point read.
    async fn get_job(&self, job_id: &str) -> Result<Job, StoreError>;

    /// Write `status` (stamping `completed_at` when terminal).
    ///
    /// Only legal lifecycle moves are applied; anything else, in particular
    /// any write to a job that is already terminal, is a no-op that returns
    /// `Ok(false)`.
    async fn update_job_status(&self, job_id: &str, status: JobStatus) -> Result<bool, StoreError>;

    /// Record the outcome of one item, keyed by `(job_id, item_index)`.
    ///
    /// Atomically: rejects an index that was already recorded (returning
    /// `applied == false`), bumps exactly one counter, appends the
    /// non-empty result, and finalizes the job when this write is the one
    /// that made it converge while `Processing`.
    async fn update_job_progress(
        &self,
        job_id: &str,
        item_index: u32,
        outcome: &ItemOutcome,
    ) -> Result<ProgressUpdate, StoreError>;

    /// Drop jobs whose TTL has passed. Stores with native expiry return 0.
    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(0)
    }

    /// Backend name for logs and health output.
    fn backend(&self) -> &'static str;

    /// Finalize a converged job that is still `Processing`, then return the
    /// current record.
    ///
    /// Safe to call from any number of racing callers: the status write is
    /// guarded, so only the first one changes anything. A job that has not
    /// converged is returned untouched.
    async fn finalize_if_converged(&self, job_id: &str) -> Result<Job, StoreError> {
        let job = self.get_job(job_id).await?;
        if !job.needs_finalization() {
            return Ok(job);
        }

        let target = job.final_status();
        if self.update_job_status(job_id, target).await? {
            info!(
                job_id,
                status = %target,
                completed = job.completed_items,
                failed = job.failed_items,
                "Job finalized"
            );
        } else {
            debug!(job_id, "Job already finalized by another caller");
        }
        self.get_job(job_id).await
    }
}
