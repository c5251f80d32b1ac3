//! In-process job store.
//!
//! Every mutation happens under one write lock, which is what makes the
//! increment, the append and the convergence check a single atomic step.

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use greenops_core::{ItemOutcome, Job, JobStatus, ProgressUpdate, DEFAULT_JOB_TTL_DAYS};

use crate::error::StoreError;
use crate::store::JobStore;

#[derive(Debug)]
struct Entry {
    job: Job,
    /// Idempotency keys already recorded for this job.
    processed: HashSet<u32>,
}

pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
}

impl MemoryJobStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new(Duration::days(DEFAULT_JOB_TTL_DAYS))
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(
        &self,
        resource_types: BTreeSet<String>,
        total_items: u32,
    ) -> Result<Job, StoreError> {
        let job = Job::new(resource_types, total_items, self.ttl);
        self.jobs.write().await.insert(
            job.job_id.clone(),
            Entry {
                job: job.clone(),
                processed: HashSet::new(),
            },
        );
        info!(job_id = %job.job_id, total_items, "Created job");
        Ok(job)
    }

    async fn get_job(&self, job_id: &str) -> Result<Job, StoreError> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))
    }

    async fn update_job_status(&self, job_id: &str, status: JobStatus) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;

        let from = entry.job.status;
        let applied = entry.job.apply_status(status, Utc::now());
        if !applied {
            debug!(job_id, from = %from, to = %status, "Ignored status write");
        }
        Ok(applied)
    }

    async fn update_job_progress(
        &self,
        job_id: &str,
        item_index: u32,
        outcome: &ItemOutcome,
    ) -> Result<ProgressUpdate, StoreError> {
        if let Some(field) = outcome.record().and_then(|r| r.first_non_finite()) {
            return Err(StoreError::Encoding(format!(
                "result for item {item_index}: {field} is not finite"
            )));
        }

        let mut jobs = self.jobs.write().await;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;

        if item_index >= entry.job.total_items {
            return Err(StoreError::InvalidItem {
                job_id: job_id.to_string(),
                item_index,
                total_items: entry.job.total_items,
            });
        }

        if !entry.processed.insert(item_index) {
            debug!(job_id, item_index, "Duplicate progress write ignored");
            return Ok(ProgressUpdate {
                applied: false,
                ..entry.job.progress()
            });
        }

        let now = Utc::now();
        let job = &mut entry.job;
        match outcome {
            ItemOutcome::Succeeded(_) => job.completed_items += 1,
            ItemOutcome::Failed { .. } => job.failed_items += 1,
        }
        if let Some(record) = outcome.record() {
            job.results.push(record.clone());
        }
        job.updated_at = now;

        if job.needs_finalization() {
            let target = job.final_status();
            job.apply_status(target, now);
            info!(job_id, status = %target, "Job finalized on last item");
        }

        Ok(job.progress())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, entry| !entry.job.is_expired(now));
        let purged = before - jobs.len();
        if purged > 0 {
            info!(purged, "Purged expired jobs");
        }
        Ok(purged)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greenops_core::ResultRecord;

    fn record(analysis: &str) -> ResultRecord {
        ResultRecord {
            analysis: analysis.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let store = MemoryJobStore::default();
        assert!(matches!(store.get_job("nope").await, Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.update_job_status("nope", JobStatus::Processing).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.update_job_progress("nope", 0, &ItemOutcome::failed("x")).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_out_of_range_index_is_rejected() {
        let store = MemoryJobStore::default();
        let job = store.create_job(BTreeSet::new(), 2).await.unwrap();
        let err = store
            .update_job_progress(&job.job_id, 2, &ItemOutcome::failed("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidItem { item_index: 2, total_items: 2, .. }));
        assert_eq!(store.get_job(&job.job_id).await.unwrap().processed_items(), 0);
    }

    #[tokio::test]
    async fn test_non_finite_metric_is_an_encoding_error() {
        let store = MemoryJobStore::default();
        let job = store.create_job(BTreeSet::new(), 1).await.unwrap();
        let mut rec = record("bad");
        rec.metrics.insert("cost".into(), f64::INFINITY);

        let err = store
            .update_job_progress(&job.job_id, 0, &ItemOutcome::Succeeded(Some(rec)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Encoding(_)));

        // Nothing was recorded, so the item can still be counted as failed.
        let update = store
            .update_job_progress(&job.job_id, 0, &ItemOutcome::failed("unencodable"))
            .await
            .unwrap();
        assert!(update.applied);
        assert_eq!(update.failed_items, 1);
    }

    #[tokio::test]
    async fn test_pending_job_is_not_finalized_by_progress() {
        let store = MemoryJobStore::default();
        let job = store.create_job(BTreeSet::new(), 1).await.unwrap();
        let update = store
            .update_job_progress(&job.job_id, 0, &ItemOutcome::Succeeded(Some(record("ok"))))
            .await
            .unwrap();
        assert!(update.is_converged());
        assert_eq!(update.status, JobStatus::Pending);

        store.update_job_status(&job.job_id, JobStatus::Processing).await.unwrap();
        let finalized = store.finalize_if_converged(&job.job_id).await.unwrap();
        assert_eq!(finalized.status, JobStatus::Completed);
        assert!(finalized.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_purge_expired_drops_only_stale_jobs() {
        let store = MemoryJobStore::new(Duration::seconds(60));
        let job = store.create_job(BTreeSet::new(), 1).await.unwrap();

        assert_eq!(store.purge_expired(Utc::now()).await.unwrap(), 0);
        assert_eq!(store.len().await, 1);

        let later = Utc::now() + Duration::seconds(120);
        assert_eq!(store.purge_expired(later).await.unwrap(), 1);
        assert!(store.is_empty().await);
        assert!(store.get_job(&job.job_id).await.is_err());
    }
}
