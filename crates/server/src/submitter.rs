//! Job submission: create the job, fan its items out onto the queue, start it.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use greenops_core::{ItemOutcome, Job, JobStatus, WorkItem};
use greenops_queue::{QueueError, QueueProducer};
use greenops_store::{JobStore, StoreError};

const STATUS_WRITE_ATTEMPTS: u32 = 3;

/// Resource payloads grouped by type tag.
///
/// `resources` is the general form; `instances`, `s3_buckets` and
/// `rds_instances` are accepted as shorthands for the `ec2`, `s3` and `rds`
/// tags.
#[derive(Debug, Clone, Default, Deserialize, Serialize, utoipa::ToSchema)]
pub struct AnalyzeRequest {
    #[serde(default)]
    #[schema(value_type = Object)]
    pub resources: BTreeMap<String, Vec<Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schema(value_type = Vec<Object>)]
    pub instances: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schema(value_type = Vec<Object>)]
    pub s3_buckets: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schema(value_type = Vec<Object>)]
    pub rds_instances: Vec<Value>,
}

impl AnalyzeRequest {
    /// Payloads per lower-cased type tag, in tag order, empty types dropped.
    pub fn into_batches(self) -> BTreeMap<String, Vec<Value>> {
        let legacy = [
            ("ec2", self.instances),
            ("s3", self.s3_buckets),
            ("rds", self.rds_instances),
        ];
        let mut batches: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for (tag, payloads) in self
            .resources
            .into_iter()
            .chain(legacy.into_iter().map(|(t, p)| (t.to_string(), p)))
        {
            let tag = tag.trim().to_lowercase();
            if tag.is_empty() || payloads.is_empty() {
                continue;
            }
            batches.entry(tag).or_default().extend(payloads);
        }
        batches
    }

    pub fn item_count(&self) -> usize {
        self.resources.values().map(Vec::len).sum::<usize>()
            + self.instances.len()
            + self.s3_buckets.len()
            + self.rds_instances.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct SubmitReceipt {
    pub job_id: String,
    #[schema(value_type = String, example = "processing")]
    pub status: JobStatus,
    pub total_items: u32,
    /// Items that could not be enqueued and were recorded as failed.
    pub enqueue_failures: u32,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("no resources to analyze")]
    EmptyBatch,

    #[error("batch of {0} items is too large")]
    TooLarge(usize),

    #[error("job store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("work queue unavailable for job {job_id}: {reason}")]
    QueueUnavailable { job_id: String, reason: String },

    /// The job was created but could not be fully accounted for or started.
    #[error("job {job_id} left incomplete: {source}")]
    Incomplete {
        job_id: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Clone)]
pub struct Submitter {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn QueueProducer>,
}

impl Submitter {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn QueueProducer>) -> Self {
        Self { store, queue }
    }

    pub async fn submit(&self, request: AnalyzeRequest) -> Result<SubmitReceipt, SubmitError> {
        let batches = request.into_batches();
        let total: usize = batches.values().map(Vec::len).sum();
        if total == 0 {
            return Err(SubmitError::EmptyBatch);
        }
        let total_items = u32::try_from(total).map_err(|_| SubmitError::TooLarge(total))?;

        let resource_types: BTreeSet<String> = batches.keys().cloned().collect();
        let job = self.store.create_job(resource_types, total_items).await?;

        let mut item_index = 0u32;
        let mut enqueue_failures = 0u32;
        let mut last_error: Option<QueueError> = None;
        for (item_type, payloads) in batches {
            for payload in payloads {
                let item = WorkItem::new(&job.job_id, item_index, &item_type, payload);
                if let Err(e) = self.queue.enqueue(&item).await {
                    enqueue_failures += 1;
                    self.record_enqueue_failure(&item, &e)
                        .await
                        .map_err(|source| SubmitError::Incomplete {
                            job_id: job.job_id.clone(),
                            source,
                        })?;
                    last_error = Some(e);
                }
                item_index += 1;
            }
        }

        let job = self.start(&job.job_id).await?;

        if enqueue_failures == total_items {
            let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
            warn!(job_id = %job.job_id, status = %job.status, "No item could be enqueued");
            return Err(SubmitError::QueueUnavailable {
                job_id: job.job_id,
                reason,
            });
        }

        info!(
            job_id = %job.job_id,
            total_items,
            enqueue_failures,
            provider = self.queue.provider(),
            "Job submitted"
        );
        Ok(SubmitReceipt {
            job_id: job.job_id,
            status: job.status,
            total_items,
            enqueue_failures,
        })
    }

    /// An item that never reached the queue is counted as failed right away,
    /// so the job can still converge. If even that write fails the item is
    /// unaccounted for and the submission must not be acknowledged.
    async fn record_enqueue_failure(
        &self,
        item: &WorkItem,
        error: &QueueError,
    ) -> Result<(), StoreError> {
        warn!(
            job_id = %item.job_id,
            item_index = item.item_index,
            item_type = %item.item_type,
            error = %error,
            "Enqueue failed, recording item as failed"
        );
        let outcome = ItemOutcome::failed(format!("enqueue failed: {error}"));
        retry_transient(&item.job_id, "Enqueue failure write", || {
            self.store.update_job_progress(&item.job_id, item.item_index, &outcome)
        })
        .await
        .map(|_| ())
    }

    /// Pending -> Processing, then finalize in case every item was already
    /// accounted for.
    async fn start(&self, job_id: &str) -> Result<Job, SubmitError> {
        let incomplete = |source| SubmitError::Incomplete {
            job_id: job_id.to_string(),
            source,
        };
        retry_transient(job_id, "Status write", || {
            self.store.update_job_status(job_id, JobStatus::Processing)
        })
        .await
        .map_err(incomplete)?;
        self.store.finalize_if_converged(job_id).await.map_err(incomplete)
    }
}

/// Run a store write, retrying transient errors with linear backoff.
async fn retry_transient<T, F, Fut>(
    job_id: &str,
    what: &str,
    mut write: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1;
    loop {
        match write().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < STATUS_WRITE_ATTEMPTS => {
                warn!(job_id, attempt, error = %e, "{what} failed, retrying");
                tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
