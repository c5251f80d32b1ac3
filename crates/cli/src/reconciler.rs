//! Client-side status reconciliation.
//!
//! Polls a job until it is terminal and returns its results. A job whose
//! counters already add up to `total_items` but whose status is still
//! `processing` lost the finalization race on the worker side; after
//! `stall_threshold` such polls with no counter movement the reconciler asks
//! the server to run the finalization check itself (`force_complete=true`).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use greenops_core::{JobStatus, ResultRecord};

/// Job status as served by `GET /jobs/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub total_items: u32,
    pub completed_items: u32,
    pub failed_items: u32,
    #[serde(default)]
    pub resource_types: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<ResultRecord>>,
}

impl JobSnapshot {
    pub fn processed_items(&self) -> u32 {
        self.completed_items.saturating_add(self.failed_items)
    }

    pub fn is_converged(&self) -> bool {
        self.processed_items() >= self.total_items
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("server returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {job_id} not finished after {attempts} polls")]
    PollTimeout { job_id: String, attempts: u32 },

    #[error("could not fetch results for job {job_id}: {source}")]
    Results {
        job_id: String,
        #[source]
        source: FetchError,
    },
}

/// Where job status comes from. Implemented by the HTTP client; tests script it.
#[async_trait]
pub trait JobStatusSource: Send + Sync {
    async fn job_status(
        &self,
        job_id: &str,
        force_complete: bool,
    ) -> Result<JobSnapshot, FetchError>;

    async fn job_results(&self, job_id: &str) -> Result<Vec<ResultRecord>, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub stall_threshold: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_attempts: 60,
            stall_threshold: 3,
        }
    }
}

/// A terminal job and its results.
#[derive(Debug, Clone, Serialize)]
pub struct Reconciled {
    pub job: JobSnapshot,
    pub results: Vec<ResultRecord>,
    /// Polls spent, including the one that saw the terminal status.
    pub attempts: u32,
    /// Whether a forced completion produced the terminal status.
    pub forced: bool,
}

pub struct StatusReconciler<S> {
    source: S,
    config: PollConfig,
}

impl<S: JobStatusSource> StatusReconciler<S> {
    pub fn new(source: S, config: PollConfig) -> Self {
        Self { source, config }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Poll until the job is terminal or the attempt budget runs out.
    pub async fn wait(&self, job_id: &str) -> Result<Reconciled, ReconcileError> {
        let mut last_processed: Option<u32> = None;
        let mut stalls = 0u32;

        for attempt in 1..=self.config.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.poll_interval).await;
            }

            let job = match self.source.job_status(job_id, false).await {
                Ok(job) => job,
                Err(FetchError::NotFound(id)) => return Err(ReconcileError::NotFound(id)),
                Err(e) => {
                    warn!(job_id, attempt, error = %e, "Status poll failed");
                    continue;
                }
            };

            if job.status.is_terminal() {
                return self.finish(job, attempt, false).await;
            }

            let processed = job.processed_items();
            let moved = last_processed != Some(processed);
            last_processed = Some(processed);

            if !job.is_converged() {
                stalls = 0;
                debug!(job_id, attempt, processed, total = job.total_items, "Job in progress");
                continue;
            }

            stalls = if moved { 1 } else { stalls + 1 };
            debug!(job_id, attempt, stalls, "Job converged but not finalized");
            if stalls < self.config.stall_threshold {
                continue;
            }

            info!(job_id, attempt, stalls, "Forcing completion");
            match self.source.job_status(job_id, true).await {
                Ok(forced) if forced.status.is_terminal() => {
                    return self.finish(forced, attempt, true).await;
                }
                Ok(forced) => {
                    warn!(job_id, status = %forced.status, "Forced completion left job running")
                }
                Err(FetchError::NotFound(id)) => return Err(ReconcileError::NotFound(id)),
                Err(e) => warn!(job_id, attempt, error = %e, "Forced completion failed"),
            }
        }

        Err(ReconcileError::PollTimeout {
            job_id: job_id.to_string(),
            attempts: self.config.max_attempts,
        })
    }

    async fn finish(
        &self,
        mut job: JobSnapshot,
        attempts: u32,
        forced: bool,
    ) -> Result<Reconciled, ReconcileError> {
        let results = match job.results.take() {
            Some(results) => results,
            None => self
                .source
                .job_results(&job.job_id)
                .await
                .map_err(|source| ReconcileError::Results {
                    job_id: job.job_id.clone(),
                    source,
                })?,
        };
        info!(job_id = %job.job_id, status = %job.status, attempts, forced, "Job finished");
        Ok(Reconciled {
            job,
            results,
            attempts,
            forced,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn snapshot(status: JobStatus, completed: u32, failed: u32) -> JobSnapshot {
        JobSnapshot {
            job_id: "job-1".into(),
            status,
            total_items: 3,
            completed_items: completed,
            failed_items: failed,
            resource_types: vec!["ec2".into()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
            results: None,
        }
    }

    /// Replays canned replies; the last one repeats.
    struct Script {
        replies: Mutex<VecDeque<Result<JobSnapshot, FetchError>>>,
        results_calls: Mutex<u32>,
    }

    impl Script {
        fn new(replies: Vec<Result<JobSnapshot, FetchError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                results_calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl JobStatusSource for Script {
        async fn job_status(&self, _job_id: &str, _force: bool) -> Result<JobSnapshot, FetchError> {
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                replies.pop_front().unwrap()
            } else {
                match replies.front().unwrap() {
                    Ok(job) => Ok(job.clone()),
                    Err(FetchError::NotFound(id)) => Err(FetchError::NotFound(id.clone())),
                    Err(_) => Err(FetchError::Transport("down".into())),
                }
            }
        }

        async fn job_results(&self, _job_id: &str) -> Result<Vec<ResultRecord>, FetchError> {
            *self.results_calls.lock().unwrap() += 1;
            Ok(vec![ResultRecord::default()])
        }
    }

    fn fast(max_attempts: u32) -> PollConfig {
        PollConfig {
            poll_interval: Duration::from_millis(1),
            max_attempts,
            stall_threshold: 3,
        }
    }

    #[tokio::test]
    async fn test_terminal_without_inline_results_fetches_them() {
        let script = Script::new(vec![Ok(snapshot(JobStatus::Failed, 0, 3))]);
        let reconciler = StatusReconciler::new(script, fast(5));

        let done = reconciler.wait("job-1").await.unwrap();
        assert_eq!(done.job.status, JobStatus::Failed);
        assert_eq!(done.attempts, 1);
        assert_eq!(done.results.len(), 1);
        assert_eq!(*reconciler.source().results_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_consume_attempts() {
        let script = Script::new(vec![
            Err(FetchError::Transport("reset".into())),
            Err(FetchError::Http {
                status: 503,
                body: "busy".into(),
            }),
            Ok(snapshot(JobStatus::Completed, 3, 0)),
        ]);
        let done = StatusReconciler::new(script, fast(5)).wait("job-1").await.unwrap();
        assert_eq!(done.attempts, 3);
        assert!(!done.forced);
    }

    #[tokio::test]
    async fn test_not_found_aborts() {
        let script = Script::new(vec![Err(FetchError::NotFound("job-1".into()))]);
        let err = StatusReconciler::new(script, fast(5)).wait("job-1").await.unwrap_err();
        assert!(matches!(err, ReconcileError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_progressing_job_times_out_without_forcing() {
        let script = Script::new(vec![
            Ok(snapshot(JobStatus::Processing, 0, 0)),
            Ok(snapshot(JobStatus::Processing, 1, 0)),
            Ok(snapshot(JobStatus::Processing, 2, 0)),
        ]);
        let err = StatusReconciler::new(script, fast(4)).wait("job-1").await.unwrap_err();
        assert!(matches!(err, ReconcileError::PollTimeout { attempts: 4, .. }));
    }
}
