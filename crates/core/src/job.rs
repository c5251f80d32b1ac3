//! Job record, lifecycle status, and progress bookkeeping.
//!
//! A [`Job`] is one batch analysis request. Its counters only ever grow and
//! its status only ever moves forward:
//!
//! ```text
//! Pending ──▶ Processing ──▶ Completed
//!                      └───▶ Failed
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GreenopsError;
use crate::item::ResultRecord;

/// Default store-level time-to-live for job records.
pub const DEFAULT_JOB_TTL_DAYS: i64 = 7;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `self → next` is a legal lifecycle move.
    ///
    /// Terminal states accept nothing; re-asserting the current state is
    /// not a transition either.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    /// States from which `next` may be reached.
    pub fn predecessors(next: JobStatus) -> &'static [JobStatus] {
        match next {
            JobStatus::Pending => &[],
            JobStatus::Processing => &[JobStatus::Pending],
            JobStatus::Completed | JobStatus::Failed => &[JobStatus::Processing],
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = GreenopsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(GreenopsError::InvalidStatus(other.to_string())),
        }
    }
}

/// A batch analysis request tracked as one record with aggregate progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub total_items: u32,
    pub completed_items: u32,
    pub failed_items: u32,
    /// Append-only, in completion order.
    #[serde(default)]
    pub results: Vec<ResultRecord>,
    #[serde(default)]
    pub resource_types: BTreeSet<String>,
    /// Unix seconds after which the store may garbage-collect the record.
    pub expiration_time: i64,
}

impl Job {
    /// Build a fresh `Pending` job with zeroed counters.
    pub fn new(resource_types: BTreeSet<String>, total_items: u32, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            total_items,
            completed_items: 0,
            failed_items: 0,
            results: Vec::new(),
            resource_types,
            expiration_time: now
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
                .timestamp(),
        }
    }

    pub fn processed_items(&self) -> u32 {
        self.completed_items + self.failed_items
    }

    /// `completed_items + failed_items` has reached `total_items`.
    pub fn is_converged(&self) -> bool {
        self.processed_items() >= self.total_items
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Converged while the status field still says `Processing`.
    pub fn needs_finalization(&self) -> bool {
        self.status == JobStatus::Processing && self.is_converged()
    }

    /// Terminal status a converged job settles into.
    pub fn final_status(&self) -> JobStatus {
        final_status_for(self.total_items, self.failed_items)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time <= now.timestamp()
    }

    /// Apply a status write with the lifecycle guard. Returns whether it
    /// changed anything.
    pub fn apply_status(&mut self, next: JobStatus, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        true
    }

    pub fn progress(&self) -> ProgressUpdate {
        ProgressUpdate {
            applied: true,
            total_items: self.total_items,
            completed_items: self.completed_items,
            failed_items: self.failed_items,
            status: self.status,
        }
    }
}

/// `Failed` only when every item failed.
pub fn final_status_for(total_items: u32, failed_items: u32) -> JobStatus {
    if failed_items == total_items {
        JobStatus::Failed
    } else {
        JobStatus::Completed
    }
}

/// What happened to a single work item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// Counted in `completed_items`; the record is appended when non-empty.
    Succeeded(Option<ResultRecord>),
    /// Counted in `failed_items`.
    Failed { reason: String },
}

impl ItemOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        ItemOutcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Succeeded(_))
    }

    /// The record to append, if any.
    pub fn record(&self) -> Option<&ResultRecord> {
        match self {
            ItemOutcome::Succeeded(Some(record)) if !record.is_empty() => Some(record),
            _ => None,
        }
    }
}

/// Counters observed right after a progress write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// `false` when the item had already been recorded.
    pub applied: bool,
    pub total_items: u32,
    pub completed_items: u32,
    pub failed_items: u32,
    pub status: JobStatus,
}

impl ProgressUpdate {
    pub fn processed_items(&self) -> u32 {
        self.completed_items + self.failed_items
    }

    pub fn is_converged(&self) -> bool {
        self.processed_items() >= self.total_items
    }
}
