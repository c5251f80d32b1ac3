//! In-process work queue with SQS-like at-least-once semantics.
//!
//! Used for local runs (server with embedded workers) and tests. A polled
//! message is leased, not removed: it disappears on `ack`, goes back to the
//! front of the queue on `nack`, and is redelivered automatically once its
//! visibility timeout lapses.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

use greenops_core::WorkItem;

use crate::codec::encode_work_item;
use crate::consumer::{QueueConsumer, QueueHealth, QueueMessage};
use crate::error::QueueError;
use crate::producer::QueueProducer;

#[derive(Debug, Clone)]
struct Stored {
    id: String,
    body: String,
    timestamp: DateTime<Utc>,
    attempt_count: u32,
}

#[derive(Debug)]
struct Lease {
    message: Stored,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    ready: VecDeque<Stored>,
    in_flight: HashMap<String, Lease>,
}

impl Inner {
    /// Move leases whose visibility timeout lapsed back onto the queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(handle, _)| handle.clone())
            .collect();
        for handle in expired {
            if let Some(lease) = self.in_flight.remove(&handle) {
                debug!(message_id = %lease.message.id, "Visibility timeout lapsed, redelivering");
                self.ready.push_back(lease.message);
            }
        }
    }
}

/// In-memory queue implementing both producer and consumer sides.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    visibility_timeout: Duration,
    wait_time: Duration,
}

impl MemoryQueue {
    /// `visibility_timeout`: how long a polled message stays leased.
    /// `wait_time`: how long an empty poll blocks waiting for new messages.
    pub fn new(visibility_timeout: Duration, wait_time: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            visibility_timeout,
            wait_time,
        }
    }

    /// Messages waiting to be delivered.
    pub async fn ready_len(&self) -> usize {
        self.inner.lock().await.ready.len()
    }

    /// Messages delivered but not yet acked.
    pub async fn in_flight_len(&self) -> usize {
        self.inner.lock().await.in_flight.len()
    }

    /// Enqueue a raw body, bypassing the work item codec.
    pub async fn push_raw(&self, body: impl Into<String>) -> String {
        let id = Uuid::new_v4().to_string();
        self.inner.lock().await.ready.push_back(Stored {
            id: id.clone(),
            body: body.into(),
            timestamp: Utc::now(),
            attempt_count: 0,
        });
        self.notify.notify_one();
        id
    }

    async fn take(&self, max_messages: usize) -> Vec<QueueMessage> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.reclaim_expired(now);

        let mut out = Vec::new();
        while out.len() < max_messages {
            let Some(mut stored) = inner.ready.pop_front() else {
                break;
            };
            stored.attempt_count += 1;
            let receipt_handle = Uuid::new_v4().to_string();
            out.push(QueueMessage {
                id: stored.id.clone(),
                body: stored.body.clone(),
                receipt_handle: receipt_handle.clone(),
                timestamp: stored.timestamp,
                attempt_count: stored.attempt_count,
            });
            inner.in_flight.insert(
                receipt_handle,
                Lease {
                    message: stored,
                    expires_at: now + self.visibility_timeout,
                },
            );
        }
        out
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(180), Duration::from_secs(1))
    }
}

#[async_trait]
impl QueueProducer for MemoryQueue {
    async fn enqueue(&self, item: &WorkItem) -> Result<String, QueueError> {
        let body = encode_work_item(item)?;
        Ok(self.push_raw(body).await)
    }

    fn provider(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl QueueConsumer for MemoryQueue {
    async fn poll_batch(&self, max_messages: u32) -> Result<Vec<QueueMessage>, QueueError> {
        let max = max_messages.max(1) as usize;
        let deadline = Instant::now() + self.wait_time;
        loop {
            let batch = self.take(max).await;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            // Wake on enqueue/nack, or re-check leases when the wait ends.
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        match inner.in_flight.remove(receipt_handle) {
            Some(_) => Ok(()),
            None => Err(QueueError::Ack(format!(
                "unknown or expired receipt handle: {receipt_handle}"
            ))),
        }
    }

    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let lease = inner
            .in_flight
            .remove(receipt_handle)
            .ok_or_else(|| {
                QueueError::Provider(format!("unknown or expired receipt handle: {receipt_handle}"))
            })?;
        inner.ready.push_front(lease.message);
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        let inner = self.inner.lock().await;
        Ok(QueueHealth {
            connected: true,
            approximate_message_count: Some(inner.ready.len() as u64),
            provider: "memory".to_string(),
        })
    }
}
