//! Queue polling loop with bounded per-message concurrency.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use greenops_core::config::{QueueConfig, WorkerConfig};
use greenops_queue::{decode_work_item, QueueConsumer, QueueMessage};

use crate::error::WorkerError;
use crate::processor::ItemProcessor;

/// Counters over the pool's lifetime.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub received: AtomicU64,
    pub acked: AtomicU64,
    pub nacked: AtomicU64,
    pub undecodable: AtomicU64,
}

pub struct WorkerPool {
    consumer: Arc<dyn QueueConsumer>,
    processor: Arc<ItemProcessor>,
    concurrency: usize,
    max_batch_size: u32,
    error_backoff: Duration,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    pub fn new(
        consumer: Arc<dyn QueueConsumer>,
        processor: Arc<ItemProcessor>,
        concurrency: usize,
    ) -> Self {
        Self {
            consumer,
            processor,
            concurrency: concurrency.max(1),
            max_batch_size: 10,
            error_backoff: Duration::from_secs(1),
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn from_config(
        consumer: Arc<dyn QueueConsumer>,
        processor: Arc<ItemProcessor>,
        queue: &QueueConfig,
        worker: &WorkerConfig,
    ) -> Self {
        Self::new(consumer, processor, worker.concurrency)
            .with_max_batch_size(queue.max_batch_size)
            .with_error_backoff(queue.poll_interval())
    }

    pub fn with_max_batch_size(mut self, n: u32) -> Self {
        self.max_batch_size = n.max(1);
        self
    }

    /// Pause after a failed poll.
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Poll and process until `shutdown` resolves, then wait for every
    /// in-flight item to finish before returning. Fails only when the queue
    /// is unreachable at startup; later poll errors are retried.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), WorkerError>
    where
        F: Future<Output = ()> + Send,
    {
        self.consumer.health_check().await?;

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        info!(concurrency = self.concurrency, batch = self.max_batch_size, "Worker pool started");

        loop {
            while let Some(done) = tasks.try_join_next() {
                if let Err(e) = done {
                    error!(error = %e, "Worker task aborted");
                }
            }

            let free = semaphore.available_permits();
            if free == 0 {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tasks.join_next() => continue,
                }
            }

            let max = u32::try_from(free).unwrap_or(u32::MAX).min(self.max_batch_size);
            let polled = tokio::select! {
                _ = &mut shutdown => break,
                polled = self.consumer.poll_batch(max) => polled,
            };

            let messages = match polled {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(error = %e, "Queue poll failed, retrying in {:?}", self.error_backoff);
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(self.error_backoff) => continue,
                    }
                }
            };

            for msg in messages {
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                self.stats.received.fetch_add(1, Ordering::Relaxed);
                let consumer = Arc::clone(&self.consumer);
                let processor = Arc::clone(&self.processor);
                let stats = Arc::clone(&self.stats);
                tasks.spawn(async move {
                    handle_message(consumer.as_ref(), &processor, &stats, msg).await;
                    drop(permit);
                });
            }
        }

        info!(in_flight = tasks.len(), "Worker pool draining");
        while let Some(done) = tasks.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "Worker task aborted");
            }
        }
        info!(
            received = self.stats.received.load(Ordering::Relaxed),
            acked = self.stats.acked.load(Ordering::Relaxed),
            nacked = self.stats.nacked.load(Ordering::Relaxed),
            "Worker pool stopped"
        );
        Ok(())
    }
}

async fn handle_message(
    consumer: &dyn QueueConsumer,
    processor: &ItemProcessor,
    stats: &PoolStats,
    msg: QueueMessage,
) {
    let item = match decode_work_item(&msg) {
        Ok(item) => item,
        Err(e) => {
            // Redelivering a malformed body can never succeed.
            warn!(message_id = %msg.id, error = %e, "Dropping undecodable message");
            stats.undecodable.fetch_add(1, Ordering::Relaxed);
            ack(consumer, stats, &msg).await;
            return;
        }
    };

    if msg.is_redelivery() {
        debug!(
            job_id = %item.job_id,
            item_index = item.item_index,
            attempt = msg.attempt_count,
            "Processing redelivered item"
        );
    }

    let report = processor.process(item).await;
    if report.disposition.should_ack() {
        ack(consumer, stats, &msg).await;
    } else {
        match consumer.nack(&msg.receipt_handle).await {
            Ok(()) => {
                stats.nacked.fetch_add(1, Ordering::Relaxed);
            }
            // The visibility timeout will bring it back anyway.
            Err(e) => warn!(message_id = %msg.id, error = %e, "Nack failed"),
        }
    }
}

async fn ack(consumer: &dyn QueueConsumer, stats: &PoolStats, msg: &QueueMessage) {
    match consumer.ack(&msg.receipt_handle).await {
        Ok(()) => {
            stats.acked.fetch_add(1, Ordering::Relaxed);
        }
        // Worst case the item is redelivered and deduplicated by the store.
        Err(e) => warn!(message_id = %msg.id, error = %e, "Ack failed"),
    }
}
