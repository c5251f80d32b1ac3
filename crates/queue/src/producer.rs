//! Queue producer trait.

use async_trait::async_trait;

use greenops_core::WorkItem;

use crate::error::QueueError;

/// Sends work items to the queue.
#[async_trait]
pub trait QueueProducer: Send + Sync {
    /// Enqueue one work item. Returns the provider's message id.
    async fn enqueue(&self, item: &WorkItem) -> Result<String, QueueError>;

    /// Provider name for logs and health output.
    fn provider(&self) -> &'static str;
}
