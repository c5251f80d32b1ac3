//! Shared handler state.

use std::sync::Arc;

use greenops_queue::QueueConsumer;
use greenops_store::JobStore;

use crate::submitter::Submitter;

pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub submitter: Submitter,
    /// Queue handle used for health reporting.
    pub queue: Arc<dyn QueueConsumer>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn JobStore>,
        submitter: Submitter,
        queue: Arc<dyn QueueConsumer>,
    ) -> Self {
        Self {
            store,
            submitter,
            queue,
        }
    }
}
