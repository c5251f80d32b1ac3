use thiserror::Error;

use greenops_queue::QueueError;

use crate::analyzer::AnalyzerError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("work queue unavailable: {0}")]
    Queue(#[from] QueueError),

    #[error("analyzer setup failed: {0}")]
    Analyzer(#[from] AnalyzerError),
}
