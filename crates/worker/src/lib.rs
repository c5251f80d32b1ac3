//! Worker pool: pulls work items off the queue, runs the analyzer for each
//! one and records the outcome in the job store.

pub mod analyzer;
pub mod error;
pub mod http;
pub mod pool;
pub mod processor;

pub use analyzer::{Analyzer, AnalyzerError, AnalyzerRegistry};
pub use error::WorkerError;
pub use http::HttpAnalyzer;
pub use pool::{PoolStats, WorkerPool};
pub use processor::{Disposition, ItemProcessor, OutcomeKind, ProcessReport, RetryPolicy};
