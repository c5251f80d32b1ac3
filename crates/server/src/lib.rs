//! HTTP front end: job submission, status polling, and the optional
//! in-process worker pool.

pub mod api;
pub mod background;
pub mod router;
pub mod state;
pub mod submitter;

pub use router::build_router;
pub use state::AppState;
pub use submitter::{AnalyzeRequest, SubmitError, SubmitReceipt, Submitter};
