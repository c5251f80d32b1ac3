pub mod client;
pub mod config;
pub mod output;
pub mod reconciler;

pub use client::{ServerClient, SubmitReceipt};
pub use config::CliConfig;
pub use reconciler::{
    FetchError, JobSnapshot, JobStatusSource, PollConfig, ReconcileError, Reconciled,
    StatusReconciler,
};
