//! API endpoint modules.
//!
//! Shared error types live here in mod.rs.

pub mod doc;
pub mod health;
pub mod jobs;

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use greenops_store::StoreError;

// ── Shared types ─────────────────────────────────────────────────

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    /// Set when the job was created before the request failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            job_id: None,
        }),
    )
}

/// Map a store failure onto an HTTP status.
pub(crate) fn store_error(e: StoreError) -> ApiError {
    let status = match &e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e.to_string())
}

// ── Re-exports ───────────────────────────────────────────────────

pub use health::health;
pub use jobs::{analyze, get_job, get_job_results};
