//! Job submission, status, and results endpoints.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use greenops_core::{Job, JobStatus, ResultRecord};
use greenops_store::StoreError;

use crate::state::AppState;
use crate::submitter::{AnalyzeRequest, SubmitError, SubmitReceipt};

use super::{api_error, store_error, ApiError, ErrorResponse};

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct JobStatusResponse {
    pub job_id: String,
    #[schema(value_type = String, example = "processing")]
    pub status: JobStatus,
    pub total_items: u32,
    pub completed_items: u32,
    pub failed_items: u32,
    #[schema(value_type = Vec<String>)]
    pub resource_types: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Present once the job is terminal or every item is accounted for.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Vec<Object>>)]
    pub results: Option<Vec<ResultRecord>>,
}

impl JobStatusResponse {
    fn from_job(job: Job) -> Self {
        let with_results = job.is_terminal() || job.is_converged();
        Self {
            job_id: job.job_id,
            status: job.status,
            total_items: job.total_items,
            completed_items: job.completed_items,
            failed_items: job.failed_items,
            resource_types: job.resource_types.into_iter().collect(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
            results: with_results.then_some(job.results),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct JobResultsResponse {
    pub job_id: String,
    #[schema(value_type = Vec<Object>)]
    pub results: Vec<ResultRecord>,
}

#[derive(Debug, Default, Deserialize, utoipa::IntoParams)]
pub struct JobQuery {
    /// Run the finalization check before answering.
    #[serde(default)]
    pub force_complete: bool,
}

fn submit_error(e: SubmitError) -> ApiError {
    match e {
        SubmitError::EmptyBatch | SubmitError::TooLarge(_) => {
            api_error(StatusCode::BAD_REQUEST, e.to_string())
        }
        SubmitError::Store(StoreError::Transient(msg)) => {
            api_error(StatusCode::SERVICE_UNAVAILABLE, format!("job store unavailable: {msg}"))
        }
        SubmitError::Store(inner) => {
            api_error(StatusCode::INTERNAL_SERVER_ERROR, inner.to_string())
        }
        SubmitError::QueueUnavailable { ref job_id, .. }
        | SubmitError::Incomplete { ref job_id, .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: e.to_string(),
                job_id: Some(job_id.clone()),
            }),
        ),
    }
}

/// Submit a batch of resources for analysis.
#[utoipa::path(
    post,
    path = "/analyze",
    tag = "Jobs",
    request_body = AnalyzeRequest,
    responses(
        (status = 202, description = "Job accepted", body = SubmitReceipt),
        (status = 400, description = "Malformed or empty batch", body = ErrorResponse),
        (status = 503, description = "Store or queue unavailable", body = ErrorResponse)
    )
)]
pub async fn analyze(
    State(state): State<Arc<AppState>>,
    body: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitReceipt>), ApiError> {
    let Json(request) = body.map_err(|e| api_error(StatusCode::BAD_REQUEST, e.body_text()))?;

    let receipt = state.submitter.submit(request).await.map_err(|e| {
        warn!(error = %e, "Submission failed");
        submit_error(e)
    })?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// Job status. `200` with results once terminal or converged, `202` otherwise.
#[utoipa::path(
    get,
    path = "/jobs/{id}",
    tag = "Jobs",
    params(
        ("id" = String, Path, description = "Job id"),
        JobQuery
    ),
    responses(
        (status = 200, description = "Job finished or converged", body = JobStatusResponse),
        (status = 202, description = "Job still running", body = JobStatusResponse),
        (status = 404, description = "Unknown job", body = ErrorResponse)
    )
)]
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<JobQuery>,
) -> Result<(StatusCode, Json<JobStatusResponse>), ApiError> {
    let job = if query.force_complete {
        let job = state.store.finalize_if_converged(&id).await.map_err(store_error)?;
        info!(job_id = %id, status = %job.status, "Forced completion check");
        job
    } else {
        state.store.get_job(&id).await.map_err(store_error)?
    };

    let response = JobStatusResponse::from_job(job);
    let code = if response.results.is_some() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((code, Json(response)))
}

/// Results accumulated so far, whatever the job status.
#[utoipa::path(
    get,
    path = "/jobs/{id}/results",
    tag = "Jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Current results", body = JobResultsResponse),
        (status = 404, description = "Unknown job", body = ErrorResponse)
    )
)]
pub async fn get_job_results(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobResultsResponse>, ApiError> {
    let job = state.store.get_job(&id).await.map_err(store_error)?;
    Ok(Json(JobResultsResponse {
        job_id: job.job_id,
        results: job.results,
    }))
}
