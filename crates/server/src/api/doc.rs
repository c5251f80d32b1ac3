//! OpenAPI documentation aggregator, served via Scalar UI at `/docs`.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "greenops API",
        version = "0.1.0",
        description = "Batch resource analysis: submit a batch, poll the job, collect results.",
    ),
    tags(
        (name = "Health", description = "Server liveness and backend connectivity"),
        (name = "Jobs", description = "Job submission, status polling, and results"),
    ),
    paths(
        crate::api::health::health,
        crate::api::jobs::analyze,
        crate::api::jobs::get_job,
        crate::api::jobs::get_job_results,
    ),
    components(schemas(
        crate::api::ErrorResponse,
        crate::api::health::HealthResponse,
        crate::api::health::QueueStatus,
        crate::api::jobs::JobStatusResponse,
        crate::api::jobs::JobResultsResponse,
        crate::submitter::AnalyzeRequest,
        crate::submitter::SubmitReceipt,
    ))
)]
pub struct ApiDoc;
