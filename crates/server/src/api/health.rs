//! Health endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use tracing::warn;

use crate::state::AppState;

#[derive(Serialize, utoipa::ToSchema)]
pub struct QueueStatus {
    pub provider: String,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approximate_message_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dlq_depth: Option<u64>,
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    /// `ok`, or `degraded` when the queue is unreachable.
    pub status: &'static str,
    pub version: &'static str,
    pub store: &'static str,
    pub queue: QueueStatus,
}

/// Server liveness plus store backend and queue connectivity.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Server health", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let queue = match state.queue.health_check().await {
        Ok(h) => QueueStatus {
            provider: h.provider,
            connected: h.connected,
            approximate_message_count: h.approximate_message_count,
            dlq_depth: state.queue.dlq_depth().await.ok().flatten(),
        },
        Err(e) => {
            warn!(error = %e, "Queue health check failed");
            QueueStatus {
                provider: "unknown".to_string(),
                connected: false,
                approximate_message_count: None,
                dlq_depth: None,
            }
        }
    };

    Json(HealthResponse {
        status: if queue.connected { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        store: state.store.backend(),
        queue,
    })
}
