use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use greenops_cli::{FetchError, JobStatusSource, PollConfig, ServerClient, StatusReconciler};
use greenops_core::JobStatus;

fn status_body(status: &str, completed: u32, failed: u32) -> serde_json::Value {
    json!({
        "job_id": "job-1",
        "status": status,
        "total_items": 2,
        "completed_items": completed,
        "failed_items": failed,
        "resource_types": ["ec2"],
        "created_at": "2026-10-01T12:00:00Z",
        "updated_at": "2026-10-01T12:00:05Z"
    })
}

fn client(server: &MockServer) -> ServerClient {
    ServerClient::new(&server.uri(), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_submit_posts_body_and_parses_receipt() {
    let server = MockServer::start().await;
    let request = json!({"instances": [{"instanceId": "i-1"}]});
    Mock::given(method("POST"))
        .and(path("/analyze"))
        .and(body_json(&request))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({
            "job_id": "job-1",
            "status": "processing",
            "total_items": 1,
            "enqueue_failures": 0
        })))
        .expect(1)
        .mount(&server)
        .await;

    let receipt = client(&server).submit(&request).await.unwrap();
    assert_eq!(receipt.job_id, "job-1");
    assert_eq!(receipt.status, JobStatus::Processing);
    assert_eq!(receipt.total_items, 1);
}

#[tokio::test]
async fn test_submit_surfaces_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/analyze"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({"error": "no resources to analyze"})),
        )
        .mount(&server)
        .await;

    let err = client(&server).submit(&json!({})).await.unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("400"), "{msg}");
    assert!(msg.contains("no resources to analyze"), "{msg}");
}

#[tokio::test]
async fn test_status_accepts_202_and_maps_404() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jobs/job-1"))
        .respond_with(ResponseTemplate::new(202).set_body_json(status_body("processing", 1, 0)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jobs/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "job not found"})))
        .mount(&server)
        .await;

    let c = client(&server);
    let job = c.job_status("job-1", false).await.unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.completed_items, 1);
    assert!(job.results.is_none());

    let err = c.job_status("missing", false).await.unwrap_err();
    assert!(matches!(err, FetchError::NotFound(id) if id == "missing"));
}

#[tokio::test]
async fn test_reconciler_forces_completion_over_http() {
    let server = MockServer::start().await;
    let mut finished = status_body("completed", 2, 0);
    finished["completed_at"] = json!("2026-10-01T12:00:09Z");
    finished["results"] = json!([
        {"item_index": 0, "item_type": "ec2", "analysis": "ok"},
        {"item_index": 1, "item_type": "ec2", "analysis": "ok"}
    ]);

    Mock::given(method("GET"))
        .and(path("/jobs/job-1"))
        .and(query_param("force_complete", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(finished))
        .expect(1)
        .mount(&server)
        .await;
    // Converged but never finalized; mounted second so the forced route wins.
    Mock::given(method("GET"))
        .and(path("/jobs/job-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(status_body("processing", 2, 0)))
        .mount(&server)
        .await;

    let poll = PollConfig {
        poll_interval: Duration::from_millis(5),
        max_attempts: 10,
        stall_threshold: 3,
    };
    let done = StatusReconciler::new(client(&server), poll).wait("job-1").await.unwrap();

    assert!(done.forced);
    assert_eq!(done.attempts, 3);
    assert_eq!(done.job.status, JobStatus::Completed);
    assert_eq!(done.results.len(), 2);
}

#[tokio::test]
async fn test_results_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jobs/job-1/results"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "job_id": "job-1",
            "results": [{"item_index": 0, "item_type": "s3", "analysis": "enable lifecycle rules"}]
        })))
        .mount(&server)
        .await;

    let results = client(&server).job_results("job-1").await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].item_type, "s3");
}
