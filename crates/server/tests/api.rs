//! HTTP contract tests: the router driven in-process with `oneshot`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use greenops_core::{ItemOutcome, Job, JobStatus, ProgressUpdate, ResultRecord, WorkItem};
use greenops_queue::{decode_work_item, MemoryQueue, QueueConsumer, QueueError, QueueProducer};
use greenops_server::{build_router, AppState, Submitter};
use greenops_store::{JobStore, MemoryJobStore, StoreError};

struct DeadQueue;

#[async_trait]
impl QueueProducer for DeadQueue {
    async fn enqueue(&self, _item: &WorkItem) -> Result<String, QueueError> {
        Err(QueueError::Connection("queue is down".into()))
    }

    fn provider(&self) -> &'static str {
        "dead"
    }
}

/// Memory queue whose Nth sends (1-based) fail.
struct FlakyQueue {
    inner: MemoryQueue,
    fail_on: Vec<u32>,
    sends: AtomicU32,
}

impl FlakyQueue {
    fn failing_on(fail_on: &[u32]) -> Self {
        Self {
            inner: MemoryQueue::new(Duration::from_secs(30), Duration::from_millis(10)),
            fail_on: fail_on.to_vec(),
            sends: AtomicU32::new(0),
        }
    }

    /// Every item that made it onto the queue, in send order.
    async fn drain(&self) -> Vec<WorkItem> {
        let messages = self.inner.poll_batch(100).await.unwrap();
        messages.iter().map(|m| decode_work_item(m).unwrap()).collect()
    }
}

#[async_trait]
impl QueueProducer for FlakyQueue {
    async fn enqueue(&self, item: &WorkItem) -> Result<String, QueueError> {
        let n = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on.contains(&n) {
            return Err(QueueError::Connection(format!("send {n} dropped")));
        }
        self.inner.enqueue(item).await
    }

    fn provider(&self) -> &'static str {
        "flaky"
    }
}

/// Memory store that throttles the first `throttle` progress writes.
struct ThrottledStore {
    inner: MemoryJobStore,
    throttle: u32,
    throttled: AtomicU32,
}

impl ThrottledStore {
    fn new(throttle: u32) -> Self {
        Self {
            inner: MemoryJobStore::default(),
            throttle,
            throttled: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl JobStore for ThrottledStore {
    async fn create_job(
        &self,
        resource_types: BTreeSet<String>,
        total_items: u32,
    ) -> Result<Job, StoreError> {
        self.inner.create_job(resource_types, total_items).await
    }

    async fn get_job(&self, job_id: &str) -> Result<Job, StoreError> {
        self.inner.get_job(job_id).await
    }

    async fn update_job_status(&self, job_id: &str, status: JobStatus) -> Result<bool, StoreError> {
        self.inner.update_job_status(job_id, status).await
    }

    async fn update_job_progress(
        &self,
        job_id: &str,
        item_index: u32,
        outcome: &ItemOutcome,
    ) -> Result<ProgressUpdate, StoreError> {
        if self.throttled.load(Ordering::SeqCst) < self.throttle {
            self.throttled.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Transient("ProvisionedThroughputExceeded".into()));
        }
        self.inner.update_job_progress(job_id, item_index, outcome).await
    }

    fn backend(&self) -> &'static str {
        "throttled"
    }
}

fn router_with(store: Arc<dyn JobStore>, queue: Arc<dyn QueueProducer>) -> Router {
    let state = AppState::new(
        store.clone(),
        Submitter::new(store, queue),
        Arc::new(MemoryQueue::default()),
    );
    build_router(Arc::new(state), "*")
}

struct TestApp {
    router: Router,
    store: Arc<MemoryJobStore>,
    queue: Arc<MemoryQueue>,
}

fn app() -> TestApp {
    let store = Arc::new(MemoryJobStore::default());
    let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30), Duration::from_millis(10)));
    let state = AppState::new(
        store.clone(),
        Submitter::new(store.clone(), queue.clone()),
        queue.clone(),
    );
    TestApp {
        router: build_router(Arc::new(state), "*"),
        store,
        queue,
    }
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn record(index: u32) -> ItemOutcome {
    ItemOutcome::Succeeded(Some(ResultRecord {
        item_index: index,
        item_type: "ec2".into(),
        analysis: format!("item {index}"),
        ..Default::default()
    }))
}

#[tokio::test]
async fn test_analyze_accepts_batch_and_enqueues_items() {
    let t = app();
    let body = json!({
        "instances": [{"instanceId": "i-1"}, {"instanceId": "i-2"}],
        "resources": {"s3": [{"bucketName": "logs"}]}
    });
    let (status, resp) = send(&t.router, post_json("/analyze", &body.to_string())).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(resp["status"], "processing");
    assert_eq!(resp["total_items"], 3);
    assert_eq!(resp["enqueue_failures"], 0);
    assert_eq!(t.queue.ready_len().await, 3);

    let job = t.store.get_job(resp["job_id"].as_str().unwrap()).await.unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.resource_types, BTreeSet::from(["ec2".to_string(), "s3".to_string()]));
}

#[tokio::test]
async fn test_analyze_rejects_malformed_and_empty_bodies() {
    let t = app();

    let (status, resp) = send(&t.router, post_json("/analyze", "{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(resp["error"].is_string());

    let empty = post_json("/analyze", r#"{"resources": {"ec2": []}}"#);
    let (status, resp) = send(&t.router, empty).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(resp["error"], "no resources to analyze");
    assert!(t.store.is_empty().await);
}

#[tokio::test]
async fn test_analyze_with_queue_down_fails_the_job() {
    let store = Arc::new(MemoryJobStore::default());
    let queue = Arc::new(MemoryQueue::default());
    let submitter = Submitter::new(store.clone(), Arc::new(DeadQueue));
    let state = AppState::new(store.clone(), submitter, queue);
    let router = build_router(Arc::new(state), "*");

    let body = r#"{"instances": [{"instanceId": "i-1"}]}"#;
    let (status, resp) = send(&router, post_json("/analyze", body)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let job = store.get_job(resp["job_id"].as_str().unwrap()).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failed_items, 1);
}

#[tokio::test]
async fn test_unknown_job_is_404() {
    let t = app();
    let (status, _) = send(&t.router, get("/jobs/does-not-exist")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&t.router, get("/jobs/does-not-exist/results")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_running_job_is_202_without_results() {
    let t = app();
    let job = t.store.create_job(BTreeSet::new(), 2).await.unwrap();
    t.store.update_job_status(&job.job_id, JobStatus::Processing).await.unwrap();
    t.store.update_job_progress(&job.job_id, 0, &record(0)).await.unwrap();

    let (status, resp) = send(&t.router, get(&format!("/jobs/{}", job.job_id))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(resp["completed_items"], 1);
    assert!(resp.get("results").is_none());

    // Partial results are always available on the results endpoint.
    let (status, resp) = send(&t.router, get(&format!("/jobs/{}/results", job.job_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp["results"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_finished_job_is_200_with_results() {
    let t = app();
    let job = t.store.create_job(BTreeSet::new(), 2).await.unwrap();
    t.store.update_job_status(&job.job_id, JobStatus::Processing).await.unwrap();
    t.store.update_job_progress(&job.job_id, 0, &record(0)).await.unwrap();
    t.store.update_job_progress(&job.job_id, 1, &ItemOutcome::failed("x")).await.unwrap();

    let (status, resp) = send(&t.router, get(&format!("/jobs/{}", job.job_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp["status"], "completed");
    assert_eq!(resp["results"].as_array().unwrap().len(), 1);
    assert!(resp["completed_at"].is_string());
}

#[tokio::test]
async fn test_force_complete_finalizes_converged_job() {
    let t = app();
    // Items recorded while still pending: converged, but nobody finalized it.
    let job = t.store.create_job(BTreeSet::new(), 2).await.unwrap();
    t.store.update_job_progress(&job.job_id, 0, &record(0)).await.unwrap();
    t.store.update_job_progress(&job.job_id, 1, &record(1)).await.unwrap();
    t.store.update_job_status(&job.job_id, JobStatus::Processing).await.unwrap();

    let (status, resp) = send(&t.router, get(&format!("/jobs/{}", job.job_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp["status"], "processing");
    assert_eq!(resp["results"].as_array().unwrap().len(), 2);

    let forced = get(&format!("/jobs/{}?force_complete=true", job.job_id));
    let (status, resp) = send(&t.router, forced).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp["status"], "completed");
    assert_eq!(resp["results"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_force_complete_is_a_no_op_before_convergence() {
    let t = app();
    let job = t.store.create_job(BTreeSet::new(), 3).await.unwrap();
    t.store.update_job_status(&job.job_id, JobStatus::Processing).await.unwrap();
    t.store.update_job_progress(&job.job_id, 0, &record(0)).await.unwrap();

    let forced = get(&format!("/jobs/{}?force_complete=true", job.job_id));
    let (status, resp) = send(&t.router, forced).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(resp["status"], "processing");
    assert_eq!(resp["completed_items"], 1);
    assert_eq!(resp["failed_items"], 0);
}

#[tokio::test]
async fn test_health_reports_backends() {
    let t = app();
    let (status, resp) = send(&t.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["store"], "memory");
    assert_eq!(resp["queue"]["provider"], "memory");
    assert_eq!(resp["queue"]["connected"], true);
}

#[tokio::test]
async fn test_partial_enqueue_failure_still_converges() {
    let store = Arc::new(MemoryJobStore::default());
    let queue = Arc::new(FlakyQueue::failing_on(&[2]));
    let router = router_with(store.clone(), queue.clone());
    let body = json!({
        "instances": [{"instanceId": "i-1"}, {"instanceId": "i-2"}, {"instanceId": "i-3"}]
    });

    let (status, resp) = send(&router, post_json("/analyze", &body.to_string())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(resp["total_items"], 3);
    assert_eq!(resp["enqueue_failures"], 1);

    let job_id = resp["job_id"].as_str().unwrap();
    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.failed_items, 1);
    assert_eq!(job.completed_items, 0);

    // Finish what reached the queue, as a worker would.
    let queued = queue.drain().await;
    assert_eq!(queued.iter().map(|i| i.item_index).collect::<Vec<_>>(), vec![0, 2]);
    for item in &queued {
        store.update_job_progress(job_id, item.item_index, &record(item.item_index)).await.unwrap();
    }

    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completed_items, 2);
    assert_eq!(job.failed_items, 1);
}

#[tokio::test]
async fn test_item_indices_are_global_across_types() {
    let store = Arc::new(MemoryJobStore::default());
    let queue = Arc::new(FlakyQueue::failing_on(&[]));
    let router = router_with(store, queue.clone());
    let body = json!({
        "resources": {
            "s3": [{"bucketName": "a"}, {"bucketName": "b"}],
            "ec2": [{"instanceId": "c"}]
        },
        "instances": [{"instanceId": "d"}]
    });

    let (status, resp) = send(&router, post_json("/analyze", &body.to_string())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(resp["total_items"], 4);

    let queued = queue.drain().await;
    let seen: Vec<(u32, &str)> = queued
        .iter()
        .map(|i| (i.item_index, i.item_type.as_str()))
        .collect();
    assert_eq!(seen, vec![(0, "ec2"), (1, "ec2"), (2, "s3"), (3, "s3")]);
    assert!(queued.iter().all(|i| resp["job_id"].as_str() == Some(i.job_id.as_str())));
}

#[tokio::test]
async fn test_enqueue_failure_is_recorded_through_a_throttled_store() {
    let store = Arc::new(ThrottledStore::new(1));
    let queue = Arc::new(FlakyQueue::failing_on(&[2]));
    let router = router_with(store.clone(), queue.clone());
    let body = json!({"instances": [{"instanceId": "i-1"}, {"instanceId": "i-2"}]});

    let (status, resp) = send(&router, post_json("/analyze", &body.to_string())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(resp["enqueue_failures"], 1);
    assert_eq!(store.throttled.load(Ordering::SeqCst), 1);

    let job_id = resp["job_id"].as_str().unwrap();
    assert_eq!(store.get_job(job_id).await.unwrap().failed_items, 1);

    let queued = queue.drain().await;
    assert_eq!(queued.len(), 1);
    store.update_job_progress(job_id, queued[0].item_index, &record(0)).await.unwrap();

    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.processed_items(), 2);
}

#[tokio::test]
async fn test_unrecordable_enqueue_failure_is_503() {
    let store = Arc::new(ThrottledStore::new(u32::MAX));
    let queue = Arc::new(FlakyQueue::failing_on(&[2]));
    let router = router_with(store.clone(), queue);
    let body = json!({"instances": [{"instanceId": "i-1"}, {"instanceId": "i-2"}]});

    let (status, resp) = send(&router, post_json("/analyze", &body.to_string())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(resp["error"].as_str().unwrap().contains("left incomplete"));
    assert_eq!(store.throttled.load(Ordering::SeqCst), 3);

    // Never acknowledged, never started.
    let job = store.get_job(resp["job_id"].as_str().unwrap()).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
}
