use axum::{body::Bytes, http::{header, HeaderMap, StatusCode}, routing::post, Json, Router};
use mlops_core::{
    persist_report, run_load_test, HttpEndpointRuntime, HttpSender, InferenceClient, InferenceError, LoadTestConfig,
    LoadTestSummary, MemoryStore, ObjectLocation, ObjectStore, PayloadEncoding, RuntimeError,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

async fn spawn(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

fn gateway() -> Router {
    Router::new()
        .route("/predict", post(|| async { Json(json!({ "predicted_class": 1, "score": 2 })) }))
        .route("/slow", post(|| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Json(json!({ "predicted_class": 1 }))
        }))
        .route("/fail", post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "boom" }))) }))
}

/// Runs the blocking harness off the executor threads, as the load-tester binary does.
async fn load_test(url: String, requests: usize, timeout: Duration) -> LoadTestSummary {
    tokio::task::spawn_blocking(move || {
        let mut cfg = LoadTestConfig::new(url);
        cfg.request_count = requests;
        cfg.concurrency = requests;
        cfg.request_timeout = timeout;
        let sender = HttpSender::new(cfg.request_timeout).unwrap();
        run_load_test(&cfg, &sender).unwrap()
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn successful_responses_are_completed() {
    let addr = spawn(gateway()).await;
    let summary = load_test(format!("http://{addr}/predict"), 6, Duration::from_secs(5)).await;
    assert_eq!(summary.completed, 6);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.status_counts.get(&200), Some(&6));
    assert!(summary.p90_latency_s.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_timeout_counts_as_failed() {
    let addr = spawn(gateway()).await;
    let summary = load_test(format!("http://{addr}/slow"), 3, Duration::from_millis(200)).await;
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.failed, 3);
    assert!(summary.status_counts.is_empty());
    assert_eq!(summary.avg_latency_s, None);
    assert!(summary.duration_s < 3.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_errors_count_as_failed_with_status() {
    let addr = spawn(gateway()).await;
    let summary = load_test(format!("http://{addr}/fail"), 4, Duration::from_secs(5)).await;
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.failed, 4);
    assert_eq!(summary.status_counts.get(&500), Some(&4));
    assert_eq!(summary.p99_latency_s, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn report_is_persisted_under_test_prefix() {
    let addr = spawn(gateway()).await;
    let summary = load_test(format!("http://{addr}/predict"), 2, Duration::from_secs(5)).await;
    let store = MemoryStore::with_bucket("cloud-ml-lead-models");
    let location = persist_report(&store, "cloud-ml-lead-models", &summary).await.unwrap();

    assert_eq!(store.keys("cloud-ml-lead-models"), vec![location.key.clone()]);
    assert!(location.key.starts_with("test/load_test_report_") && location.key.ends_with(".json"));
    assert_eq!(store.content_type(&location).as_deref(), Some("application/json"));
    let stored: LoadTestSummary = serde_json::from_slice(&store.get_object(&location).await.unwrap()).unwrap();
    assert_eq!(stored.test_id, summary.test_id);
    assert_eq!(stored.completed, 2);
    assert_eq!(stored.status_counts, summary.status_counts);

    let missing = persist_report(&store, "no-such-bucket", &summary).await;
    assert!(missing.is_err());
}

fn serving_container(status: StatusCode, answer: &'static str) -> Router {
    Router::new().route("/invocations", post(move |headers: HeaderMap, body: Bytes| async move {
        let content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or_default().to_string();
        let fields = std::str::from_utf8(&body).map(|b| b.split(',').count()).unwrap_or(0);
        if content_type != "text/csv" || fields != 50 {
            return (StatusCode::UNSUPPORTED_MEDIA_TYPE, format!("unexpected {content_type} body with {fields} fields"));
        }
        (status, answer.to_string())
    }))
}

#[tokio::test]
async fn http_runtime_posts_to_invocations() {
    let addr = spawn(serving_container(StatusCode::OK, "0.1,0.2,0.6,0.05,0.05")).await;
    let runtime = HttpEndpointRuntime::new(format!("http://{addr}/"), Duration::from_secs(5)).unwrap();
    let store = Arc::new(MemoryStore::with_bucket("logs"));
    let client = InferenceClient::new(Arc::new(runtime), "lead-scoring-xgb-endpoint", PayloadEncoding::Csv).with_audit(store.clone(), "logs");

    let result = client.predict(&[0.5; 50]).await.unwrap();
    assert_eq!(result.raw, "0.1,0.2,0.6,0.05,0.05");
    assert_eq!(result.predicted_class(), Some(2));
    assert_eq!(result.score(), json!(3));

    let keys = store.keys("logs");
    let record: Value = serde_json::from_slice(&store.get_object(&ObjectLocation::new("logs", keys[0].clone())).await.unwrap()).unwrap();
    assert_eq!(record["prediction"], json!("0.1,0.2,0.6,0.05,0.05"));
}

#[tokio::test]
async fn http_runtime_maps_non_success_to_status_error() {
    let addr = spawn(serving_container(StatusCode::FAILED_DEPENDENCY, "model container crashed")).await;
    let runtime = HttpEndpointRuntime::new(format!("http://{addr}"), Duration::from_secs(5)).unwrap();
    let client = InferenceClient::new(Arc::new(runtime), "ep", PayloadEncoding::Csv);
    match client.predict(&[0.5; 50]).await {
        Err(InferenceError::Runtime(RuntimeError::Status { status, body })) => {
            assert_eq!(status, 424);
            assert_eq!(body, "model container crashed");
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn http_runtime_reports_unreachable_endpoint_as_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let runtime = HttpEndpointRuntime::new(format!("http://{addr}"), Duration::from_secs(2)).unwrap();
    let client = InferenceClient::new(Arc::new(runtime), "ep", PayloadEncoding::Csv);
    assert!(matches!(client.predict(&[0.5; 50]).await, Err(InferenceError::Runtime(RuntimeError::Transport(_)))));
}
