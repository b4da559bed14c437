//! Core shared utilities for the model delivery tools.
//!
//! Everything a tool needs is passed in explicitly: object store, hosting
//! provider and endpoint runtime are trait objects handed to the component
//! that uses them. This crate only owns process-level plumbing (tracing,
//! configuration, health + metrics routes).

use anyhow::Result;
use axum::{http::{header, StatusCode}, response::IntoResponse, routing::get, Json, Router};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn mark_not_live() { NODE_LIVENESS.store(false, Ordering::SeqCst); }
pub fn is_ready() -> bool { NODE_READINESS.load(Ordering::SeqCst) }

/// Install the global subscriber once per process.
///
/// `RUST_LOG` drives filtering (default `info`); `MLOPS_JSON_LOG=1|true`
/// switches to flattened JSON lines.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("MLOPS_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        if json {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false);
            tracing_subscriber::registry().with(env_filter).with(fmt_layer).try_init()?;
        } else {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true);
            tracing_subscriber::registry().with(env_filter).with(fmt_layer).try_init()?;
        }
        Ok(())
    })?;
    info!(target: "mlops", service, "tracing initialized");
    Ok(())
}

/// `/live`, `/ready` and `/metrics` routes, merged into a service router.
pub fn health_router() -> Router {
    Router::new()
        .route("/live", get(|| async { Json(serde_json::json!({"live": NODE_LIVENESS.load(Ordering::SeqCst)})) }))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
}

async fn ready_handler() -> impl IntoResponse {
    let ready = is_ready();
    let code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(serde_json::json!({"ready": ready})))
}

async fn metrics_handler() -> axum::response::Response {
    match metrics_ext::encode_text() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response(),
    }
}

pub mod settings;
pub mod metrics_ext;
pub mod storage;
pub mod hosting;
pub mod image_uris;
pub mod deployer;
pub mod inference;
pub mod bounded;
pub mod loadtest;
pub mod packager;
pub mod backends;
#[cfg(feature = "aws")]
pub mod aws;

pub use settings::{load_config, load_config_from_env, Backend, ConfigError, PipelineConfig};
pub use metrics_ext::{ExtendedMetrics, EXTENDED_METRICS};
pub use storage::{LocalStore, MemoryStore, ObjectLocation, ObjectStore, StorageError};
pub use hosting::{EndpointDescription, EndpointStatus, HostedModel, EndpointConfig, HostingProvider, MemoryHostingProvider, ProductionVariant, ProviderError, ResourceKind, WaitError, WaitPolicy};
pub use image_uris::{resolve_image, ImageError, ImageSpec};
pub use deployer::{DeployError, DeployRequest, DeployStep, Deployer, EndpointAddress, NO_FAILURE_REASON};
pub use inference::{EndpointRuntime, FeatureVector, FnRuntime, HttpEndpointRuntime, InferenceClient, InferenceError, PayloadEncoding, Prediction, PredictionResult, RuntimeError, ValidationError, FEATURE_COUNT};
pub use bounded::{bounded_parallel_map, PoolError, TaskPanic};
pub use loadtest::{nearest_rank, run_load_test, HttpSender, LoadTestConfig, LoadTestError, LoadTestSummary, persist_report, RequestSender, SendOutcome, TransportError};
pub use packager::{build_bundle, ArtifactPackager, PackageError, PackageRequest, PackagedArtifact};
pub use backends::{endpoint_runtime, hosting_provider, object_store, wait_policy};
