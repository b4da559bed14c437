//! Load test harness: bounded concurrent dispatch through the public
//! prediction entry point, nearest-rank latency aggregation.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::bounded::{bounded_parallel_map, PoolError};
use crate::inference::FEATURE_COUNT;
use crate::metrics_ext::EXTENDED_METRICS;
use crate::settings::PipelineConfig;
use crate::storage::{ObjectLocation, ObjectStore, StorageError};

#[derive(Debug, Clone)]
pub struct LoadTestConfig {
    pub url: String,
    pub request_count: usize,
    pub concurrency: usize,
    pub latency_threshold: Duration,
    pub request_timeout: Duration,
    pub feature_range: (f64, f64),
}

impl LoadTestConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), request_count: 300, concurrency: 300, latency_threshold: Duration::from_secs(1), request_timeout: Duration::from_secs(30), feature_range: (0.1, 5.0) }
    }

    pub fn from_pipeline(cfg: &PipelineConfig) -> Self {
        Self {
            request_count: cfg.load_test_requests,
            concurrency: cfg.load_test_concurrency,
            latency_threshold: cfg.latency_threshold(),
            request_timeout: cfg.request_timeout(),
            ..Self::new(cfg.api_gateway_url.clone())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome { pub status: u16, pub predicted_class: Option<Value> }

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("transport: {0}")]
    Other(String),
}

/// Blocking request sender, one call per load-test request.
pub trait RequestSender: Send + Sync {
    fn send(&self, url: &str, payload: &Value) -> Result<SendOutcome, TransportError>;
}

pub struct HttpSender { client: reqwest::blocking::Client }

impl HttpSender {
    /// Must be built outside of an async executor thread (e.g. inside `spawn_blocking`).
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build().map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self { client })
    }
}

impl RequestSender for HttpSender {
    fn send(&self, url: &str, payload: &Value) -> Result<SendOutcome, TransportError> {
        let resp = self.client.post(url).json(payload).send().map_err(|e| {
            if e.is_timeout() { TransportError::Timeout } else { TransportError::Other(e.to_string()) }
        })?;
        let status = resp.status().as_u16();
        let body: Option<Value> = resp.json().ok();
        let predicted_class = body.and_then(|b| b.get("predicted_class").cloned()).filter(|v| !v.is_null());
        Ok(SendOutcome { status, predicted_class })
    }
}

#[derive(Debug, Error)]
pub enum LoadTestError {
    #[error("invalid load test config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadTestSummary {
    pub test_id: String,
    pub timestamp: String,
    pub total_requests: usize,
    pub completed: usize,
    pub failed: usize,
    pub avg_latency_s: Option<f64>,
    pub max_latency_s: Option<f64>,
    pub p90_latency_s: Option<f64>,
    pub p95_latency_s: Option<f64>,
    pub p99_latency_s: Option<f64>,
    pub over_threshold: usize,
    pub latency_threshold_s: f64,
    pub duration_s: f64,
    pub concurrency: usize,
    pub status_counts: BTreeMap<u16, usize>,
}

#[derive(Debug)]
enum RequestRecord {
    Completed { status: u16, latency: f64 },
    Failed { status: Option<u16> },
}

/// Nearest-rank percentile of an ascending slice: `ceil(pct/100 * n) - 1`, clamped.
pub fn nearest_rank(sorted: &[f64], pct: u32) -> Option<f64> {
    let n = sorted.len();
    if n == 0 { return None; }
    let rank = (pct as usize * n).div_ceil(100);
    Some(sorted[rank.saturating_sub(1).min(n - 1)])
}

fn round_to(v: f64, places: i32) -> f64 {
    let f = 10f64.powi(places);
    (v * f).round() / f
}

fn synthetic_features(range: (f64, f64)) -> Vec<f64> {
    let mut rng = rand::thread_rng();
    (0..FEATURE_COUNT).map(|_| round_to(rng.gen_range(range.0..=range.1), 2)).collect()
}

fn send_one(index: usize, cfg: &LoadTestConfig, sender: &dyn RequestSender) -> RequestRecord {
    let payload = serde_json::json!({ "features": synthetic_features(cfg.feature_range) });
    let started = Instant::now();
    let outcome = sender.send(&cfg.url, &payload);
    let latency = started.elapsed().as_secs_f64();
    match outcome {
        Ok(o) if (200..300).contains(&o.status) => {
            EXTENDED_METRICS.loadtest.requests_total.with_label_values(&["ok"]).inc();
            EXTENDED_METRICS.loadtest.latency_seconds.observe(latency);
            debug!(request = index, status = o.status, latency, predicted_class = ?o.predicted_class, "request completed");
            RequestRecord::Completed { status: o.status, latency }
        }
        Ok(o) => {
            EXTENDED_METRICS.loadtest.requests_total.with_label_values(&["failed"]).inc();
            debug!(request = index, status = o.status, "request rejected");
            RequestRecord::Failed { status: Some(o.status) }
        }
        Err(e) => {
            EXTENDED_METRICS.loadtest.requests_total.with_label_values(&["failed"]).inc();
            debug!(request = index, error = %e, "request failed");
            RequestRecord::Failed { status: None }
        }
    }
}

fn summarize(records: &[RequestRecord], cfg: &LoadTestConfig, duration: Duration) -> LoadTestSummary {
    let mut latencies = Vec::with_capacity(records.len());
    let mut status_counts = BTreeMap::new();
    let mut failed = 0;
    for r in records {
        match r {
            RequestRecord::Completed { status, latency } => { latencies.push(*latency); *status_counts.entry(*status).or_insert(0) += 1; }
            RequestRecord::Failed { status } => {
                failed += 1;
                if let Some(s) = status { *status_counts.entry(*s).or_insert(0) += 1; }
            }
        }
    }
    latencies.sort_by(f64::total_cmp);
    let threshold = cfg.latency_threshold.as_secs_f64();
    let avg = (!latencies.is_empty()).then(|| latencies.iter().sum::<f64>() / latencies.len() as f64);
    let r3 = |v: Option<f64>| v.map(|x| round_to(x, 3));
    LoadTestSummary {
        test_id: uuid::Uuid::new_v4().to_string(),
        timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        total_requests: records.len(),
        completed: latencies.len(),
        failed,
        avg_latency_s: r3(avg),
        max_latency_s: r3(latencies.last().copied()),
        p90_latency_s: r3(nearest_rank(&latencies, 90)),
        p95_latency_s: r3(nearest_rank(&latencies, 95)),
        p99_latency_s: r3(nearest_rank(&latencies, 99)),
        over_threshold: latencies.iter().filter(|l| **l > threshold).count(),
        latency_threshold_s: threshold,
        duration_s: round_to(duration.as_secs_f64(), 2),
        concurrency: cfg.concurrency,
        status_counts,
    }
}

/// Dispatch `cfg.request_count` requests with at most `cfg.concurrency` in flight.
/// Blocks the calling thread until every request finished.
#[instrument(skip(cfg, sender), fields(url = %cfg.url, requests = cfg.request_count, concurrency = cfg.concurrency))]
pub fn run_load_test(cfg: &LoadTestConfig, sender: &dyn RequestSender) -> Result<LoadTestSummary, LoadTestError> {
    if cfg.url.is_empty() { return Err(LoadTestError::InvalidConfig("url is empty".into())); }
    let (lo, hi) = cfg.feature_range;
    if !(lo.is_finite() && hi.is_finite() && lo <= hi) {
        return Err(LoadTestError::InvalidConfig(format!("feature range ({lo}, {hi}) is not a finite ascending interval")));
    }
    info!("starting load test");
    let started = Instant::now();
    let records: Vec<RequestRecord> = bounded_parallel_map((0..cfg.request_count).collect(), cfg.concurrency, |i| send_one(i, cfg, sender))?
        .into_iter()
        .map(|r| r.unwrap_or(RequestRecord::Failed { status: None }))
        .collect();
    let summary = summarize(&records, cfg, started.elapsed());
    info!(
        completed = summary.completed,
        failed = summary.failed,
        avg = ?summary.avg_latency_s,
        p90 = ?summary.p90_latency_s,
        p95 = ?summary.p95_latency_s,
        p99 = ?summary.p99_latency_s,
        over_threshold = summary.over_threshold,
        duration_s = summary.duration_s,
        "load test finished"
    );
    Ok(summary)
}

/// Store the summary at `test/load_test_report_{YYYYmmddTHHMMSSZ}.json`.
pub async fn persist_report(store: &dyn ObjectStore, bucket: &str, summary: &LoadTestSummary) -> Result<ObjectLocation, StorageError> {
    let key = format!("test/load_test_report_{}.json", chrono::Utc::now().format("%Y%m%dT%H%M%SZ"));
    let location = ObjectLocation::new(bucket, key);
    let body = serde_json::to_vec_pretty(summary).map_err(|e| StorageError::Backend(e.to_string()))?;
    store.put_object(&location, body, "application/json").await?;
    Ok(location)
}
