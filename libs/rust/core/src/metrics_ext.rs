//! Metric groups for deploy, inference and load-test paths.
//!
//! All instruments live in one registry so the gateway can expose them at
//! `/metrics`; tools that never serve HTTP just record into it.

use once_cell::sync::Lazy;
use prometheus::{Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub struct DeployMetrics {
    pub deploys_total: IntCounterVec,
    pub step_latency_seconds: HistogramVec,
    pub status_polls_total: IntCounter,
}

pub struct InferenceMetrics {
    pub requests_total: IntCounterVec,
    pub latency_seconds: Histogram,
    pub audit_failures_total: IntCounter,
}

pub struct LoadTestMetrics {
    pub requests_total: IntCounterVec,
    pub latency_seconds: Histogram,
}

pub struct ExtendedMetrics {
    pub deploy: DeployMetrics,
    pub inference: InferenceMetrics,
    pub loadtest: LoadTestMetrics,
}

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("static counter definition");
    let _ = REGISTRY.register(Box::new(c.clone()));
    c
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("static counter definition");
    let _ = REGISTRY.register(Box::new(c.clone()));
    c
}

fn histogram(name: &str, help: &str) -> Histogram {
    let h = Histogram::with_opts(HistogramOpts::new(name, help)).expect("static histogram definition");
    let _ = REGISTRY.register(Box::new(h.clone()));
    h
}

fn histogram_vec(name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("static histogram definition");
    let _ = REGISTRY.register(Box::new(h.clone()));
    h
}

pub static EXTENDED_METRICS: Lazy<ExtendedMetrics> = Lazy::new(|| {
    ExtendedMetrics {
        deploy: DeployMetrics {
            deploys_total: counter_vec("mlops_deploy_total", "Deploy attempts by outcome", &["outcome"]),
            step_latency_seconds: histogram_vec("mlops_deploy_step_latency_seconds", "Latency per deploy step", &["step"]),
            status_polls_total: counter("mlops_deploy_status_polls_total", "Endpoint status polls while waiting for InService"),
        },
        inference: InferenceMetrics {
            requests_total: counter_vec("mlops_inference_requests_total", "Inference calls by outcome", &["outcome"]),
            latency_seconds: histogram("mlops_inference_latency_seconds", "Endpoint invocation latency"),
            audit_failures_total: counter("mlops_inference_audit_failures_total", "Audit records that could not be persisted"),
        },
        loadtest: LoadTestMetrics {
            requests_total: counter_vec("mlops_loadtest_requests_total", "Load test requests by outcome", &["outcome"]),
            latency_seconds: histogram("mlops_loadtest_latency_seconds", "Latency of completed load test requests"),
        },
    }
});

/// Prometheus text exposition of [`REGISTRY`].
pub fn encode_text() -> anyhow::Result<String> {
    Lazy::force(&EXTENDED_METRICS);
    let mut buf = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buf)?;
    Ok(String::from_utf8(buf)?)
}
