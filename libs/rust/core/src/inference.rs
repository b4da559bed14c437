//! Inference client: feature validation, payload encoding, endpoint
//! invocation, response decoding and the best-effort audit trail.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::metrics_ext::EXTENDED_METRICS;
use crate::storage::{ObjectLocation, ObjectStore};

pub const FEATURE_COUNT: usize = 50;
/// Width of the one-based score scale for probability responses.
pub const MAX_SCORE: usize = 5;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("features must be a list")]
    NotAList,
    #[error("expected 50 features, got {0}")]
    WrongCount(usize),
    #[error("feature at index {index} is not a finite number")]
    NotNumeric { index: usize },
}

impl ValidationError {
    /// Message returned to callers of the public entry point.
    pub fn public_message(&self) -> &'static str {
        match self {
            ValidationError::NotAList | ValidationError::WrongCount(_) => "Exactly 50 numerical features required.",
            ValidationError::NotNumeric { .. } => "All features must be numbers.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector(Vec<f64>);

impl FeatureVector {
    pub fn new(values: Vec<f64>) -> Result<Self, ValidationError> {
        if values.len() != FEATURE_COUNT { return Err(ValidationError::WrongCount(values.len())); }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) { return Err(ValidationError::NotNumeric { index }); }
        Ok(Self(values))
    }

    /// Accepts JSON numbers and numeric strings (`"1.5"`).
    pub fn from_json(value: &Value) -> Result<Self, ValidationError> {
        let items = value.as_array().ok_or(ValidationError::NotAList)?;
        if items.len() != FEATURE_COUNT { return Err(ValidationError::WrongCount(items.len())); }
        let values = items.iter().enumerate().map(|(index, v)| {
            let n = match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            n.filter(|x| x.is_finite()).ok_or(ValidationError::NotNumeric { index })
        }).collect::<Result<Vec<_>, _>>()?;
        Ok(Self(values))
    }

    pub fn values(&self) -> &[f64] { &self.0 }

    pub fn encode(&self, encoding: PayloadEncoding) -> Vec<u8> {
        match encoding {
            PayloadEncoding::Csv => self.0.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(",").into_bytes(),
            PayloadEncoding::Json => serde_json::json!({ "features": self.0 }).to_string().into_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding { Csv, Json }

impl PayloadEncoding {
    pub fn from_content_type(ct: &str) -> Option<Self> {
        match ct.split(';').next().map(str::trim) {
            Some("text/csv") => Some(Self::Csv),
            Some("application/json") => Some(Self::Json),
            _ => None,
        }
    }
    pub fn content_type(&self) -> &'static str {
        match self { Self::Csv => "text/csv", Self::Json => "application/json" }
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("endpoint transport: {0}")]
    Transport(String),
    #[error("endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model error: {0}")]
    Model(String),
}

/// Invokes a hosted endpoint with an encoded payload and returns raw bytes.
#[async_trait]
pub trait EndpointRuntime: Send + Sync {
    async fn invoke(&self, endpoint: &str, content_type: &str, body: Vec<u8>) -> Result<Vec<u8>, RuntimeError>;
}

/// Serving-container compatible endpoint reachable over HTTP (`POST {base}/invocations`).
#[derive(Debug, Clone)]
pub struct HttpEndpointRuntime { client: reqwest::Client, base_url: String }

impl HttpEndpointRuntime {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RuntimeError> {
        let client = reqwest::Client::builder().timeout(timeout).build().map_err(|e| RuntimeError::Transport(e.to_string()))?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string() })
    }
}

#[async_trait]
impl EndpointRuntime for HttpEndpointRuntime {
    async fn invoke(&self, endpoint: &str, content_type: &str, body: Vec<u8>) -> Result<Vec<u8>, RuntimeError> {
        let url = format!("{}/invocations", self.base_url);
        debug!(%endpoint, %url, "invoking endpoint");
        let resp = self.client.post(&url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send().await
            .map_err(|e| RuntimeError::Transport(e.to_string()))?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|e| RuntimeError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(RuntimeError::Status { status: status.as_u16(), body: String::from_utf8_lossy(&bytes).into_owned() });
        }
        Ok(bytes.to_vec())
    }
}

type InvokeFn = dyn Fn(&str, &str, &[u8]) -> Result<Vec<u8>, RuntimeError> + Send + Sync;

/// Runtime backed by a closure `(endpoint, content_type, body) -> bytes`.
pub struct FnRuntime { f: Box<InvokeFn> }

impl FnRuntime {
    pub fn new<F>(f: F) -> Self where F: Fn(&str, &str, &[u8]) -> Result<Vec<u8>, RuntimeError> + Send + Sync + 'static {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl EndpointRuntime for FnRuntime {
    async fn invoke(&self, endpoint: &str, content_type: &str, body: Vec<u8>) -> Result<Vec<u8>, RuntimeError> {
        (self.f)(endpoint, content_type, &body)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Prediction {
    Class(usize),
    Probabilities(Vec<f64>),
    Raw(String),
}

impl Prediction {
    /// Decode a raw endpoint response.
    pub fn decode(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let text = text.trim();
        if let Ok(v) = serde_json::from_str::<Value>(text) {
            if let Some(p) = Self::from_json(&v) { return p; }
        }
        Self::from_text(text)
    }

    fn from_text(text: &str) -> Self {
        let parsed: Option<Vec<f64>> = text.split(',').map(|s| s.trim().parse::<f64>().ok()).collect();
        match parsed {
            Some(v) if v.len() == 1 => Self::from_number(v[0]),
            Some(v) if v.len() > 1 => Self::Probabilities(v),
            _ => Self::Raw(text.to_string()),
        }
    }

    fn from_json(v: &Value) -> Option<Self> {
        match v {
            Value::Number(n) => n.as_f64().map(Self::from_number),
            Value::String(s) => Some(Self::from_text(s.trim())),
            Value::Array(items) => {
                let nums: Option<Vec<f64>> = items.iter().map(Value::as_f64).collect();
                match nums {
                    Some(n) if n.len() == 1 => Some(Self::from_number(n[0])),
                    Some(n) if n.len() > 1 => Some(Self::Probabilities(n)),
                    _ if items.len() == 1 => Self::from_json(&items[0]),
                    _ => None,
                }
            }
            Value::Object(m) => ["predictions", "predicted_class", "score"].iter().find_map(|k| m.get(*k)).and_then(Self::from_json),
            _ => None,
        }
    }

    fn from_number(v: f64) -> Self {
        if v.is_finite() && v >= 0.0 && v.fract() == 0.0 { Self::Class(v as usize) } else { Self::Raw(v.to_string()) }
    }

    /// Zero-based class index (argmax for probabilities).
    pub fn predicted_class(&self) -> Option<usize> {
        match self {
            Self::Class(c) => Some(*c),
            Self::Probabilities(p) => p.iter().enumerate().fold(None, |best: Option<(usize, f64)>, (i, &x)| match best {
                Some((_, bx)) if bx >= x => best,
                _ => Some((i, x)),
            }).map(|(i, _)| i),
            Self::Raw(_) => None,
        }
    }

    /// One-based score in `[1, 5]` for probabilities, class index or raw text otherwise.
    /// A probability vector wider than the score scale has no score and yields `null`.
    pub fn score(&self) -> Value {
        match self {
            Self::Class(c) => Value::from(*c),
            Self::Probabilities(p) if p.len() > MAX_SCORE => Value::Null,
            Self::Probabilities(_) => self.predicted_class().map(|i| Value::from(i + 1)).unwrap_or(Value::Null),
            Self::Raw(s) => Value::from(s.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub raw: String,
    pub prediction: Prediction,
    pub latency_secs: f64,
}

impl PredictionResult {
    pub fn predicted_class(&self) -> Option<usize> { self.prediction.predicted_class() }
    pub fn score(&self) -> Value { self.prediction.score() }
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[derive(Serialize)]
struct AuditRecord<'a> {
    timestamp: String,
    features: &'a [f64],
    prediction: &'a str,
    latency: f64,
}

struct AuditSink { store: Arc<dyn ObjectStore>, bucket: String }

pub struct InferenceClient {
    runtime: Arc<dyn EndpointRuntime>,
    endpoint_name: String,
    encoding: PayloadEncoding,
    audit: Option<AuditSink>,
}

impl InferenceClient {
    pub fn new(runtime: Arc<dyn EndpointRuntime>, endpoint_name: impl Into<String>, encoding: PayloadEncoding) -> Self {
        Self { runtime, endpoint_name: endpoint_name.into(), encoding, audit: None }
    }

    /// Record every successful prediction under `inference_logs/` in `bucket`.
    pub fn with_audit(mut self, store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        self.audit = Some(AuditSink { store, bucket: bucket.into() });
        self
    }

    pub fn endpoint_name(&self) -> &str { &self.endpoint_name }

    pub async fn predict(&self, features: &[f64]) -> Result<PredictionResult, InferenceError> {
        let fv = FeatureVector::new(features.to_vec()).map_err(|e| self.rejected(e))?;
        self.predict_vector(&fv).await
    }

    /// Validate a JSON `features` value and predict.
    pub async fn predict_json(&self, features: &Value) -> Result<PredictionResult, InferenceError> {
        let fv = FeatureVector::from_json(features).map_err(|e| self.rejected(e))?;
        self.predict_vector(&fv).await
    }

    fn rejected(&self, e: ValidationError) -> ValidationError {
        EXTENDED_METRICS.inference.requests_total.with_label_values(&["invalid"]).inc();
        debug!(endpoint = %self.endpoint_name, error = %e, "rejected feature vector");
        e
    }

    #[instrument(skip(self, fv), fields(endpoint = %self.endpoint_name))]
    pub async fn predict_vector(&self, fv: &FeatureVector) -> Result<PredictionResult, InferenceError> {
        let body = fv.encode(self.encoding);
        let started = Instant::now();
        let raw = match self.runtime.invoke(&self.endpoint_name, self.encoding.content_type(), body).await {
            Ok(raw) => raw,
            Err(e) => {
                EXTENDED_METRICS.inference.requests_total.with_label_values(&["error"]).inc();
                warn!(error = %e, "endpoint invocation failed");
                return Err(e.into());
            }
        };
        let elapsed = started.elapsed().as_secs_f64();
        EXTENDED_METRICS.inference.requests_total.with_label_values(&["ok"]).inc();
        EXTENDED_METRICS.inference.latency_seconds.observe(elapsed);

        let result = PredictionResult {
            raw: String::from_utf8_lossy(&raw).trim().to_string(),
            prediction: Prediction::decode(&raw),
            latency_secs: (elapsed * 1000.0).round() / 1000.0,
        };
        debug!(prediction = ?result.prediction, latency = result.latency_secs, "prediction decoded");
        self.write_audit(fv, &result).await;
        Ok(result)
    }

    async fn write_audit(&self, fv: &FeatureVector, result: &PredictionResult) {
        let Some(sink) = &self.audit else { return };
        let now = chrono::Utc::now();
        let record = AuditRecord {
            timestamp: now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            features: fv.values(),
            prediction: &result.raw,
            latency: result.latency_secs,
        };
        let location = ObjectLocation::new(sink.bucket.clone(), format!("inference_logs/{}-{}.json", now.timestamp(), uuid::Uuid::new_v4()));
        let body = match serde_json::to_vec(&record) {
            Ok(b) => b,
            Err(e) => { EXTENDED_METRICS.inference.audit_failures_total.inc(); warn!(error = %e, "audit record not serializable"); return; }
        };
        if let Err(e) = sink.store.put_object(&location, body, "application/json").await {
            EXTENDED_METRICS.inference.audit_failures_total.inc();
            warn!(error = %e, %location, "failed to write audit record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo_class(class: &'static str) -> Arc<FnRuntime> {
        Arc::new(FnRuntime::new(move |_, _, _| Ok(class.as_bytes().to_vec())))
    }

    #[test]
    fn validates_length_and_content() {
        assert_eq!(FeatureVector::new(vec![0.0; 49]), Err(ValidationError::WrongCount(49)));
        assert_eq!(FeatureVector::new(vec![0.0; 51]), Err(ValidationError::WrongCount(51)));
        let mut v = vec![0.0; 50];
        v[3] = f64::NAN;
        assert_eq!(FeatureVector::new(v), Err(ValidationError::NotNumeric { index: 3 }));

        let mut items: Vec<Value> = (0..50).map(|i| Value::from(i as f64)).collect();
        items[7] = Value::from("1.5");
        let fv = FeatureVector::from_json(&Value::Array(items.clone())).unwrap();
        assert_eq!(fv.values()[7], 1.5);
        items[7] = Value::from("abc");
        let err = FeatureVector::from_json(&Value::Array(items)).unwrap_err();
        assert_eq!(err.public_message(), "All features must be numbers.");
        let err = FeatureVector::from_json(&serde_json::json!({"a": 1})).unwrap_err();
        assert_eq!(err.public_message(), "Exactly 50 numerical features required.");
    }

    #[test]
    fn encodes_csv_and_json() {
        let fv = FeatureVector::new((0..50).map(|i| i as f64 / 2.0).collect()).unwrap();
        let csv = String::from_utf8(fv.encode(PayloadEncoding::Csv)).unwrap();
        assert!(csv.starts_with("0,0.5,1,1.5,"));
        assert_eq!(csv.split(',').count(), 50);
        let json: Value = serde_json::from_slice(&fv.encode(PayloadEncoding::Json)).unwrap();
        assert_eq!(json["features"].as_array().unwrap().len(), 50);
        assert_eq!(PayloadEncoding::from_content_type("text/csv; charset=utf-8"), Some(PayloadEncoding::Csv));
        assert_eq!(PayloadEncoding::from_content_type("text/plain"), None);
    }

    #[test]
    fn decodes_response_shapes() {
        assert_eq!(Prediction::decode(b"2.0\n"), Prediction::Class(2));
        assert_eq!(Prediction::decode(b"[3]"), Prediction::Class(3));
        assert_eq!(Prediction::decode(b"0.1,0.2,0.6,0.05,0.05"), Prediction::Probabilities(vec![0.1, 0.2, 0.6, 0.05, 0.05]));
        assert_eq!(Prediction::decode(br#"{"predictions":[{"score":4}]}"#), Prediction::Class(4));
        assert_eq!(Prediction::decode(br#"{"predicted_class":1}"#), Prediction::Class(1));
        assert_eq!(Prediction::decode(b"[[0.9,0.1]]"), Prediction::Probabilities(vec![0.9, 0.1]));
        assert_eq!(Prediction::decode(b"not a number"), Prediction::Raw("not a number".into()));
    }

    #[test]
    fn probability_score_is_one_based() {
        let p = Prediction::Probabilities(vec![0.1, 0.2, 0.6, 0.05, 0.05]);
        assert_eq!(p.predicted_class(), Some(2));
        assert_eq!(p.score(), Value::from(3));
        assert_eq!(Prediction::Class(0).score(), Value::from(0));
        assert_eq!(Prediction::Raw("x".into()).predicted_class(), None);
    }

    #[test]
    fn wide_probability_vector_has_no_score() {
        let p = Prediction::Probabilities(vec![0.05, 0.05, 0.1, 0.1, 0.1, 0.1, 0.5]);
        assert_eq!(p.predicted_class(), Some(6));
        assert_eq!(p.score(), Value::Null);
    }

    #[tokio::test]
    async fn audit_keeps_raw_endpoint_text() {
        let store = Arc::new(MemoryStore::with_bucket("logs"));
        let client = InferenceClient::new(echo_class("0.1,0.2,0.6,0.05,0.05"), "ep", PayloadEncoding::Csv).with_audit(store.clone(), "logs");
        let result = client.predict(&[0.3; 50]).await.unwrap();
        assert_eq!(result.predicted_class(), Some(2));
        let keys = store.keys("logs");
        let record: Value = serde_json::from_slice(&store.get_object(&ObjectLocation::new("logs", keys[0].clone())).await.unwrap()).unwrap();
        assert_eq!(record["prediction"], Value::from("0.1,0.2,0.6,0.05,0.05"));
    }

    #[tokio::test]
    async fn invalid_vector_never_reaches_runtime() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let runtime = Arc::new(FnRuntime::new(move |_, _, _| { seen.fetch_add(1, Ordering::SeqCst); Ok(b"1".to_vec()) }));
        let client = InferenceClient::new(runtime, "ep", PayloadEncoding::Csv);
        assert!(matches!(client.predict(&[0.0; 49]).await, Err(InferenceError::Validation(ValidationError::WrongCount(49)))));
        assert!(matches!(client.predict_json(&Value::Array(vec![Value::from("x"); 50])).await, Err(InferenceError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_prediction_is_audited() {
        let store = Arc::new(MemoryStore::with_bucket("logs"));
        let client = InferenceClient::new(echo_class("4"), "ep", PayloadEncoding::Csv).with_audit(store.clone(), "logs");
        let result = client.predict(&[0.1; 50]).await.unwrap();
        assert_eq!(result.predicted_class(), Some(4));
        assert!(result.latency_secs >= 0.0);
        let keys = store.keys("logs");
        assert_eq!(keys.len(), 1);
        assert!(keys[0].starts_with("inference_logs/") && keys[0].ends_with(".json"));
        let record: Value = serde_json::from_slice(&store.get_object(&ObjectLocation::new("logs", keys[0].clone())).await.unwrap()).unwrap();
        assert_eq!(record["prediction"], Value::from("4"));
        assert_eq!(record["features"].as_array().unwrap().len(), 50);
    }

    #[tokio::test]
    async fn audit_failure_does_not_fail_prediction() {
        let store = Arc::new(MemoryStore::new());
        let client = InferenceClient::new(echo_class("1"), "ep", PayloadEncoding::Json).with_audit(store, "missing-bucket");
        assert!(client.predict(&[0.5; 50]).await.is_ok());
    }
}
