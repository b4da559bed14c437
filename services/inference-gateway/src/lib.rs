//! Public prediction entry point: `POST /predict {"features": [...]}`
//! (or a `text/csv` body of 50 comma-separated values).

use axum::{body::Bytes, extract::State, http::{header, HeaderMap, StatusCode}, response::{IntoResponse, Response}, routing::post, Json, Router};
use mlops_core::{health_router, InferenceClient, InferenceError, PayloadEncoding};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState { client: Arc<InferenceClient> }

pub fn router(client: Arc<InferenceClient>) -> Router {
    Router::new()
        .route("/predict", post(predict))
        .with_state(AppState { client })
        .merge(health_router())
}

fn error_body(code: StatusCode, message: &str) -> Response {
    (code, Json(json!({ "error": message }))).into_response()
}

/// `text/csv` bodies are a bare comma-separated vector; anything else is JSON.
fn features_from_body(headers: &HeaderMap, body: &[u8]) -> Result<Value, &'static str> {
    let content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or("application/json");
    if PayloadEncoding::from_content_type(content_type) == Some(PayloadEncoding::Csv) {
        let text = std::str::from_utf8(body).map_err(|_| "Request body must be UTF-8 text.")?;
        return Ok(Value::Array(text.trim().split(',').map(|s| Value::from(s.trim())).collect()));
    }
    let parsed: Value = serde_json::from_slice(body).map_err(|_| "Request body must be a JSON object.")?;
    Ok(parsed.get("features").cloned().unwrap_or(Value::Null))
}

async fn predict(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let features = match features_from_body(&headers, &body) {
        Ok(v) => v,
        Err(msg) => return error_body(StatusCode::BAD_REQUEST, msg),
    };
    match state.client.predict_json(&features).await {
        Ok(result) => {
            info!(endpoint = state.client.endpoint_name(), predicted_class = ?result.predicted_class(), latency = result.latency_secs, "prediction served");
            (StatusCode::OK, Json(json!({
                "score": result.score(),
                "predicted_class": result.predicted_class(),
                "latency": result.latency_secs,
            }))).into_response()
        }
        Err(InferenceError::Validation(e)) => error_body(StatusCode::BAD_REQUEST, e.public_message()),
        Err(InferenceError::Runtime(e)) => {
            error!(error = %e, "inference failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}
