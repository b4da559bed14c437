use anyhow::{Context, Result};
use mlops_core::{endpoint_runtime, init_tracing, load_config, InferenceClient, PayloadEncoding, FEATURE_COUNT};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("endpoint-smoke")?;
    let cfg = load_config("endpoint-smoke")?;
    let encoding = PayloadEncoding::from_content_type(&cfg.content_type)
        .with_context(|| format!("unsupported content type {}", cfg.content_type))?;

    let client = InferenceClient::new(endpoint_runtime(&cfg).await?, cfg.sagemaker_endpoint_name.clone(), encoding);
    let result = client
        .predict(&[0.1; FEATURE_COUNT])
        .await
        .with_context(|| format!("invoking {}", cfg.sagemaker_endpoint_name))?;
    info!(endpoint = %cfg.sagemaker_endpoint_name, raw = %result.raw, predicted_class = ?result.predicted_class(), latency = result.latency_secs, "smoke test passed");
    println!("{}", serde_json::json!({
        "endpoint": cfg.sagemaker_endpoint_name,
        "raw": result.raw,
        "predicted_class": result.predicted_class(),
        "score": result.score(),
        "latency": result.latency_secs,
    }));
    Ok(())
}
