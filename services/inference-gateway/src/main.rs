use anyhow::{Context, Result};
use inference_gateway::router;
use mlops_core::{clear_ready, endpoint_runtime, init_tracing, load_config, mark_ready, object_store, InferenceClient, PayloadEncoding};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("inference-gateway")?;
    let cfg = load_config("inference-gateway")?;
    let encoding = PayloadEncoding::from_content_type(&cfg.content_type)
        .with_context(|| format!("unsupported content type {}", cfg.content_type))?;

    let mut client = InferenceClient::new(endpoint_runtime(&cfg).await?, cfg.sagemaker_endpoint_name.clone(), encoding);
    if cfg.audit_enabled {
        client = client.with_audit(object_store(&cfg).await?, cfg.s3_bucket.clone());
    }

    let listener = TcpListener::bind(("0.0.0.0", cfg.gateway_port)).await
        .with_context(|| format!("binding port {}", cfg.gateway_port))?;
    info!(addr = %listener.local_addr()?, endpoint = %cfg.sagemaker_endpoint_name, audit = cfg.audit_enabled, "inference gateway listening");
    mark_ready();
    axum::serve(listener, router(Arc::new(client)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            clear_ready();
            info!("shutdown");
        })
        .await?;
    Ok(())
}
