use anyhow::{Context, Result};
use mlops_core::{init_tracing, load_config, object_store, ArtifactPackager, PackageRequest};
use serde_json::Value;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("model-packager")?;
    let cfg = load_config("model-packager")?;

    let metrics: Option<Value> = match &cfg.metrics_path {
        Some(path) => {
            let raw = tokio::fs::read(path).await.with_context(|| format!("reading metrics document {path}"))?;
            Some(serde_json::from_slice(&raw).with_context(|| format!("parsing metrics document {path}"))?)
        }
        None => None,
    };

    let store = object_store(&cfg).await?;
    let req = PackageRequest {
        model_path: cfg.model_path.clone().into(),
        model_name: cfg.model_name.clone(),
        archive_name: cfg.model_archive_name.clone(),
        metrics,
        version: None,
    };
    let artifact = ArtifactPackager::new(store, cfg.s3_bucket.clone())
        .package(&req)
        .await
        .with_context(|| format!("packaging {}", cfg.model_path))?;
    info!(bundle = %artifact.bundle, latest = %artifact.latest, version = %artifact.version, sha256 = %artifact.sha256, "model packaged");
    println!("{}", serde_json::to_string_pretty(&artifact)?);
    Ok(())
}
