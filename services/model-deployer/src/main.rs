use anyhow::{Context, Result};
use mlops_core::{hosting_provider, init_tracing, load_config, object_store, wait_policy, DeployRequest, Deployer, ImageSpec};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("model-deployer")?;
    let cfg = load_config("model-deployer")?;

    let mut req = DeployRequest::new(cfg.model_name.clone(), cfg.artifact_location(), cfg.instance_type.clone(), cfg.role_arn()?, cfg.aws_region.clone());
    req.instance_count = cfg.instance_count;
    req.image = ImageSpec { framework: cfg.image_framework.clone(), version: cfg.image_version.clone() };

    let provider = hosting_provider(&cfg).await?;
    let store = object_store(&cfg).await?;
    info!(model = %req.model_name, artifact = %req.artifact, endpoint = %req.endpoint_name(), "deploying");
    let address = Deployer::new(provider, wait_policy(&cfg))
        .with_artifact_store(store)
        .deploy(&req)
        .await
        .with_context(|| format!("deploying {}", req.endpoint_name()))?;
    info!(endpoint = %address.name, arn = %address.arn, created = address.created, "endpoint ready");
    println!("{}", serde_json::to_string_pretty(&address)?);
    Ok(())
}
