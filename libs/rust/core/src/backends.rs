//! Capability construction from [`PipelineConfig`]: each tool asks for the
//! store/provider/runtime it needs and gets the configured backend.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::hosting::{HostingProvider, MemoryHostingProvider, WaitPolicy};
use crate::inference::{EndpointRuntime, HttpEndpointRuntime};
use crate::settings::{Backend, PipelineConfig};
use crate::storage::{LocalStore, ObjectStore};

pub fn wait_policy(cfg: &PipelineConfig) -> WaitPolicy {
    WaitPolicy { poll_interval: Duration::from_secs(cfg.wait_poll_secs), timeout: Duration::from_secs(cfg.wait_timeout_secs) }
}

pub async fn object_store(cfg: &PipelineConfig) -> Result<Arc<dyn ObjectStore>> {
    match cfg.backend {
        Backend::Local => {
            info!(root = %cfg.local_store_dir, "using local object store");
            Ok(Arc::new(LocalStore::new(&cfg.local_store_dir)))
        }
        Backend::Aws => aws_store(cfg).await,
    }
}

/// Local backend is a dry-run simulator; nothing is provisioned.
pub async fn hosting_provider(cfg: &PipelineConfig) -> Result<Arc<dyn HostingProvider>> {
    match cfg.backend {
        Backend::Local => {
            info!(region = %cfg.aws_region, "using simulated hosting provider (dry run)");
            Ok(Arc::new(MemoryHostingProvider::new(&cfg.aws_region).with_polls_to_settle(1)))
        }
        Backend::Aws => aws_hosting(cfg).await,
    }
}

pub async fn endpoint_runtime(cfg: &PipelineConfig) -> Result<Arc<dyn EndpointRuntime>> {
    match cfg.backend {
        Backend::Local => {
            info!(url = %cfg.endpoint_url, "using HTTP endpoint runtime");
            Ok(Arc::new(HttpEndpointRuntime::new(cfg.endpoint_url.clone(), cfg.request_timeout())?))
        }
        Backend::Aws => aws_runtime(cfg).await,
    }
}

#[cfg(feature = "aws")]
async fn aws_store(cfg: &PipelineConfig) -> Result<Arc<dyn ObjectStore>> {
    let sdk = crate::aws::load_sdk_config(&cfg.aws_region).await;
    Ok(Arc::new(crate::aws::S3Store::new(&sdk)))
}

#[cfg(feature = "aws")]
async fn aws_hosting(cfg: &PipelineConfig) -> Result<Arc<dyn HostingProvider>> {
    let sdk = crate::aws::load_sdk_config(&cfg.aws_region).await;
    Ok(Arc::new(crate::aws::SageMakerHosting::new(&sdk)))
}

#[cfg(feature = "aws")]
async fn aws_runtime(cfg: &PipelineConfig) -> Result<Arc<dyn EndpointRuntime>> {
    let sdk = crate::aws::load_sdk_config(&cfg.aws_region).await;
    Ok(Arc::new(crate::aws::SageMakerRuntime::new(&sdk)))
}

#[cfg(not(feature = "aws"))]
async fn aws_store(_cfg: &PipelineConfig) -> Result<Arc<dyn ObjectStore>> { Err(aws_disabled()) }

#[cfg(not(feature = "aws"))]
async fn aws_hosting(_cfg: &PipelineConfig) -> Result<Arc<dyn HostingProvider>> { Err(aws_disabled()) }

#[cfg(not(feature = "aws"))]
async fn aws_runtime(_cfg: &PipelineConfig) -> Result<Arc<dyn EndpointRuntime>> { Err(aws_disabled()) }

#[cfg(not(feature = "aws"))]
fn aws_disabled() -> anyhow::Error { anyhow::anyhow!("backend `aws` requires building with the `aws` feature") }

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::load_config_from_env;

    #[tokio::test]
    async fn local_backend_builds_every_capability() {
        let cfg = load_config_from_env("test", config::Map::new()).unwrap();
        assert!(object_store(&cfg).await.is_ok());
        assert!(hosting_provider(&cfg).await.is_ok());
        assert!(endpoint_runtime(&cfg).await.is_ok());
        assert_eq!(wait_policy(&cfg).poll_interval, Duration::from_secs(30));
    }

    #[cfg(not(feature = "aws"))]
    #[tokio::test]
    async fn aws_backend_needs_feature() {
        let mut env = config::Map::new();
        env.insert("BACKEND".to_string(), "aws".to_string());
        let cfg = load_config_from_env("test", env).unwrap();
        assert!(hosting_provider(&cfg).await.is_err());
    }
}
