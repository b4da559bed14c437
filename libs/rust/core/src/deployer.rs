//! Idempotent create-or-update deploy across model → config → endpoint.
//!
//! Hosted model and endpoint configuration are immutable on the platform,
//! so an existing one with the same name is deleted and recreated. The
//! endpoint is never deleted: it is created once and afterwards updated in
//! place, keeping its ARN.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::hosting::{EndpointConfig, EndpointStatus, HostedModel, HostingProvider, ProductionVariant, ProviderError, ResourceKind, WaitError, WaitPolicy};
use crate::image_uris::{resolve_image, ImageError, ImageSpec};
use crate::metrics_ext::EXTENDED_METRICS;
use crate::storage::{ObjectLocation, ObjectStore, StorageError};

pub const TRAFFIC_VARIANT: &str = "AllTraffic";
pub const NO_FAILURE_REASON: &str = "No detailed reason provided";
const MAX_RESOURCE_NAME: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeployStep { ResolveImage, DeleteModel, CreateModel, DeleteConfig, CreateConfig, DescribeEndpoint, CreateEndpoint, UpdateEndpoint, Wait }

impl DeployStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStep::ResolveImage => "resolve_image",
            DeployStep::DeleteModel => "delete_model",
            DeployStep::CreateModel => "create_model",
            DeployStep::DeleteConfig => "delete_endpoint_config",
            DeployStep::CreateConfig => "create_endpoint_config",
            DeployStep::DescribeEndpoint => "describe_endpoint",
            DeployStep::CreateEndpoint => "create_endpoint",
            DeployStep::UpdateEndpoint => "update_endpoint",
            DeployStep::Wait => "wait_in_service",
        }
    }
}

impl fmt::Display for DeployStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("invalid deploy request: {0}")]
    Validation(String),
    #[error("image resolution: {0}")]
    ImageResolution(#[from] ImageError),
    #[error("model artifact {0} does not exist")]
    ArtifactMissing(ObjectLocation),
    #[error("checking model artifact: {0}")]
    ArtifactCheck(#[from] StorageError),
    #[error("{step} failed: {source}")]
    Provider { step: DeployStep, #[source] source: ProviderError },
    #[error("endpoint {endpoint} deployment failed with status {status}: {reason}")]
    Failed { endpoint: String, status: EndpointStatus, reason: String },
    #[error("endpoint {endpoint} not InService after {waited:?} (last status {last_status:?}): {reason}")]
    Timeout { endpoint: String, waited: Duration, last_status: Option<EndpointStatus>, reason: String },
}

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub model_name: String,
    pub artifact: ObjectLocation,
    pub instance_type: String,
    pub instance_count: u32,
    pub role_arn: String,
    pub region: String,
    pub image: ImageSpec,
}

impl DeployRequest {
    pub fn new(model_name: impl Into<String>, artifact: ObjectLocation, instance_type: impl Into<String>, role_arn: impl Into<String>, region: impl Into<String>) -> Self {
        Self { model_name: model_name.into(), artifact, instance_type: instance_type.into(), instance_count: 1, role_arn: role_arn.into(), region: region.into(), image: ImageSpec::default() }
    }
    pub fn config_name(&self) -> String { format!("{}-config", self.model_name) }
    pub fn endpoint_name(&self) -> String { format!("{}-endpoint", self.model_name) }

    fn validate(&self) -> Result<(), DeployError> {
        let name = &self.model_name;
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') || name.starts_with('-') {
            return Err(DeployError::Validation(format!("model name `{name}` must be alphanumeric with hyphens")));
        }
        if self.endpoint_name().len() > MAX_RESOURCE_NAME {
            return Err(DeployError::Validation(format!("endpoint name `{}` exceeds {MAX_RESOURCE_NAME} characters", self.endpoint_name())));
        }
        if self.instance_count == 0 { return Err(DeployError::Validation("instance count must be at least 1".into())); }
        if self.role_arn.trim().is_empty() { return Err(DeployError::Validation("execution role is required".into())); }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointAddress {
    pub name: String,
    pub arn: String,
    pub config_name: String,
    /// `true` when this deploy created the endpoint, `false` when it updated it.
    pub created: bool,
}

pub struct Deployer {
    provider: Arc<dyn HostingProvider>,
    wait: WaitPolicy,
    artifacts: Option<Arc<dyn ObjectStore>>,
}

impl Deployer {
    pub fn new(provider: Arc<dyn HostingProvider>, wait: WaitPolicy) -> Self { Self { provider, wait, artifacts: None } }

    /// Require the artifact to exist in `store` before anything is created.
    pub fn with_artifact_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    #[instrument(skip(self, req), fields(model = %req.model_name, artifact = %req.artifact, region = %req.region))]
    pub async fn deploy(&self, req: &DeployRequest) -> Result<EndpointAddress, DeployError> {
        let result = self.run(req).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(DeployError::Failed { .. }) => "failed",
            Err(DeployError::Timeout { .. }) => "timeout",
            Err(_) => "error",
        };
        EXTENDED_METRICS.deploy.deploys_total.with_label_values(&[outcome]).inc();
        result
    }

    async fn run(&self, req: &DeployRequest) -> Result<EndpointAddress, DeployError> {
        req.validate()?;
        let image = {
            let _t = step_timer(DeployStep::ResolveImage);
            resolve_image(&req.image, &req.region, &req.instance_type)?
        };
        info!(%image, "resolved serving image");
        if let Some(store) = &self.artifacts {
            if !store.exists(&req.artifact).await? {
                error!(artifact = %req.artifact, "model artifact not found");
                return Err(DeployError::ArtifactMissing(req.artifact.clone()));
            }
        }

        self.delete_if_exists(ResourceKind::Model, &req.model_name).await?;
        let model = HostedModel { name: req.model_name.clone(), image, model_data_url: req.artifact.to_string(), execution_role_arn: req.role_arn.clone() };
        {
            let _t = step_timer(DeployStep::CreateModel);
            self.provider.create_model(&model).await.map_err(|source| DeployError::Provider { step: DeployStep::CreateModel, source })?;
        }
        info!(model = %model.name, "hosted model created");

        let config_name = req.config_name();
        self.delete_if_exists(ResourceKind::EndpointConfig, &config_name).await?;
        let config = EndpointConfig {
            name: config_name.clone(),
            variants: vec![ProductionVariant {
                variant_name: TRAFFIC_VARIANT.into(),
                model_name: req.model_name.clone(),
                instance_type: req.instance_type.clone(),
                initial_instance_count: req.instance_count,
                initial_variant_weight: 1.0,
            }],
        };
        {
            let _t = step_timer(DeployStep::CreateConfig);
            self.provider.create_endpoint_config(&config).await.map_err(|source| DeployError::Provider { step: DeployStep::CreateConfig, source })?;
        }
        info!(config = %config_name, instance_type = %req.instance_type, instances = req.instance_count, "endpoint configuration created");

        let endpoint = req.endpoint_name();
        let created = self.create_or_update_endpoint(&endpoint, &config_name).await?;

        let desc = {
            let _t = step_timer(DeployStep::Wait);
            self.provider.wait_until_in_service(&endpoint, &self.wait).await
        };
        match desc {
            Ok(desc) => {
                info!(endpoint = %endpoint, arn = %desc.arn, created, "endpoint InService");
                Ok(EndpointAddress { name: endpoint, arn: desc.arn, config_name, created })
            }
            Err(WaitError::Failed(desc)) => {
                let reason = failure_reason(desc.failure_reason);
                error!(endpoint = %endpoint, status = %desc.status, failure_reason = %reason, "endpoint deployment failed");
                Err(DeployError::Failed { endpoint, status: desc.status, reason })
            }
            Err(WaitError::Timeout { last, waited }) => {
                let (last_status, reason) = match last {
                    Some(d) => (Some(d.status), failure_reason(d.failure_reason)),
                    None => (None, failure_reason(None)),
                };
                error!(endpoint = %endpoint, ?waited, ?last_status, failure_reason = %reason, "endpoint did not reach InService");
                Err(DeployError::Timeout { endpoint, waited, last_status, reason })
            }
            Err(WaitError::Provider(source)) => Err(DeployError::Provider { step: DeployStep::Wait, source }),
        }
    }

    async fn delete_if_exists(&self, kind: ResourceKind, name: &str) -> Result<(), DeployError> {
        let step = match kind { ResourceKind::Model => DeployStep::DeleteModel, _ => DeployStep::DeleteConfig };
        let _t = step_timer(step);
        let described = match kind {
            ResourceKind::Model => self.provider.describe_model(name).await.map(|_| ()),
            _ => self.provider.describe_endpoint_config(name).await.map(|_| ()),
        };
        match described {
            Ok(()) => {}
            Err(e) if self.provider.is_not_found(kind, &e) => {
                info!(resource = kind.label(), %name, "no existing resource to delete");
                return Ok(());
            }
            Err(source) => return Err(DeployError::Provider { step, source }),
        }
        let deleted = match kind {
            ResourceKind::Model => self.provider.delete_model(name).await,
            _ => self.provider.delete_endpoint_config(name).await,
        };
        match deleted {
            Ok(()) => { info!(resource = kind.label(), %name, "deleted existing resource"); Ok(()) }
            Err(e) if self.provider.is_not_found(kind, &e) => { warn!(resource = kind.label(), %name, "resource vanished before delete"); Ok(()) }
            Err(source) => Err(DeployError::Provider { step, source }),
        }
    }

    async fn create_or_update_endpoint(&self, endpoint: &str, config_name: &str) -> Result<bool, DeployError> {
        let existing = {
            let _t = step_timer(DeployStep::DescribeEndpoint);
            self.provider.describe_endpoint(endpoint).await
        };
        match existing {
            Ok(desc) => {
                info!(%endpoint, status = %desc.status, "endpoint exists, updating in place");
                let _t = step_timer(DeployStep::UpdateEndpoint);
                self.provider.update_endpoint(endpoint, config_name).await.map_err(|source| DeployError::Provider { step: DeployStep::UpdateEndpoint, source })?;
                Ok(false)
            }
            Err(e) if self.provider.is_not_found(ResourceKind::Endpoint, &e) => {
                info!(%endpoint, "endpoint not found, creating");
                let _t = step_timer(DeployStep::CreateEndpoint);
                self.provider.create_endpoint(endpoint, config_name).await.map_err(|source| DeployError::Provider { step: DeployStep::CreateEndpoint, source })?;
                Ok(true)
            }
            Err(source) => Err(DeployError::Provider { step: DeployStep::DescribeEndpoint, source }),
        }
    }
}

fn failure_reason(reason: Option<String>) -> String {
    reason.filter(|r| !r.is_empty()).unwrap_or_else(|| NO_FAILURE_REASON.to_string())
}

fn step_timer(step: DeployStep) -> prometheus::HistogramTimer {
    EXTENDED_METRICS.deploy.step_latency_seconds.with_label_values(&[step.as_str()]).start_timer()
}
