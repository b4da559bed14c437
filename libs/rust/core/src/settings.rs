//! Layered tool configuration: defaults, optional file (`MLOPS_CONFIG_FILE`),
//! then the process environment (`AWS_REGION`, `S3_BUCKET`, ...).

use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::storage::ObjectLocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend { Local, Aws }

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Source(#[from] config::ConfigError),
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub backend: Backend,
    pub aws_region: String,
    pub s3_bucket: String,
    pub sagemaker_execution_role_arn: Option<String>,
    pub sagemaker_endpoint_name: String,
    pub model_name: String,
    /// Bundle to deploy: an `s3://` URL, a key in `s3_bucket`, or empty for
    /// the packager's latest bundle of `model_name`.
    pub model_key: String,
    pub instance_type: String,
    pub instance_count: u32,
    pub image_framework: String,
    pub image_version: String,
    pub content_type: String,
    pub endpoint_url: String,
    pub api_gateway_url: String,
    pub load_test_requests: usize,
    pub load_test_concurrency: usize,
    pub latency_threshold_secs: f64,
    pub request_timeout_secs: u64,
    pub wait_poll_secs: u64,
    pub wait_timeout_secs: u64,
    pub local_store_dir: String,
    pub model_path: String,
    pub model_archive_name: String,
    pub metrics_path: Option<String>,
    pub gateway_port: u16,
    pub audit_enabled: bool,
    pub persist_report: bool,
}

impl PipelineConfig {
    pub fn role_arn(&self) -> Result<&str, ConfigError> {
        self.sagemaker_execution_role_arn.as_deref().filter(|r| !r.is_empty()).ok_or(ConfigError::Missing("sagemaker_execution_role_arn"))
    }
    pub fn artifact_location(&self) -> ObjectLocation {
        let key = self.model_key.trim();
        if key.is_empty() { return ObjectLocation::latest_bundle(self.s3_bucket.clone(), &self.model_name); }
        key.parse().unwrap_or_else(|_| ObjectLocation::new(self.s3_bucket.clone(), key.trim_start_matches('/')))
    }
    pub fn request_timeout(&self) -> Duration { Duration::from_secs(self.request_timeout_secs) }
    pub fn latency_threshold(&self) -> Duration { Duration::from_secs_f64(self.latency_threshold_secs.max(0.0)) }
}

fn defaults(service: &str) -> Result<ConfigBuilder<DefaultState>, config::ConfigError> {
    Config::builder()
        .set_default("service_name", service)?
        .set_default("backend", "local")?
        .set_default("aws_region", "us-east-1")?
        .set_default("s3_bucket", "cloud-ml-lead-models")?
        .set_default("sagemaker_endpoint_name", "lead-scoring-xgb-endpoint")?
        .set_default("model_name", "xgboostmodel")?
        .set_default("model_key", "")?
        .set_default("instance_type", "ml.t2.medium")?
        .set_default("instance_count", 1)?
        .set_default("image_framework", "xgboost")?
        .set_default("image_version", "1.7-1")?
        .set_default("content_type", "text/csv")?
        .set_default("endpoint_url", "http://127.0.0.1:8080")?
        .set_default("api_gateway_url", "http://127.0.0.1:9090/predict")?
        .set_default("load_test_requests", 300)?
        .set_default("load_test_concurrency", 300)?
        .set_default("latency_threshold_secs", 1.0)?
        .set_default("request_timeout_secs", 30)?
        .set_default("wait_poll_secs", 30)?
        .set_default("wait_timeout_secs", 3600)?
        .set_default("local_store_dir", ".mlops-store")?
        .set_default("model_path", "model/output/xgboostmodel")?
        .set_default("model_archive_name", "xgboostmodel")?
        .set_default("gateway_port", 9090)?
        .set_default("audit_enabled", true)?
        .set_default("persist_report", true)
}

/// Load configuration for `service` from defaults, `MLOPS_CONFIG_FILE` and the environment.
pub fn load_config(service: &str) -> Result<PipelineConfig, ConfigError> {
    let mut builder = defaults(service)?;
    if let Ok(file) = std::env::var("MLOPS_CONFIG_FILE") {
        builder = builder.add_source(File::with_name(&file).required(false));
    }
    builder = builder.add_source(Environment::default().try_parsing(true));
    let cfg: PipelineConfig = builder.build()?.try_deserialize()?;
    tracing::debug!(service, backend=?cfg.backend, region=%cfg.aws_region, "configuration loaded");
    Ok(cfg)
}

/// Same layering as [`load_config`] with an explicit environment map.
pub fn load_config_from_env(service: &str, env: config::Map<String, String>) -> Result<PipelineConfig, ConfigError> {
    let builder = defaults(service)?.add_source(Environment::default().try_parsing(true).source(Some(env)));
    Ok(builder.build()?.try_deserialize()?)
}
