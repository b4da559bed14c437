//! Amazon backends: S3 object store, SageMaker hosting provider and the
//! SageMaker runtime. Compiled only with the `aws` feature.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client as S3Client;
use aws_sdk_sagemaker::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_sagemaker::types::{ContainerDefinition, ProductionVariant as SmVariant, ProductionVariantInstanceType};
use aws_sdk_sagemaker::Client as SageMakerClient;
use aws_sdk_sagemakerruntime::primitives::Blob;
use aws_sdk_sagemakerruntime::Client as RuntimeClient;
use tracing::info;

use crate::hosting::{EndpointConfig, EndpointDescription, EndpointStatus, HostedModel, HostingProvider, ProductionVariant, ProviderError};
use crate::inference::{EndpointRuntime, RuntimeError};
use crate::storage::{ObjectLocation, ObjectStore, StorageError};

pub async fn load_sdk_config(region: &str) -> aws_config::SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(region.to_string()))
        .load()
        .await
}

fn provider_error<E, R>(e: SdkError<E, R>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let code = e.code().map(str::to_string);
    let message = e.message().map(str::to_string).unwrap_or_else(|| DisplayErrorContext(&e).to_string());
    ProviderError { code, message }
}

pub struct S3Store { client: S3Client, region: String }

impl S3Store {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        let region = config.region().map(|r| r.to_string()).unwrap_or_else(|| "us-east-1".into());
        Self { client: S3Client::new(config), region }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn ensure_bucket(&self, bucket: &str) -> Result<bool, StorageError> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => return Ok(false),
            Err(e) if e.as_service_error().map(|s| s.is_not_found()).unwrap_or(false) => {}
            Err(e) => return Err(StorageError::Backend(DisplayErrorContext(&e).to_string())),
        }
        let mut req = self.client.create_bucket().bucket(bucket);
        if self.region != "us-east-1" {
            let cfg = CreateBucketConfiguration::builder().location_constraint(BucketLocationConstraint::from(self.region.as_str())).build();
            req = req.create_bucket_configuration(cfg);
        }
        req.send().await.map_err(|e| StorageError::Backend(DisplayErrorContext(&e).to_string()))?;
        info!(%bucket, region = %self.region, "bucket created");
        Ok(true)
    }

    async fn put_object(&self, location: &ObjectLocation, body: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| StorageError::Backend(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    async fn get_object(&self, location: &ObjectLocation) -> Result<Vec<u8>, StorageError> {
        let out = match self.client.get_object().bucket(&location.bucket).key(&location.key).send().await {
            Ok(out) => out,
            Err(e) if e.as_service_error().map(|s| s.is_no_such_key()).unwrap_or(false) => return Err(StorageError::NotFound(location.clone())),
            Err(e) => return Err(StorageError::Backend(DisplayErrorContext(&e).to_string())),
        };
        let bytes = out.body.collect().await.map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn exists(&self, location: &ObjectLocation) -> Result<bool, StorageError> {
        match self.client.head_object().bucket(&location.bucket).key(&location.key).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().map(|s| s.is_not_found()).unwrap_or(false) => Ok(false),
            Err(e) => Err(StorageError::Backend(DisplayErrorContext(&e).to_string())),
        }
    }
}

pub struct SageMakerHosting { client: SageMakerClient }

impl SageMakerHosting {
    pub fn new(config: &aws_config::SdkConfig) -> Self { Self { client: SageMakerClient::new(config) } }
}

#[async_trait]
impl HostingProvider for SageMakerHosting {
    async fn describe_model(&self, name: &str) -> Result<HostedModel, ProviderError> {
        let out = self.client.describe_model().model_name(name).send().await.map_err(provider_error)?;
        let container = out.primary_container();
        Ok(HostedModel {
            name: name.to_string(),
            image: container.and_then(|c| c.image()).unwrap_or_default().to_string(),
            model_data_url: container.and_then(|c| c.model_data_url()).unwrap_or_default().to_string(),
            execution_role_arn: out.execution_role_arn().unwrap_or_default().to_string(),
        })
    }

    async fn create_model(&self, model: &HostedModel) -> Result<(), ProviderError> {
        let container = ContainerDefinition::builder().image(&model.image).model_data_url(&model.model_data_url).build();
        self.client
            .create_model()
            .model_name(&model.name)
            .primary_container(container)
            .execution_role_arn(&model.execution_role_arn)
            .send()
            .await
            .map_err(provider_error)?;
        Ok(())
    }

    async fn delete_model(&self, name: &str) -> Result<(), ProviderError> {
        self.client.delete_model().model_name(name).send().await.map_err(provider_error)?;
        Ok(())
    }

    async fn describe_endpoint_config(&self, name: &str) -> Result<EndpointConfig, ProviderError> {
        let out = self.client.describe_endpoint_config().endpoint_config_name(name).send().await.map_err(provider_error)?;
        let variants = out.production_variants().iter().map(|v| ProductionVariant {
            variant_name: v.variant_name().to_string(),
            model_name: v.model_name().unwrap_or_default().to_string(),
            instance_type: v.instance_type().map(|t| t.as_str().to_string()).unwrap_or_default(),
            initial_instance_count: v.initial_instance_count().unwrap_or(0).max(0) as u32,
            initial_variant_weight: v.initial_variant_weight().unwrap_or(0.0),
        }).collect();
        Ok(EndpointConfig { name: name.to_string(), variants })
    }

    async fn create_endpoint_config(&self, config: &EndpointConfig) -> Result<(), ProviderError> {
        let mut req = self.client.create_endpoint_config().endpoint_config_name(&config.name);
        for v in &config.variants {
            let variant = SmVariant::builder()
                .variant_name(&v.variant_name)
                .model_name(&v.model_name)
                .instance_type(ProductionVariantInstanceType::from(v.instance_type.as_str()))
                .initial_instance_count(v.initial_instance_count as i32)
                .initial_variant_weight(v.initial_variant_weight)
                .build()
                .map_err(|e| ProviderError::new(e.to_string()))?;
            req = req.production_variants(variant);
        }
        req.send().await.map_err(provider_error)?;
        Ok(())
    }

    async fn delete_endpoint_config(&self, name: &str) -> Result<(), ProviderError> {
        self.client.delete_endpoint_config().endpoint_config_name(name).send().await.map_err(provider_error)?;
        Ok(())
    }

    async fn describe_endpoint(&self, name: &str) -> Result<EndpointDescription, ProviderError> {
        let out = self.client.describe_endpoint().endpoint_name(name).send().await.map_err(provider_error)?;
        Ok(EndpointDescription {
            name: name.to_string(),
            arn: out.endpoint_arn().unwrap_or_default().to_string(),
            config_name: out.endpoint_config_name().unwrap_or_default().to_string(),
            status: out.endpoint_status().map(|s| EndpointStatus::parse(s.as_str())).unwrap_or(EndpointStatus::Unknown(String::new())),
            failure_reason: out.failure_reason().map(str::to_string),
        })
    }

    async fn create_endpoint(&self, name: &str, config_name: &str) -> Result<(), ProviderError> {
        self.client.create_endpoint().endpoint_name(name).endpoint_config_name(config_name).send().await.map_err(provider_error)?;
        Ok(())
    }

    async fn update_endpoint(&self, name: &str, config_name: &str) -> Result<(), ProviderError> {
        self.client.update_endpoint().endpoint_name(name).endpoint_config_name(config_name).send().await.map_err(provider_error)?;
        Ok(())
    }
}

pub struct SageMakerRuntime { client: RuntimeClient }

impl SageMakerRuntime {
    pub fn new(config: &aws_config::SdkConfig) -> Self { Self { client: RuntimeClient::new(config) } }
}

#[async_trait]
impl EndpointRuntime for SageMakerRuntime {
    async fn invoke(&self, endpoint: &str, content_type: &str, body: Vec<u8>) -> Result<Vec<u8>, RuntimeError> {
        let out = self.client
            .invoke_endpoint()
            .endpoint_name(endpoint)
            .content_type(content_type)
            .body(Blob::new(body))
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(se) if se.is_model_error() => RuntimeError::Model(se.to_string()),
                _ => RuntimeError::Transport(aws_sdk_sagemakerruntime::error::DisplayErrorContext(&e).to_string()),
            })?;
        Ok(out.body().map(|b| b.as_ref().to_vec()).unwrap_or_default())
    }
}
