use mlops_core::{
    load_config_from_env, ArtifactPackager, DeployError, DeployRequest, DeployStep, Deployer, EndpointStatus, FnRuntime,
    HostingProvider, InferenceClient, MemoryHostingProvider, MemoryStore, ObjectLocation, PackageRequest, PayloadEncoding,
    ProviderError, WaitPolicy, NO_FAILURE_REASON,
};
use std::sync::Arc;
use std::time::Duration;

fn fast_wait() -> WaitPolicy { WaitPolicy { poll_interval: Duration::from_millis(1), timeout: Duration::from_secs(5) } }

fn demo_request() -> DeployRequest {
    DeployRequest::new("demo-model", "s3://bucket/model.tar.gz".parse::<ObjectLocation>().unwrap(), "ml.t2.medium", "arn:aws:iam::123456789012:role/sm", "us-east-1")
}

#[tokio::test]
async fn redeploy_replaces_model_and_config_but_keeps_endpoint() {
    let provider = Arc::new(MemoryHostingProvider::new("us-east-1"));
    let deployer = Deployer::new(provider.clone(), fast_wait());

    let first = deployer.deploy(&demo_request()).await.unwrap();
    assert!(first.created);
    let second = deployer.deploy(&demo_request()).await.unwrap();
    assert!(!second.created);

    assert_eq!(first.arn, second.arn);
    assert_eq!(provider.model_names(), vec!["demo-model".to_string()]);
    assert_eq!(provider.config_names(), vec!["demo-model-config".to_string()]);
    assert_eq!(provider.endpoint_names(), vec!["demo-model-endpoint".to_string()]);

    let calls = provider.calls();
    assert!(calls.contains(&"delete_model:demo-model".to_string()));
    assert!(calls.contains(&"delete_endpoint_config:demo-model-config".to_string()));
    assert!(calls.contains(&"update_endpoint:demo-model-endpoint".to_string()));
    assert_eq!(calls.iter().filter(|c| c.starts_with("create_endpoint:")).count(), 1);
}

#[tokio::test]
async fn steps_run_in_model_config_endpoint_order() {
    let provider = Arc::new(MemoryHostingProvider::default());
    Deployer::new(provider.clone(), fast_wait()).deploy(&demo_request()).await.unwrap();
    let calls = provider.calls();
    let pos = |op: &str| calls.iter().position(|c| c.starts_with(op)).unwrap();
    assert!(pos("create_model:") < pos("create_endpoint_config:"));
    assert!(pos("create_endpoint_config:") < pos("create_endpoint:"));
    let config = provider.config("demo-model-config").unwrap();
    assert_eq!(config.variants.len(), 1);
    assert_eq!(config.variants[0].variant_name, "AllTraffic");
    assert_eq!(config.variants[0].initial_variant_weight, 1.0);
    assert_eq!(config.variants[0].initial_instance_count, 1);
    let model = provider.model("demo-model").unwrap();
    assert_eq!(model.model_data_url, "s3://bucket/model.tar.gz");
    assert!(model.image.ends_with("sagemaker-xgboost:1.7-1"));
}

#[tokio::test]
async fn endpoint_describe_failure_other_than_absence_aborts() {
    let provider = Arc::new(MemoryHostingProvider::default());
    provider.inject_fault("describe_endpoint", ProviderError::with_code("AccessDeniedException", "User is not authorized to perform: sagemaker:DescribeEndpoint"));
    let deployer = Deployer::new(provider.clone(), fast_wait());
    match deployer.deploy(&demo_request()).await {
        Err(DeployError::Provider { step, source }) => {
            assert_eq!(step, DeployStep::DescribeEndpoint);
            assert!(source.message.contains("not authorized"));
        }
        other => panic!("expected provider error, got {other:?}"),
    }
    let calls = provider.calls();
    assert!(!calls.iter().any(|c| c.starts_with("create_endpoint:") || c.starts_with("update_endpoint:")));
    assert!(provider.endpoint_names().is_empty());
}

#[tokio::test]
async fn model_describe_failure_aborts_before_any_mutation() {
    let provider = Arc::new(MemoryHostingProvider::default());
    provider.inject_fault("describe_model", ProviderError::with_code("ThrottlingException", "Rate exceeded"));
    let err = Deployer::new(provider.clone(), fast_wait()).deploy(&demo_request()).await.unwrap_err();
    assert!(matches!(err, DeployError::Provider { step: DeployStep::DeleteModel, .. }));
    assert_eq!(provider.calls(), vec!["describe_model:demo-model".to_string()]);
}

#[tokio::test]
async fn wait_timeout_is_reported() {
    let provider = Arc::new(MemoryHostingProvider::default().with_polls_to_settle(u32::MAX));
    let policy = WaitPolicy { poll_interval: Duration::from_millis(1), timeout: Duration::from_millis(10) };
    match Deployer::new(provider, policy).deploy(&demo_request()).await {
        Err(DeployError::Timeout { endpoint, last_status, reason, .. }) => {
            assert_eq!(endpoint, "demo-model-endpoint");
            assert_eq!(last_status, Some(EndpointStatus::Creating));
            assert_eq!(reason, NO_FAILURE_REASON);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn deployed_endpoint_serves_predictions() {
    let provider = Arc::new(MemoryHostingProvider::default());
    let address = Deployer::new(provider.clone(), fast_wait()).deploy(&demo_request()).await.unwrap();
    assert_eq!(address.name, "demo-model-endpoint");
    assert_eq!(provider.describe_endpoint(&address.name).await.unwrap().status, EndpointStatus::InService);

    let runtime = Arc::new(FnRuntime::new(|endpoint, content_type, body| {
        assert_eq!(endpoint, "demo-model-endpoint");
        assert_eq!(content_type, "text/csv");
        assert_eq!(std::str::from_utf8(body).unwrap().split(',').count(), 50);
        Ok(b"2.0".to_vec())
    }));
    let client = InferenceClient::new(runtime, address.name.clone(), PayloadEncoding::Csv);
    let result = client.predict(&[0.0; 50]).await.unwrap();
    let class = result.predicted_class().unwrap();
    assert!(class < 5);
    assert!(result.latency_secs >= 0.0);
}

#[tokio::test]
async fn packaged_bundle_is_what_the_default_config_deploys() {
    let dir = std::env::temp_dir().join(format!("mlops-deploy-{}", uuid::Uuid::new_v4()));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let model_path = dir.join("xgboostmodel");
    tokio::fs::write(&model_path, b"booster").await.unwrap();

    let cfg = load_config_from_env("test", [("S3_BUCKET".to_string(), "artifacts".to_string())].into_iter().collect()).unwrap();
    let store = Arc::new(MemoryStore::new());
    let packaged = ArtifactPackager::new(store.clone(), cfg.s3_bucket.clone())
        .package(&PackageRequest::new(&model_path, cfg.model_name.clone()))
        .await
        .unwrap();
    assert_eq!(cfg.artifact_location(), packaged.latest);

    let provider = Arc::new(MemoryHostingProvider::default());
    let req = DeployRequest::new("demo-model", cfg.artifact_location(), "ml.t2.medium", "arn:aws:iam::123456789012:role/sm", "us-east-1");
    Deployer::new(provider.clone(), fast_wait()).with_artifact_store(store).deploy(&req).await.unwrap();
    let model = provider.model("demo-model").unwrap();
    assert_eq!(model.model_data_url, packaged.latest.to_string());
    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn missing_artifact_aborts_before_any_call() {
    let store = Arc::new(MemoryStore::with_bucket("bucket"));
    let provider = Arc::new(MemoryHostingProvider::default());
    let deployer = Deployer::new(provider.clone(), fast_wait()).with_artifact_store(store);
    match deployer.deploy(&demo_request()).await {
        Err(DeployError::ArtifactMissing(loc)) => assert_eq!(loc.to_string(), "s3://bucket/model.tar.gz"),
        other => panic!("expected missing artifact, got {other:?}"),
    }
    assert!(provider.calls().is_empty());
}
