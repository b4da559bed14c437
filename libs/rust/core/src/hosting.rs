//! Model hosting provider capability.
//!
//! Three named resource kinds (hosted model, endpoint configuration,
//! endpoint) with describe/create/delete/update plus a readiness wait.
//! Models and configurations are immutable once created; endpoints are
//! long-lived and re-pointed at new configurations.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

use crate::metrics_ext::EXTENDED_METRICS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind { Model, EndpointConfig, Endpoint }

impl ResourceKind {
    /// Resource noun as it appears in provider error messages.
    pub fn label(&self) -> &'static str {
        match self { ResourceKind::Model => "model", ResourceKind::EndpointConfig => "endpoint configuration", ResourceKind::Endpoint => "endpoint" }
    }
}

/// Error reported by the hosting provider, message kept verbatim.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ProviderError { pub code: Option<String>, pub message: String }

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self { Self { code: None, message: message.into() } }
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self { Self { code: Some(code.into()), message: message.into() } }
}

/// The platform reports absence only through the message text, e.g.
/// `Could not find endpoint configuration "..."`.
pub fn message_says_not_found(kind: ResourceKind, err: &ProviderError) -> bool {
    err.message.contains(&format!("Could not find {}", kind.label()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostedModel {
    pub name: String,
    pub image: String,
    pub model_data_url: String,
    pub execution_role_arn: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionVariant {
    pub variant_name: String,
    pub model_name: String,
    pub instance_type: String,
    pub initial_instance_count: u32,
    pub initial_variant_weight: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig { pub name: String, pub variants: Vec<ProductionVariant> }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointStatus {
    OutOfService,
    Creating,
    Updating,
    SystemUpdating,
    RollingBack,
    InService,
    Deleting,
    Failed,
    UpdateRollbackFailed,
    Unknown(String),
}

impl EndpointStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "OutOfService" => Self::OutOfService,
            "Creating" => Self::Creating,
            "Updating" => Self::Updating,
            "SystemUpdating" => Self::SystemUpdating,
            "RollingBack" => Self::RollingBack,
            "InService" => Self::InService,
            "Deleting" => Self::Deleting,
            "Failed" => Self::Failed,
            "UpdateRollbackFailed" => Self::UpdateRollbackFailed,
            other => Self::Unknown(other.to_string()),
        }
    }
    pub fn as_str(&self) -> &str {
        match self {
            Self::OutOfService => "OutOfService",
            Self::Creating => "Creating",
            Self::Updating => "Updating",
            Self::SystemUpdating => "SystemUpdating",
            Self::RollingBack => "RollingBack",
            Self::InService => "InService",
            Self::Deleting => "Deleting",
            Self::Failed => "Failed",
            Self::UpdateRollbackFailed => "UpdateRollbackFailed",
            Self::Unknown(s) => s,
        }
    }
    /// Statuses from which the endpoint will not reach InService on its own.
    pub fn is_terminal_failure(&self) -> bool { matches!(self, Self::Failed | Self::UpdateRollbackFailed | Self::OutOfService | Self::Deleting) }
    pub fn is_transitioning(&self) -> bool { matches!(self, Self::Creating | Self::Updating | Self::SystemUpdating | Self::RollingBack) }
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointDescription {
    pub name: String,
    pub arn: String,
    pub config_name: String,
    pub status: EndpointStatus,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WaitPolicy { pub poll_interval: Duration, pub timeout: Duration }

impl Default for WaitPolicy {
    fn default() -> Self { Self { poll_interval: Duration::from_secs(30), timeout: Duration::from_secs(3600) } }
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("endpoint entered {} state", .0.status)]
    Failed(EndpointDescription),
    #[error("endpoint not InService after {waited:?}")]
    Timeout { last: Option<EndpointDescription>, waited: Duration },
    #[error(transparent)]
    Provider(ProviderError),
}

#[async_trait]
pub trait HostingProvider: Send + Sync {
    async fn describe_model(&self, name: &str) -> Result<HostedModel, ProviderError>;
    async fn create_model(&self, model: &HostedModel) -> Result<(), ProviderError>;
    async fn delete_model(&self, name: &str) -> Result<(), ProviderError>;

    async fn describe_endpoint_config(&self, name: &str) -> Result<EndpointConfig, ProviderError>;
    async fn create_endpoint_config(&self, config: &EndpointConfig) -> Result<(), ProviderError>;
    async fn delete_endpoint_config(&self, name: &str) -> Result<(), ProviderError>;

    async fn describe_endpoint(&self, name: &str) -> Result<EndpointDescription, ProviderError>;
    async fn create_endpoint(&self, name: &str, config_name: &str) -> Result<(), ProviderError>;
    async fn update_endpoint(&self, name: &str, config_name: &str) -> Result<(), ProviderError>;

    /// Classify `err` as "resource does not exist".
    fn is_not_found(&self, kind: ResourceKind, err: &ProviderError) -> bool { message_says_not_found(kind, err) }

    /// Poll `describe_endpoint` at a fixed interval until InService, a
    /// terminal failure, or the policy timeout.
    async fn wait_until_in_service(&self, name: &str, policy: &WaitPolicy) -> Result<EndpointDescription, WaitError> {
        let started = Instant::now();
        loop {
            let desc = self.describe_endpoint(name).await.map_err(WaitError::Provider)?;
            EXTENDED_METRICS.deploy.status_polls_total.inc();
            if desc.status == EndpointStatus::InService { return Ok(desc); }
            if desc.status.is_terminal_failure() { return Err(WaitError::Failed(desc)); }
            debug!(endpoint = name, status = %desc.status, "endpoint_not_ready");
            if started.elapsed() >= policy.timeout { return Err(WaitError::Timeout { last: Some(desc), waited: started.elapsed() }); }
            tokio::time::sleep(policy.poll_interval).await;
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory simulator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct SimEndpoint { arn: String, config_name: String, status: EndpointStatus, failure_reason: Option<String>, polls_remaining: u32 }

#[derive(Debug, Default)]
struct SimState {
    models: BTreeMap<String, HostedModel>,
    configs: BTreeMap<String, EndpointConfig>,
    endpoints: BTreeMap<String, SimEndpoint>,
    calls: Vec<String>,
    faults: HashMap<String, ProviderError>,
    failing_configs: HashMap<String, String>,
}

/// Hosting provider simulator with the platform's naming, error text and
/// endpoint lifecycle. An endpoint that is created or updated stays in
/// `Creating`/`Updating` for `polls_to_settle` describe calls.
#[derive(Debug)]
pub struct MemoryHostingProvider {
    region: String,
    account: String,
    polls_to_settle: u32,
    state: Mutex<SimState>,
}

impl Default for MemoryHostingProvider {
    fn default() -> Self { Self::new("us-east-1") }
}

impl MemoryHostingProvider {
    pub fn new(region: &str) -> Self {
        Self { region: region.to_string(), account: "000000000000".into(), polls_to_settle: 2, state: Mutex::new(SimState::default()) }
    }
    pub fn with_polls_to_settle(mut self, polls: u32) -> Self { self.polls_to_settle = polls; self }

    /// Every subsequent call to `op` (e.g. `"describe_endpoint"`) fails with `err`.
    pub fn inject_fault(&self, op: &str, err: ProviderError) { self.state.lock().faults.insert(op.to_string(), err); }
    pub fn clear_faults(&self) { self.state.lock().faults.clear(); }
    /// Endpoints pointed at `config_name` end up `Failed` with `reason`.
    pub fn fail_config(&self, config_name: &str, reason: &str) { self.state.lock().failing_configs.insert(config_name.to_string(), reason.to_string()); }

    pub fn calls(&self) -> Vec<String> { self.state.lock().calls.clone() }
    pub fn model_names(&self) -> Vec<String> { self.state.lock().models.keys().cloned().collect() }
    pub fn config_names(&self) -> Vec<String> { self.state.lock().configs.keys().cloned().collect() }
    pub fn endpoint_names(&self) -> Vec<String> { self.state.lock().endpoints.keys().cloned().collect() }
    pub fn model(&self, name: &str) -> Option<HostedModel> { self.state.lock().models.get(name).cloned() }
    pub fn config(&self, name: &str) -> Option<EndpointConfig> { self.state.lock().configs.get(name).cloned() }

    fn arn(&self, kind: &str, name: &str) -> String {
        format!("arn:aws:sagemaker:{}:{}:{}/{}", self.region, self.account, kind, name.to_lowercase())
    }

    fn not_found(&self, kind: ResourceKind, arn_kind: &str, name: &str) -> ProviderError {
        ProviderError::with_code("ValidationException", format!("Could not find {} \"{}\".", kind.label(), self.arn(arn_kind, name)))
    }

    fn enter(&self, st: &mut SimState, op: &str, name: &str) -> Result<(), ProviderError> {
        st.calls.push(format!("{op}:{name}"));
        match st.faults.get(op) { Some(err) => Err(err.clone()), None => Ok(()) }
    }

    fn view(name: &str, ep: &SimEndpoint) -> EndpointDescription {
        EndpointDescription { name: name.to_string(), arn: ep.arn.clone(), config_name: ep.config_name.clone(), status: ep.status.clone(), failure_reason: ep.failure_reason.clone() }
    }
}

#[async_trait]
impl HostingProvider for MemoryHostingProvider {
    async fn describe_model(&self, name: &str) -> Result<HostedModel, ProviderError> {
        let mut st = self.state.lock();
        self.enter(&mut st, "describe_model", name)?;
        st.models.get(name).cloned().ok_or_else(|| self.not_found(ResourceKind::Model, "model", name))
    }

    async fn create_model(&self, model: &HostedModel) -> Result<(), ProviderError> {
        let mut st = self.state.lock();
        self.enter(&mut st, "create_model", &model.name)?;
        if st.models.contains_key(&model.name) {
            return Err(ProviderError::with_code("ValidationException", format!("Cannot create already existing model \"{}\".", self.arn("model", &model.name))));
        }
        st.models.insert(model.name.clone(), model.clone());
        Ok(())
    }

    async fn delete_model(&self, name: &str) -> Result<(), ProviderError> {
        let mut st = self.state.lock();
        self.enter(&mut st, "delete_model", name)?;
        st.models.remove(name).map(|_| ()).ok_or_else(|| self.not_found(ResourceKind::Model, "model", name))
    }

    async fn describe_endpoint_config(&self, name: &str) -> Result<EndpointConfig, ProviderError> {
        let mut st = self.state.lock();
        self.enter(&mut st, "describe_endpoint_config", name)?;
        st.configs.get(name).cloned().ok_or_else(|| self.not_found(ResourceKind::EndpointConfig, "endpoint-config", name))
    }

    async fn create_endpoint_config(&self, config: &EndpointConfig) -> Result<(), ProviderError> {
        let mut st = self.state.lock();
        self.enter(&mut st, "create_endpoint_config", &config.name)?;
        if st.configs.contains_key(&config.name) {
            return Err(ProviderError::with_code("ValidationException", format!("Cannot create already existing endpoint configuration \"{}\".", self.arn("endpoint-config", &config.name))));
        }
        if let Some(missing) = config.variants.iter().find(|v| !st.models.contains_key(&v.model_name)) {
            return Err(self.not_found(ResourceKind::Model, "model", &missing.model_name));
        }
        st.configs.insert(config.name.clone(), config.clone());
        Ok(())
    }

    async fn delete_endpoint_config(&self, name: &str) -> Result<(), ProviderError> {
        let mut st = self.state.lock();
        self.enter(&mut st, "delete_endpoint_config", name)?;
        st.configs.remove(name).map(|_| ()).ok_or_else(|| self.not_found(ResourceKind::EndpointConfig, "endpoint-config", name))
    }

    async fn describe_endpoint(&self, name: &str) -> Result<EndpointDescription, ProviderError> {
        let mut st = self.state.lock();
        self.enter(&mut st, "describe_endpoint", name)?;
        let failing = st.failing_configs.clone();
        let ep = st.endpoints.get_mut(name).ok_or_else(|| self.not_found(ResourceKind::Endpoint, "endpoint", name))?;
        if ep.status.is_transitioning() {
            if ep.polls_remaining > 0 { ep.polls_remaining -= 1; }
            if ep.polls_remaining == 0 {
                match failing.get(&ep.config_name) {
                    Some(reason) => { ep.status = EndpointStatus::Failed; ep.failure_reason = Some(reason.clone()); }
                    None => { ep.status = EndpointStatus::InService; ep.failure_reason = None; }
                }
            }
        }
        Ok(Self::view(name, ep))
    }

    async fn create_endpoint(&self, name: &str, config_name: &str) -> Result<(), ProviderError> {
        let mut st = self.state.lock();
        self.enter(&mut st, "create_endpoint", name)?;
        if st.endpoints.contains_key(name) {
            return Err(ProviderError::with_code("ValidationException", format!("Cannot create already existing endpoint \"{}\".", self.arn("endpoint", name))));
        }
        if !st.configs.contains_key(config_name) { return Err(self.not_found(ResourceKind::EndpointConfig, "endpoint-config", config_name)); }
        let ep = SimEndpoint { arn: self.arn("endpoint", name), config_name: config_name.to_string(), status: EndpointStatus::Creating, failure_reason: None, polls_remaining: self.polls_to_settle };
        st.endpoints.insert(name.to_string(), ep);
        Ok(())
    }

    async fn update_endpoint(&self, name: &str, config_name: &str) -> Result<(), ProviderError> {
        let mut st = self.state.lock();
        self.enter(&mut st, "update_endpoint", name)?;
        if !st.configs.contains_key(config_name) { return Err(self.not_found(ResourceKind::EndpointConfig, "endpoint-config", config_name)); }
        let polls = self.polls_to_settle;
        let arn = self.arn("endpoint", name);
        let ep = st.endpoints.get_mut(name).ok_or_else(|| self.not_found(ResourceKind::Endpoint, "endpoint", name))?;
        if ep.status.is_transitioning() {
            return Err(ProviderError::with_code("ValidationException", format!("Cannot update in-progress endpoint \"{arn}\".")));
        }
        ep.config_name = config_name.to_string();
        ep.status = EndpointStatus::Updating;
        ep.failure_reason = None;
        ep.polls_remaining = polls;
        Ok(())
    }
}
