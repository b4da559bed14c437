//! Container image resolution for the managed built-in algorithms.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec { pub framework: String, pub version: String }

impl Default for ImageSpec {
    fn default() -> Self { Self { framework: "xgboost".into(), version: "1.7-1".into() } }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("unsupported framework `{0}`")]
    UnknownFramework(String),
    #[error("framework `{framework}` has no version `{version}`")]
    UnknownVersion { framework: String, version: String },
    #[error("no registry for `{framework}` in region `{region}`")]
    UnknownRegion { framework: String, region: String },
    #[error("instance type `{0}` is not a hosting instance type (expected `ml.*`)")]
    InvalidInstanceType(String),
}

const XGBOOST_VERSIONS: &[&str] = &["1.0-1", "1.2-1", "1.2-2", "1.3-1", "1.5-1", "1.7-1"];

// Per-region registry accounts publishing the xgboost serving image.
static XGBOOST_ACCOUNTS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("us-east-1", "683313688378"),
        ("us-east-2", "257758044811"),
        ("us-west-1", "746614075791"),
        ("us-west-2", "246618743249"),
        ("ap-south-1", "720646828776"),
        ("ap-northeast-1", "354813040037"),
        ("ap-southeast-1", "121021644041"),
        ("ap-southeast-2", "783357654285"),
        ("eu-west-1", "141502667606"),
        ("eu-central-1", "492215442770"),
    ])
});

/// Resolve the serving image URI for `spec` in `region`.
pub fn resolve_image(spec: &ImageSpec, region: &str, instance_type: &str) -> Result<String, ImageError> {
    if !instance_type.starts_with("ml.") || instance_type.len() <= 3 {
        return Err(ImageError::InvalidInstanceType(instance_type.to_string()));
    }
    if spec.framework != "xgboost" { return Err(ImageError::UnknownFramework(spec.framework.clone())); }
    if !XGBOOST_VERSIONS.contains(&spec.version.as_str()) {
        return Err(ImageError::UnknownVersion { framework: spec.framework.clone(), version: spec.version.clone() });
    }
    let account = XGBOOST_ACCOUNTS.get(region).ok_or_else(|| ImageError::UnknownRegion { framework: spec.framework.clone(), region: region.to_string() })?;
    Ok(format!("{account}.dkr.ecr.{region}.amazonaws.com/sagemaker-xgboost:{}", spec.version))
}
