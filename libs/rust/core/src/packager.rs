//! Artifact packager: wraps a serialized model into `model.tar.gz` and
//! uploads it (plus an optional metrics document) under a versioned key,
//! refreshing the stable `latest` key the deployer reads by default.

use flate2::{write::GzEncoder, Compression};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument};

use crate::storage::{ObjectLocation, ObjectStore, StorageError};

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("model file {0} not found")]
    ModelMissing(PathBuf),
    #[error("invalid archive entry name `{0}`")]
    InvalidEntryName(String),
    #[error("bundle io: {0}")]
    Io(#[from] std::io::Error),
    #[error("metrics document: {0}")]
    Metrics(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Gzip-compressed tar with a single entry `arcname` (mode 0644).
pub fn build_bundle(model: &[u8], arcname: &str) -> Result<Vec<u8>, PackageError> {
    if arcname.is_empty() || arcname.contains("..") || arcname.starts_with('/') {
        return Err(PackageError::InvalidEntryName(arcname.to_string()));
    }
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(model.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    builder.append_data(&mut header, arcname, model)?;
    Ok(builder.into_inner()?.finish()?)
}

#[derive(Debug, Clone)]
pub struct PackageRequest {
    pub model_path: PathBuf,
    pub model_name: String,
    pub archive_name: String,
    pub metrics: Option<Value>,
    /// Defaults to the current UTC time as `YYYYmmddHHMMSS`.
    pub version: Option<String>,
}

impl PackageRequest {
    pub fn new(model_path: impl Into<PathBuf>, model_name: impl Into<String>) -> Self {
        let model_name = model_name.into();
        Self { model_path: model_path.into(), archive_name: model_name.clone(), model_name, metrics: None, version: None }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PackagedArtifact {
    pub bundle: ObjectLocation,
    /// Stable copy of `bundle` that the deployer resolves by default.
    pub latest: ObjectLocation,
    pub metrics: Option<ObjectLocation>,
    pub version: String,
    pub sha256: String,
    pub size_bytes: usize,
}

pub struct ArtifactPackager {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl ArtifactPackager {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self { Self { store, bucket: bucket.into() } }

    #[instrument(skip(self, req), fields(model = %req.model_name, bucket = %self.bucket))]
    pub async fn package(&self, req: &PackageRequest) -> Result<PackagedArtifact, PackageError> {
        let model = read_model(&req.model_path).await?;
        let bundle = build_bundle(&model, &req.archive_name)?;
        let sha256 = hex::encode(Sha256::digest(&bundle));
        let size_bytes = bundle.len();
        let version = req.version.clone().unwrap_or_else(|| chrono::Utc::now().format("%Y%m%d%H%M%S").to_string());

        if self.store.ensure_bucket(&self.bucket).await? {
            info!(bucket = %self.bucket, "created bucket");
        }
        let bundle_loc = ObjectLocation::versioned_bundle(self.bucket.clone(), &req.model_name, &version);
        self.store.put_object(&bundle_loc, bundle.clone(), "application/gzip").await?;
        info!(location = %bundle_loc, size_bytes, %sha256, "uploaded model bundle");
        let latest = ObjectLocation::latest_bundle(self.bucket.clone(), &req.model_name);
        self.store.put_object(&latest, bundle, "application/gzip").await?;
        info!(location = %latest, "updated latest bundle");

        let metrics = match &req.metrics {
            Some(doc) => {
                let loc = bundle_loc.sibling("metrics.json");
                self.store.put_object(&loc, serde_json::to_vec_pretty(doc)?, "application/json").await?;
                info!(location = %loc, "uploaded metrics");
                Some(loc)
            }
            None => None,
        };
        Ok(PackagedArtifact { bundle: bundle_loc, latest, metrics, version, sha256, size_bytes })
    }
}

async fn read_model(path: &Path) -> Result<Vec<u8>, PackageError> {
    match tokio::fs::read(path).await {
        Ok(b) => Ok(b),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PackageError::ModelMissing(path.to_path_buf())),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn unpack(bundle: &[u8]) -> Vec<(String, u32, Vec<u8>)> {
        let mut archive = tar::Archive::new(GzDecoder::new(bundle));
        archive.entries().unwrap().map(|e| {
            let mut e = e.unwrap();
            let name = e.path().unwrap().to_string_lossy().into_owned();
            let mode = e.header().mode().unwrap();
            let mut body = Vec::new();
            e.read_to_end(&mut body).unwrap();
            (name, mode, body)
        }).collect()
    }

    #[test]
    fn bundle_has_single_named_entry() {
        let bundle = build_bundle(b"booster-bytes", "xgboostmodel").unwrap();
        let entries = unpack(&bundle);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "xgboostmodel");
        assert_eq!(entries[0].1, 0o644);
        assert_eq!(entries[0].2, b"booster-bytes");
        assert!(matches!(build_bundle(b"x", "../evil"), Err(PackageError::InvalidEntryName(_))));
    }

    #[tokio::test]
    async fn uploads_versioned_bundle_and_metrics() {
        let dir = std::env::temp_dir().join(format!("mlops-pkg-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let model_path = dir.join("xgboostmodel");
        tokio::fs::write(&model_path, b"model").await.unwrap();

        let store = Arc::new(MemoryStore::new());
        let packager = ArtifactPackager::new(store.clone(), "artifacts");
        let mut req = PackageRequest::new(&model_path, "xgboostmodel");
        req.version = Some("20240101120000".into());
        req.metrics = Some(serde_json::json!({"accuracy": 0.91}));
        let out = packager.package(&req).await.unwrap();

        assert_eq!(out.bundle.to_string(), "s3://artifacts/models/xgboostmodel_20240101120000/model.tar.gz");
        assert_eq!(out.metrics.as_ref().map(|m| m.key.as_str()), Some("models/xgboostmodel_20240101120000/metrics.json"));
        assert_eq!(store.content_type(&out.bundle).as_deref(), Some("application/gzip"));
        let stored = store.get_object(&out.bundle).await.unwrap();
        assert_eq!(stored.len(), out.size_bytes);
        assert_eq!(hex::encode(Sha256::digest(&stored)), out.sha256);
        assert_eq!(out.latest.key, "models/xgboostmodel/latest/model.tar.gz");
        assert_eq!(store.get_object(&out.latest).await.unwrap(), stored);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn missing_model_uploads_nothing() {
        let store = Arc::new(MemoryStore::new());
        let packager = ArtifactPackager::new(store.clone(), "artifacts");
        let req = PackageRequest::new("/definitely/not/here/model.bin", "m");
        assert!(matches!(packager.package(&req).await, Err(PackageError::ModelMissing(_))));
        assert!(store.keys("artifacts").is_empty());
    }
}
