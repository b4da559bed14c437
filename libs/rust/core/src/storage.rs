//! Object storage capability: `(bucket, key)` addressed blobs.
//!
//! Bundles, inference audit records and load-test reports all go through
//! [`ObjectStore`]. The deploy step reads the same `s3://bucket/key` the
//! packager wrote, so both sides build locations with [`ObjectLocation`].

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object location `{0}`")]
    InvalidLocation(String),
    #[error("bucket `{0}` does not exist")]
    NoSuchBucket(String),
    #[error("object {0} not found")]
    NotFound(ObjectLocation),
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation { pub bucket: String, pub key: String }

pub const BUNDLE_FILE: &str = "model.tar.gz";

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self { Self { bucket: bucket.into(), key: key.into() } }

    /// `models/{model}_{version}/model.tar.gz`, written once per packaging run.
    pub fn versioned_bundle(bucket: impl Into<String>, model_name: &str, version: &str) -> Self {
        Self::new(bucket, format!("models/{model_name}_{version}/{BUNDLE_FILE}"))
    }

    /// `models/{model}/latest/model.tar.gz`, overwritten by every packaging
    /// run and read back by the deployer when no explicit key is configured.
    pub fn latest_bundle(bucket: impl Into<String>, model_name: &str) -> Self {
        Self::new(bucket, format!("models/{model_name}/latest/{BUNDLE_FILE}"))
    }

    /// Sibling object in the same "directory" as this one.
    pub fn sibling(&self, name: &str) -> Self {
        let prefix = self.key.rsplit_once('/').map(|(p, _)| format!("{p}/")).unwrap_or_default();
        Self::new(self.bucket.clone(), format!("{prefix}{name}"))
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "s3://{}/{}", self.bucket, self.key) }
}

impl FromStr for ObjectLocation {
    type Err = StorageError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("s3://").ok_or_else(|| StorageError::InvalidLocation(s.to_string()))?;
        match rest.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok(Self::new(bucket, key)),
            _ => Err(StorageError::InvalidLocation(s.to_string())),
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the bucket when missing. Returns `true` if it was created.
    async fn ensure_bucket(&self, bucket: &str) -> Result<bool, StorageError>;
    async fn put_object(&self, location: &ObjectLocation, body: Vec<u8>, content_type: &str) -> Result<(), StorageError>;
    async fn get_object(&self, location: &ObjectLocation) -> Result<Vec<u8>, StorageError>;

    /// Whether an object is stored at `location`; a missing bucket counts as absent.
    async fn exists(&self, location: &ObjectLocation) -> Result<bool, StorageError> {
        match self.get_object(location).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_) | StorageError::NoSuchBucket(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredObject { body: Vec<u8>, content_type: String }

/// In-process store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: Mutex<HashMap<String, HashMap<String, StoredObject>>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }
    pub fn with_bucket(bucket: &str) -> Self {
        let s = Self::default();
        s.buckets.lock().insert(bucket.to_string(), HashMap::new());
        s
    }
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self.buckets.lock().get(bucket).map(|b| b.keys().cloned().collect()).unwrap_or_default();
        keys.sort();
        keys
    }
    pub fn content_type(&self, location: &ObjectLocation) -> Option<String> {
        self.buckets.lock().get(&location.bucket).and_then(|b| b.get(&location.key)).map(|o| o.content_type.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<bool, StorageError> {
        let mut buckets = self.buckets.lock();
        if buckets.contains_key(bucket) { return Ok(false); }
        buckets.insert(bucket.to_string(), HashMap::new());
        Ok(true)
    }

    async fn put_object(&self, location: &ObjectLocation, body: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.get_mut(&location.bucket).ok_or_else(|| StorageError::NoSuchBucket(location.bucket.clone()))?;
        bucket.insert(location.key.clone(), StoredObject { body, content_type: content_type.to_string() });
        Ok(())
    }

    async fn get_object(&self, location: &ObjectLocation) -> Result<Vec<u8>, StorageError> {
        self.buckets.lock()
            .get(&location.bucket)
            .and_then(|b| b.get(&location.key))
            .map(|o| o.body.clone())
            .ok_or_else(|| StorageError::NotFound(location.clone()))
    }

    async fn exists(&self, location: &ObjectLocation) -> Result<bool, StorageError> {
        Ok(self.buckets.lock().get(&location.bucket).is_some_and(|b| b.contains_key(&location.key)))
    }
}

/// Directory-backed store: `{root}/{bucket}/{key}`.
#[derive(Debug, Clone)]
pub struct LocalStore { root: PathBuf }

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf, StorageError> {
        if bucket.is_empty() || bucket.contains(['/', '\\']) || bucket == "." || bucket == ".." {
            return Err(StorageError::InvalidLocation(bucket.to_string()));
        }
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, location: &ObjectLocation) -> Result<PathBuf, StorageError> {
        let key = Path::new(&location.key);
        if key.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(StorageError::InvalidLocation(location.to_string()));
        }
        Ok(self.bucket_dir(&location.bucket)?.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<bool, StorageError> {
        let dir = self.bucket_dir(bucket)?;
        if tokio::fs::metadata(&dir).await.is_ok() { return Ok(false); }
        tokio::fs::create_dir_all(&dir).await?;
        Ok(true)
    }

    async fn put_object(&self, location: &ObjectLocation, body: Vec<u8>, _content_type: &str) -> Result<(), StorageError> {
        let dir = self.bucket_dir(&location.bucket)?;
        if tokio::fs::metadata(&dir).await.is_err() { return Err(StorageError::NoSuchBucket(location.bucket.clone())); }
        let path = self.object_path(location)?;
        if let Some(parent) = path.parent() { tokio::fs::create_dir_all(parent).await?; }
        tokio::fs::write(&path, body).await?;
        Ok(())
    }

    async fn get_object(&self, location: &ObjectLocation) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(location)?;
        match tokio::fs::read(&path).await {
            Ok(b) => Ok(b),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound(location.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, location: &ObjectLocation) -> Result<bool, StorageError> {
        let path = self.object_path(location)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
