//! Namespaced JSON key-value store over object storage.
//!
//! Documents live at `{namespace}/{key}` in an [`ObjectStore`]. A missing key
//! is `Ok(None)`; anything else that goes wrong is a [`StoreError`].

pub mod local;
pub mod memory;
pub mod s3_store;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::{AppConfig, StorageBackend};

pub use self::local::LocalObjectStore;
pub use self::memory::MemoryObjectStore;
pub use self::s3_store::S3ObjectStore;

const JSON_CONTENT_TYPE: &str = "application/json";

/// Raw object storage used by [`KvStore`].
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Writes an object, replacing any existing one.
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StoreError>;

    /// Reads an object. Returns `Ok(None)` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Deletes an object. Deleting a missing object succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Lists full keys starting with `prefix`, in no particular order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// JSON documents scoped to a namespace (a logical table name).
#[derive(Clone)]
pub struct KvStore {
    namespace: String,
    backend: Arc<dyn ObjectStore>,
}

impl KvStore {
    pub fn new(namespace: impl Into<String>, backend: Arc<dyn ObjectStore>) -> Self {
        Self {
            namespace: namespace.into(),
            backend,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn object_key(&self, key: &str) -> String {
        format!("{}/{}", self.namespace, key)
    }

    /// Store `value` as JSON at `key`, overwriting unconditionally. Returns the value.
    pub async fn set<T: Serialize>(&self, key: &str, value: T) -> Result<T, StoreError> {
        let body = serde_json::to_vec_pretty(&value)?;
        self.backend
            .put(&self.object_key(key), &body, JSON_CONTENT_TYPE)
            .await?;
        tracing::trace!(namespace = %self.namespace, key, bytes = body.len(), "Stored document");
        Ok(value)
    }

    /// Load the document at `key`, or `None` if it was never written (or was deleted).
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.backend.get(&self.object_key(key)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.backend.delete(&self.object_key(key)).await
    }

    /// All keys in the namespace, prefix stripped.
    pub async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        let prefix = format!("{}/", self.namespace);
        let keys = self.backend.list(&prefix).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .filter(|k| !k.is_empty())
            .collect())
    }
}

/// Build the object store selected by configuration.
pub fn build_object_store(config: &AppConfig) -> Result<Arc<dyn ObjectStore>, StoreError> {
    match config.storage_backend {
        StorageBackend::Local => Ok(Arc::new(LocalObjectStore::new(&config.storage_dir)?)),
        StorageBackend::S3 => {
            let bucket = config
                .s3_bucket
                .as_deref()
                .ok_or_else(|| StoreError::Config("S3_BUCKET is required for the s3 backend".into()))?;
            let store = S3ObjectStore::new(
                bucket,
                &config.s3_region,
                config.s3_endpoint.as_deref(),
                config.s3_access_key.as_deref(),
                config.s3_secret_key.as_deref(),
            )?;
            Ok(Arc::new(store))
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] ::s3::error::S3Error),

    #[error("S3 request for {key} returned status {status}")]
    Status { key: String, status: u16 },

    #[error("Filesystem operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed JSON document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Storage configuration error: {0}")]
    Config(String),
}
