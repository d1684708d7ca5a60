//! Asset storage for Portray nodes
//!
//! Uploaded inputs (portrait images, speech audio) and rendered outputs
//! (matted frames, synthesized videos) are stored as opaque assets behind
//! a pluggable backend trait. The default backend keeps assets on the
//! local filesystem under a per-kind directory.

mod local;
mod metrics;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use local::LocalStore;
pub use metrics::StorageMetrics;

/// Opaque asset identifier, `<kind>-<uuid>`.
pub type AssetId = String;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid asset id: {0}")]
    InvalidAssetId(String),

    #[error("Asset not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// What an asset is, which decides its directory and serving content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    /// Uploaded portrait image
    Image,
    /// Uploaded speech audio
    Audio,
    /// Background-removed frame from the matting stage
    Matte,
    /// Rendered output video
    Video,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Image => "image",
            AssetKind::Audio => "audio",
            AssetKind::Matte => "matte",
            AssetKind::Video => "video",
        }
    }

    /// Content type used when the asset is served over HTTP.
    pub fn content_type(&self) -> &'static str {
        match self {
            AssetKind::Image | AssetKind::Audio => "application/octet-stream",
            AssetKind::Matte => "image/png",
            AssetKind::Video => "video/mp4",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "image" => Some(AssetKind::Image),
            "audio" => Some(AssetKind::Audio),
            "matte" => Some(AssetKind::Matte),
            "video" => Some(AssetKind::Video),
            _ => None,
        }
    }
}

/// Handle to a stored asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAsset {
    pub id: AssetId,
    pub kind: AssetKind,
    pub size_bytes: u64,
}

/// Split an asset id into its kind and name parts.
///
/// Rejects ids that could escape the storage root.
pub fn parse_asset_id(id: &str) -> Result<(AssetKind, &str), StorageError> {
    let (kind, name) = id
        .split_once('-')
        .ok_or_else(|| StorageError::InvalidAssetId(id.to_string()))?;
    let kind = AssetKind::parse(kind).ok_or_else(|| StorageError::InvalidAssetId(id.to_string()))?;
    if name.trim().is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
    {
        return Err(StorageError::InvalidAssetId(id.to_string()));
    }
    Ok((kind, name))
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Persist a new asset, returning its handle.
    async fn put(&self, kind: AssetKind, data: &[u8]) -> Result<StoredAsset, StorageError>;
    /// Read an asset's bytes.
    async fn get(&self, id: &str) -> Result<Vec<u8>, StorageError>;
    /// Whether the asset exists.
    async fn exists(&self, id: &str) -> Result<bool, StorageError>;
    /// Remove an asset. Removing a missing asset is not an error.
    async fn delete(&self, id: &str) -> Result<(), StorageError>;
}

/// Backend-agnostic entry point with optional metrics.
#[derive(Clone)]
pub struct StorageManager {
    backend: Arc<dyn AssetStore>,
    metrics: Option<Arc<StorageMetrics>>,
}

impl StorageManager {
    pub fn new(backend: Arc<dyn AssetStore>) -> Self {
        Self {
            backend,
            metrics: None,
        }
    }

    pub fn with_metrics(backend: Arc<dyn AssetStore>, metrics: Arc<StorageMetrics>) -> Self {
        Self {
            backend,
            metrics: Some(metrics),
        }
    }

    /// Local-filesystem store rooted at `root`.
    pub fn local(root: std::path::PathBuf) -> Result<Self, StorageError> {
        Ok(Self::new(Arc::new(LocalStore::new(root)?)))
    }

    pub async fn put(&self, kind: AssetKind, data: &[u8]) -> Result<StoredAsset, StorageError> {
        let _timer = self
            .metrics
            .as_ref()
            .map(|metrics| metrics.operation_duration_seconds.start_timer());
        let result = self.backend.put(kind, data).await;
        self.record_metric("put", result.is_err());
        if result.is_ok() {
            if let Some(metrics) = &self.metrics {
                metrics.bytes_stored_total.inc_by(data.len() as u64);
            }
        }
        result
    }

    pub async fn get(&self, id: &str) -> Result<Vec<u8>, StorageError> {
        let _timer = self
            .metrics
            .as_ref()
            .map(|metrics| metrics.operation_duration_seconds.start_timer());
        let result = self.backend.get(id).await;
        self.record_metric("get", result.is_err());
        result
    }

    pub async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        let result = self.backend.exists(id).await;
        self.record_metric("exists", result.is_err());
        result
    }

    pub async fn delete(&self, id: &str) -> Result<(), StorageError> {
        let result = self.backend.delete(id).await;
        self.record_metric("delete", result.is_err());
        result
    }

    fn record_metric(&self, operation: &str, failed: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.operations_total.with_label_values(&[operation]).inc();
            if failed {
                metrics
                    .operations_failed_total
                    .with_label_values(&[operation])
                    .inc();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let temp_dir = TempDir::new().expect("temp dir");
        let storage = StorageManager::local(temp_dir.path().to_path_buf()).expect("storage");

        let asset = storage
            .put(AssetKind::Image, b"portrait-bytes")
            .await
            .expect("put");
        assert_eq!(asset.kind, AssetKind::Image);
        assert_eq!(asset.size_bytes, 14);
        assert!(asset.id.starts_with("image-"));

        let fetched = storage.get(&asset.id).await.expect("get");
        assert_eq!(fetched, b"portrait-bytes");
        assert!(storage.exists(&asset.id).await.expect("exists"));
    }

    #[tokio::test]
    async fn test_delete_and_missing() {
        let temp_dir = TempDir::new().expect("temp dir");
        let storage = StorageManager::local(temp_dir.path().to_path_buf()).expect("storage");

        let asset = storage.put(AssetKind::Audio, b"wav").await.expect("put");
        storage.delete(&asset.id).await.expect("delete");
        assert!(!storage.exists(&asset.id).await.expect("exists"));

        let result = storage.get(&asset.id).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));

        // Deleting an already-deleted asset is fine.
        storage.delete(&asset.id).await.expect("delete again");
    }

    #[test]
    fn test_parse_asset_id() {
        let (kind, name) = parse_asset_id("video-6a1f").expect("parse");
        assert_eq!(kind, AssetKind::Video);
        assert_eq!(name, "6a1f");

        assert!(parse_asset_id("novdash").is_err());
        assert!(parse_asset_id("unknown-6a1f").is_err());
        assert!(parse_asset_id("image-../../etc/passwd").is_err());
        assert!(parse_asset_id("image-a/b").is_err());
        assert!(parse_asset_id("image-").is_err());
    }

    #[tokio::test]
    async fn test_metrics_recorded_on_put() {
        let temp_dir = TempDir::new().expect("temp dir");
        let registry = Registry::new();
        let metrics = Arc::new(StorageMetrics::new(&registry).expect("metrics"));
        let storage = StorageManager::with_metrics(
            Arc::new(LocalStore::new(temp_dir.path().to_path_buf()).expect("store")),
            metrics.clone(),
        );

        storage.put(AssetKind::Video, b"mp4!").await.expect("put");

        assert_eq!(metrics.operations_total.with_label_values(&["put"]).get(), 1);
        assert_eq!(metrics.bytes_stored_total.get(), 4);
    }
}
