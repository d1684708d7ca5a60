use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::{parse_asset_id, AssetKind, AssetStore, StorageError, StoredAsset};

/// Filesystem-backed asset store, one directory per asset kind.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: PathBuf) -> Result<Self, StorageError> {
        if root.as_os_str().is_empty() {
            return Err(StorageError::Backend("storage root is empty".to_string()));
        }
        Ok(Self { root })
    }

    fn data_path(&self, kind: AssetKind, name: &str) -> PathBuf {
        self.root.join(kind.as_str()).join(format!("{name}.bin"))
    }

    fn resolve(&self, id: &str) -> Result<PathBuf, StorageError> {
        let (kind, name) = parse_asset_id(id)?;
        Ok(self.data_path(kind, name))
    }

    async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl AssetStore for LocalStore {
    async fn put(&self, kind: AssetKind, data: &[u8]) -> Result<StoredAsset, StorageError> {
        let name = Uuid::new_v4().to_string();
        let target = self.data_path(kind, &name);
        let temp = target.with_extension("tmp");

        Self::ensure_parent(&target).await?;

        // Write-then-rename so readers never observe a partial asset.
        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(data).await?;
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&temp, &target).await?;

        let asset = StoredAsset {
            id: format!("{}-{}", kind.as_str(), name),
            kind,
            size_bytes: data.len() as u64,
        };
        debug!(asset_id = %asset.id, size_bytes = asset.size_bytes, "asset stored");
        Ok(asset)
    }

    async fn get(&self, id: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(id)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        let path = self.resolve(id)?;
        Ok(tokio::fs::metadata(&path).await.is_ok())
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        let path = self.resolve(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
