use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{path::Path as ObjPath, ObjectStore, PutMode, PutOptions, PutPayload};
use thiserror::Error;
use uuid::Uuid;

pub type DynStore = Arc<dyn ObjectStore>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageKind {
    Local,
    Memory,
}

impl StorageKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "local" | "fs" | "filesystem" => Some(Self::Local),
            "memory" | "mem" => Some(Self::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("blob `{key}` not found")]
    NotFound { key: String },
    #[error("blob `{key}` already exists")]
    AlreadyExists { key: String },
    #[error("object store error: {0}")]
    Backend(#[from] object_store::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Blob store key of the original upload for a job.
pub fn image_key(id: Uuid) -> String {
    format!("images/{id}")
}

/// Blob store key of the produced model for a job.
pub fn model_key(id: Uuid) -> String {
    format!("models/{id}.glb")
}

/// Key-addressed binary storage for uploads and produced models.
///
/// Writes are create-only: a key, once written, is never replaced.
#[derive(Clone)]
pub struct BlobStore {
    store: DynStore,
    local_base: Option<PathBuf>,
}

impl BlobStore {
    pub async fn open(kind: &StorageKind, local_dir: &Path) -> Result<Self, StorageError> {
        match kind {
            StorageKind::Local => {
                if !local_dir.exists() {
                    tokio::fs::create_dir_all(local_dir).await?;
                }
                let base = local_dir.canonicalize()?;
                let store = LocalFileSystem::new_with_prefix(&base)?;
                Ok(Self {
                    store: Arc::new(store),
                    local_base: Some(base),
                })
            }
            StorageKind::Memory => Ok(Self::in_memory()),
        }
    }

    pub fn in_memory() -> Self {
        Self::with_backend(Arc::new(InMemory::new()))
    }

    /// Wrap an arbitrary object store, e.g. a failure-injecting one in tests.
    pub fn with_backend(store: DynStore) -> Self {
        Self {
            store,
            local_base: None,
        }
    }

    pub fn local_base_path(&self) -> Option<&Path> {
        self.local_base.as_deref()
    }

    pub async fn put_new(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        let path = ObjPath::from(key);
        let payload = PutPayload::from_bytes(data);
        let opts = PutOptions::from(PutMode::Create);

        match self.store.put_opts(&path, payload, opts).await {
            Ok(_) => Ok(()),
            Err(object_store::Error::AlreadyExists { .. }) => Err(StorageError::AlreadyExists {
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = ObjPath::from(key);
        let result = match self.store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(StorageError::NotFound {
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        Ok(result.bytes().await?)
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = ObjPath::from(key);
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
