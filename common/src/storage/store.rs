use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{path::Path as ObjPath, ObjectStore};

use crate::error::AppError;
use crate::utils::config::{AppConfig, StorageKind};

pub type DynStore = Arc<dyn ObjectStore>;

/// Artifact store for raw chunked-file text, one object per ingested file.
///
/// Not read by the embedding or retrieval path; it exists for audit and
/// for future re-chunking without re-fetching from the code host.
#[derive(Clone)]
pub struct StorageManager {
    store: DynStore,
    backend_kind: StorageKind,
    local_base: Option<PathBuf>,
}

impl StorageManager {
    pub async fn new(cfg: &AppConfig) -> Result<Self, AppError> {
        let backend_kind = cfg.storage.clone();
        let (store, local_base) = create_storage_backend(cfg).await?;

        Ok(Self {
            store,
            backend_kind,
            local_base,
        })
    }

    /// Inject a specific backend, used by tests.
    pub fn with_backend(store: DynStore, backend_kind: StorageKind) -> Self {
        Self {
            store,
            backend_kind,
            local_base: None,
        }
    }

    pub fn memory() -> Self {
        Self::with_backend(Arc::new(InMemory::new()), StorageKind::Memory)
    }

    pub fn backend_kind(&self) -> &StorageKind {
        &self.backend_kind
    }

    /// Idempotent backend preparation. The local base directory is created
    /// on demand during construction; for S3 the bucket must already exist
    /// (object_store exposes no create-bucket call), so this probes access
    /// and fails early with a readable error instead of mid-run.
    pub async fn ensure_ready(&self) -> Result<(), AppError> {
        match self.backend_kind {
            StorageKind::Local | StorageKind::Memory => Ok(()),
            StorageKind::S3 => {
                let mut listing = self.store.list(None);
                match listing.next().await {
                    None | Some(Ok(_)) => Ok(()),
                    Some(Err(err)) => Err(AppError::from(err)),
                }
            }
        }
    }

    pub async fn put(&self, location: &str, data: Bytes) -> Result<(), AppError> {
        let path = ObjPath::from(location);
        let payload = object_store::PutPayload::from_bytes(data);
        self.store.put(&path, payload).await?;
        Ok(())
    }

    pub async fn get(&self, location: &str) -> Result<Bytes, AppError> {
        let path = ObjPath::from(location);
        let result = self.store.get(&path).await?;
        Ok(result.bytes().await?)
    }

    pub async fn exists(&self, location: &str) -> Result<bool, AppError> {
        let path = ObjPath::from(location);
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(AppError::from(e)),
        }
    }

    /// Delete all objects below the specified prefix.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<(), AppError> {
        let prefix_path = ObjPath::from(prefix);
        let locations = self
            .store
            .list(Some(&prefix_path))
            .map_ok(|m| m.location)
            .boxed();
        self.store
            .delete_stream(locations)
            .try_collect::<Vec<_>>()
            .await?;

        Ok(())
    }

    pub fn local_base_path(&self) -> Option<&std::path::Path> {
        self.local_base.as_deref()
    }
}

/// Deterministic object key for one ingested file.
pub fn artifact_key(
    tenant_id: Option<&str>,
    default_tenant: &str,
    owner: &str,
    repo: &str,
    ref_name: &str,
    path: &str,
) -> String {
    let tenant = match tenant_id {
        Some(t) if !t.is_empty() => t,
        _ => default_tenant,
    };
    let normalized = path.replace('\\', "/");
    let normalized = normalized.trim_start_matches('/');
    format!("tenants/{tenant}/repos/{owner}/{repo}/refs/{ref_name}/files/{normalized}")
}

async fn create_storage_backend(
    cfg: &AppConfig,
) -> Result<(DynStore, Option<PathBuf>), AppError> {
    match cfg.storage {
        StorageKind::Local => {
            let base = PathBuf::from(&cfg.data_dir);
            if !base.exists() {
                tokio::fs::create_dir_all(&base).await?;
            }
            let store = LocalFileSystem::new_with_prefix(base.clone())?;
            Ok((Arc::new(store), Some(base)))
        }
        StorageKind::Memory => {
            let store = InMemory::new();
            Ok((Arc::new(store), None))
        }
        StorageKind::S3 => {
            let bucket = cfg.s3_bucket.as_deref().ok_or_else(|| {
                AppError::Validation("s3_bucket must be configured for the s3 backend".into())
            })?;

            let mut builder = AmazonS3Builder::new()
                .with_bucket_name(bucket)
                .with_region(&cfg.s3_region);

            if let Some(endpoint) = &cfg.s3_endpoint {
                builder = builder
                    .with_endpoint(endpoint)
                    .with_allow_http(endpoint.starts_with("http://"));
            }
            if let (Some(access_key), Some(secret_key)) =
                (&cfg.s3_access_key_id, &cfg.s3_secret_access_key)
            {
                builder = builder
                    .with_access_key_id(access_key)
                    .with_secret_access_key(secret_key);
            }

            let store = builder.build()?;
            Ok((Arc::new(store), None))
        }
    }
}
