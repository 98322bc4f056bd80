//! `ObjectStore`: the durable blob store external contract (spec §4.3).
//! Only the contract is specified by the source system — this module
//! provides a filesystem-backed implementation (the production default) and
//! an in-memory fake for tests, following the teacher's "express external
//! collaborators as interfaces with in-memory fakes" guidance.

use crate::error::ObjectStoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncSeek};
use tracing::{info, warn};

/// A blob readable and seekable back to the start — needed so
/// `hasher::hash_stream` and the engine's count-then-process scan can both
/// work over the same handle.
pub trait SeekableRead: AsyncRead + AsyncSeek + Unpin + Send + std::fmt::Debug {}
impl<T: AsyncRead + AsyncSeek + Unpin + Send + std::fmt::Debug> SeekableRead for T {}

pub type BoxedBlob = Box<dyn SeekableRead>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Durable write; returns only once the blob is persisted.
    async fn put(&self, bucket: &str, key: &str, content: &[u8]) -> Result<(), ObjectStoreError>;

    /// Streaming, seekable read.
    async fn get(&self, bucket: &str, key: &str) -> Result<BoxedBlob, ObjectStoreError>;

    /// Idempotent delete — deleting a missing object is not an error.
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError>;

    /// Create `bucket` if it doesn't exist. Called asynchronously during
    /// startup; must not block the caller and must not prevent the service
    /// from starting if the backing store is unreachable (spec §4.3, §7).
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), ObjectStoreError>;
}

/// Production default: one file per `(bucket, key)` under a root directory.
pub struct FilesystemObjectStore {
    root: PathBuf,
}

impl FilesystemObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }
}

#[async_trait]
impl ObjectStore for FilesystemObjectStore {
    async fn put(&self, bucket: &str, key: &str, content: &[u8]) -> Result<(), ObjectStoreError> {
        let dir = self.root.join(bucket);
        tokio::fs::create_dir_all(&dir).await?;
        let path = self.path(bucket, key);
        tokio::fs::write(&path, content).await?;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<BoxedBlob, ObjectStoreError> {
        let path = self.path(bucket, key);
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ObjectStoreError::NotFound { bucket: bucket.to_string(), key: key.to_string() }
            } else {
                ObjectStoreError::Io(e)
            }
        })?;
        Ok(Box::new(file))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        let path = self.path(bucket, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ObjectStoreError::Io(e)),
        }
    }

    async fn ensure_bucket(&self, bucket: &str) -> Result<(), ObjectStoreError> {
        let dir = self.root.join(bucket);
        match tokio::fs::create_dir_all(&dir).await {
            Ok(()) => {
                info!("bucket ready: {bucket}");
                Ok(())
            }
            Err(e) => {
                warn!("could not create bucket {bucket}, continuing in degraded mode: {e}");
                Err(ObjectStoreError::Io(e))
            }
        }
    }
}

/// Spawns `ensure_bucket` as a detached background task so a slow or
/// unreachable object store never delays service startup (spec §4.3).
pub fn bootstrap_bucket_async(store: std::sync::Arc<dyn ObjectStore>, bucket: &'static str) {
    tokio::spawn(async move {
        if let Err(e) = store.ensure_bucket(bucket).await {
            warn!("bucket bootstrap for {bucket} failed, service continues: {e}");
        }
    });
}

/// In-memory fake for unit and integration tests.
#[derive(Default)]
pub struct InMemoryObjectStore {
    blobs: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, bucket: &str, key: &str, content: &[u8]) -> Result<(), ObjectStoreError> {
        self.blobs
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), content.to_vec());
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<BoxedBlob, ObjectStoreError> {
        let blobs = self.blobs.lock().unwrap();
        match blobs.get(&(bucket.to_string(), key.to_string())) {
            Some(bytes) => Ok(Box::new(std::io::Cursor::new(bytes.clone()))),
            None => Err(ObjectStoreError::NotFound { bucket: bucket.to_string(), key: key.to_string() }),
        }
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        self.blobs.lock().unwrap().remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn ensure_bucket(&self, _bucket: &str) -> Result<(), ObjectStoreError> {
        Ok(())
    }
}
