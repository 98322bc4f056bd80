//! Composition root. Wires every component by hand, exactly as the teacher's
//! `AppState` does: no DI framework, no reflection, just a struct built once
//! at startup and threaded through as `Arc<PipelineState>`.

use crate::config::Config;
use crate::lock::{DistributedLock, InMemoryLock};
use crate::queue::{InMemoryQueue, WorkQueue};
use crate::storage::{FilesystemObjectStore, InMemoryObjectStore, ObjectStore, UploadRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub const UPLOAD_BUCKET: &str = "cnab-uploads";
pub const WORK_STREAM: &str = "cnab:upload:queue";
pub const DLQ_STREAM: &str = "cnab:upload:dlq";
pub const CONSUMER_GROUP: &str = "processing-engine";

/// Central state shared by `IngestionFront`, `ProcessingEngine`, and
/// `RecoveryLoop`.
pub struct PipelineState {
    pub config: Config,
    pub registry: Arc<UploadRegistry>,
    pub object_store: Arc<dyn ObjectStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub lock: Arc<dyn DistributedLock>,
    /// When true, `IngestionFront` drives `ProcessingEngine` inline instead
    /// of enqueuing (spec §4.7 step 11 — the "test profile" / synchronous
    /// strategy).
    pub synchronous: bool,
}

impl PipelineState {
    /// Production wiring: sled-backed registry, filesystem object store
    /// with non-blocking bucket bootstrap, in-memory queue/lock (a real
    /// deployment would point these at Redis/etcd; the trait boundary is
    /// the same either way).
    pub async fn new_production(config: Config) -> Result<Arc<Self>, Box<dyn std::error::Error + Send + Sync>> {
        let data_dir = PathBuf::from(&config.storage.data_dir);
        std::fs::create_dir_all(&data_dir)?;
        let registry = Arc::new(UploadRegistry::new(data_dir.join("registry"))?);

        let object_store: Arc<dyn ObjectStore> =
            Arc::new(FilesystemObjectStore::new(PathBuf::from(&config.storage.object_store_dir)));
        crate::storage::object_store::bootstrap_bucket_async(object_store.clone(), UPLOAD_BUCKET);

        let queue: Arc<dyn WorkQueue> = Arc::new(InMemoryQueue::new());
        let lock: Arc<dyn DistributedLock> = Arc::new(InMemoryLock::new());

        info!("pipeline state initialized, data_dir={:?}", data_dir);

        Ok(Arc::new(Self { config, registry, object_store, queue, lock, synchronous: false }))
    }

    /// Test wiring: everything in-memory, synchronous processing so a
    /// single upload call observes its final result without a background
    /// consumer loop.
    pub fn new_test(data_dir: impl Into<PathBuf>) -> Arc<Self> {
        let data_dir = data_dir.into();
        let registry = Arc::new(UploadRegistry::new(&data_dir).expect("open test registry"));
        let object_store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let queue: Arc<dyn WorkQueue> = Arc::new(InMemoryQueue::new());
        let lock: Arc<dyn DistributedLock> = Arc::new(InMemoryLock::new());
        Arc::new(Self { config: Config::default(), registry, object_store, queue, lock, synchronous: true })
    }

    pub async fn cleanup_and_save(&self) {
        if let Err(e) = self.registry.close().await {
            tracing::error!("failed to flush upload registry: {e}");
        } else {
            info!("upload registry flushed");
        }
    }
}
