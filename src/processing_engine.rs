//! `ProcessingEngine`: the heart of the system (spec §4.8). Consumes queue
//! messages, acquires the per-upload distributed lock, streams the blob,
//! drives `Parser` + line persistence with checkpointing, and routes
//! failures to retry or the DLQ. `LineWorker` (§4.8.1) is the per-line
//! unit of work dispatched through a bounded concurrency pool.

use crate::app_state::{PipelineState, CONSUMER_GROUP, DLQ_STREAM, UPLOAD_BUCKET, WORK_STREAM};
use crate::domain::{FileUpload, LineOutcome, Transaction, UploadStatus};
use crate::error::{ObjectStoreError, ProcessingError};
use crate::hasher;
use crate::lock::{upload_lock_name, Lease};
use crate::parser;
use crate::queue::{Delivery, UploadMessage};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

/// Net effect of one pass over a blob, starting from `resume_from_line`.
/// Counts are absolute (baseline + delta) except the `new_*`/`considered`
/// fields, which cover only lines processed in this pass and drive the
/// "structurally unparseable" check (spec §7 `unprocessable_entity`).
struct ProcessOutcome {
    processed: u64,
    failed: u64,
    skipped: u64,
    considered: u64,
    new_processed: u64,
    new_failed: u64,
    new_skipped: u64,
}

fn split_lines(content: &[u8]) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    let mut start = 0usize;
    for i in 0..content.len() {
        if content[i] == b'\n' {
            let mut end = i;
            if end > start && content[end - 1] == b'\r' {
                end -= 1;
            }
            lines.push(content[start..end].to_vec());
            start = i + 1;
        }
    }
    if start < content.len() {
        lines.push(content[start..].to_vec());
    }
    lines
}

async fn process_line(
    state: Arc<PipelineState>,
    upload_id: String,
    index: u64,
    line: Vec<u8>,
) -> LineOutcome {
    let line_hash = hasher::hash_line(&line);

    match state.registry.is_line_unique(&line_hash) {
        Ok(true) => {}
        Ok(false) => return LineOutcome::Skipped,
        Err(e) => {
            warn!("registry error checking line uniqueness at {index}: {e}");
            return LineOutcome::Failed;
        }
    }

    let record = match parser::parse_line(&line, index) {
        Ok(r) => r,
        Err(e) => {
            debug!("line {index} failed to parse: {e}");
            return LineOutcome::Failed;
        }
    };

    let transaction = Transaction {
        idempotency_key: line_hash.clone(),
        file_upload_id: Some(upload_id.clone()),
        record,
    };

    let max_retry = state.config.pipeline.max_retry_per_line;
    let retry_delay = Duration::from_millis(state.config.pipeline.retry_delay_ms);
    let mut attempt = 0u32;
    loop {
        match state.registry.insert_transaction(&transaction) {
            Ok(true) => {
                state.registry.record_line_hash(&upload_id, &line_hash, &String::from_utf8_lossy(&line));
                return LineOutcome::Processed;
            }
            // Another worker won the idempotency-key race: this is the
            // same outcome as if our own uniqueness check had failed.
            Ok(false) => return LineOutcome::Skipped,
            Err(e) => {
                attempt += 1;
                if attempt >= max_retry {
                    warn!("line {index} permanently failed after {attempt} attempts: {e}");
                    return LineOutcome::Failed;
                }
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}

/// Extends the per-upload lease alongside a checkpoint flush (spec §4.8
/// step 7). A failed renewal is logged but not fatal to the current pass:
/// the worst case is a second replica racing in on the next delivery, which
/// is safe because every write downstream is idempotent on its hash.
async fn renew_lease(state: &Arc<PipelineState>, lease: Option<&Lease>) {
    let Some(lease) = lease else { return };
    let ttl = Duration::from_secs(state.config.pipeline.processing_ttl_secs);
    if let Err(e) = state.lock.renew(lease, ttl).await {
        warn!("failed to renew lease {}: {e}", lease.name);
    }
}

/// Scans the blob once to determine `total_line_count`, then streams lines
/// through a bounded pool of `LineWorker`s in file order (spec §4.8 steps
/// 5-8). Checkpoints every `checkpoint_interval` newly-considered lines.
async fn process_upload_content(
    state: &Arc<PipelineState>,
    upload: &FileUpload,
    resume_from_line: u64,
    lease: Option<&Lease>,
) -> Result<ProcessOutcome, ProcessingError> {
    let mut blob = state
        .object_store
        .get(UPLOAD_BUCKET, &upload.storage_path)
        .await
        .map_err(|e| match e {
            ObjectStoreError::NotFound { .. } => ProcessingError::MissingBlob(upload.id.clone()),
            ObjectStoreError::Io(io) => ProcessingError::TransientStorage(io.to_string()),
        })?;

    let mut content = Vec::new();
    blob.read_to_end(&mut content)
        .await
        .map_err(|e| ProcessingError::TransientStorage(e.to_string()))?;

    let lines = split_lines(&content);
    let total = lines.len() as u64;
    state
        .registry
        .set_total_line_count(&upload.id, total)
        .map_err(|e| ProcessingError::TransientStorage(e.to_string()))?;

    let parallel_workers = state.config.pipeline.parallel_workers.max(1);
    let results = futures_util::stream::iter(lines.into_iter().enumerate().map(|(idx, line)| {
        let idx = idx as u64;
        let state = state.clone();
        let upload_id = upload.id.clone();
        async move {
            if idx < resume_from_line {
                (idx, None)
            } else {
                (idx, Some(process_line(state, upload_id, idx, line).await))
            }
        }
    }))
    .buffered(parallel_workers);
    tokio::pin!(results);

    let mut processed = upload.processed_line_count;
    let mut failed = upload.failed_line_count;
    let mut skipped = upload.skipped_line_count;
    let (mut new_processed, mut new_failed, mut new_skipped) = (0u64, 0u64, 0u64);
    let mut since_checkpoint = 0u64;
    let mut last_index: Option<u64> = None;

    while let Some((idx, outcome)) = results.next().await {
        last_index = Some(idx);
        if let Some(outcome) = outcome {
            match outcome {
                LineOutcome::Processed => {
                    processed += 1;
                    new_processed += 1;
                }
                LineOutcome::Failed => {
                    failed += 1;
                    new_failed += 1;
                }
                LineOutcome::Skipped => {
                    skipped += 1;
                    new_skipped += 1;
                }
            }
            since_checkpoint += 1;
            if since_checkpoint >= state.config.pipeline.checkpoint_interval {
                state
                    .registry
                    .commit_line_hashes()
                    .map_err(|e| ProcessingError::TransientStorage(e.to_string()))?;
                state
                    .registry
                    .update_checkpoint(&upload.id, idx, processed, failed, skipped)
                    .map_err(|e| ProcessingError::TransientStorage(e.to_string()))?;
                renew_lease(state, lease).await;
                since_checkpoint = 0;
            }
        }
    }

    state
        .registry
        .commit_line_hashes()
        .map_err(|e| ProcessingError::TransientStorage(e.to_string()))?;
    if let Some(idx) = last_index {
        state
            .registry
            .update_checkpoint(&upload.id, idx, processed, failed, skipped)
            .map_err(|e| ProcessingError::TransientStorage(e.to_string()))?;
        renew_lease(state, lease).await;
    }

    Ok(ProcessOutcome {
        processed,
        failed,
        skipped,
        considered: new_processed + new_failed + new_skipped,
        new_processed,
        new_failed,
        new_skipped,
    })
}

pub struct ProcessingEngine {
    state: Arc<PipelineState>,
}

impl ProcessingEngine {
    pub fn new(state: Arc<PipelineState>) -> Self {
        Self { state }
    }

    /// Processes an upload end to end without going through the queue or
    /// lock — used by `IngestionFront`'s synchronous strategy (spec §4.7
    /// step 11, §7 "processes in-memory and writes Success directly").
    pub async fn process_inline(&self, upload_id: &str) -> Result<(u64, UploadStatus), ProcessingError> {
        let message = UploadMessage {
            upload_id: upload_id.to_string(),
            storage_path: String::new(),
            resume_from_line: 0,
            attempt: 0,
        };
        let status = self.process_message(&message, None).await?;
        let upload = self
            .state
            .registry
            .get_by_id(upload_id)
            .ok()
            .flatten()
            .ok_or_else(|| ProcessingError::Unprocessable(upload_id.to_string()))?;
        Ok((upload.processed_line_count, status))
    }

    /// Pulls one batch from the queue and processes each delivery. Returns
    /// the number of deliveries handled, so the caller's run loop can back
    /// off when the queue is empty.
    pub async fn run_once(&self, consumer_id: &str) -> usize {
        let cfg = &self.state.config.pipeline;
        let deliveries = self
            .state
            .queue
            .consume(WORK_STREAM, CONSUMER_GROUP, consumer_id, cfg.parallel_workers, Duration::from_secs(2))
            .await
            .unwrap_or_default();
        let n = deliveries.len();
        for delivery in deliveries {
            self.process_delivery(delivery).await;
        }
        n
    }

    /// Long-running consumer loop; exits when `shutdown` is signalled
    /// (spec §5 graceful shutdown).
    pub async fn run(&self, consumer_id: &str, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                n = self.run_once(consumer_id) => {
                    if n == 0 {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        }
        info!("processing engine consumer {consumer_id} shut down");
    }

    async fn process_delivery(&self, delivery: Delivery) {
        let message = delivery.payload;
        let name = upload_lock_name(&message.upload_id);
        let ttl = Duration::from_secs(self.state.config.pipeline.processing_ttl_secs);

        let Some(lease) = self.state.lock.acquire(&name, ttl).await else {
            debug!("lock contended for {}, leaving for pending reclaim", message.upload_id);
            return;
        };

        let outcome = self.process_message(&message, Some(&lease)).await;
        self.finish_delivery(&delivery.message_id, &message, outcome, &lease).await;
        let _ = self.state.lock.release(&lease).await;
    }

    async fn finish_delivery(
        &self,
        message_id: &str,
        message: &UploadMessage,
        outcome: Result<UploadStatus, ProcessingError>,
        _lease: &Lease,
    ) {
        let max_retries = self.state.config.pipeline.max_retries;
        match outcome {
            Ok(_status) => {
                let _ = self.state.queue.ack(WORK_STREAM, CONSUMER_GROUP, message_id).await;
            }
            Err(e) if e.is_recoverable() && message.attempt < max_retries => {
                warn!("transient failure on upload {}: {e}, will retry", message.upload_id);
                let _ = self.state.registry.update_status(&message.upload_id, UploadStatus::Processing, Some(message.attempt + 1));

                let resume_from_line = self
                    .state
                    .registry
                    .get_by_id(&message.upload_id)
                    .ok()
                    .flatten()
                    .and_then(|u| u.last_checkpoint_line)
                    .map(|l| l + 1)
                    .unwrap_or(message.resume_from_line);
                let retry_message = UploadMessage {
                    upload_id: message.upload_id.clone(),
                    storage_path: message.storage_path.clone(),
                    resume_from_line,
                    attempt: message.attempt + 1,
                };
                // Re-enqueue a fresh delivery from the last checkpoint and ack
                // the original: this stream has no broker-side pending-reclaim
                // loop, so explicit re-enqueue is this deployment's retry path
                // (spec §4.8 step 9).
                if self.state.queue.enqueue(WORK_STREAM, retry_message).await.is_err() {
                    warn!("failed to re-enqueue retry for upload {}, leaving original unacked", message.upload_id);
                    return;
                }
                let _ = self.state.queue.ack(WORK_STREAM, CONSUMER_GROUP, message_id).await;
            }
            Err(e) => {
                error!("upload {} failed permanently: {e}", message.upload_id);
                let _ = self.state.registry.mark_failed(&message.upload_id, format!("{}: {e}", e.kind()));
                let _ = self
                    .state
                    .queue
                    .enqueue_dead(
                        DLQ_STREAM,
                        serde_json::json!({
                            "uploadId": message.upload_id,
                            "reason": e.kind(),
                            "attempts": message.attempt,
                        }),
                    )
                    .await;
                let _ = self.state.queue.ack(WORK_STREAM, CONSUMER_GROUP, message_id).await;
            }
        }
    }

    async fn process_message(&self, message: &UploadMessage, lease: Option<&Lease>) -> Result<UploadStatus, ProcessingError> {
        let upload = self
            .state
            .registry
            .get_by_id(&message.upload_id)
            .map_err(|e| ProcessingError::TransientStorage(e.to_string()))?;
        let Some(upload) = upload else {
            debug!("upload {} not found, treating delivery as stale", message.upload_id);
            return Ok(UploadStatus::Failed);
        };
        if upload.status.is_terminal() {
            debug!("upload {} already terminal ({:?}), skipping", upload.id, upload.status);
            return Ok(upload.status);
        }

        self.state
            .registry
            .update_status(&upload.id, UploadStatus::Processing, Some(message.attempt))
            .map_err(|e| ProcessingError::TransientStorage(e.to_string()))?;

        if upload.storage_path.is_empty() {
            return Err(ProcessingError::MissingBlob(upload.id.clone()));
        }

        let outcome = process_upload_content(&self.state, &upload, message.resume_from_line, lease).await?;

        if outcome.considered > 0 && outcome.new_processed == 0 && outcome.new_skipped == 0 && outcome.new_failed == outcome.considered {
            return Err(ProcessingError::Unprocessable(format!(
                "all {} lines in upload {} failed to parse",
                outcome.considered, upload.id
            )));
        }

        let status = self
            .state
            .registry
            .finalise_result(&upload.id, outcome.processed, outcome.failed, outcome.skipped)
            .map_err(|e| ProcessingError::TransientStorage(e.to_string()))?;

        info!(
            "✅ upload {} reached {:?}: processed={} failed={} skipped={}",
            upload.id, status, outcome.processed, outcome.failed, outcome.skipped
        );
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::PipelineState;
    use crate::storage::ObjectStore;

    fn cnab_line(type_code: u8, cpf: &str, amount: &str) -> String {
        format!(
            "{}{}{}{}{}{}{:<14}{:<18}",
            type_code as char,
            "20190301",
            amount,
            cpf,
            "1234****7890",
            "153453",
            "JOAO MACEDO",
            "BAR DO JOAO"
        )
    }

    fn state() -> Arc<PipelineState> {
        let dir = tempfile::tempdir().unwrap();
        PipelineState::new_test(dir.path().join("registry"))
    }

    async fn seed_upload(state: &Arc<PipelineState>, content: &str) -> FileUpload {
        let hash = hasher::hash_file(content.as_bytes());
        state.object_store.put(UPLOAD_BUCKET, "blob-1", content.as_bytes()).await.unwrap();
        state
            .registry
            .create_pending("20190301120000".into(), hash, content.len() as u64, "blob-1".into())
            .unwrap()
    }

    #[tokio::test]
    async fn happy_path_three_lines_reaches_success() {
        let state = state();
        let content = format!(
            "{}\n{}\n{}\n",
            cnab_line(b'1', "09620676017", "0000014200"),
            cnab_line(b'2', "09620676017", "0000005000"),
            cnab_line(b'4', "09620676017", "0000010000"),
        );
        let upload = seed_upload(&state, &content).await;

        let engine = ProcessingEngine::new(state.clone());
        let (count, status) = engine.process_inline(&upload.id).await.unwrap();
        assert_eq!(status, UploadStatus::Success);
        assert_eq!(count, 3);

        let txs = state.registry.transactions_by_cpf("09620676017").unwrap();
        assert_eq!(txs.len(), 3);
    }

    #[tokio::test]
    async fn partial_failure_yields_partially_completed() {
        let state = state();
        let content = format!(
            "{}\n{}\n{}\n{}\n{}\n",
            cnab_line(b'1', "09620676017", "0000014200"),
            cnab_line(b'2', "09620676017", "0000005000"),
            cnab_line(b'X', "09620676017", "0000010000"), // invalid type
            cnab_line(b'4', "09620676017", "0000010000"),
            cnab_line(b'6', "09620676017", "0000010000"),
        );
        let upload = seed_upload(&state, &content).await;

        let engine = ProcessingEngine::new(state.clone());
        let message = UploadMessage { upload_id: upload.id.clone(), storage_path: upload.storage_path.clone(), resume_from_line: 0, attempt: 0 };
        let status = engine.process_message(&message, None).await.unwrap();
        assert_eq!(status, UploadStatus::PartiallyCompleted);

        let reloaded = state.registry.get_by_id(&upload.id).unwrap().unwrap();
        assert_eq!(reloaded.processed_line_count, 4);
        assert_eq!(reloaded.failed_line_count, 1);
    }

    #[tokio::test]
    async fn resuming_from_checkpoint_does_not_duplicate_transactions() {
        let state = state();
        let mut content = String::new();
        for i in 0..20 {
            content.push_str(&cnab_line(b'1', "09620676017", &format!("{:010}", i)));
            content.push('\n');
        }
        let upload = seed_upload(&state, &content).await;

        let engine = ProcessingEngine::new(state.clone());
        let message = UploadMessage { upload_id: upload.id.clone(), storage_path: upload.storage_path.clone(), resume_from_line: 10, attempt: 1 };
        // Mark as if the first 10 lines were already processed by a prior
        // attempt (simulating a crash-and-resume).
        state.registry.update_status(&upload.id, UploadStatus::Processing, None).unwrap();
        state.registry.update_checkpoint(&upload.id, 9, 10, 0, 0).unwrap();

        let status = engine.process_message(&message, None).await.unwrap();
        assert_eq!(status, UploadStatus::Success);

        let reloaded = state.registry.get_by_id(&upload.id).unwrap().unwrap();
        assert_eq!(reloaded.processed_line_count, 20);
    }

    #[tokio::test]
    async fn missing_blob_is_reported_as_missing_blob() {
        let state = state();
        let upload = state
            .registry
            .create_pending("f".into(), "h".into(), 10, "does-not-exist".into())
            .unwrap();
        let engine = ProcessingEngine::new(state.clone());
        let err = engine.process_inline(&upload.id).await.unwrap_err();
        assert_eq!(err.kind(), "missing_blob");
    }

    #[tokio::test]
    async fn empty_storage_path_is_missing_blob() {
        let state = state();
        let upload = state
            .registry
            .create_pending("f".into(), "h".into(), 10, String::new())
            .unwrap();
        let engine = ProcessingEngine::new(state.clone());
        let err = engine.process_inline(&upload.id).await.unwrap_err();
        assert_eq!(err.kind(), "missing_blob");
    }

    #[tokio::test]
    async fn all_lines_failing_to_parse_is_unprocessable() {
        let state = state();
        let content = "garbage\nmore garbage\n".to_string();
        let upload = seed_upload(&state, &content).await;
        let engine = ProcessingEngine::new(state.clone());
        let err = engine.process_inline(&upload.id).await.unwrap_err();
        assert_eq!(err.kind(), "unprocessable_entity");
    }

    #[tokio::test]
    async fn processing_same_line_twice_is_idempotent() {
        let state = state();
        let content = format!("{}\n", cnab_line(b'1', "09620676017", "0000014200"));
        let upload_a = seed_upload(&state, &content).await;
        let engine = ProcessingEngine::new(state.clone());
        engine.process_inline(&upload_a.id).await.unwrap();

        // A second, distinct upload containing the identical line: the
        // line-level idempotency key is global, so it's skipped, not
        // duplicated, even though it's a different FileUpload.
        state.object_store.put(UPLOAD_BUCKET, "blob-2", content.as_bytes()).await.unwrap();
        let upload_b = state
            .registry
            .create_pending("f2".into(), "different-file-hash".into(), content.len() as u64, "blob-2".into())
            .unwrap();
        let (_count, status) = engine.process_inline(&upload_b.id).await.unwrap();
        assert_eq!(status, UploadStatus::Success);

        let reloaded = state.registry.get_by_id(&upload_b.id).unwrap().unwrap();
        assert_eq!(reloaded.skipped_line_count, 1);
        assert_eq!(reloaded.processed_line_count, 0);

        let txs = state.registry.transactions_by_cpf("09620676017").unwrap();
        assert_eq!(txs.len(), 1);
    }
}
