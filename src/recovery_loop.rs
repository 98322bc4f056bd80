//! `RecoveryLoop`: a periodic ticker that finds uploads stuck in a
//! non-terminal state and re-enqueues them from their last checkpoint
//! (spec §4.9), plus the admin-triggered `resume` / `resume_all` operations
//! backing the `POST /uploads/{id}/resume` and `POST /uploads/resume-all`
//! routes.

use crate::app_state::{PipelineState, WORK_STREAM};
use crate::error::{RecoveryError, RegistryError};
use crate::queue::UploadMessage;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct RecoveryLoop {
    state: Arc<PipelineState>,
}

impl RecoveryLoop {
    pub fn new(state: Arc<PipelineState>) -> Self {
        Self { state }
    }

    /// Re-enqueues a single stuck upload from `lastCheckpointLine + 1` (or
    /// line 0 if it never checkpointed), bumping its retry attempt.
    pub async fn resume(&self, upload_id: &str) -> Result<(), RecoveryError> {
        let upload = self
            .state
            .registry
            .get_by_id(upload_id)?
            .ok_or_else(|| RegistryError::NotFound(upload_id.to_string()))?;

        if upload.status.is_terminal() {
            info!("resume requested for terminal upload {upload_id}, nothing to do");
            return Ok(());
        }

        if upload.storage_path.is_empty() {
            warn!("upload {upload_id} has no storage path, marking failed instead of resuming");
            self.state.registry.mark_failed(upload_id, "missing_blob: no storage path to resume from".to_string())?;
            return Ok(());
        }

        let resume_from_line = upload.last_checkpoint_line.map(|l| l + 1).unwrap_or(0);
        let message = UploadMessage {
            upload_id: upload.id.clone(),
            storage_path: upload.storage_path.clone(),
            resume_from_line,
            attempt: upload.retry_count + 1,
        };
        self.state.queue.enqueue(WORK_STREAM, message).await?;
        info!("🔄 resumed upload {upload_id} from line {resume_from_line}");
        Ok(())
    }

    /// Resumes every upload `find_stuck` currently reports. Returns the
    /// number of uploads re-enqueued.
    pub async fn resume_all(&self) -> Result<usize, RecoveryError> {
        let timeout = ChronoDuration::minutes(self.state.config.pipeline.stuck_upload_timeout_minutes);
        let stuck = self.state.registry.find_stuck(timeout)?;
        let mut resumed = 0;
        for upload in &stuck {
            if let Err(e) = self.resume(&upload.id).await {
                warn!("failed to resume stuck upload {}: {e}", upload.id);
                continue;
            }
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Long-running ticker: calls `resume_all` every
    /// `recovery_check_interval_minutes`, exiting when `shutdown` fires.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.state.config.pipeline.recovery_check_interval_minutes * 60);
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.resume_all().await {
                        Ok(0) => {}
                        Ok(n) => info!("🔄 recovery loop resumed {n} stuck upload(s)"),
                        Err(e) => warn!("recovery loop scan failed: {e}"),
                    }
                }
            }
        }
        info!("recovery loop shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::{PipelineState, UPLOAD_BUCKET};
    use crate::domain::UploadStatus;

    fn state() -> Arc<PipelineState> {
        let dir = tempfile::tempdir().unwrap();
        PipelineState::new_test(dir.path().join("registry"))
    }

    #[tokio::test]
    async fn resume_enqueues_from_last_checkpoint() {
        let state = state();
        state.object_store.put(UPLOAD_BUCKET, "blob", b"content").await.unwrap();
        let upload = state.registry.create_pending("f".into(), "h".into(), 10, "blob".into()).unwrap();
        state.registry.update_status(&upload.id, UploadStatus::Processing, None).unwrap();
        state.registry.update_checkpoint(&upload.id, 49, 50, 0, 0).unwrap();

        let recovery = RecoveryLoop::new(state.clone());
        recovery.resume(&upload.id).await.unwrap();

        let delivered = state.queue.consume(WORK_STREAM, "test-group", "c1", 10, Duration::from_millis(0)).await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload.resume_from_line, 50);
        assert_eq!(delivered[0].payload.attempt, 1);
    }

    #[tokio::test]
    async fn resume_is_a_no_op_for_terminal_uploads() {
        let state = state();
        let upload = state.registry.create_failed("f".into(), "h".into(), 10, "boom".into()).unwrap();
        let recovery = RecoveryLoop::new(state.clone());
        recovery.resume(&upload.id).await.unwrap();

        let delivered = state.queue.consume(WORK_STREAM, "test-group", "c1", 10, Duration::from_millis(0)).await.unwrap();
        assert!(delivered.is_empty());
    }

    #[tokio::test]
    async fn resume_skips_and_fails_uploads_with_no_storage_path() {
        let state = state();
        let upload = state.registry.create_pending("f".into(), "h".into(), 10, String::new()).unwrap();
        state.registry.update_status(&upload.id, UploadStatus::Processing, None).unwrap();

        let recovery = RecoveryLoop::new(state.clone());
        recovery.resume(&upload.id).await.unwrap();

        let delivered = state.queue.consume(WORK_STREAM, "test-group", "c1", 10, Duration::from_millis(0)).await.unwrap();
        assert!(delivered.is_empty());

        let reloaded = state.registry.get_by_id(&upload.id).unwrap().unwrap();
        assert_eq!(reloaded.status, UploadStatus::Failed);
    }

    #[tokio::test]
    async fn resume_all_picks_up_every_stuck_upload() {
        let state = state();
        for i in 0..3 {
            let upload = state
                .registry
                .create_pending(format!("f{i}"), format!("h{i}"), 10, "blob".into())
                .unwrap();
            state.registry.update_status(&upload.id, UploadStatus::Processing, None).unwrap();
        }
        let recovery = RecoveryLoop::new(state.clone());
        let resumed = recovery.resume_all().await.unwrap();
        assert_eq!(resumed, 3);
    }
}
