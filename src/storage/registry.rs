//! `UploadRegistry`: persistent tracking of `FileUpload` rows and per-line
//! hash rows, implementing the upload state machine and checkpoint updates
//! (spec §4.4). Built over `sled`, following the teacher's
//! `storage/transaction_log.rs`: one tree per logical table, a content-hash
//! index tree for deduplication, and monotonic state transitions enforced
//! in Rust rather than left to the caller.
//!
//! ## Trees
//!
//! - `file_uploads`: id -> `FileUpload` (JSON)
//! - `file_hash_index`: fileHash -> id, populated only for non-Duplicate
//!   rows, enforcing "fileHash unique among non-Duplicate rows" (spec §3).
//! - `line_hashes`: lineHash -> `FileUploadLineHash` (JSON)
//! - `transactions`: idempotencyKey -> `Transaction` (JSON); sled's key
//!   uniqueness gives us "idempotencyKey is globally unique" for free.
//! - `cpf_index`: cpf\0idempotencyKey -> () — ordered range scan per CPF,
//!   satisfying spec §3's "index on cpf" for query-side use.

use crate::domain::{FileUpload, Transaction, UploadStatus};
use crate::error::{RegistryError, RegistryResult};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};

/// A staged, not-yet-committed line hash (spec §4.4: `recordLineHash` is
/// staged; `commitLineHashes` flushes the batch transactionally).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileUploadLineHash {
    pub file_upload_id: String,
    pub line_hash: String,
    pub line_content: String,
}

pub struct UploadRegistry {
    db: sled::Db,
    file_uploads: sled::Tree,
    file_hash_index: sled::Tree,
    line_hashes: sled::Tree,
    transactions: sled::Tree,
    cpf_index: sled::Tree,
    staged_line_hashes: Mutex<Vec<FileUploadLineHash>>,
}

impl UploadRegistry {
    pub fn new<P: AsRef<Path>>(path: P) -> RegistryResult<Self> {
        let db = sled::Config::new()
            .path(path)
            .flush_every_ms(Some(100))
            .cache_capacity(64 * 1024 * 1024)
            .mode(sled::Mode::HighThroughput)
            .open()?;

        let file_uploads = db.open_tree("file_uploads")?;
        let file_hash_index = db.open_tree("file_hash_index")?;
        let line_hashes = db.open_tree("line_hashes")?;
        let transactions = db.open_tree("transactions")?;
        let cpf_index = db.open_tree("cpf_index")?;

        Ok(Self {
            db,
            file_uploads,
            file_hash_index,
            line_hashes,
            transactions,
            cpf_index,
            staged_line_hashes: Mutex::new(Vec::new()),
        })
    }

    pub async fn close(&self) -> RegistryResult<()> {
        info!("flushing upload registry to disk");
        self.db.flush_async().await?;
        Ok(())
    }

    // ----- FileUpload lifecycle -----

    /// Returns `(true, None)` if no non-Duplicate row has this hash, else
    /// `(false, Some(existing))`.
    pub fn is_file_unique(&self, file_hash: &str) -> RegistryResult<(bool, Option<FileUpload>)> {
        match self.file_hash_index.get(file_hash.as_bytes())? {
            Some(id_bytes) => {
                let id = String::from_utf8_lossy(&id_bytes).into_owned();
                let existing = self.get_by_id(&id)?;
                Ok((false, existing))
            }
            None => Ok((true, None)),
        }
    }

    pub fn create_pending(
        &self,
        file_name: String,
        file_hash: String,
        file_size: u64,
        storage_path: String,
    ) -> RegistryResult<FileUpload> {
        let upload = FileUpload {
            id: uuid::Uuid::new_v4().to_string(),
            file_name,
            file_hash: file_hash.clone(),
            file_size,
            storage_path,
            status: UploadStatus::Pending,
            total_line_count: None,
            processed_line_count: 0,
            failed_line_count: 0,
            skipped_line_count: 0,
            last_checkpoint_line: None,
            last_checkpoint_at: None,
            processing_started_at: None,
            processing_completed_at: None,
            uploaded_at: Utc::now(),
            retry_count: 0,
            error_message: None,
        };
        self.put_upload(&upload)?;
        self.file_hash_index.insert(file_hash.as_bytes(), upload.id.as_bytes())?;
        Ok(upload)
    }

    /// Used when the pipeline refuses an upload after persisting enough
    /// metadata to audit (spec §4.4).
    pub fn create_failed(
        &self,
        file_name: String,
        file_hash: String,
        file_size: u64,
        error_message: String,
    ) -> RegistryResult<FileUpload> {
        let now = Utc::now();
        let upload = FileUpload {
            id: uuid::Uuid::new_v4().to_string(),
            file_name,
            file_hash: file_hash.clone(),
            file_size,
            storage_path: String::new(),
            status: UploadStatus::Failed,
            total_line_count: None,
            processed_line_count: 0,
            failed_line_count: 0,
            skipped_line_count: 0,
            last_checkpoint_line: None,
            last_checkpoint_at: None,
            processing_started_at: None,
            processing_completed_at: Some(now),
            uploaded_at: now,
            retry_count: 0,
            error_message: Some(error_message),
        };
        self.put_upload(&upload)?;
        self.file_hash_index.insert(file_hash.as_bytes(), upload.id.as_bytes())?;
        Ok(upload)
    }

    pub fn set_total_line_count(&self, id: &str, n: u64) -> RegistryResult<()> {
        let mut upload = self.get_by_id(id)?.ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        upload.total_line_count = Some(n);
        self.put_upload(&upload)
    }

    pub fn update_status(&self, id: &str, new_status: UploadStatus, retry_count: Option<u32>) -> RegistryResult<()> {
        let mut upload = self.get_by_id(id)?.ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if !valid_transition(upload.status, new_status) {
            return Err(RegistryError::InvalidTransition {
                from: upload.status.to_string(),
                to: new_status.to_string(),
            });
        }
        if upload.status == UploadStatus::Pending && new_status == UploadStatus::Processing {
            upload.processing_started_at.get_or_insert(Utc::now());
        }
        upload.status = new_status;
        if let Some(rc) = retry_count {
            upload.retry_count = rc;
        }
        if new_status.is_terminal() {
            upload.processing_completed_at = Some(Utc::now());
        }
        self.put_upload(&upload)
    }

    /// Monotonic: refuses to move `last_checkpoint_line` backward.
    pub fn update_checkpoint(
        &self,
        id: &str,
        last_checkpoint_line: u64,
        processed: u64,
        failed: u64,
        skipped: u64,
    ) -> RegistryResult<()> {
        let mut upload = self.get_by_id(id)?.ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if let Some(current) = upload.last_checkpoint_line {
            if last_checkpoint_line < current {
                return Err(RegistryError::NonMonotonicCheckpoint { current, attempted: last_checkpoint_line });
            }
        }
        upload.last_checkpoint_line = Some(last_checkpoint_line);
        upload.last_checkpoint_at = Some(Utc::now());
        upload.processed_line_count = processed;
        upload.failed_line_count = failed;
        upload.skipped_line_count = skipped;
        self.put_upload(&upload)
    }

    /// Stages a line hash for the next `commit_line_hashes` flush.
    pub fn record_line_hash(&self, file_upload_id: &str, line_hash: &str, line_content: &str) {
        self.staged_line_hashes.lock().unwrap().push(FileUploadLineHash {
            file_upload_id: file_upload_id.to_string(),
            line_hash: line_hash.to_string(),
            line_content: line_content.to_string(),
        });
    }

    /// Transactional flush of staged hashes: one atomic batch write.
    pub fn commit_line_hashes(&self) -> RegistryResult<usize> {
        let staged = std::mem::take(&mut *self.staged_line_hashes.lock().unwrap());
        if staged.is_empty() {
            return Ok(0);
        }
        let mut batch = sled::Batch::default();
        for entry in &staged {
            let bytes = serde_json::to_vec(entry)?;
            batch.insert(entry.line_hash.as_bytes(), bytes);
        }
        let count = staged.len();
        self.line_hashes.apply_batch(batch)?;
        Ok(count)
    }

    /// Checks both the committed tree and anything staged-but-not-yet-
    /// flushed in this process, so a resumed run in the same engine
    /// instance sees its own in-flight work.
    pub fn is_line_unique(&self, line_hash: &str) -> RegistryResult<bool> {
        if self.line_hashes.contains_key(line_hash.as_bytes())? {
            return Ok(false);
        }
        let staged = self.staged_line_hashes.lock().unwrap();
        Ok(!staged.iter().any(|h| h.line_hash == line_hash))
    }

    /// Resolves the terminal (or still-in-progress) status per spec §4.4's
    /// `finaliseResult` rules.
    pub fn finalise_result(&self, id: &str, processed: u64, failed: u64, skipped: u64) -> RegistryResult<UploadStatus> {
        let mut upload = self.get_by_id(id)?.ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let total = upload.total_line_count.unwrap_or(0);
        let sigma = processed + failed + skipped;

        upload.processed_line_count = processed;
        upload.failed_line_count = failed;
        upload.skipped_line_count = skipped;

        let new_status = if sigma < total {
            UploadStatus::Processing
        } else if failed == 0 {
            UploadStatus::Success
        } else {
            UploadStatus::PartiallyCompleted
        };

        if sigma >= total && total > 0 {
            upload.last_checkpoint_line = Some(sigma.saturating_sub(1));
            upload.last_checkpoint_at = Some(Utc::now());
        }

        if new_status != upload.status {
            if !valid_transition(upload.status, new_status) && new_status != UploadStatus::Processing {
                return Err(RegistryError::InvalidTransition {
                    from: upload.status.to_string(),
                    to: new_status.to_string(),
                });
            }
            upload.status = new_status;
        }
        if new_status.is_terminal() {
            upload.processing_completed_at = Some(Utc::now());
        }
        self.put_upload(&upload)?;
        Ok(new_status)
    }

    /// Uploads in non-terminal state whose last checkpoint (or, absent
    /// that, their `processing_started_at`) is older than `timeout`.
    pub fn find_stuck(&self, timeout: Duration) -> RegistryResult<Vec<FileUpload>> {
        let cutoff = Utc::now() - timeout;
        let mut stuck = Vec::new();
        for item in self.file_uploads.iter() {
            let (_, bytes) = item?;
            let upload: FileUpload = serde_json::from_slice(&bytes)?;
            if upload.status.is_terminal() {
                continue;
            }
            let progress_at = upload.last_checkpoint_at.or(upload.processing_started_at).unwrap_or(upload.uploaded_at);
            if progress_at < cutoff {
                stuck.push(upload);
            }
        }
        Ok(stuck)
    }

    pub fn get_by_id(&self, id: &str) -> RegistryResult<Option<FileUpload>> {
        match self.file_uploads.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list(&self, page: usize, page_size: usize, status: Option<UploadStatus>) -> RegistryResult<Vec<FileUpload>> {
        let mut all: Vec<FileUpload> = Vec::new();
        for item in self.file_uploads.iter() {
            let (_, bytes) = item?;
            let upload: FileUpload = serde_json::from_slice(&bytes)?;
            if status.map(|s| s == upload.status).unwrap_or(true) {
                all.push(upload);
            }
        }
        all.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        let start = page.saturating_mul(page_size).min(all.len());
        let end = (start + page_size).min(all.len());
        Ok(all[start..end].to_vec())
    }

    /// Uploads currently in `Pending` or `Processing` — the `GET
    /// /uploads/incomplete` view (spec §5 external interfaces).
    pub fn list_incomplete(&self, page: usize, page_size: usize) -> RegistryResult<Vec<FileUpload>> {
        let mut all: Vec<FileUpload> = Vec::new();
        for item in self.file_uploads.iter() {
            let (_, bytes) = item?;
            let upload: FileUpload = serde_json::from_slice(&bytes)?;
            if !upload.status.is_terminal() {
                all.push(upload);
            }
        }
        all.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at));
        let start = page.saturating_mul(page_size).min(all.len());
        let end = (start + page_size).min(all.len());
        Ok(all[start..end].to_vec())
    }

    // ----- Transactions -----

    /// Inserts a `Transaction`. Returns `false` (no-op) if the
    /// `idempotencyKey` already exists — the caller should treat this as a
    /// `Skipped` outcome (spec §4.8.1).
    pub fn insert_transaction(&self, transaction: &Transaction) -> RegistryResult<bool> {
        let key = transaction.idempotency_key.as_bytes();
        if self.transactions.contains_key(key)? {
            return Ok(false);
        }
        let bytes = serde_json::to_vec(transaction)?;
        let inserted = self
            .transactions
            .compare_and_swap(key, None as Option<&[u8]>, Some(bytes))?
            .is_ok();
        if inserted {
            let index_key = format!("{}\0{}", transaction.record.cpf, transaction.idempotency_key);
            self.cpf_index.insert(index_key.as_bytes(), &[])?;
        }
        Ok(inserted)
    }

    /// Query-side helper: all transactions recorded for a CPF, in
    /// insertion order. Not exposed over HTTP (query endpoints are out of
    /// scope) but exercises the `cpf_index` tree the data model requires.
    pub fn transactions_by_cpf(&self, cpf: &str) -> RegistryResult<Vec<Transaction>> {
        let prefix = format!("{cpf}\0");
        let mut results = Vec::new();
        for item in self.cpf_index.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            let key_str = String::from_utf8_lossy(&key);
            let idempotency_key = key_str.split('\0').nth(1).unwrap_or_default();
            if let Some(bytes) = self.transactions.get(idempotency_key.as_bytes())? {
                results.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(results)
    }

    /// Forces a terminal `Failed` status with a reason, used when
    /// processing hits a non-recoverable error outside the normal
    /// `finaliseResult` accounting (spec §4.8 step 10).
    pub fn mark_failed(&self, id: &str, error_message: String) -> RegistryResult<()> {
        let mut upload = self.get_by_id(id)?.ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if upload.status != UploadStatus::Failed {
            if !valid_transition(upload.status, UploadStatus::Failed) {
                return Err(RegistryError::InvalidTransition {
                    from: upload.status.to_string(),
                    to: UploadStatus::Failed.to_string(),
                });
            }
            upload.status = UploadStatus::Failed;
            upload.processing_completed_at = Some(Utc::now());
        }
        upload.error_message = Some(error_message);
        self.put_upload(&upload)
    }

    /// Admin "clear all data": cascade-deletes everything.
    pub fn clear_all(&self) -> RegistryResult<()> {
        self.file_uploads.clear()?;
        self.file_hash_index.clear()?;
        self.line_hashes.clear()?;
        self.transactions.clear()?;
        self.cpf_index.clear()?;
        warn!("all ingestion data cleared by admin operation");
        Ok(())
    }

    fn put_upload(&self, upload: &FileUpload) -> RegistryResult<()> {
        let bytes = serde_json::to_vec(upload)?;
        self.file_uploads.insert(upload.id.as_bytes(), bytes)?;
        Ok(())
    }
}

fn valid_transition(from: UploadStatus, to: UploadStatus) -> bool {
    use UploadStatus::*;
    matches!(
        (from, to),
        (Pending, Processing)
            | (Processing, Processing)
            | (Processing, Success)
            | (Processing, PartiallyCompleted)
            | (Processing, Failed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Cents, DayTime, TransactionRecord, TransactionType};

    fn open() -> (UploadRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = UploadRegistry::new(dir.path()).unwrap();
        (registry, dir)
    }

    fn sample_record(cpf: &str) -> TransactionRecord {
        TransactionRecord {
            transaction_type: TransactionType::Debit,
            transaction_date: chrono::NaiveDate::from_ymd_opt(2019, 3, 1).unwrap(),
            transaction_time: DayTime::from_hms(15, 34, 53),
            amount: Cents(14200),
            cpf: cpf.to_string(),
            card: "1234****7890".to_string(),
            store_owner: "JOAO MACEDO".to_string(),
            store_name: "BAR DO JOAO".to_string(),
            bank_code: TransactionType::Debit,
        }
    }

    #[test]
    fn duplicate_file_hash_is_detected() {
        let (registry, _dir) = open();
        let upload = registry.create_pending("f1".into(), "hash-a".into(), 100, "path".into()).unwrap();
        let (unique, existing) = registry.is_file_unique("hash-a").unwrap();
        assert!(!unique);
        assert_eq!(existing.unwrap().id, upload.id);

        let (unique, existing) = registry.is_file_unique("hash-b").unwrap();
        assert!(unique);
        assert!(existing.is_none());
    }

    #[test]
    fn status_transitions_follow_the_state_machine() {
        let (registry, _dir) = open();
        let upload = registry.create_pending("f1".into(), "hash-a".into(), 100, "path".into()).unwrap();

        registry.update_status(&upload.id, UploadStatus::Processing, Some(0)).unwrap();
        let reloaded = registry.get_by_id(&upload.id).unwrap().unwrap();
        assert_eq!(reloaded.status, UploadStatus::Processing);
        assert!(reloaded.processing_started_at.is_some());

        // Pending -> Success directly is not a legal transition.
        let upload2 = registry.create_pending("f2".into(), "hash-c".into(), 100, "path".into()).unwrap();
        let err = registry.update_status(&upload2.id, UploadStatus::Success, None).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
    }

    #[test]
    fn checkpoint_refuses_to_move_backward() {
        let (registry, _dir) = open();
        let upload = registry.create_pending("f1".into(), "hash-a".into(), 100, "path".into()).unwrap();
        registry.update_status(&upload.id, UploadStatus::Processing, None).unwrap();

        registry.update_checkpoint(&upload.id, 50, 51, 0, 0).unwrap();
        let err = registry.update_checkpoint(&upload.id, 10, 11, 0, 0).unwrap_err();
        assert!(matches!(err, RegistryError::NonMonotonicCheckpoint { .. }));

        registry.update_checkpoint(&upload.id, 60, 61, 0, 0).unwrap();
        let reloaded = registry.get_by_id(&upload.id).unwrap().unwrap();
        assert_eq!(reloaded.last_checkpoint_line, Some(60));
    }

    #[test]
    fn finalise_result_picks_success_partial_or_keeps_processing() {
        let (registry, _dir) = open();

        let u1 = registry.create_pending("f1".into(), "h1".into(), 100, "p".into()).unwrap();
        registry.set_total_line_count(&u1.id, 3).unwrap();
        registry.update_status(&u1.id, UploadStatus::Processing, None).unwrap();
        let status = registry.finalise_result(&u1.id, 3, 0, 0).unwrap();
        assert_eq!(status, UploadStatus::Success);
        let reloaded = registry.get_by_id(&u1.id).unwrap().unwrap();
        assert_eq!(reloaded.last_checkpoint_line, Some(2));

        let u2 = registry.create_pending("f2".into(), "h2".into(), 100, "p".into()).unwrap();
        registry.set_total_line_count(&u2.id, 5).unwrap();
        registry.update_status(&u2.id, UploadStatus::Processing, None).unwrap();
        let status = registry.finalise_result(&u2.id, 4, 1, 0).unwrap();
        assert_eq!(status, UploadStatus::PartiallyCompleted);

        let u3 = registry.create_pending("f3".into(), "h3".into(), 100, "p".into()).unwrap();
        registry.set_total_line_count(&u3.id, 10).unwrap();
        registry.update_status(&u3.id, UploadStatus::Processing, None).unwrap();
        let status = registry.finalise_result(&u3.id, 4, 0, 0).unwrap();
        assert_eq!(status, UploadStatus::Processing);
    }

    #[test]
    fn line_hash_staging_and_commit() {
        let (registry, _dir) = open();
        assert!(registry.is_line_unique("abc").unwrap());
        registry.record_line_hash("upload-1", "abc", "raw line");
        // Staged but not yet committed: still observed as non-unique in
        // this process, so a resumed run doesn't reprocess it.
        assert!(!registry.is_line_unique("abc").unwrap());

        let flushed = registry.commit_line_hashes().unwrap();
        assert_eq!(flushed, 1);
        assert!(!registry.is_line_unique("abc").unwrap());
    }

    #[test]
    fn transaction_idempotency_key_is_unique() {
        let (registry, _dir) = open();
        let tx = Transaction {
            idempotency_key: "key-1".into(),
            file_upload_id: Some("u1".into()),
            record: sample_record("09620676017"),
        };
        assert!(registry.insert_transaction(&tx).unwrap());
        assert!(!registry.insert_transaction(&tx).unwrap());
    }

    #[test]
    fn transactions_by_cpf_returns_balance_inputs() {
        let (registry, _dir) = open();
        for (i, (cpf, code)) in [("c1", TransactionType::Debit), ("c1", TransactionType::Boleto), ("c2", TransactionType::Credit)]
            .into_iter()
            .enumerate()
        {
            let mut record = sample_record(cpf);
            record.transaction_type = code;
            record.bank_code = code;
            let tx = Transaction {
                idempotency_key: format!("key-{i}"),
                file_upload_id: Some("u1".into()),
                record,
            };
            registry.insert_transaction(&tx).unwrap();
        }
        let c1_txs = registry.transactions_by_cpf("c1").unwrap();
        assert_eq!(c1_txs.len(), 2);
        let c2_txs = registry.transactions_by_cpf("c2").unwrap();
        assert_eq!(c2_txs.len(), 1);
    }

    #[test]
    fn find_stuck_reports_old_non_terminal_uploads() {
        let (registry, _dir) = open();
        let upload = registry.create_pending("f1".into(), "h1".into(), 100, "p".into()).unwrap();
        registry.update_status(&upload.id, UploadStatus::Processing, None).unwrap();

        let stuck = registry.find_stuck(Duration::seconds(0)).unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, upload.id);

        let not_stuck = registry.find_stuck(Duration::hours(1)).unwrap();
        assert!(not_stuck.is_empty());
    }

    #[test]
    fn clear_all_wipes_every_tree() {
        let (registry, _dir) = open();
        registry.create_pending("f1".into(), "h1".into(), 100, "p".into()).unwrap();
        let tx = Transaction {
            idempotency_key: "k1".into(),
            file_upload_id: Some("u1".into()),
            record: sample_record("c1"),
        };
        registry.insert_transaction(&tx).unwrap();

        registry.clear_all().unwrap();
        assert!(registry.list(0, 10, None).unwrap().is_empty());
        assert!(registry.transactions_by_cpf("c1").unwrap().is_empty());
    }

    #[test]
    fn list_incomplete_excludes_terminal_uploads() {
        let (registry, _dir) = open();
        let pending = registry.create_pending("f1".into(), "h1".into(), 10, "p".into()).unwrap();
        let done = registry.create_pending("f2".into(), "h2".into(), 10, "p".into()).unwrap();
        registry.update_status(&done.id, UploadStatus::Processing, None).unwrap();
        registry.set_total_line_count(&done.id, 1).unwrap();
        registry.finalise_result(&done.id, 1, 0, 0).unwrap();

        let incomplete = registry.list_incomplete(0, 100).unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].id, pending.id);
    }

    #[test]
    fn list_pages_and_filters_by_status() {
        let (registry, _dir) = open();
        for i in 0..5 {
            registry.create_pending(format!("f{i}"), format!("h{i}"), 10, "p".into()).unwrap();
        }
        let page1 = registry.list(0, 2, None).unwrap();
        assert_eq!(page1.len(), 2);
        let all_pending = registry.list(0, 100, Some(UploadStatus::Pending)).unwrap();
        assert_eq!(all_pending.len(), 5);
        let all_success = registry.list(0, 100, Some(UploadStatus::Success)).unwrap();
        assert!(all_success.is_empty());
    }
}
