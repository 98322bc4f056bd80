//! Error taxonomy for the ingestion pipeline. One `thiserror` enum per
//! module boundary, mirroring the teacher's `error.rs` / `storage/
//! transaction_log.rs` pattern: lower-level errors convert into higher-level
//! ones via `#[from]`, and every per-line failure is a value, never a panic.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("line {index}: line too short ({len} bytes, need 80)")]
    LineTooShort { index: u64, len: usize },

    #[error("line {index}: invalid type byte")]
    InvalidType { index: u64 },

    #[error("line {index}: invalid date")]
    InvalidDate { index: u64 },

    #[error("line {index}: invalid amount")]
    InvalidAmount { index: u64 },

    #[error("line {index}: invalid time")]
    InvalidTime { index: u64 },
}

impl ParseError {
    pub fn index(&self) -> u64 {
        match self {
            ParseError::LineTooShort { index, .. }
            | ParseError::InvalidType { index }
            | ParseError::InvalidDate { index }
            | ParseError::InvalidAmount { index }
            | ParseError::InvalidTime { index } => *index,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ParseError::LineTooShort { .. } => "line_too_short",
            ParseError::InvalidType { .. } => "invalid_type",
            ParseError::InvalidDate { .. } => "invalid_date",
            ParseError::InvalidAmount { .. } => "invalid_amount",
            ParseError::InvalidTime { .. } => "invalid_time",
        }
    }
}

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("object store io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("message not found: {0}")]
    NotFound(String),

    #[error("queue is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock held by another owner: {0}")]
    Contended(String),

    #[error("lease expired or unknown: {0}")]
    InvalidLease(String),
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("upload not found: {0}")]
    NotFound(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("checkpoint would move backward: current={current} attempted={attempted}")]
    NonMonotonicCheckpoint { current: u64, attempted: u64 },
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Error kinds surfaced at the HTTP boundary, mirroring spec §7's taxonomy.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("payload too large: {0} bytes exceeds limit of {1}")]
    PayloadTooLarge(usize, usize),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Non-recoverable outcomes of a `ProcessingEngine` attempt, which drive the
/// DLQ + `Failed` transition of spec §4.8 step 10.
#[derive(Error, Debug, Clone)]
pub enum ProcessingError {
    #[error("blob missing for upload {0}")]
    MissingBlob(String),

    #[error("transient storage fault: {0}")]
    TransientStorage(String),

    #[error("lock held elsewhere for upload {0}")]
    LockConflict(String),

    #[error("file structurally unparseable: {0}")]
    Unprocessable(String),
}

/// Errors from `RecoveryLoop`'s resume operations.
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl ProcessingError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessingError::MissingBlob(_) => "missing_blob",
            ProcessingError::TransientStorage(_) => "transient_storage",
            ProcessingError::LockConflict(_) => "lock_conflict",
            ProcessingError::Unprocessable(_) => "unprocessable_entity",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProcessingError::TransientStorage(_) | ProcessingError::LockConflict(_))
    }
}
