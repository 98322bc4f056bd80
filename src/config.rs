//! Configuration for the ingestion pipeline.
//!
//! Follows the teacher's `config.rs` pattern: a `Config` aggregating
//! section structs, every section implementing `Default`, field-level
//! `#[serde(default = "...")]` for individual knobs, and a loader that
//! never aborts startup — a missing or malformed `config.yaml` just falls
//! back to defaults (logged, non-fatal).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Max in-flight `LineWorker`s per upload (spec §6).
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,
    /// Lines per checkpoint flush.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    /// Per-line attempts before a line is given up as `Failed`.
    #[serde(default = "default_max_retry_per_line")]
    pub max_retry_per_line: u32,
    /// Delay between per-line retries.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Per-upload attempts before the whole upload is sent to the DLQ.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// RecoveryLoop tick interval.
    #[serde(default = "default_recovery_check_interval_minutes")]
    pub recovery_check_interval_minutes: u64,
    /// How long a non-terminal upload may go without progress before it's
    /// considered stuck.
    #[serde(default = "default_stuck_upload_timeout_minutes")]
    pub stuck_upload_timeout_minutes: i64,
    /// Upload size limit in bytes (spec §6, Open Questions: 1 MiB is
    /// authoritative, not the ~1 GiB figure seen elsewhere in the source).
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    /// Distributed lock lease TTL in seconds; must exceed the expected
    /// checkpoint flush time (spec §5).
    #[serde(default = "default_processing_ttl_secs")]
    pub processing_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_object_store_dir")]
    pub object_store_dir: String,
}

fn default_port() -> u16 {
    3000
}
fn default_parallel_workers() -> usize {
    4
}
fn default_checkpoint_interval() -> u64 {
    100
}
fn default_max_retry_per_line() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_max_retries() -> u32 {
    5
}
fn default_recovery_check_interval_minutes() -> u64 {
    5
}
fn default_stuck_upload_timeout_minutes() -> i64 {
    30
}
fn default_max_bytes() -> usize {
    1024 * 1024
}
fn default_processing_ttl_secs() -> u64 {
    60
}
fn default_data_dir() -> String {
    "./data".to_string()
}
fn default_object_store_dir() -> String {
    "./data/blobs".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self { port: default_port() }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parallel_workers: default_parallel_workers(),
            checkpoint_interval: default_checkpoint_interval(),
            max_retry_per_line: default_max_retry_per_line(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retries: default_max_retries(),
            recovery_check_interval_minutes: default_recovery_check_interval_minutes(),
            stuck_upload_timeout_minutes: default_stuck_upload_timeout_minutes(),
            max_bytes: default_max_bytes(),
            processing_ttl_secs: default_processing_ttl_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            object_store_dir: default_object_store_dir(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            pipeline: PipelineConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Load configuration from `path` (or `./config.yaml` if `None`), falling
/// back to defaults on any I/O or parse error. Configuration loading must
/// never abort startup.
pub fn load_config(path: Option<PathBuf>) -> Config {
    let config_path = path.unwrap_or_else(|| Path::new("config.yaml").to_path_buf());

    if !config_path.exists() {
        debug!("no config file at {:?}, using defaults", config_path);
        return Config::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match serde_yaml::from_str(&contents) {
            Ok(config) => {
                debug!("loaded configuration from {:?}", config_path);
                config
            }
            Err(e) => {
                error!("error parsing {:?}: {e}", config_path);
                Config::default()
            }
        },
        Err(e) => {
            error!("error reading {:?}: {e}", config_path);
            Config::default()
        }
    }
}
