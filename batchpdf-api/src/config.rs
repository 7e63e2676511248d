//! Server configuration read from the environment

use batchpdf::batch::DEFAULT_JOB_TIMEOUT;
use batchpdf::intake::DEFAULT_MAX_FILE_SIZE;
use batchpdf::{BatchOptions, SizeConstraint};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BIND: &str = "0.0.0.0:3000";
/// Whole-request cap for multi-file submissions (1 GiB)
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 1024 * 1024 * 1024;
pub const DEFAULT_RETENTION_HOURS: u64 = 24;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub max_upload_bytes: u64,
    pub max_request_bytes: usize,
    pub workers: usize,
    pub job_timeout: Duration,
    /// Engine command line, e.g. `python3 /opt/engine.py`
    pub engine: Option<String>,
    pub storage_dir: PathBuf,
    pub retention: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            max_upload_bytes: DEFAULT_MAX_FILE_SIZE,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            workers: num_cpus::get(),
            job_timeout: DEFAULT_JOB_TIMEOUT,
            engine: None,
            storage_dir: std::env::temp_dir().join("batchpdf"),
            retention: Duration::from_secs(DEFAULT_RETENTION_HOURS * 3600),
        }
    }
}

impl ServerConfig {
    /// Read `BATCHPDF_*` variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            bind_addr: parse(&value, "BATCHPDF_BIND")?.unwrap_or(defaults.bind_addr),
            max_upload_bytes: parse(&value, "BATCHPDF_MAX_UPLOAD_BYTES")?
                .unwrap_or(defaults.max_upload_bytes),
            max_request_bytes: parse(&value, "BATCHPDF_MAX_REQUEST_BYTES")?
                .unwrap_or(defaults.max_request_bytes),
            workers: parse::<usize>(&value, "BATCHPDF_WORKERS")?
                .map(|workers| workers.max(1))
                .unwrap_or(defaults.workers),
            job_timeout: parse(&value, "BATCHPDF_JOB_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_timeout),
            engine: value("BATCHPDF_ENGINE").map(|v| v.trim().to_string()),
            storage_dir: value("BATCHPDF_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_dir),
            retention: parse::<u64>(&value, "BATCHPDF_RETENTION_HOURS")?
                .map(|hours| Duration::from_secs(hours * 3600))
                .unwrap_or(defaults.retention),
        })
    }

    /// Batch options for runs submitted through the API
    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions::default()
            .with_parallelism(self.workers)
            .with_job_timeout(self.job_timeout)
            .with_size_constraint(self.size_constraint())
    }

    pub fn size_constraint(&self) -> SizeConstraint {
        SizeConstraint::new(self.max_upload_bytes)
    }

    /// Where engine outputs are written
    pub fn output_dir(&self) -> PathBuf {
        self.storage_dir.join("outputs")
    }
}

fn parse<T: FromStr>(
    value: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    value(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value: raw })
        })
        .transpose()
}
