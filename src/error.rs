use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AtbError {
    #[error("invalid archive id: {0}")]
    InvalidArchiveId(String),

    #[error("invalid checksum: {0}")]
    InvalidChecksum(String),

    #[error("conflicting plan for archive {archive}: {message}")]
    #[diagnostic(help("every row of one archive must carry the same URL and checksum"))]
    PlanConflict { archive: String, message: String },

    #[error("request failed: {0}")]
    Network(String),

    #[error("server returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("cannot read archive {path}: {message}")]
    ArchiveOpen { path: PathBuf, message: String },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to read selection table: {0}")]
    SelectionRead(String),

    #[error("selection table is missing required columns: {}", .0.join(", "))]
    #[diagnostic(help("expected a tab-separated table with tar_xz, tar_xz_url and filename_in_tar_xz"))]
    SelectionColumns(Vec<String>),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl AtbError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AtbError::Network(_) | AtbError::Status { .. } | AtbError::ChecksumMismatch { .. }
        )
    }
}
