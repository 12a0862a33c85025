//! Error taxonomy for the transfer engine.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Error, Debug)]
pub enum TransferError {
    /// A file or directory that was expected to exist has vanished. Callers
    /// log and re-enumerate on the next cycle.
    #[error("Not found: {path}")]
    NotFound { path: PathBuf },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Checksum mismatch for {path}: local {local} != remote {remote}")]
    ChecksumMismatch {
        path: PathBuf,
        local: String,
        remote: String,
    },

    /// The external statistics binary failed. `retryable` reflects whether
    /// the exit status is in the configured transient set.
    #[error("Subprocess failed with exit code {exit_code:?} (retryable: {retryable})")]
    SubprocessFailed {
        exit_code: Option<i32>,
        retryable: bool,
    },

    #[error("Data Product Dashboard unavailable: {reason}")]
    DashboardUnavailable { reason: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("Invariant violation: {reason}")]
    InvariantViolation { reason: String },

    #[error(transparent)]
    Metadata(#[from] pst_send_metadata::MetadataError),
}

impl TransferError {
    pub fn io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    pub fn invariant(reason: impl Into<String>) -> Self {
        Self::InvariantViolation {
            reason: reason.into(),
        }
    }

    /// True for failures that a retry with backoff may clear.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io { .. } | Self::ChecksumMismatch { .. } => true,
            Self::SubprocessFailed { retryable, .. } => *retryable,
            Self::DashboardUnavailable { .. } => true,
            _ => false,
        }
    }
}
