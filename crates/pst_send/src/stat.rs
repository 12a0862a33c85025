//! Statistics generation for data/weights pairs.
//!
//! The production path shells out to the external statistics binary; the
//! trait seam lets tests (or an embedded implementation) generate stat files
//! in-process while preserving the same pair -> stat-file contract.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::error::{Result, TransferError};

/// Default name of the external statistics binary, resolved via PATH.
pub const DEFAULT_STAT_BINARY: &str = "ska_pst_stat_file_proc";

/// Exit codes treated as transient: EX_TEMPFAIL and the conventional
/// could-not-exec code used by daemon tooling.
pub const DEFAULT_RETRYABLE_EXIT_CODES: &[i32] = &[75, 111];

/// Generates the stat file for one data/weights pair.
#[async_trait]
pub trait StatProcessor: Send + Sync {
    async fn generate(
        &self,
        data: &Path,
        weights: &Path,
        stat_out: &Path,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Invokes the external statistics binary as a child process.
#[derive(Debug, Clone)]
pub struct StatFileProcessor {
    binary: PathBuf,
    retryable_exit_codes: Vec<i32>,
}

impl StatFileProcessor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            retryable_exit_codes: DEFAULT_RETRYABLE_EXIT_CODES.to_vec(),
        }
    }

    pub fn with_retryable_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.retryable_exit_codes = codes;
        self
    }

    fn is_retryable_code(&self, code: Option<i32>) -> bool {
        match code {
            // Terminated by signal: the environment, not the input.
            None => true,
            Some(code) => self.retryable_exit_codes.contains(&code),
        }
    }
}

impl Default for StatFileProcessor {
    fn default() -> Self {
        Self::new(DEFAULT_STAT_BINARY)
    }
}

#[async_trait]
impl StatProcessor for StatFileProcessor {
    async fn generate(
        &self,
        data: &Path,
        weights: &Path,
        stat_out: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Some(parent) = stat_out.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TransferError::io(parent, e))?;
        }

        debug!(
            binary = %self.binary.display(),
            data = %data.display(),
            weights = %weights.display(),
            out = %stat_out.display(),
            "running statistics binary"
        );

        let mut child = tokio::process::Command::new(&self.binary)
            .arg("-d")
            .arg(data)
            .arg("-w")
            .arg(weights)
            .arg("-o")
            .arg(stat_out)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TransferError::io(&self.binary, e))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(read_stream(stdout));
        let stderr_task = tokio::spawn(read_stream(stderr));

        let status = loop {
            if cancel.is_cancelled() {
                let _ = child.kill().await;
                let _ = std::fs::remove_file(stat_out);
                return Err(TransferError::Cancelled);
            }
            match child.try_wait().map_err(|e| TransferError::io(&self.binary, e))? {
                Some(status) => break status,
                None => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        if !stdout.is_empty() {
            debug!(target: "stat_binary", "{}", stdout.trim_end());
        }

        if status.success() {
            return Ok(());
        }

        let _ = std::fs::remove_file(stat_out);
        if !stderr.is_empty() {
            warn!(target: "stat_binary", "{}", stderr.trim_end());
        }
        Err(TransferError::SubprocessFailed {
            exit_code: status.code(),
            retryable: self.is_retryable_code(status.code()),
        })
    }
}

async fn read_stream(stream: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    let Some(mut stream) = stream else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}
