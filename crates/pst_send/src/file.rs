//! One artifact on disk, on either the local or remote side.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::{Result, TransferError};

/// Chunk size for checksum reads and file copies.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Logical kind of an artifact inside a scan directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Data,
    Weights,
    Stat,
    Config,
    Metadata,
    Sentinel,
}

/// A voltage recorder artifact: path, kind, size, mtime and a lazily
/// computed SHA-256. The checksum cache is dropped whenever `stat()`
/// observes a size or mtime change.
#[derive(Debug, Clone)]
pub struct VoltageRecorderFile {
    path: PathBuf,
    kind: FileKind,
    size: u64,
    mtime: SystemTime,
    checksum: Option<String>,
}

impl VoltageRecorderFile {
    /// Stat `path` and build the file record.
    pub fn new(path: PathBuf, kind: FileKind) -> Result<Self> {
        let meta = std::fs::metadata(&path).map_err(|e| TransferError::io(&path, e))?;
        Ok(Self {
            size: meta.len(),
            mtime: meta.modified().map_err(|e| TransferError::io(&path, e))?,
            path,
            kind,
            checksum: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mtime(&self) -> SystemTime {
        self.mtime
    }

    /// Refresh size/mtime from the filesystem. Fails with `NotFound` if the
    /// file vanished.
    pub fn stat(&mut self) -> Result<()> {
        let meta = std::fs::metadata(&self.path).map_err(|e| TransferError::io(&self.path, e))?;
        let size = meta.len();
        let mtime = meta.modified().map_err(|e| TransferError::io(&self.path, e))?;
        if size != self.size || mtime != self.mtime {
            self.checksum = None;
        }
        self.size = size;
        self.mtime = mtime;
        Ok(())
    }

    /// Compute and cache the SHA-256 of the file contents. Idempotent.
    pub async fn checksum(&mut self) -> Result<String> {
        if let Some(checksum) = &self.checksum {
            return Ok(checksum.clone());
        }
        let checksum = checksum_file(&self.path).await?;
        self.checksum = Some(checksum.clone());
        Ok(checksum)
    }

    /// Size AND checksum match; mtime is advisory only.
    pub async fn same_content(&mut self, other: &mut VoltageRecorderFile) -> Result<bool> {
        if self.size != other.size {
            return Ok(false);
        }
        Ok(self.checksum().await? == other.checksum().await?)
    }
}

/// SHA-256 of a file, read in chunks so the task yields between reads.
pub async fn checksum_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
