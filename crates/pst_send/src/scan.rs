//! Scan identity and the base view over a scan directory.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Result, TransferError};

pub const SCAN_CONFIG_FILE: &str = "scan_configuration.json";
pub const OBS_HEADER_FILE: &str = "obs.header";
pub const SCAN_COMPLETED_FILE: &str = "scan_completed";
pub const TRANSFER_COMPLETED_FILE: &str = "transfer_completed";

/// Natural key of a scan: `<eb_id>/<subsystem_id>/<scan_id>` beneath a root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScanKey {
    pub eb_id: String,
    pub subsystem_id: String,
    pub scan_id: String,
}

impl ScanKey {
    pub fn new(
        eb_id: impl Into<String>,
        subsystem_id: impl Into<String>,
        scan_id: impl Into<String>,
    ) -> Self {
        Self {
            eb_id: eb_id.into(),
            subsystem_id: subsystem_id.into(),
            scan_id: scan_id.into(),
        }
    }

    /// Parse a root-relative scan path of exactly three components.
    pub fn from_relative_path(path: &Path) -> Result<Self> {
        let parts: Vec<&str> = path
            .iter()
            .map(|c| c.to_str().unwrap_or(""))
            .collect();
        match parts.as_slice() {
            [eb_id, subsystem_id, scan_id]
                if !eb_id.is_empty() && !subsystem_id.is_empty() && !scan_id.is_empty() =>
            {
                Ok(Self::new(*eb_id, *subsystem_id, *scan_id))
            }
            _ => Err(TransferError::invariant(format!(
                "scan path {} is not <eb_id>/<subsystem_id>/<scan_id>",
                path.display()
            ))),
        }
    }

    /// The key as a root-relative path.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(&self.eb_id)
            .join(&self.subsystem_id)
            .join(&self.scan_id)
    }
}

impl fmt::Display for ScanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.eb_id, self.subsystem_id, self.scan_id)
    }
}

/// Base view over one scan directory, on either the local or the remote
/// side; the side is determined by the root the view was constructed with.
#[derive(Debug, Clone)]
pub struct Scan {
    root: PathBuf,
    key: ScanKey,
    scan_path: PathBuf,
}

impl Scan {
    pub fn new(root: PathBuf, key: ScanKey) -> Self {
        let scan_path = root.join(key.relative_path());
        Self {
            root,
            key,
            scan_path,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key(&self) -> &ScanKey {
        &self.key
    }

    /// Absolute path of the scan directory in this view.
    pub fn scan_path(&self) -> &Path {
        &self.scan_path
    }

    pub fn exists(&self) -> bool {
        self.scan_path.is_dir()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.scan_path.join("data")
    }

    pub fn weights_dir(&self) -> PathBuf {
        self.scan_path.join("weights")
    }

    pub fn stat_dir(&self) -> PathBuf {
        self.scan_path.join("stat")
    }

    pub fn scan_config_path(&self) -> PathBuf {
        self.scan_path.join(SCAN_CONFIG_FILE)
    }

    pub fn obs_header_path(&self) -> PathBuf {
        self.scan_path.join(OBS_HEADER_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.scan_path.join(pst_send_metadata::METADATA_FILE_NAME)
    }

    pub fn scan_completed_path(&self) -> PathBuf {
        self.scan_path.join(SCAN_COMPLETED_FILE)
    }

    pub fn transfer_completed_path(&self) -> PathBuf {
        self.scan_path.join(TRANSFER_COMPLETED_FILE)
    }

    /// The end-of-stream sentinel written by the capture subsystem.
    pub fn is_scan_completed(&self) -> bool {
        self.scan_completed_path().is_file()
    }

    /// The replication sentinel, in this view.
    pub fn is_transfer_completed(&self) -> bool {
        self.transfer_completed_path().is_file()
    }
}
