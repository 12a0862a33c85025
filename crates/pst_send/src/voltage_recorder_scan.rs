//! Concrete scan view for the PST voltage recorder layout: artifact
//! enumeration, pair bookkeeping and the completeness predicates driving both
//! workers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use pst_send_metadata::DataProductMeta;
use tracing::{debug, warn};

use crate::error::{Result, TransferError};
use crate::file::{FileKind, VoltageRecorderFile};
use crate::scan::{Scan, ScanKey, OBS_HEADER_FILE, SCAN_COMPLETED_FILE, SCAN_CONFIG_FILE};

/// A data/weights pair sharing a suffix key, plus its stat file once the
/// statistics binary has produced one.
#[derive(Debug, Clone)]
pub struct FilePair {
    pub key: String,
    pub data: VoltageRecorderFile,
    pub weights: VoltageRecorderFile,
    pub stat: Option<VoltageRecorderFile>,
}

impl FilePair {
    /// Scan-relative path where the pair's stat file belongs.
    pub fn stat_relative_path(&self) -> PathBuf {
        PathBuf::from("stat").join(format!("{}.h5", self.key))
    }
}

/// One unit of transfer work: a scan-relative path plus its artifact kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    pub kind: FileKind,
    pub relative: PathBuf,
}

impl TransferItem {
    fn new(kind: FileKind, relative: PathBuf) -> Self {
        Self { kind, relative }
    }
}

/// Scan view specialized for the voltage recorder directory layout.
#[derive(Debug, Clone)]
pub struct VoltageRecorderScan {
    scan: Scan,
}

impl VoltageRecorderScan {
    pub fn new(root: PathBuf, key: ScanKey) -> Self {
        Self {
            scan: Scan::new(root, key),
        }
    }

    pub fn scan(&self) -> &Scan {
        &self.scan
    }

    pub fn key(&self) -> &ScanKey {
        self.scan.key()
    }

    pub fn scan_path(&self) -> &Path {
        self.scan.scan_path()
    }

    pub fn is_scan_completed(&self) -> bool {
        self.scan.is_scan_completed()
    }

    pub fn is_transfer_completed(&self) -> bool {
        self.scan.is_transfer_completed()
    }

    /// Enumerate data/weights pairs in lexicographic key order.
    ///
    /// A data file whose weights companion has not appeared yet (or vice
    /// versa) is not a pair; it is skipped until both members exist.
    pub fn enumerate_pairs(&self) -> Result<Vec<FilePair>> {
        let data = files_by_key(&self.scan.data_dir(), "dada")?;
        let weights = files_by_key(&self.scan.weights_dir(), "dada")?;

        let mut pairs = Vec::new();
        for (key, data_path) in &data {
            let Some(weights_path) = weights.get(key) else {
                debug!(scan = %self.key(), key, "data file has no weights companion yet");
                continue;
            };
            let stat_path = self.scan.stat_dir().join(format!("{key}.h5"));
            let stat = if stat_path.is_file() {
                Some(VoltageRecorderFile::new(stat_path, FileKind::Stat)?)
            } else {
                None
            };
            pairs.push(FilePair {
                key: key.clone(),
                data: VoltageRecorderFile::new(data_path.clone(), FileKind::Data)?,
                weights: VoltageRecorderFile::new(weights_path.clone(), FileKind::Weights)?,
                stat,
            });
        }
        for key in weights.keys() {
            if !data.contains_key(key) {
                debug!(scan = %self.key(), key, "weights file has no data companion yet");
            }
        }
        Ok(pairs)
    }

    /// Pairs for which no stat file exists yet.
    pub fn unprocessed_pairs(&self) -> Result<Vec<FilePair>> {
        Ok(self
            .enumerate_pairs()?
            .into_iter()
            .filter(|pair| pair.stat.is_none())
            .collect())
    }

    /// Every artifact present in this view, as scan-relative transfer items
    /// in replication order: data/weights pairs, stat files, config files,
    /// the metadata document, then `scan_completed`. `transfer_completed` is
    /// never listed; the transfer worker writes it as a terminal step.
    pub fn all_transfer_items(&self) -> Result<Vec<TransferItem>> {
        let mut items = Vec::new();

        for pair in self.enumerate_pairs()? {
            items.push(TransferItem::new(
                FileKind::Data,
                relative_to_scan(self.scan_path(), pair.data.path()),
            ));
            items.push(TransferItem::new(
                FileKind::Weights,
                relative_to_scan(self.scan_path(), pair.weights.path()),
            ));
        }

        for (key, _) in files_by_key(&self.scan.stat_dir(), "h5")? {
            items.push(TransferItem::new(
                FileKind::Stat,
                PathBuf::from("stat").join(format!("{key}.h5")),
            ));
        }

        for name in [SCAN_CONFIG_FILE, OBS_HEADER_FILE] {
            if self.scan_path().join(name).is_file() {
                items.push(TransferItem::new(FileKind::Config, PathBuf::from(name)));
            }
        }
        if self.scan.metadata_path().is_file() {
            items.push(TransferItem::new(
                FileKind::Metadata,
                PathBuf::from(pst_send_metadata::METADATA_FILE_NAME),
            ));
        }
        if self.scan.is_scan_completed() {
            items.push(TransferItem::new(
                FileKind::Sentinel,
                PathBuf::from(SCAN_COMPLETED_FILE),
            ));
        }

        Ok(items)
    }

    /// Artifacts whose counterpart in `remote` is missing, size-differs or
    /// checksum-differs, in replication order.
    pub async fn untransferred_files(
        &self,
        remote: &VoltageRecorderScan,
    ) -> Result<Vec<TransferItem>> {
        let mut untransferred = Vec::new();
        for item in self.all_transfer_items()? {
            let local_path = self.scan_path().join(&item.relative);
            let remote_path = remote.scan_path().join(&item.relative);
            if !remote_path.is_file() {
                untransferred.push(item);
                continue;
            }
            let mut local = match VoltageRecorderFile::new(local_path.clone(), item.kind) {
                Ok(file) => file,
                Err(TransferError::NotFound { .. }) => {
                    // Vanished between enumeration and comparison; the next
                    // cycle re-enumerates.
                    warn!(scan = %self.key(), path = %local_path.display(), "artifact vanished during comparison");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mut counterpart = VoltageRecorderFile::new(remote_path, item.kind)?;
            if !local.same_content(&mut counterpart).await? {
                untransferred.push(item);
            }
        }
        Ok(untransferred)
    }

    /// Every pair has a stat file AND the metadata document's processing
    /// section reports completion for the observed pair count.
    pub fn is_processing_completed(&self) -> bool {
        let pairs = match self.enumerate_pairs() {
            Ok(pairs) => pairs,
            Err(e) => {
                debug!(scan = %self.key(), error = %e, "pair enumeration failed");
                return false;
            }
        };
        if pairs.iter().any(|pair| pair.stat.is_none()) {
            return false;
        }
        match DataProductMeta::load(&self.scan.metadata_path()) {
            Ok(meta) => meta.processing.is_complete(pairs.len() as u32),
            Err(_) => false,
        }
    }

    /// Local-side terminal state: recording ended, processing finalized and
    /// the replication sentinel written. A scan in this state may be deleted.
    pub fn is_complete(&self) -> bool {
        self.is_scan_completed() && self.is_processing_completed() && self.is_transfer_completed()
    }

    /// Byte totals per artifact directory, for the metadata files block.
    /// Returns (data, weights, stat, pair_count).
    pub fn artifact_totals(&self) -> Result<(u64, u64, u64, u32)> {
        let pairs = self.enumerate_pairs()?;
        let mut data_total = 0;
        let mut weights_total = 0;
        let mut stat_total = 0;
        for pair in &pairs {
            data_total += pair.data.size();
            weights_total += pair.weights.size();
            if let Some(stat) = &pair.stat {
                stat_total += stat.size();
            }
        }
        Ok((data_total, weights_total, stat_total, pairs.len() as u32))
    }

    /// Remove the scan directory. Refuses unless `is_complete()` holds.
    pub fn delete(&self) -> Result<()> {
        if !self.is_complete() {
            return Err(TransferError::invariant(format!(
                "refusing to delete incomplete scan {}",
                self.key()
            )));
        }
        std::fs::remove_dir_all(self.scan_path())
            .map_err(|e| TransferError::io(self.scan_path(), e))
    }
}

/// Files in `dir` with extension `ext`, keyed by file stem, sorted by key.
/// A missing directory is an empty listing, not an error.
fn files_by_key(dir: &Path, ext: &str) -> Result<BTreeMap<String, PathBuf>> {
    let mut files = BTreeMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(TransferError::io(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| TransferError::io(dir, e))?;
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(ext) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            files.insert(stem.to_string(), path);
        }
    }
    Ok(files)
}

fn relative_to_scan(scan_path: &Path, file_path: &Path) -> PathBuf {
    file_path
        .strip_prefix(scan_path)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| file_path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_scan(root: &Path) -> VoltageRecorderScan {
        let key = ScanKey::new("eb-m001-20240101-00001", "pst-low", "42");
        let scan = VoltageRecorderScan::new(root.to_path_buf(), key);
        fs::create_dir_all(scan.scan_path().join("data")).unwrap();
        fs::create_dir_all(scan.scan_path().join("weights")).unwrap();
        scan
    }

    fn add_pair(scan: &VoltageRecorderScan, key: &str, payload: &[u8]) {
        fs::write(scan.scan_path().join("data").join(format!("{key}.dada")), payload).unwrap();
        fs::write(scan.scan_path().join("weights").join(format!("{key}.dada")), b"w").unwrap();
    }

    fn add_stat(scan: &VoltageRecorderScan, key: &str) {
        let dir = scan.scan_path().join("stat");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{key}.h5")), b"stat").unwrap();
    }

    #[test]
    fn pairs_enumerate_in_key_order_and_skip_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let scan = make_scan(dir.path());
        add_pair(&scan, "b_0001", b"bb");
        add_pair(&scan, "a_0000", b"aa");
        // A lone data file is not a pair yet.
        fs::write(scan.scan_path().join("data/c_0002.dada"), b"cc").unwrap();

        let pairs = scan.enumerate_pairs().unwrap();
        let keys: Vec<&str> = pairs.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["a_0000", "b_0001"]);
    }

    #[test]
    fn unprocessed_pairs_drop_once_stat_exists() {
        let dir = tempfile::tempdir().unwrap();
        let scan = make_scan(dir.path());
        add_pair(&scan, "a_0000", b"aa");
        add_pair(&scan, "b_0001", b"bb");
        add_stat(&scan, "a_0000");

        let unprocessed = scan.unprocessed_pairs().unwrap();
        assert_eq!(unprocessed.len(), 1);
        assert_eq!(unprocessed[0].key, "b_0001");
    }

    #[test]
    fn transfer_items_follow_replication_order() {
        let dir = tempfile::tempdir().unwrap();
        let scan = make_scan(dir.path());
        add_pair(&scan, "a_0000", b"aa");
        add_stat(&scan, "a_0000");
        fs::write(scan.scan_path().join(SCAN_CONFIG_FILE), b"{}").unwrap();
        fs::write(scan.scan_path().join(OBS_HEADER_FILE), b"HDR_SIZE 4096").unwrap();
        fs::write(scan.scan_path().join("data_product.yaml"), b"interface: x").unwrap();
        fs::write(scan.scan_path().join(SCAN_COMPLETED_FILE), b"").unwrap();

        let items = scan.all_transfer_items().unwrap();
        let rels: Vec<String> = items
            .iter()
            .map(|i| i.relative.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            rels,
            vec![
                "data/a_0000.dada",
                "weights/a_0000.dada",
                "stat/a_0000.h5",
                "scan_configuration.json",
                "obs.header",
                "data_product.yaml",
                "scan_completed",
            ]
        );
    }

    #[tokio::test]
    async fn untransferred_detects_missing_and_differing_remotes() {
        let local_dir = tempfile::tempdir().unwrap();
        let remote_dir = tempfile::tempdir().unwrap();
        let local = make_scan(local_dir.path());
        let remote = make_scan(remote_dir.path());
        add_pair(&local, "a_0000", b"payload");

        // Nothing on the remote side yet: both pair members are pending.
        let pending = local.untransferred_files(&remote).await.unwrap();
        assert_eq!(pending.len(), 2);

        // Same size, different bytes: checksum comparison must catch it.
        fs::write(
            remote.scan_path().join("data/a_0000.dada"),
            b"pAyload",
        )
        .unwrap();
        fs::write(remote.scan_path().join("weights/a_0000.dada"), b"w").unwrap();
        let pending = local.untransferred_files(&remote).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].relative, PathBuf::from("data/a_0000.dada"));

        // Bit-exact remote copy: nothing left.
        fs::write(remote.scan_path().join("data/a_0000.dada"), b"payload").unwrap();
        let pending = local.untransferred_files(&remote).await.unwrap();
        assert!(pending.is_empty());
    }

    #[test]
    fn delete_refuses_incomplete_scans() {
        let dir = tempfile::tempdir().unwrap();
        let scan = make_scan(dir.path());
        add_pair(&scan, "a_0000", b"aa");

        let err = scan.delete().unwrap_err();
        assert!(matches!(err, TransferError::InvariantViolation { .. }));
        assert!(scan.scan_path().exists());
    }

    #[test]
    fn completeness_requires_all_three_conditions() {
        let dir = tempfile::tempdir().unwrap();
        let scan = make_scan(dir.path());
        add_pair(&scan, "a_0000", b"aa");
        assert!(!scan.is_complete());

        add_stat(&scan, "a_0000");
        fs::write(scan.scan_path().join(SCAN_COMPLETED_FILE), b"").unwrap();
        assert!(!scan.is_complete());

        let mut meta = DataProductMeta::default();
        meta.processing.record_pair(pst_send_metadata::PairStat {
            key: "a_0000".to_string(),
            stat_path: "stat/a_0000.h5".to_string(),
            data_size: 2,
            weights_size: 1,
        });
        meta.processing.finalize(1, chrono::Utc::now());
        meta.save_atomic(&scan.scan().metadata_path()).unwrap();
        assert!(scan.is_processing_completed());
        assert!(!scan.is_complete());

        fs::write(scan.scan().transfer_completed_path(), b"").unwrap();
        assert!(scan.is_complete());
        scan.delete().unwrap();
        assert!(!scan.scan_path().exists());
    }
}
