//! Transfer worker: replicates the current scan to the remote tree with
//! checksum verification, then writes the `transfer_completed` sentinels.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::error::{Result, TransferError};
use crate::file::{checksum_file, FileKind, CHUNK_SIZE};
use crate::quiesce::{QuiescenceTracker, DEFAULT_QUIESCENCE_WINDOW};
use crate::retry::Backoff;
use crate::scan::ScanKey;
use crate::scan_manager::ScanLedger;
use crate::voltage_recorder_scan::VoltageRecorderScan;

#[derive(Debug, Clone)]
pub struct ScanTransferConfig {
    /// Delay between transfer cycles when there is nothing to do.
    pub loop_wait: Duration,
    /// Consecutive unchanged-size observations before a payload file moves.
    pub quiescence_window: u32,
    /// Total attempts for one file copy (first try plus retries).
    pub max_file_attempts: u32,
}

impl Default for ScanTransferConfig {
    fn default() -> Self {
        Self {
            loop_wait: Duration::from_secs(2),
            quiescence_window: DEFAULT_QUIESCENCE_WINDOW,
            max_file_attempts: 3,
        }
    }
}

/// Long-lived worker replicating the current scan local -> remote.
pub struct ScanTransfer {
    local_root: PathBuf,
    remote_root: PathBuf,
    current_rx: watch::Receiver<Option<ScanKey>>,
    ledger: Arc<ScanLedger>,
    cancel: CancellationToken,
    config: ScanTransferConfig,
    tracker: QuiescenceTracker,
}

impl ScanTransfer {
    pub fn new(
        local_root: PathBuf,
        remote_root: PathBuf,
        current_rx: watch::Receiver<Option<ScanKey>>,
        ledger: Arc<ScanLedger>,
        cancel: CancellationToken,
        config: ScanTransferConfig,
    ) -> Self {
        let tracker = QuiescenceTracker::new(config.quiescence_window);
        Self {
            local_root,
            remote_root,
            current_rx,
            ledger,
            cancel,
            config,
            tracker,
        }
    }

    pub async fn run(mut self) {
        info!("transfer worker started");
        while !self.cancel.is_cancelled() {
            let current = self.current_rx.borrow().clone();
            if let Some(key) = current {
                if let Err(e) = self.drive_scan(&key).await {
                    match e {
                        TransferError::Cancelled => break,
                        TransferError::NotFound { ref path } => {
                            debug!(scan = %key, path = %path.display(), "artifact vanished, re-enumerating next cycle");
                        }
                        e @ TransferError::InvariantViolation { .. } => {
                            self.ledger.mark_errored(&key, e.to_string());
                        }
                        e => {
                            // Transient trouble: the scan is retried on the
                            // next cycle and stays undeletable meanwhile.
                            warn!(scan = %key, error = %e, "transfer cycle failed");
                        }
                    }
                }
            }
            if self.cancel.sleep(self.config.loop_wait).await {
                break;
            }
        }
        info!("transfer worker stopped");
    }

    /// One transfer cycle over the current scan: replicate every stable
    /// untransferred artifact, then write the sentinels once the scan is
    /// fully replicated and processing has declared completion.
    async fn drive_scan(&mut self, key: &ScanKey) -> Result<()> {
        if self.ledger.status(key).transferred {
            return Ok(());
        }
        let local = VoltageRecorderScan::new(self.local_root.clone(), key.clone());
        let remote = VoltageRecorderScan::new(self.remote_root.clone(), key.clone());
        if !local.scan().exists() {
            return Ok(());
        }
        self.tracker.retain_under(local.scan_path());

        std::fs::create_dir_all(remote.scan_path())
            .map_err(|e| TransferError::io(remote.scan_path(), e))?;

        let pending = local.untransferred_files(&remote).await?;
        if local.is_transfer_completed() && !pending.is_empty() {
            return Err(TransferError::invariant(format!(
                "transfer_completed present on {} but {} artifacts are not replicated",
                key,
                pending.len()
            )));
        }

        let mut all_moved = true;
        for item in pending {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let local_path = local.scan_path().join(&item.relative);
            if self.payload_still_growing(&item.kind, &local_path) {
                debug!(scan = %key, path = %item.relative.display(), "file still growing, deferring");
                all_moved = false;
                continue;
            }
            let remote_path = remote.scan_path().join(&item.relative);
            if let Err(e) = self.copy_with_retries(&local_path, &remote_path).await {
                match e {
                    TransferError::Cancelled => return Err(TransferError::Cancelled),
                    TransferError::NotFound { .. } => {
                        debug!(scan = %key, path = %item.relative.display(), "source vanished, re-enumerating next cycle");
                        all_moved = false;
                    }
                    e => {
                        warn!(
                            scan = %key,
                            path = %item.relative.display(),
                            error = %e,
                            "file errored this pass, will retry next cycle"
                        );
                        all_moved = false;
                    }
                }
                continue;
            }
            self.tracker.forget(&local_path);
        }

        if all_moved
            && local.is_scan_completed()
            && local.is_processing_completed()
            && local.untransferred_files(&remote).await?.is_empty()
        {
            // Local first: a crash in between leaves the local truth
            // authoritative and a re-run re-pushes the remote sentinel.
            if !local.is_transfer_completed() {
                write_sentinel(&local.scan().transfer_completed_path())?;
            }
            if !remote.is_transfer_completed() {
                write_sentinel(&remote.scan().transfer_completed_path())?;
            }
            self.ledger.mark_transferred(key);
            info!(scan = %key, "transfer complete");
        }
        Ok(())
    }

    /// Payload files move only once quiescent; control files are written
    /// atomically by their producers and are exempt.
    fn payload_still_growing(&mut self, kind: &FileKind, local_path: &Path) -> bool {
        if !matches!(kind, FileKind::Data | FileKind::Weights | FileKind::Stat) {
            return false;
        }
        let size = match std::fs::metadata(local_path) {
            Ok(meta) => meta.len(),
            Err(_) => return true,
        };
        !self.tracker.observe(local_path, size)
    }

    async fn copy_with_retries(&self, local_path: &Path, remote_path: &Path) -> Result<()> {
        let mut backoff = Backoff::new(self.config.max_file_attempts);
        loop {
            match copy_verified(local_path, remote_path, &self.cancel).await {
                Ok(()) => {
                    debug!(src = %local_path.display(), dst = %remote_path.display(), "file replicated");
                    return Ok(());
                }
                Err(e) if e.is_retryable() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            src = %local_path.display(),
                            error = %e,
                            retry_in = ?delay,
                            "copy failed, retrying"
                        );
                        if self.cancel.sleep(delay).await {
                            return Err(TransferError::Cancelled);
                        }
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }
}

/// Copy `local` to `remote` via a sibling `.part` temp file, fsync, verify
/// the checksum against the source and atomically rename into place. A
/// mismatch removes the temp file and surfaces `ChecksumMismatch`.
pub async fn copy_verified(
    local: &Path,
    remote: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    if let Some(parent) = remote.parent() {
        std::fs::create_dir_all(parent).map_err(|e| TransferError::io(parent, e))?;
    }
    let part = part_path(remote);

    let mut src = tokio::fs::File::open(local)
        .await
        .map_err(|e| TransferError::io(local, e))?;
    let mut dst = tokio::fs::File::create(&part)
        .await
        .map_err(|e| TransferError::io(&part, e))?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        if cancel.is_cancelled() {
            drop(dst);
            let _ = std::fs::remove_file(&part);
            return Err(TransferError::Cancelled);
        }
        let n = src
            .read(&mut buf)
            .await
            .map_err(|e| TransferError::io(local, e))?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])
            .await
            .map_err(|e| TransferError::io(&part, e))?;
    }
    dst.flush().await.map_err(|e| TransferError::io(&part, e))?;
    dst.sync_all()
        .await
        .map_err(|e| TransferError::io(&part, e))?;
    drop(dst);

    let local_sum = checksum_file(local).await?;
    let remote_sum = checksum_file(&part).await?;
    if local_sum != remote_sum {
        let _ = std::fs::remove_file(&part);
        return Err(TransferError::ChecksumMismatch {
            path: remote.to_path_buf(),
            local: local_sum,
            remote: remote_sum,
        });
    }

    tokio::fs::rename(&part, remote)
        .await
        .map_err(|e| TransferError::io(remote, e))
}

fn part_path(remote: &Path) -> PathBuf {
    let name = remote
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    remote.with_file_name(format!("{name}.part"))
}

/// Write a zero-byte sentinel file.
fn write_sentinel(path: &Path) -> Result<()> {
    std::fs::write(path, b"").map_err(|e| TransferError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pst_send_metadata::DataProductMeta;
    use std::fs;

    fn finalized_metadata(pair_count: u32) -> DataProductMeta {
        let mut meta = DataProductMeta::default();
        for i in 0..pair_count {
            meta.processing.record_pair(pst_send_metadata::PairStat {
                key: format!("p_{i:04}"),
                stat_path: format!("stat/p_{i:04}.h5"),
                data_size: 4,
                weights_size: 1,
            });
        }
        meta.processing.finalize(pair_count, chrono::Utc::now());
        meta
    }

    /// A processed, completed local scan with `pair_count` pairs.
    fn make_local_scan(root: &Path, key: &ScanKey, pair_count: u32) {
        let dir = root.join(key.relative_path());
        fs::create_dir_all(dir.join("data")).unwrap();
        fs::create_dir_all(dir.join("weights")).unwrap();
        fs::create_dir_all(dir.join("stat")).unwrap();
        for i in 0..pair_count {
            fs::write(dir.join(format!("data/p_{i:04}.dada")), b"data").unwrap();
            fs::write(dir.join(format!("weights/p_{i:04}.dada")), b"w").unwrap();
            fs::write(dir.join(format!("stat/p_{i:04}.h5")), b"stat").unwrap();
        }
        fs::write(dir.join("scan_configuration.json"), b"{}").unwrap();
        fs::write(dir.join("obs.header"), b"HDR_SIZE 4096").unwrap();
        finalized_metadata(pair_count)
            .save_atomic(&dir.join("data_product.yaml"))
            .unwrap();
        fs::write(dir.join("scan_completed"), b"").unwrap();
    }

    fn make_worker(
        local_root: &Path,
        remote_root: &Path,
        key: &ScanKey,
        window: u32,
    ) -> (ScanTransfer, watch::Sender<Option<ScanKey>>, Arc<ScanLedger>) {
        let (tx, rx) = watch::channel(Some(key.clone()));
        let ledger = Arc::new(ScanLedger::new());
        let config = ScanTransferConfig {
            loop_wait: Duration::from_millis(10),
            quiescence_window: window,
            max_file_attempts: 3,
        };
        let worker = ScanTransfer::new(
            local_root.to_path_buf(),
            remote_root.to_path_buf(),
            rx,
            ledger.clone(),
            CancellationToken::new(),
            config,
        );
        (worker, tx, ledger)
    }

    #[tokio::test]
    async fn completed_scan_is_fully_replicated_with_sentinels() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let key = ScanKey::new("eb-a", "pst-low", "1");
        make_local_scan(local.path(), &key, 3);
        let (mut worker, _tx, ledger) = make_worker(local.path(), remote.path(), &key, 1);

        worker.drive_scan(&key).await.unwrap();

        let remote_dir = remote.path().join(key.relative_path());
        for i in 0..3 {
            assert!(remote_dir.join(format!("data/p_{i:04}.dada")).is_file());
            assert!(remote_dir.join(format!("weights/p_{i:04}.dada")).is_file());
            assert!(remote_dir.join(format!("stat/p_{i:04}.h5")).is_file());
        }
        assert!(remote_dir.join("scan_configuration.json").is_file());
        assert!(remote_dir.join("obs.header").is_file());
        assert!(remote_dir.join("data_product.yaml").is_file());
        assert!(remote_dir.join("scan_completed").is_file());
        assert!(remote_dir.join("transfer_completed").is_file());
        assert!(local
            .path()
            .join(key.relative_path())
            .join("transfer_completed")
            .is_file());
        assert!(ledger.status(&key).transferred);
    }

    #[tokio::test]
    async fn sentinel_waits_for_processing_completion() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let key = ScanKey::new("eb-a", "pst-low", "1");
        make_local_scan(local.path(), &key, 1);
        // Processing not finalized: an unprocessed pair remains.
        let dir = local.path().join(key.relative_path());
        fs::write(dir.join("data/q_0009.dada"), b"late").unwrap();
        fs::write(dir.join("weights/q_0009.dada"), b"w").unwrap();

        let (mut worker, _tx, ledger) = make_worker(local.path(), remote.path(), &key, 1);
        worker.drive_scan(&key).await.unwrap();

        let remote_dir = remote.path().join(key.relative_path());
        // Payload moved eagerly, sentinel held back.
        assert!(remote_dir.join("data/q_0009.dada").is_file());
        assert!(!remote_dir.join("transfer_completed").exists());
        assert!(!dir.join("transfer_completed").exists());
        assert!(!ledger.status(&key).transferred);
    }

    #[tokio::test]
    async fn rerun_does_not_rewrite_verified_files() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let key = ScanKey::new("eb-a", "pst-low", "1");
        make_local_scan(local.path(), &key, 3);
        let (mut worker, _tx, _ledger) = make_worker(local.path(), remote.path(), &key, 1);

        worker.drive_scan(&key).await.unwrap();

        // Age one replicated file; a fresh run (new worker, empty ledger)
        // must verify it and leave it untouched.
        let aged = remote
            .path()
            .join(key.relative_path())
            .join("data/p_0000.dada");
        let old = filetime::FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_mtime(&aged, old).unwrap();

        let (mut worker, _tx, ledger) = make_worker(local.path(), remote.path(), &key, 1);
        worker.drive_scan(&key).await.unwrap();
        assert!(ledger.status(&key).transferred);
        let mtime = filetime::FileTime::from_last_modification_time(&fs::metadata(&aged).unwrap());
        assert_eq!(mtime, old);
    }

    #[tokio::test]
    async fn crash_leftovers_are_resumed_idempotently() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let key = ScanKey::new("eb-a", "pst-low", "1");
        make_local_scan(local.path(), &key, 3);

        // Simulate a crash after one file was renamed and another was mid-copy.
        let remote_dir = remote.path().join(key.relative_path());
        fs::create_dir_all(remote_dir.join("data")).unwrap();
        fs::write(remote_dir.join("data/p_0000.dada"), b"data").unwrap();
        fs::write(remote_dir.join("data/p_0001.dada.part"), b"da").unwrap();

        let (mut worker, _tx, ledger) = make_worker(local.path(), remote.path(), &key, 1);
        worker.drive_scan(&key).await.unwrap();

        assert!(ledger.status(&key).transferred);
        assert!(remote_dir.join("transfer_completed").is_file());
        // No temp files survive a completed pass.
        for entry in fs::read_dir(remote_dir.join("data")).unwrap() {
            let name = entry.unwrap().file_name();
            assert!(
                !name.to_string_lossy().ends_with(".part"),
                "stale part file left: {name:?}"
            );
        }
    }

    #[tokio::test]
    async fn corrupted_remote_copy_is_detected_and_replaced() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let key = ScanKey::new("eb-a", "pst-low", "1");
        make_local_scan(local.path(), &key, 1);

        // A remote copy of the right size but wrong bytes.
        let remote_dir = remote.path().join(key.relative_path());
        fs::create_dir_all(remote_dir.join("data")).unwrap();
        fs::write(remote_dir.join("data/p_0000.dada"), b"dat@").unwrap();

        let (mut worker, _tx, ledger) = make_worker(local.path(), remote.path(), &key, 1);
        worker.drive_scan(&key).await.unwrap();

        assert_eq!(
            fs::read(remote_dir.join("data/p_0000.dada")).unwrap(),
            b"data"
        );
        assert!(ledger.status(&key).transferred);
    }

    #[tokio::test]
    async fn growing_payload_defers_but_control_files_move() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let key = ScanKey::new("eb-a", "pst-low", "1");
        make_local_scan(local.path(), &key, 1);
        // Remove the end-of-stream sentinel: the scan is still recording.
        fs::remove_file(local.path().join(key.relative_path()).join("scan_completed")).unwrap();

        let (mut worker, _tx, _ledger) = make_worker(local.path(), remote.path(), &key, 2);
        worker.drive_scan(&key).await.unwrap();

        let remote_dir = remote.path().join(key.relative_path());
        // First observation: payload deferred, config replicated immediately.
        assert!(!remote_dir.join("data/p_0000.dada").exists());
        assert!(remote_dir.join("scan_configuration.json").is_file());

        // Second observation with unchanged size: payload moves.
        worker.drive_scan(&key).await.unwrap();
        assert!(remote_dir.join("data/p_0000.dada").is_file());
        assert!(!remote_dir.join("transfer_completed").exists());
    }

    #[tokio::test]
    async fn local_sentinel_with_missing_files_is_an_invariant_violation() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let key = ScanKey::new("eb-a", "pst-low", "1");
        make_local_scan(local.path(), &key, 1);
        fs::write(
            local.path().join(key.relative_path()).join("transfer_completed"),
            b"",
        )
        .unwrap();

        let (mut worker, _tx, _ledger) = make_worker(local.path(), remote.path(), &key, 1);
        let err = worker.drive_scan(&key).await.unwrap_err();
        assert!(matches!(err, TransferError::InvariantViolation { .. }));
    }

    #[tokio::test]
    async fn interrupted_sentinel_write_is_repushed_to_remote() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let key = ScanKey::new("eb-a", "pst-low", "1");
        make_local_scan(local.path(), &key, 1);
        let (mut worker, _tx, ledger) = make_worker(local.path(), remote.path(), &key, 1);

        worker.drive_scan(&key).await.unwrap();
        assert!(ledger.status(&key).transferred);

        // A crash between the local and remote sentinel writes leaves only
        // the local one; a fresh run must re-push the remote sentinel.
        let remote_sentinel = remote
            .path()
            .join(key.relative_path())
            .join("transfer_completed");
        fs::remove_file(&remote_sentinel).unwrap();
        let (mut worker, _tx, ledger) = make_worker(local.path(), remote.path(), &key, 1);
        worker.drive_scan(&key).await.unwrap();
        assert!(remote_sentinel.is_file());
        assert!(ledger.status(&key).transferred);
    }
}
