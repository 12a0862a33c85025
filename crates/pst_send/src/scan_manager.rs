//! Scan discovery, ordering and the current-scan handoffs to both workers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Result, TransferError};
use crate::scan::ScanKey;
use crate::voltage_recorder_scan::VoltageRecorderScan;

/// Per-scan worker progress, kept in memory and rebuilt from the filesystem
/// on restart. The filesystem stays authoritative; this ledger only records
/// what the workers and the supervisor have confirmed this run.
#[derive(Debug, Clone, Default)]
pub struct ScanStatus {
    pub processed: bool,
    pub transferred: bool,
    pub registered: bool,
    pub errored: Option<String>,
}

#[derive(Debug, Default)]
pub struct ScanLedger {
    inner: Mutex<HashMap<ScanKey, ScanStatus>>,
}

impl ScanLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, key: &ScanKey) -> ScanStatus {
        self.inner
            .lock()
            .expect("ledger lock poisoned")
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    fn update(&self, key: &ScanKey, apply: impl FnOnce(&mut ScanStatus)) {
        let mut inner = self.inner.lock().expect("ledger lock poisoned");
        apply(inner.entry(key.clone()).or_default());
    }

    pub fn mark_processed(&self, key: &ScanKey) {
        self.update(key, |s| s.processed = true);
    }

    pub fn mark_transferred(&self, key: &ScanKey) {
        self.update(key, |s| s.transferred = true);
    }

    pub fn mark_registered(&self, key: &ScanKey) {
        self.update(key, |s| s.registered = true);
    }

    pub fn mark_errored(&self, key: &ScanKey, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(scan = %key, reason, "scan marked errored");
        self.update(key, |s| s.errored = Some(reason));
    }

    pub fn is_errored(&self, key: &ScanKey) -> bool {
        self.status(key).errored.is_some()
    }

    pub fn forget(&self, key: &ScanKey) {
        self.inner
            .lock()
            .expect("ledger lock poisoned")
            .remove(key);
    }

    /// Errored scans with reasons, for the shutdown report.
    pub fn errored_scans(&self) -> Vec<(ScanKey, String)> {
        let inner = self.inner.lock().expect("ledger lock poisoned");
        let mut errored: Vec<_> = inner
            .iter()
            .filter_map(|(key, status)| {
                status
                    .errored
                    .as_ref()
                    .map(|reason| (key.clone(), reason.clone()))
            })
            .collect();
        errored.sort_by(|a, b| a.0.cmp(&b.0));
        errored
    }
}

#[derive(Debug, Clone)]
struct DiscoveredScan {
    key: ScanKey,
    /// Directory mtime captured at first observation; gives a stable
    /// oldest-first order.
    mtime: SystemTime,
}

/// Discovers scans under `<local_root>/<eb-*>/<subsystem>/`, keeps them in
/// oldest-first order, publishes the current scan to each worker through a
/// single-slot refresh-latest handoff, and deletes fully finished scans.
pub struct ScanManager {
    local_root: PathBuf,
    subsystem_id: String,
    scans: Vec<DiscoveredScan>,
    process_tx: watch::Sender<Option<ScanKey>>,
    transfer_tx: watch::Sender<Option<ScanKey>>,
}

impl ScanManager {
    pub fn new(
        local_root: PathBuf,
        subsystem_id: impl Into<String>,
    ) -> (
        Self,
        watch::Receiver<Option<ScanKey>>,
        watch::Receiver<Option<ScanKey>>,
    ) {
        let (process_tx, process_rx) = watch::channel(None);
        let (transfer_tx, transfer_rx) = watch::channel(None);
        (
            Self {
                local_root,
                subsystem_id: subsystem_id.into(),
                scans: Vec::new(),
                process_tx,
                transfer_tx,
            },
            process_rx,
            transfer_rx,
        )
    }

    /// Build a local-side view of a known scan.
    pub fn local_scan(&self, key: &ScanKey) -> VoltageRecorderScan {
        VoltageRecorderScan::new(self.local_root.clone(), key.clone())
    }

    /// Keys of all known scans, oldest first.
    pub fn scan_keys(&self) -> Vec<ScanKey> {
        self.scans.iter().map(|s| s.key.clone()).collect()
    }

    /// Rescan the filesystem: add newly appeared scans, drop vanished ones,
    /// keep the list ordered by first-observed directory mtime with the
    /// relative path as tie-break.
    pub fn refresh(&mut self, ledger: &ScanLedger) {
        let found = match self.discover() {
            Ok(found) => found,
            Err(e) => {
                warn!(root = %self.local_root.display(), error = %e, "scan discovery failed");
                return;
            }
        };

        for (key, mtime) in &found {
            if !self.scans.iter().any(|s| &s.key == key) {
                debug!(scan = %key, "adding new scan");
                self.scans.push(DiscoveredScan {
                    key: key.clone(),
                    mtime: *mtime,
                });
            }
        }

        self.scans.retain(|scan| {
            let still_there = found.iter().any(|(key, _)| key == &scan.key);
            if !still_there {
                debug!(scan = %scan.key, "removing vanished scan");
                ledger.forget(&scan.key);
            }
            still_there
        });

        self.scans
            .sort_by(|a, b| a.mtime.cmp(&b.mtime).then_with(|| a.key.cmp(&b.key)));
    }

    fn discover(&self) -> Result<Vec<(ScanKey, SystemTime)>> {
        let mut found = Vec::new();
        let entries = std::fs::read_dir(&self.local_root)
            .map_err(|e| TransferError::io(&self.local_root, e))?;
        for eb_entry in entries {
            let eb_entry = match eb_entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(root = %self.local_root.display(), error = %e, "unreadable entry, skipping this cycle");
                    continue;
                }
            };
            let eb_id = eb_entry.file_name().to_string_lossy().to_string();
            if !eb_id.starts_with("eb-") || !eb_entry.path().is_dir() {
                continue;
            }
            let subsystem_dir = eb_entry.path().join(&self.subsystem_id);
            let scan_entries = match std::fs::read_dir(&subsystem_dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(dir = %subsystem_dir.display(), error = %e, "unreadable subsystem directory, skipping this cycle");
                    continue;
                }
            };
            for scan_entry in scan_entries {
                let scan_entry = match scan_entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(dir = %subsystem_dir.display(), error = %e, "unreadable scan entry, skipping this cycle");
                        continue;
                    }
                };
                let path = scan_entry.path();
                if !path.is_dir() {
                    continue;
                }
                let scan_id = scan_entry.file_name().to_string_lossy().to_string();
                let mtime = match path.metadata().and_then(|m| m.modified()) {
                    Ok(mtime) => mtime,
                    Err(e) => {
                        warn!(dir = %path.display(), error = %e, "cannot stat scan directory, skipping this cycle");
                        continue;
                    }
                };
                found.push((
                    ScanKey::new(eb_id.clone(), self.subsystem_id.clone(), scan_id),
                    mtime,
                ));
            }
        }
        Ok(found)
    }

    /// Publish the current scan for each worker: the oldest scan that has
    /// not reached that worker's terminal state and is not errored.
    pub fn publish(&self, ledger: &ScanLedger) {
        let process_current = self
            .scans
            .iter()
            .map(|s| &s.key)
            .find(|key| {
                let status = ledger.status(key);
                !status.processed && status.errored.is_none()
            })
            .cloned();
        let transfer_current = self
            .scans
            .iter()
            .map(|s| &s.key)
            .find(|key| {
                let status = ledger.status(key);
                !status.transferred && status.errored.is_none()
            })
            .cloned();

        self.process_tx.send_if_modified(|slot| {
            if *slot != process_current {
                *slot = process_current;
                true
            } else {
                false
            }
        });
        self.transfer_tx.send_if_modified(|slot| {
            if *slot != transfer_current {
                *slot = transfer_current;
                true
            } else {
                false
            }
        });
    }

    /// Delete every scan whose local view is complete and whose dashboard
    /// registration has been confirmed. Returns the deleted keys.
    pub fn delete_completed(&mut self, ledger: &ScanLedger) -> Vec<ScanKey> {
        let mut deleted = Vec::new();
        for scan in &self.scans {
            let status = ledger.status(&scan.key);
            if status.errored.is_some() || !status.registered {
                continue;
            }
            let view = VoltageRecorderScan::new(self.local_root.clone(), scan.key.clone());
            if !view.is_complete() {
                continue;
            }
            match view.delete() {
                Ok(()) => {
                    info!(scan = %scan.key, "deleted completed scan");
                    ledger.forget(&scan.key);
                    deleted.push(scan.key.clone());
                }
                Err(e) => {
                    warn!(scan = %scan.key, error = %e, "failed to delete completed scan");
                }
            }
        }
        self.scans
            .retain(|scan| !deleted.contains(&scan.key));
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use std::fs;
    use std::path::Path;

    fn make_scan_dir(root: &Path, eb: &str, subsystem: &str, scan: &str, mtime_secs: i64) {
        let dir = root.join(eb).join(subsystem).join(scan);
        fs::create_dir_all(&dir).unwrap();
        set_file_mtime(&dir, FileTime::from_unix_time(mtime_secs, 0)).unwrap();
    }

    #[test]
    fn discovery_orders_scans_oldest_first() {
        let root = tempfile::tempdir().unwrap();
        make_scan_dir(root.path(), "eb-b", "pst-low", "2", 2_000);
        make_scan_dir(root.path(), "eb-a", "pst-low", "1", 1_000);
        // Another subsystem is invisible to this manager.
        make_scan_dir(root.path(), "eb-a", "pst-mid", "9", 500);
        // Non-execution-block directories are ignored.
        fs::create_dir_all(root.path().join("lost+found")).unwrap();

        let ledger = ScanLedger::new();
        let (mut manager, _prx, _trx) = ScanManager::new(root.path().to_path_buf(), "pst-low");
        manager.refresh(&ledger);

        let keys = manager.scan_keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].eb_id, "eb-a");
        assert_eq!(keys[1].eb_id, "eb-b");
    }

    #[test]
    fn publish_hands_each_worker_the_oldest_unfinished_scan() {
        let root = tempfile::tempdir().unwrap();
        make_scan_dir(root.path(), "eb-a", "pst-low", "1", 1_000);
        make_scan_dir(root.path(), "eb-a", "pst-low", "2", 2_000);

        let ledger = ScanLedger::new();
        let (mut manager, process_rx, transfer_rx) =
            ScanManager::new(root.path().to_path_buf(), "pst-low");
        manager.refresh(&ledger);
        manager.publish(&ledger);

        let first = ScanKey::new("eb-a", "pst-low", "1");
        let second = ScanKey::new("eb-a", "pst-low", "2");
        assert_eq!(process_rx.borrow().as_ref(), Some(&first));
        assert_eq!(transfer_rx.borrow().as_ref(), Some(&first));

        // The process worker finishes scan 1; its slot advances while the
        // transfer slot stays put.
        ledger.mark_processed(&first);
        manager.publish(&ledger);
        assert_eq!(process_rx.borrow().as_ref(), Some(&second));
        assert_eq!(transfer_rx.borrow().as_ref(), Some(&first));
    }

    #[test]
    fn errored_scans_are_skipped_in_handoffs() {
        let root = tempfile::tempdir().unwrap();
        make_scan_dir(root.path(), "eb-a", "pst-low", "1", 1_000);
        make_scan_dir(root.path(), "eb-a", "pst-low", "2", 2_000);

        let ledger = ScanLedger::new();
        let (mut manager, process_rx, transfer_rx) =
            ScanManager::new(root.path().to_path_buf(), "pst-low");
        manager.refresh(&ledger);

        let first = ScanKey::new("eb-a", "pst-low", "1");
        ledger.mark_errored(&first, "stat binary fatal exit");
        manager.publish(&ledger);

        let second = ScanKey::new("eb-a", "pst-low", "2");
        assert_eq!(process_rx.borrow().as_ref(), Some(&second));
        assert_eq!(transfer_rx.borrow().as_ref(), Some(&second));
        assert_eq!(ledger.errored_scans().len(), 1);
    }

    #[test]
    fn vanished_scans_are_dropped_from_list_and_ledger() {
        let root = tempfile::tempdir().unwrap();
        make_scan_dir(root.path(), "eb-a", "pst-low", "1", 1_000);

        let ledger = ScanLedger::new();
        let (mut manager, _prx, _trx) = ScanManager::new(root.path().to_path_buf(), "pst-low");
        manager.refresh(&ledger);
        let key = ScanKey::new("eb-a", "pst-low", "1");
        ledger.mark_processed(&key);
        assert_eq!(manager.scan_keys().len(), 1);

        fs::remove_dir_all(root.path().join("eb-a")).unwrap();
        manager.refresh(&ledger);
        assert!(manager.scan_keys().is_empty());
        assert!(!ledger.status(&key).processed);
    }

    #[test]
    fn deletion_requires_registration() {
        let root = tempfile::tempdir().unwrap();
        make_scan_dir(root.path(), "eb-a", "pst-low", "1", 1_000);
        // An empty completed scan: sentinels plus a finalized document.
        let scan_dir = root.path().join("eb-a/pst-low/1");
        fs::write(scan_dir.join("scan_completed"), b"").unwrap();
        fs::write(scan_dir.join("transfer_completed"), b"").unwrap();
        let mut meta = pst_send_metadata::DataProductMeta::default();
        meta.processing.finalize(0, chrono::Utc::now());
        meta.save_atomic(&scan_dir.join("data_product.yaml")).unwrap();

        let ledger = ScanLedger::new();
        let (mut manager, _prx, _trx) = ScanManager::new(root.path().to_path_buf(), "pst-low");
        manager.refresh(&ledger);

        // Complete but unregistered: kept.
        assert!(manager.delete_completed(&ledger).is_empty());
        assert!(scan_dir.exists());

        let key = ScanKey::new("eb-a", "pst-low", "1");
        ledger.mark_registered(&key);
        let deleted = manager.delete_completed(&ledger);
        assert_eq!(deleted, vec![key]);
        assert!(!scan_dir.exists());
    }
}
