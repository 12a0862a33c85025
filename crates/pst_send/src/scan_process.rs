//! Processing worker: drives statistics generation for the current scan and
//! finalizes its metadata document.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pst_send_metadata::{DataProductMeta, MetaDataBuilder, ObsHeader, PairStat};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::error::{Result, TransferError};
use crate::quiesce::{QuiescenceTracker, DEFAULT_QUIESCENCE_WINDOW};
use crate::retry::Backoff;
use crate::scan::ScanKey;
use crate::scan_manager::ScanLedger;
use crate::stat::StatProcessor;
use crate::voltage_recorder_scan::{FilePair, VoltageRecorderScan};

#[derive(Debug, Clone)]
pub struct ScanProcessConfig {
    /// Delay between processing cycles when there is nothing to do.
    pub loop_wait: Duration,
    /// Consecutive unchanged-size observations before a pair is processable.
    pub quiescence_window: u32,
    /// Total attempts for one stat invocation (first try plus retries).
    pub max_stat_attempts: u32,
}

impl Default for ScanProcessConfig {
    fn default() -> Self {
        Self {
            loop_wait: Duration::from_secs(2),
            quiescence_window: DEFAULT_QUIESCENCE_WINDOW,
            max_stat_attempts: 5,
        }
    }
}

/// Long-lived worker generating stat files for the current scan.
pub struct ScanProcess {
    local_root: PathBuf,
    current_rx: watch::Receiver<Option<ScanKey>>,
    ledger: Arc<ScanLedger>,
    processor: Arc<dyn StatProcessor>,
    cancel: CancellationToken,
    config: ScanProcessConfig,
    tracker: QuiescenceTracker,
}

impl ScanProcess {
    pub fn new(
        local_root: PathBuf,
        current_rx: watch::Receiver<Option<ScanKey>>,
        ledger: Arc<ScanLedger>,
        processor: Arc<dyn StatProcessor>,
        cancel: CancellationToken,
        config: ScanProcessConfig,
    ) -> Self {
        let tracker = QuiescenceTracker::new(config.quiescence_window);
        Self {
            local_root,
            current_rx,
            ledger,
            processor,
            cancel,
            config,
            tracker,
        }
    }

    pub async fn run(mut self) {
        info!("processing worker started");
        while !self.cancel.is_cancelled() {
            let current = self.current_rx.borrow().clone();
            if let Some(key) = current {
                if let Err(e) = self.drive_scan(&key).await {
                    match e {
                        TransferError::Cancelled => break,
                        TransferError::NotFound { ref path } => {
                            // Expected file vanished mid-operation; the next
                            // cycle re-enumerates.
                            debug!(scan = %key, path = %path.display(), "artifact vanished, re-enumerating next cycle");
                        }
                        e => {
                            self.ledger.mark_errored(&key, e.to_string());
                        }
                    }
                }
            }
            if self.cancel.sleep(self.config.loop_wait).await {
                break;
            }
        }
        info!("processing worker stopped");
    }

    /// One processing cycle over the current scan: generate stats for every
    /// quiescent unprocessed pair, then finalize once recording has ended
    /// and no pairs remain.
    async fn drive_scan(&mut self, key: &ScanKey) -> Result<()> {
        if self.ledger.status(key).processed {
            return Ok(());
        }
        let view = VoltageRecorderScan::new(self.local_root.clone(), key.clone());
        if !view.scan().exists() {
            return Ok(());
        }
        if view.is_processing_completed() {
            // A previous run finalized this scan; adopt it without touching
            // the metadata document again.
            self.ledger.mark_processed(key);
            return Ok(());
        }
        self.tracker.retain_under(view.scan_path());

        for pair in view.unprocessed_pairs()? {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let data_stable = self.tracker.observe(pair.data.path(), pair.data.size());
            let weights_stable = self.tracker.observe(pair.weights.path(), pair.weights.size());
            if !(data_stable && weights_stable) {
                debug!(scan = %key, pair = %pair.key, "pair still growing, deferring");
                continue;
            }

            self.process_pair(&view, &pair).await?;
            self.record_pair(&view, &pair)?;
            self.tracker.forget(pair.data.path());
            self.tracker.forget(pair.weights.path());
        }

        if view.is_scan_completed() && view.unprocessed_pairs()?.is_empty() {
            self.finalize(&view)?;
            self.ledger.mark_processed(key);
            info!(scan = %key, "processing complete");
        }
        Ok(())
    }

    /// Invoke the statistics binary for one pair, retrying transient
    /// failures with exponential backoff.
    async fn process_pair(&self, view: &VoltageRecorderScan, pair: &FilePair) -> Result<()> {
        let stat_path = view.scan_path().join(pair.stat_relative_path());
        let mut backoff = Backoff::new(self.config.max_stat_attempts);
        loop {
            match self
                .processor
                .generate(pair.data.path(), pair.weights.path(), &stat_path, &self.cancel)
                .await
            {
                Ok(()) => {
                    info!(scan = %view.key(), pair = %pair.key, "stat file generated");
                    return Ok(());
                }
                Err(e) if e.is_retryable() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            scan = %view.key(),
                            pair = %pair.key,
                            error = %e,
                            retry_in = ?delay,
                            "stat generation failed, retrying"
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

    /// Append the pair's stat summary to the metadata processing section.
    fn record_pair(&self, view: &VoltageRecorderScan, pair: &FilePair) -> Result<()> {
        let path = view.scan().metadata_path();
        let mut meta = DataProductMeta::load_or_default(&path)?;
        meta.processing.record_pair(PairStat {
            key: pair.key.clone(),
            stat_path: pair.stat_relative_path().to_string_lossy().into_owned(),
            data_size: pair.data.size(),
            weights_size: pair.weights.size(),
        });
        meta.save_atomic(&path)?;
        Ok(())
    }

    /// Build the full metadata document and mark processing complete. This
    /// is the worker's last write to the scan.
    fn finalize(&self, view: &VoltageRecorderScan) -> Result<()> {
        let path = view.scan().metadata_path();
        let mut processing = DataProductMeta::load_or_default(&path)?.processing;

        // Stat files present without a ledger entry (a previous run crashed
        // between generation and recording) are reconciled here.
        let pairs = view.enumerate_pairs()?;
        for pair in &pairs {
            if pair.stat.is_some() {
                processing.record_pair(PairStat {
                    key: pair.key.clone(),
                    stat_path: pair.stat_relative_path().to_string_lossy().into_owned(),
                    data_size: pair.data.size(),
                    weights_size: pair.weights.size(),
                });
            }
        }
        processing.finalize(pairs.len() as u32, chrono::Utc::now());

        let key = view.key();
        let mut builder = MetaDataBuilder::new(&key.eb_id, &key.scan_id);
        match ObsHeader::parse(&view.scan().obs_header_path()) {
            Ok(header) => builder = builder.with_header(header),
            Err(e) => {
                debug!(scan = %key, error = %e, "no usable obs.header, metadata keeps defaults")
            }
        }
        let (data_total, weights_total, stat_total, pair_count) = view.artifact_totals()?;
        let mut meta = builder
            .with_file_totals(data_total, weights_total, stat_total, pair_count)
            .build();
        meta.processing = processing;
        meta.save_atomic(&path)?;
        Ok(())
    }
}
