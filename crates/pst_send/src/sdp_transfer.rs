//! Top-level supervisor: owns the scan manager, both workers and the
//! dashboard client, and drives the discovery / registration / cleanup loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pst_send_metadata::DataProductMeta;
use tracing::{error, info, warn};

use crate::cancel::CancellationToken;
use crate::dashboard::DpdClient;
use crate::error::{Result, TransferError};
use crate::scan_manager::{ScanLedger, ScanManager};
use crate::scan_process::{ScanProcess, ScanProcessConfig};
use crate::scan_transfer::{ScanTransfer, ScanTransferConfig};
use crate::stat::{StatFileProcessor, StatProcessor};

/// Default interval of the supervisor's discovery/cleanup loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SdpTransferConfig {
    pub local_root: PathBuf,
    pub remote_root: PathBuf,
    pub subsystem_id: String,
    /// Dashboard endpoint; `None` authorizes deletion unconditionally.
    pub dashboard_url: Option<String>,
    pub poll_interval: Duration,
    pub process: ScanProcessConfig,
    pub transfer: ScanTransferConfig,
}

impl SdpTransferConfig {
    pub fn new(
        local_root: PathBuf,
        remote_root: PathBuf,
        subsystem_id: impl Into<String>,
    ) -> Self {
        Self {
            local_root,
            remote_root,
            subsystem_id: subsystem_id.into(),
            dashboard_url: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            process: ScanProcessConfig::default(),
            transfer: ScanTransferConfig::default(),
        }
    }
}

/// Supervisor for the PST to SDP transfer of one subsystem.
pub struct SdpTransfer {
    config: SdpTransferConfig,
    ledger: Arc<ScanLedger>,
    cancel: CancellationToken,
    processor: Arc<dyn StatProcessor>,
    dashboard: Option<DpdClient>,
}

impl SdpTransfer {
    pub fn new(config: SdpTransferConfig) -> Result<Self> {
        let dashboard = config
            .dashboard_url
            .as_deref()
            .map(DpdClient::new)
            .transpose()?;
        Ok(Self {
            config,
            ledger: Arc::new(ScanLedger::new()),
            cancel: CancellationToken::new(),
            processor: Arc::new(StatFileProcessor::default()),
            dashboard,
        })
    }

    /// Replace the statistics processor (embedded implementations, tests).
    pub fn with_processor(mut self, processor: Arc<dyn StatProcessor>) -> Self {
        self.processor = processor;
        self
    }

    /// Token cancelling the supervisor and both workers.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until cancelled. Workers finish their in-flight unit of work,
    /// then both are joined and the errored-scan report is logged.
    pub async fn run(self) -> Result<()> {
        info!(
            local = %self.config.local_root.display(),
            remote = %self.config.remote_root.display(),
            subsystem = %self.config.subsystem_id,
            dashboard = self.config.dashboard_url.as_deref().unwrap_or("disabled"),
            "starting PST to SDP transfer"
        );

        let (mut manager, process_rx, transfer_rx) = ScanManager::new(
            self.config.local_root.clone(),
            self.config.subsystem_id.clone(),
        );

        let process_worker = ScanProcess::new(
            self.config.local_root.clone(),
            process_rx,
            self.ledger.clone(),
            self.processor.clone(),
            self.cancel.clone(),
            self.config.process.clone(),
        );
        let transfer_worker = ScanTransfer::new(
            self.config.local_root.clone(),
            self.config.remote_root.clone(),
            transfer_rx,
            self.ledger.clone(),
            self.cancel.clone(),
            self.config.transfer.clone(),
        );
        let process_handle = tokio::spawn(process_worker.run());
        let transfer_handle = tokio::spawn(transfer_worker.run());

        while !self.cancel.is_cancelled() {
            manager.refresh(&self.ledger);
            manager.publish(&self.ledger);
            self.register_completed(&manager).await;
            manager.delete_completed(&self.ledger);
            if self.cancel.sleep(self.config.poll_interval).await {
                break;
            }
        }

        info!("shutting down, waiting for workers to finish in-flight work");
        if let Err(e) = process_handle.await {
            error!(error = %e, "processing worker panicked");
        }
        if let Err(e) = transfer_handle.await {
            error!(error = %e, "transfer worker panicked");
        }

        let errored = self.ledger.errored_scans();
        if errored.is_empty() {
            info!("shutdown complete, no errored scans");
        } else {
            for (key, reason) in &errored {
                warn!(scan = %key, reason, "scan errored, left for operator recovery");
            }
            info!(count = errored.len(), "shutdown complete with errored scans");
        }
        Ok(())
    }

    /// Register every locally complete, not-yet-registered scan with the
    /// dashboard. With no dashboard configured, registration is authorized
    /// unconditionally. A failing dashboard leaves scans undeleted; the next
    /// poll retries.
    async fn register_completed(&self, manager: &ScanManager) {
        for key in manager.scan_keys() {
            if self.cancel.is_cancelled() {
                return;
            }
            let status = self.ledger.status(&key);
            if status.registered || status.errored.is_some() {
                continue;
            }
            let view = manager.local_scan(&key);
            if !view.is_complete() {
                continue;
            }
            let Some(client) = &self.dashboard else {
                self.ledger.mark_registered(&key);
                continue;
            };

            let payload = match DataProductMeta::load(&view.scan().metadata_path())
                .and_then(|meta| meta.to_dashboard_json())
            {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(scan = %key, error = %e, "cannot read metadata document for registration");
                    continue;
                }
            };
            match client.register(&payload, &self.cancel).await {
                Ok(()) => {
                    info!(scan = %key, "registered with data product dashboard");
                    self.ledger.mark_registered(&key);
                }
                Err(TransferError::Cancelled) => return,
                Err(e) => {
                    // The scan stays on disk; the next poll retries.
                    warn!(scan = %key, error = %e, "dashboard registration failed, scan left undeleted");
                }
            }
        }
    }
}
