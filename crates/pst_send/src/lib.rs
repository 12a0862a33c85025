//! PST voltage recorder to SDP data product transfer engine.
//!
//! Scans recorded by the voltage recorder land under
//! `<local>/<eb_id>/<subsystem_id>/<scan_id>/`. For every scan this crate
//! generates the missing statistics and metadata artifacts, replicates the
//! scan to the remote SDP tree with checksum verification, registers the
//! completed product with the Data Product Dashboard and deletes the local
//! copy once it is safe to do so.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    watch     ┌──────────────┐   subprocess   ┌─────────────┐
//! │ ScanManager  │─────────────▶│ ScanProcess  │───────────────▶│ stat binary │
//! │ (discovery,  │              │ (stat files, │                └─────────────┘
//! │  ordering,   │              │  metadata)   │
//! │  deletion)   │    watch     ├──────────────┤    chunked copy + verify
//! │              │─────────────▶│ ScanTransfer │───────────────▶ <remote>/...
//! └──────▲───────┘              └──────────────┘
//!        │ poll / register / delete
//! ┌──────┴───────┐    HTTP
//! │ SdpTransfer  │───────────▶ Data Product Dashboard
//! └──────────────┘
//! ```
//!
//! The filesystem is the authoritative shared state: both workers rebuild
//! their view of the current scan from `stat(2)` on every cycle, so a crash
//! at any point recovers by re-observation. The workers proceed
//! independently over the same scan and synchronize only at the
//! `transfer_completed` gate.

pub mod cancel;
pub mod dashboard;
pub mod error;
pub mod file;
pub mod quiesce;
pub mod retry;
pub mod scan;
pub mod scan_manager;
pub mod scan_process;
pub mod scan_transfer;
pub mod sdp_transfer;
pub mod stat;
pub mod voltage_recorder_scan;

pub use cancel::CancellationToken;
pub use dashboard::DpdClient;
pub use error::{Result, TransferError};
pub use file::{FileKind, VoltageRecorderFile};
pub use scan::{Scan, ScanKey};
pub use scan_manager::{ScanLedger, ScanManager, ScanStatus};
pub use scan_process::{ScanProcess, ScanProcessConfig};
pub use scan_transfer::{ScanTransfer, ScanTransferConfig};
pub use sdp_transfer::{SdpTransfer, SdpTransferConfig};
pub use stat::{StatFileProcessor, StatProcessor};
pub use voltage_recorder_scan::{FilePair, TransferItem, VoltageRecorderScan};
