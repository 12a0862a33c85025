//! Data product metadata document model for PST voltage recorder scans.
//!
//! Every scan directory carries a `data_product.yaml` document describing the
//! recorded data product: observation context, generating software,
//! per-directory file totals, ObsCore catalogue fields and the processing
//! section that tracks statistics generation. The document is the unit
//! registered with the SDP Data Product Dashboard once the scan has been
//! replicated.
//!
//! Writers must go through [`DataProductMeta::save_atomic`] so that readers
//! never observe a torn document.

pub mod builder;
pub mod header;

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use builder::MetaDataBuilder;
pub use header::ObsHeader;

/// Schema identifier written into every document.
pub const INTERFACE: &str = "http://schema.skao.int/ska-data-product-meta/0.1";

/// Name of the metadata document inside a scan directory.
pub const METADATA_FILE_NAME: &str = "data_product.yaml";

pub type Result<T> = std::result::Result<T, MetadataError>;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MetadataError {
    pub fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Observation context passed through from the telescope control system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default)]
    pub observer: String,
    #[serde(default = "default_intent")]
    pub intent: String,
    #[serde(default)]
    pub notes: String,
}

fn default_intent() -> String {
    "Tied-array beam observation".to_string()
}

impl Default for Context {
    fn default() -> Self {
        Self {
            observer: String::new(),
            intent: default_intent(),
            notes: String::new(),
        }
    }
}

/// Generating software identification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub version: String,
}

/// One entry of the files block: a per-directory size total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTotals {
    pub description: String,
    pub path: String,
    pub size: u64,
    pub status: String,
}

/// IVOA ObsCore catalogue fields for the scan.
///
/// Coordinate strings (`s_ra`, `s_dec`) are carried verbatim from the
/// recorder header; no coordinate-frame conversion is performed here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsCore {
    pub dataproduct_type: String,
    pub dataproduct_subtype: String,
    pub calib_level: u8,
    #[serde(default)]
    pub obs_id: String,
    #[serde(default)]
    pub access_estsize: u64,
    #[serde(default)]
    pub target_name: String,
    #[serde(default)]
    pub s_ra: String,
    #[serde(default)]
    pub s_dec: String,
    #[serde(default)]
    pub t_min: f64,
    #[serde(default)]
    pub t_max: f64,
    #[serde(default)]
    pub t_resolution: f64,
    #[serde(default)]
    pub t_exptime: f64,
    pub facility_name: String,
    #[serde(default)]
    pub instrument_name: String,
    #[serde(default)]
    pub pol_xel: u32,
    pub pol_states: String,
    #[serde(default)]
    pub em_xel: u32,
    pub em_unit: String,
    #[serde(default)]
    pub em_min: f64,
    #[serde(default)]
    pub em_max: f64,
    pub em_res_power: String,
    #[serde(default)]
    pub em_resolution: f64,
    pub o_ucd: String,
}

impl Default for ObsCore {
    fn default() -> Self {
        Self {
            dataproduct_type: "timeseries".to_string(),
            dataproduct_subtype: "voltages".to_string(),
            calib_level: 0,
            obs_id: String::new(),
            access_estsize: 0,
            target_name: String::new(),
            s_ra: String::new(),
            s_dec: String::new(),
            t_min: 0.0,
            t_max: 0.0,
            t_resolution: 0.0,
            t_exptime: 0.0,
            facility_name: "SKA-Observatory".to_string(),
            instrument_name: String::new(),
            pol_xel: 0,
            pol_states: "null".to_string(),
            em_xel: 0,
            em_unit: "Hz".to_string(),
            em_min: 0.0,
            em_max: 0.0,
            em_res_power: "null".to_string(),
            em_resolution: 0.0,
            o_ucd: "null".to_string(),
        }
    }
}

/// Per-pair statistics summary recorded as each stat file is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairStat {
    /// Suffix key shared by the data and weights file.
    pub key: String,
    /// Scan-relative path of the generated stat file.
    pub stat_path: String,
    pub data_size: u64,
    pub weights_size: u64,
}

/// Bookkeeping for statistics generation over the scan's file pairs.
///
/// `expected_pairs` is recorded once the end-of-stream sentinel has been
/// observed; processing is complete when `completed` is set and the processed
/// count matches it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Processing {
    #[serde(default)]
    pub expected_pairs: Option<u32>,
    #[serde(default)]
    pub processed_pairs: u32,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub finalized_at: Option<String>,
    #[serde(default)]
    pub pairs: Vec<PairStat>,
}

impl Processing {
    /// Record a successfully generated stat file for one pair.
    pub fn record_pair(&mut self, stat: PairStat) {
        if self.pairs.iter().any(|p| p.key == stat.key) {
            return;
        }
        self.pairs.push(stat);
        self.processed_pairs = self.pairs.len() as u32;
    }

    /// Mark processing finished for `expected` pairs.
    pub fn finalize(&mut self, expected: u32, now: chrono::DateTime<chrono::Utc>) {
        self.expected_pairs = Some(expected);
        self.completed = true;
        self.finalized_at = Some(now.to_rfc3339());
    }

    /// True when processing has been finalized and the counts agree.
    pub fn is_complete(&self, observed_pairs: u32) -> bool {
        self.completed
            && self.expected_pairs == Some(observed_pairs)
            && self.processed_pairs == observed_pairs
    }
}

/// The `data_product.yaml` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataProductMeta {
    pub interface: String,
    #[serde(default)]
    pub execution_block: String,
    #[serde(default)]
    pub context: Context,
    #[serde(default)]
    pub config: Config,
    #[serde(default)]
    pub files: Vec<FileTotals>,
    #[serde(default)]
    pub obscore: ObsCore,
    #[serde(default)]
    pub processing: Processing,
}

impl Default for DataProductMeta {
    fn default() -> Self {
        Self {
            interface: INTERFACE.to_string(),
            execution_block: String::new(),
            context: Context::default(),
            config: Config::default(),
            files: Vec::new(),
            obscore: ObsCore::default(),
            processing: Processing::default(),
        }
    }
}

impl DataProductMeta {
    /// Read and parse a document from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| MetadataError::io(path, e))?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Load the document at `path`, or a default document if none exists yet.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Write the document to `path` via a sibling temp file and rename, so a
    /// concurrent reader sees either the old or the new document, never a
    /// partial one.
    pub fn save_atomic(&self, path: &Path) -> Result<()> {
        let yaml = self.to_yaml()?;
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, yaml.as_bytes()).map_err(|e| MetadataError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| MetadataError::io(path, e))?;
        Ok(())
    }

    /// The JSON body submitted to the Data Product Dashboard.
    pub fn to_dashboard_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
