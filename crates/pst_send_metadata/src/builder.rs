//! Assembles a [`DataProductMeta`] document from a scan's recorder header and
//! observed file totals.

use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::{DataProductMeta, FileTotals, ObsHeader, INTERFACE};

/// Format of the recorder's UTC_START timestamps.
const UTC_START_FORMAT: &str = "%Y-%m-%d-%H:%M:%S";

/// Image identifier of the generating software, recorded in the config block.
const CONFIG_IMAGE: &str = "artefact.skao.int/ska-pst/ska-pst";
const CONFIG_VERSION: &str = "0.1.3";

/// Builder for the metadata document written at processing finalization.
#[derive(Debug, Default)]
pub struct MetaDataBuilder {
    eb_id: String,
    scan_id: String,
    header: Option<ObsHeader>,
    data_total: u64,
    weights_total: u64,
    stat_total: u64,
    pair_count: u32,
}

impl MetaDataBuilder {
    pub fn new(eb_id: impl Into<String>, scan_id: impl Into<String>) -> Self {
        Self {
            eb_id: eb_id.into(),
            scan_id: scan_id.into(),
            ..Self::default()
        }
    }

    /// Attach the parsed `obs.header`; without one the science fields keep
    /// their defaults and the pipeline still completes.
    pub fn with_header(mut self, header: ObsHeader) -> Self {
        self.header = Some(header);
        self
    }

    /// Observed byte totals per artifact directory.
    pub fn with_file_totals(
        mut self,
        data_total: u64,
        weights_total: u64,
        stat_total: u64,
        pair_count: u32,
    ) -> Self {
        self.data_total = data_total;
        self.weights_total = weights_total;
        self.stat_total = stat_total;
        self.pair_count = pair_count;
        self
    }

    pub fn build(self) -> DataProductMeta {
        let mut meta = DataProductMeta {
            interface: INTERFACE.to_string(),
            execution_block: self.eb_id.clone(),
            ..DataProductMeta::default()
        };

        meta.config.image = CONFIG_IMAGE.to_string();
        meta.config.version = CONFIG_VERSION.to_string();

        meta.files = vec![
            FileTotals {
                description: "Channelised voltage data raw files".to_string(),
                path: "data".to_string(),
                size: self.data_total,
                status: "done".to_string(),
            },
            FileTotals {
                description: "Channelised weights raw files".to_string(),
                path: "weights".to_string(),
                size: self.weights_total,
                status: "done".to_string(),
            },
            FileTotals {
                description: "Data statistics files".to_string(),
                path: "stat".to_string(),
                size: self.stat_total,
                status: "done".to_string(),
            },
        ];

        meta.obscore.obs_id = self.scan_id.clone();

        if let Some(header) = &self.header {
            meta.context.observer = header.get_or_empty("OBSERVER");
            if let Some(intent) = header.get("INTENT") {
                meta.context.intent = intent.to_string();
            }
            meta.context.notes = header.get_or_empty("NOTES");

            let freq = header.get_f64("FREQ");
            let bw = header.get_f64("BW");
            let nchan = header.get_u32("NCHAN");
            let tsamp = header.get_f64("TSAMP");
            let hdr_size = header.get_u64("HDR_SIZE");

            meta.obscore.target_name = header.get_or_empty("SOURCE");
            meta.obscore.s_ra = header.get_or_empty("STT_CRD1");
            meta.obscore.s_dec = header.get_or_empty("STT_CRD2");
            meta.obscore.instrument_name = header
                .get_or_empty("TELESCOPE")
                .to_uppercase()
                .replace("SKA", "SKA-");
            meta.obscore.pol_xel = header.get_u32("NPOL");
            meta.obscore.em_xel = nchan;
            meta.obscore.em_min = (freq - bw / 2.0) * 1e6;
            meta.obscore.em_max = (freq + bw / 2.0) * 1e6;
            if nchan > 0 {
                meta.obscore.em_resolution = (bw / nchan as f64) * 1e6;
            }

            // The sample interval is in microseconds.
            let t_span = tsamp / 1e6;
            meta.obscore.t_resolution = t_span;
            meta.obscore.t_exptime = tsamp;
            if let Some(t_min) = utc_to_mjd(header.get_or_empty("UTC_START").as_str()) {
                meta.obscore.t_min = t_min;
                meta.obscore.t_max = t_min + t_span / 86_400.0;
            }

            let header_total = hdr_size * u64::from(self.pair_count);
            meta.obscore.access_estsize = self.data_total.saturating_sub(header_total);
        } else {
            meta.obscore.access_estsize = self.data_total;
        }

        meta
    }
}

/// Convert a recorder UTC_START timestamp to Modified Julian Date.
fn utc_to_mjd(utc_start: &str) -> Option<f64> {
    let naive = NaiveDateTime::parse_from_str(utc_start, UTC_START_FORMAT).ok()?;
    let when = Utc.from_utc_datetime(&naive);
    let epoch = Utc.from_utc_datetime(
        &NaiveDate::from_ymd_opt(2000, 1, 1)?
            .and_hms_opt(0, 0, 0)?,
    );
    let days_since_2000 = (when - epoch).num_seconds() as f64 / 86_400.0;
    // JD of 2000-01-01T00:00 is 2451544.5; MJD = JD - 2400000.5.
    Some(days_since_2000 + 2_451_544.5 - 2_400_000.5)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> ObsHeader {
        ObsHeader::parse_str(
            "HDR_SIZE 4096\nTELESCOPE SKALow\nSOURCE J0437-4715\nSCAN_ID 42\n\
             UTC_START 2024-01-01-00:00:00\nOBSERVER jdoe\nFREQ 200.0\nBW 4.0\n\
             NCHAN 400\nNPOL 2\nTSAMP 207.36\nSTT_CRD1 04:37:15.8\nSTT_CRD2 -47:15:09.1\n",
        )
    }

    #[test]
    fn utc_start_maps_to_known_mjd() {
        // 2024-01-01T00:00:00 UTC is MJD 60310.
        let mjd = utc_to_mjd("2024-01-01-00:00:00").unwrap();
        assert!((mjd - 60310.0).abs() < 1e-9, "mjd={mjd}");
    }

    #[test]
    fn malformed_utc_start_is_rejected() {
        assert!(utc_to_mjd("not-a-date").is_none());
        assert!(utc_to_mjd("").is_none());
    }

    #[test]
    fn builds_obscore_from_header() {
        let meta = MetaDataBuilder::new("eb-m001-20240101-00001", "42")
            .with_header(sample_header())
            .with_file_totals(1_000_000, 10_000, 2_000, 2)
            .build();

        assert_eq!(meta.execution_block, "eb-m001-20240101-00001");
        assert_eq!(meta.obscore.obs_id, "42");
        assert_eq!(meta.obscore.target_name, "J0437-4715");
        assert_eq!(meta.obscore.instrument_name, "SKA-LOW");
        assert_eq!(meta.obscore.em_xel, 400);
        assert_eq!(meta.obscore.em_min, (200.0 - 2.0) * 1e6);
        assert_eq!(meta.obscore.em_max, (200.0 + 2.0) * 1e6);
        assert_eq!(meta.obscore.em_resolution, (4.0 / 400.0) * 1e6);
        // 2 pairs x 4096 header bytes subtracted from the data total.
        assert_eq!(meta.obscore.access_estsize, 1_000_000 - 2 * 4096);
        assert_eq!(meta.files.len(), 3);
        assert_eq!(meta.files[0].size, 1_000_000);
    }

    #[test]
    fn builds_without_header() {
        let meta = MetaDataBuilder::new("eb-x", "7")
            .with_file_totals(500, 50, 0, 1)
            .build();
        assert_eq!(meta.obscore.access_estsize, 500);
        assert_eq!(meta.obscore.target_name, "");
        assert_eq!(meta.context.intent, "Tied-array beam observation");
    }
}
