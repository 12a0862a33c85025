//! DADA-style `obs.header` parsing.
//!
//! The voltage recorder writes a plain-text header of whitespace-delimited
//! `KEY VALUE` lines alongside the data files. Only a handful of keys feed
//! the metadata document; unknown keys are retained so callers can probe for
//! anything else.

use std::collections::HashMap;
use std::path::Path;

use crate::{MetadataError, Result};

/// Parsed `obs.header` contents.
#[derive(Debug, Clone, Default)]
pub struct ObsHeader {
    values: HashMap<String, String>,
}

impl ObsHeader {
    /// Parse the header file at `path`.
    ///
    /// Lines are `KEY VALUE...` with the value being everything after the
    /// first whitespace run. Blank lines and `#` comments are skipped.
    pub fn parse(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| MetadataError::io(path, e))?;
        Ok(Self::parse_str(&content))
    }

    pub fn parse_str(content: &str) -> Self {
        let mut values = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            if let Some(key) = parts.next() {
                let value = parts.next().unwrap_or("").trim().to_string();
                values.insert(key.to_string(), value);
            }
        }
        Self { values }
    }

    /// Raw string value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// String value for `key`, or empty when absent.
    pub fn get_or_empty(&self, key: &str) -> String {
        self.get(key).unwrap_or("").to_string()
    }

    /// Numeric value for `key`; absent or malformed values fall back to zero.
    pub fn get_f64(&self, key: &str) -> f64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(0.0)
    }

    pub fn get_u32(&self, key: &str) -> u32 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    pub fn get_u64(&self, key: &str) -> u64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
    }
}
