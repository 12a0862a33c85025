//! Size-stability tracking.
//!
//! Capture writes data and weights files append-only; a file may only be
//! processed or replicated once it has stopped growing. A file is considered
//! stable after its size has been observed unchanged for a configurable
//! number of consecutive observations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_QUIESCENCE_WINDOW: u32 = 2;

#[derive(Debug)]
struct SizeHistory {
    size: u64,
    observations: u32,
}

/// Per-path size history with a stability window.
#[derive(Debug)]
pub struct QuiescenceTracker {
    window: u32,
    history: HashMap<PathBuf, SizeHistory>,
}

impl QuiescenceTracker {
    pub fn new(window: u32) -> Self {
        Self {
            window: window.max(1),
            history: HashMap::new(),
        }
    }

    /// Record an observation of `path` at `size`; returns true once the size
    /// has been seen unchanged for the full window.
    pub fn observe(&mut self, path: &Path, size: u64) -> bool {
        let entry = self
            .history
            .entry(path.to_path_buf())
            .and_modify(|h| {
                if h.size == size {
                    h.observations = h.observations.saturating_add(1);
                } else {
                    h.size = size;
                    h.observations = 1;
                }
            })
            .or_insert(SizeHistory {
                size,
                observations: 1,
            });
        entry.observations >= self.window
    }

    /// Drop the history for a path (file processed, transferred or deleted).
    pub fn forget(&mut self, path: &Path) {
        self.history.remove(path);
    }

    /// Drop history for every path outside `prefix` (scan advanced).
    pub fn retain_under(&mut self, prefix: &Path) {
        self.history.retain(|path, _| path.starts_with(prefix));
    }
}

impl Default for QuiescenceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_QUIESCENCE_WINDOW)
    }
}
