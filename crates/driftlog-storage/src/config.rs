//! Log configuration.

use serde::{Deserialize, Serialize};

use crate::index::ENTRY_WIDTH;

/// Configuration accepted at log creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub segment: SegmentConfig,
}

/// Per-segment size ceilings and the offset the first segment starts at.
///
/// A segment is "maxed" (and the log rolls a new one) once its store or its
/// index reaches the configured ceiling. Small records saturate the index
/// first, large records saturate the store first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Roll the segment when the store file reaches this size (default: 1 GiB).
    #[serde(default = "default_max_store_bytes")]
    pub max_store_bytes: u64,

    /// Roll the segment when the index file reaches this size (default: 10 MiB).
    /// Must be at least [`ENTRY_WIDTH`].
    #[serde(default = "default_max_index_bytes")]
    pub max_index_bytes: u64,

    /// Offset the first segment starts at (default: 0).
    #[serde(default)]
    pub initial_offset: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_store_bytes: default_max_store_bytes(),
            max_index_bytes: default_max_index_bytes(),
            initial_offset: 0,
        }
    }
}

impl SegmentConfig {
    /// Clamp the index ceiling so at least one entry always fits.
    pub fn validated(mut self) -> Self {
        if self.max_index_bytes < ENTRY_WIDTH {
            self.max_index_bytes = ENTRY_WIDTH;
        }
        self
    }
}

fn default_max_store_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_max_index_bytes() -> u64 {
    10 * 1024 * 1024
}
