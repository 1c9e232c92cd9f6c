//! Dump configuration.

use crate::error::{DumpError, Result};
use crate::tsdb::compact::exponential_block_ranges;
use crate::tsdb::head::DEFAULT_CHUNK_RANGE;
use serde::{Deserialize, Serialize};

/// Settings for opening a database for a dump.
///
/// # Examples
/// ```rust
/// use alopex_blockdump::DumpConfig;
///
/// let config = DumpConfig::default().with_parallelism(4);
/// assert_eq!(config.block_ranges().len(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    /// Head chunk range in milliseconds.
    pub chunk_range: i64,
    /// Smallest block range in milliseconds.
    pub min_block_range: i64,
    /// Number of block range levels.
    pub block_range_steps: usize,
    /// Growth factor between block range levels.
    pub block_range_factor: i64,
    /// Worker threads for block linking. `0` or `1` links sequentially.
    pub parallelism: usize,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            chunk_range: DEFAULT_CHUNK_RANGE,
            min_block_range: DEFAULT_CHUNK_RANGE,
            block_range_steps: 3,
            block_range_factor: 5,
            parallelism: 1,
        }
    }
}

impl DumpConfig {
    /// Sets the number of linking threads.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// The exponential block range ladder.
    pub fn block_ranges(&self) -> Vec<i64> {
        exponential_block_ranges(
            self.min_block_range,
            self.block_range_steps,
            self.block_range_factor,
        )
    }

    /// Checks that every range setting is usable.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_range <= 0 {
            return Err(DumpError::Config(format!(
                "chunk_range must be positive, got {}",
                self.chunk_range
            )));
        }
        if self.min_block_range <= 0 || self.block_range_factor <= 0 {
            return Err(DumpError::Config(format!(
                "block ranges must be positive (min {}, factor {})",
                self.min_block_range, self.block_range_factor
            )));
        }
        if self.block_range_steps == 0 {
            return Err(DumpError::Config(
                "block_range_steps must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
