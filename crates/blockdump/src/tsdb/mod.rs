//! Block store primitives: write-ahead log, head, chunk and index files,
//! block metadata and the compactor that seals head data into blocks.
//!
//! # On-disk layout
//!
//! ```text
//! <db>/
//! ├── <ulid>/              sealed block
//! │   ├── meta.json
//! │   ├── index
//! │   ├── tombstones
//! │   └── chunks/000001 …
//! └── wal/segment_<id>.wal
//! ```
//!
//! All timestamps are milliseconds since the Unix epoch.

pub mod block;
pub mod chunks;
pub mod compact;
pub mod db;
pub(crate) mod encoding;
pub mod gorilla;
pub mod head;
pub mod index;
pub mod labels;
pub mod meta;
pub mod tombstones;
pub mod wal;

use crate::error::EngineResult;
use std::path::{Path, PathBuf};

pub use block::BlockReader;
pub use compact::{exponential_block_ranges, LeveledCompactor};
pub use db::{Db, DbOptions};
pub use head::{Head, HeadAppender};
pub use labels::Labels;
pub use meta::{BlockMeta, META_VERSION};
pub use wal::{SyncMode, Wal, WalConfig, WalRecord};

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Head-local series reference handed out by appenders.
pub type SeriesRef = u64;

/// Block metadata file name.
pub const META_FILENAME: &str = "meta.json";
/// Block series index file name.
pub const INDEX_FILENAME: &str = "index";
/// Block tombstones file name.
pub const TOMBSTONES_FILENAME: &str = "tombstones";
/// Block chunk segment directory name.
pub const CHUNKS_DIRNAME: &str = "chunks";
/// Write-ahead log directory name under the database directory.
pub const WAL_DIRNAME: &str = "wal";

/// A single sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Timestamp in milliseconds.
    pub t: Timestamp,
    /// Sample value.
    pub v: f64,
}

impl Sample {
    /// Creates a sample.
    pub fn new(t: Timestamp, v: f64) -> Self {
        Self { t, v }
    }
}

/// One series and its samples, sorted by timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesData {
    /// Series labels.
    pub labels: Labels,
    /// Samples in ascending timestamp order.
    pub samples: Vec<Sample>,
}

/// Anything the compactor can read series from.
pub trait SeriesSource {
    /// Returns every series with at least one sample in `[mint, maxt]`,
    /// restricted to those samples and sorted by labels.
    fn series_in_range(&self, mint: Timestamp, maxt: Timestamp) -> EngineResult<Vec<SeriesData>>;
}

/// Returns the chunk directory of a block directory.
pub fn chunk_dir(block_dir: &Path) -> PathBuf {
    block_dir.join(CHUNKS_DIRNAME)
}
