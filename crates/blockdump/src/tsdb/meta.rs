//! Block metadata (`meta.json`) and block directory naming.

use crate::error::{CatalogError, EngineResult};
use crate::tsdb::{Timestamp, META_FILENAME};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::Path;
use ulid::Ulid;

/// The only supported `meta.json` format version.
pub const META_VERSION: i64 = 1;

/// Length of a canonical ULID string.
const ULID_LEN: usize = 26;

/// Persisted, read-only block descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    /// Unique, lexicographically sortable block identifier.
    #[serde(alias = "id")]
    pub ulid: Ulid,
    /// First timestamp covered by the block (inclusive).
    pub min_time: Timestamp,
    /// Last timestamp covered by the block (inclusive).
    pub max_time: Timestamp,
    /// Content statistics.
    #[serde(default)]
    pub stats: BlockStats,
    /// Compaction lineage.
    #[serde(default)]
    pub compaction: BlockCompaction,
    /// Format version, must be [`META_VERSION`].
    pub version: i64,
}

/// Counts recorded when a block is written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockStats {
    /// Number of samples.
    pub num_samples: u64,
    /// Number of series.
    pub num_series: u64,
    /// Number of chunks.
    pub num_chunks: u64,
}

/// Which blocks a block was compacted from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockCompaction {
    /// Compaction level, 1 for blocks written straight from the head.
    pub level: u32,
    /// Identifiers of the level-1 blocks this block descends from.
    pub sources: Vec<Ulid>,
}

/// Classification of a directory name found in a database directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDirKind {
    /// The name is a valid block identifier.
    Block(Ulid),
    /// Any other name (`wal`, `*.tmp`, lock files, ...).
    NotABlock,
}

/// Classifies a directory name. Only canonical 26-character ULIDs qualify.
pub fn classify_dir_name(name: &str) -> BlockDirKind {
    if name.len() != ULID_LEN {
        return BlockDirKind::NotABlock;
    }
    match Ulid::from_string(name) {
        Ok(id) => BlockDirKind::Block(id),
        Err(_) => BlockDirKind::NotABlock,
    }
}

#[derive(Deserialize)]
struct MetaVersion {
    version: i64,
}

/// Reads `<dir>/meta.json`, returning the metadata and the file's byte size.
///
/// # Errors
///
/// Each failure mode maps to its own [`CatalogError`] variant.
pub fn read_meta(dir: &Path) -> Result<(BlockMeta, u64), CatalogError> {
    let path = dir.join(META_FILENAME);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(CatalogError::MissingMeta),
        Err(e) => return Err(CatalogError::UnreadableMeta(e)),
    };

    // The version decides the schema, so it is checked before anything else.
    let MetaVersion { version } =
        serde_json::from_slice(&bytes).map_err(CatalogError::MalformedMeta)?;
    if version != META_VERSION {
        return Err(CatalogError::UnsupportedVersion(version));
    }
    let meta: BlockMeta = serde_json::from_slice(&bytes).map_err(CatalogError::MalformedMeta)?;
    Ok((meta, bytes.len() as u64))
}

/// Writes `<dir>/meta.json` through a temporary file and returns its size.
pub fn write_meta(dir: &Path, meta: &BlockMeta) -> EngineResult<u64> {
    let path = dir.join(META_FILENAME);
    let tmp = dir.join(format!("{}.tmp", META_FILENAME));

    let json = serde_json::to_vec_pretty(meta)?;
    let mut file = File::create(&tmp)?;
    file.write_all(&json)?;
    file.sync_all()?;
    fs::rename(&tmp, &path)?;
    Ok(json.len() as u64)
}
