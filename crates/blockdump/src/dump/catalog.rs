//! Block discovery: turns a database directory into a sorted block list.

use crate::error::{CatalogError, DumpError, Result};
use crate::tsdb::meta::{classify_dir_name, read_meta, BlockDirKind};
use crate::tsdb::BlockMeta;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use ulid::Ulid;

/// A sealed block found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Block identifier, equal to the directory name.
    pub id: Ulid,
    /// Block directory.
    pub dir: PathBuf,
    /// Parsed `meta.json`.
    pub meta: BlockMeta,
    /// Size of `meta.json` in bytes.
    pub meta_size: u64,
}

/// Lists every block under `db_path`, sorted by id.
///
/// Entries that are not directories or whose names are not ULIDs are
/// skipped. Any block whose `meta.json` is missing, unreadable, malformed or
/// of an unsupported version fails the whole discovery.
pub fn discover(db_path: &Path) -> Result<Vec<Block>> {
    let entries = fs::read_dir(db_path)
        .map_err(|e| DumpError::discovery(db_path, CatalogError::ReadDir(e)))?;

    let mut blocks = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| DumpError::discovery(db_path, CatalogError::ReadDir(e)))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| DumpError::discovery(&path, CatalogError::ReadDir(e)))?;
        if !file_type.is_dir() {
            continue;
        }

        let name = entry.file_name();
        let id = match name.to_str().map(classify_dir_name) {
            Some(BlockDirKind::Block(id)) => id,
            _ => {
                trace!("Skipping non-block directory {}", path.display());
                continue;
            }
        };

        let (meta, meta_size) = read_meta(&path).map_err(|e| DumpError::discovery(&path, e))?;
        blocks.push(Block {
            id,
            dir: path,
            meta,
            meta_size,
        });
    }

    blocks.sort_by_key(|b| b.id);
    debug!("Discovered {} blocks in {}", blocks.len(), db_path.display());
    Ok(blocks)
}
