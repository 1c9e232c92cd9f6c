//! Hard-link extraction of sealed blocks.
//!
//! Sealed blocks never change, so a dump shares their files instead of
//! copying them. Linking onto an existing file fails: dumping twice into
//! the same directory is an error, and a failed block is left as is.

use crate::dump::catalog::Block;
use crate::error::{DumpError, Result};
use crate::tsdb::{chunk_dir, INDEX_FILENAME, META_FILENAME, TOMBSTONES_FILENAME};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use ulid::Ulid;

/// Files linked at the top of every block directory.
const BLOCK_FILES: [&str; 3] = [META_FILENAME, INDEX_FILENAME, TOMBSTONES_FILENAME];

/// A block extracted into the dump directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedBlock {
    /// Block identifier.
    pub id: Ulid,
    /// Block directory inside the dump directory.
    pub dir: PathBuf,
    /// Number of files linked.
    pub files: usize,
}

/// Hard-links `block` into `dump_dir/<id>`.
pub fn link_block(block: &Block, dump_dir: &Path) -> Result<LinkedBlock> {
    let dest = dump_dir.join(block.id.to_string());
    let dest_chunks = chunk_dir(&dest);
    fs::create_dir_all(&dest_chunks)
        .map_err(|e| DumpError::filesystem("create directory", &dest_chunks, e))?;

    let mut files = 0;
    for name in BLOCK_FILES {
        link(&block.dir.join(name), &dest.join(name))?;
        files += 1;
    }

    let src_chunks = chunk_dir(&block.dir);
    let entries = fs::read_dir(&src_chunks)
        .map_err(|e| DumpError::filesystem("list chunks", &src_chunks, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| DumpError::filesystem("list chunks", &src_chunks, e))?;
        link(&entry.path(), &dest_chunks.join(entry.file_name()))?;
        files += 1;
    }

    debug!("Linked block {} ({} files)", block.id, files);
    Ok(LinkedBlock {
        id: block.id,
        dir: dest,
        files,
    })
}

fn link(src: &Path, dst: &Path) -> Result<()> {
    fs::hard_link(src, dst).map_err(|e| DumpError::filesystem("hard link", dst, e))
}
