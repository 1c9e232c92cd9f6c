//! Read access to a sealed block directory.

use crate::error::EngineResult;
use crate::tsdb::chunks::ChunkReader;
use crate::tsdb::index::{read_index, IndexEntry};
use crate::tsdb::meta::{read_meta, BlockMeta};
use crate::tsdb::tombstones::{read_tombstones, Tombstone};
use crate::tsdb::{
    chunk_dir, SeriesData, SeriesSource, Timestamp, INDEX_FILENAME, TOMBSTONES_FILENAME,
};
use std::path::{Path, PathBuf};

/// A sealed block loaded for reading.
pub struct BlockReader {
    dir: PathBuf,
    meta: BlockMeta,
    index: Vec<IndexEntry>,
    chunks: ChunkReader,
    tombstones: Vec<Tombstone>,
}

impl BlockReader {
    /// Opens the block in `dir`, verifying metadata, index and chunk headers.
    pub fn open(dir: impl AsRef<Path>) -> EngineResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let (meta, _) = read_meta(&dir)?;
        let index = read_index(&dir.join(INDEX_FILENAME))?;
        let chunks = ChunkReader::open(chunk_dir(&dir))?;
        let tombstones = read_tombstones(&dir.join(TOMBSTONES_FILENAME))?;
        Ok(Self {
            dir,
            meta,
            index,
            chunks,
            tombstones,
        })
    }

    /// Block metadata.
    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    /// Block directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every series with all of its samples, tombstones applied.
    pub fn series(&self) -> EngineResult<Vec<SeriesData>> {
        self.series_in_range(i64::MIN, i64::MAX)
    }
}

impl SeriesSource for BlockReader {
    fn series_in_range(&self, mint: Timestamp, maxt: Timestamp) -> EngineResult<Vec<SeriesData>> {
        let mut out = Vec::new();
        for (pos, entry) in self.index.iter().enumerate() {
            let pos = pos as u32;
            let mut samples = Vec::new();
            for chunk in &entry.chunks {
                if chunk.max_time < mint || chunk.min_time > maxt {
                    continue;
                }
                for sample in self.chunks.chunk(chunk.chunk_ref)?.decode()? {
                    if sample.t < mint || sample.t > maxt {
                        continue;
                    }
                    if self.tombstones.iter().any(|t| t.covers(pos, sample.t)) {
                        continue;
                    }
                    samples.push(sample);
                }
            }
            if !samples.is_empty() {
                out.push(SeriesData {
                    labels: entry.labels.clone(),
                    samples,
                });
            }
        }
        Ok(out)
    }
}
