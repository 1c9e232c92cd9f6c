//! Block writing: sealing series data into an immutable block directory.
//!
//! A block is first assembled in `<dest>/<ulid>.tmp` and renamed into place
//! once every file is synced, so readers never observe a half-written
//! block under a valid ULID name.

use crate::error::{EngineError, EngineResult};
use crate::tsdb::chunks::{ChunkWriter, DEFAULT_CHUNK_SEGMENT_SIZE};
use crate::tsdb::gorilla::{XorChunk, MAX_SAMPLES_PER_CHUNK};
use crate::tsdb::index::{ChunkMeta, IndexWriter};
use crate::tsdb::meta::{write_meta, BlockCompaction, BlockMeta, BlockStats, META_VERSION};
use crate::tsdb::tombstones::write_tombstones;
use crate::tsdb::{chunk_dir, SeriesSource, Timestamp, INDEX_FILENAME, TOMBSTONES_FILENAME};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};
use ulid::Ulid;

/// Returns `steps` block ranges starting at `min` and growing by `factor`.
///
/// `exponential_block_ranges(2h, 3, 5)` yields `[2h, 10h, 50h]`.
pub fn exponential_block_ranges(min: i64, steps: usize, factor: i64) -> Vec<i64> {
    let mut ranges = Vec::with_capacity(steps);
    let mut current = min;
    for _ in 0..steps {
        ranges.push(current);
        current = current.saturating_mul(factor);
    }
    ranges
}

/// Writes blocks for the configured range levels.
#[derive(Debug, Clone)]
pub struct LeveledCompactor {
    ranges: Vec<i64>,
    segment_size: u64,
}

impl LeveledCompactor {
    /// Creates a compactor. `ranges` must be non-empty and positive.
    pub fn new(ranges: Vec<i64>) -> EngineResult<Self> {
        if ranges.is_empty() {
            return Err(EngineError::InvalidConfig(
                "at least one block range is required".to_string(),
            ));
        }
        if let Some(bad) = ranges.iter().find(|r| **r <= 0) {
            return Err(EngineError::InvalidConfig(format!(
                "block range {} is not positive",
                bad
            )));
        }
        Ok(Self {
            ranges,
            segment_size: DEFAULT_CHUNK_SEGMENT_SIZE,
        })
    }

    /// Overrides the maximum chunk segment file size.
    pub fn with_segment_size(mut self, segment_size: u64) -> Self {
        self.segment_size = segment_size;
        self
    }

    /// Configured block ranges, smallest first.
    pub fn ranges(&self) -> &[i64] {
        &self.ranges
    }

    /// Writes every sample of `source` in `[mint, maxt]` as a new block under
    /// `dest` and returns its id.
    ///
    /// The block's `minTime`/`maxTime` are `mint`/`maxt` even when the source
    /// holds no samples in the range. With a `parent`, the new block inherits
    /// its compaction lineage one level up.
    pub fn write<S: SeriesSource + ?Sized>(
        &self,
        dest: &Path,
        source: &S,
        mint: Timestamp,
        maxt: Timestamp,
        parent: Option<&BlockMeta>,
    ) -> EngineResult<Ulid> {
        if mint > maxt {
            return Err(EngineError::InvalidConfig(format!(
                "block range [{}, {}] is inverted",
                mint, maxt
            )));
        }

        let ulid = Ulid::new();
        let tmp = dest.join(format!("{}.tmp", ulid));
        let final_dir = dest.join(ulid.to_string());

        match self.write_into(&tmp, ulid, source, mint, maxt, parent) {
            Ok(meta) => {
                fs::rename(&tmp, &final_dir)?;
                debug!(
                    "Wrote block {} [{}, {}]: {} series, {} samples",
                    ulid, mint, maxt, meta.stats.num_series, meta.stats.num_samples
                );
                Ok(ulid)
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&tmp) {
                    warn!(
                        "Failed to remove partial block {}: {:?}",
                        tmp.display(),
                        cleanup
                    );
                }
                Err(e)
            }
        }
    }

    fn write_into<S: SeriesSource + ?Sized>(
        &self,
        tmp: &Path,
        ulid: Ulid,
        source: &S,
        mint: Timestamp,
        maxt: Timestamp,
        parent: Option<&BlockMeta>,
    ) -> EngineResult<BlockMeta> {
        if tmp.exists() {
            fs::remove_dir_all(tmp)?;
        }
        fs::create_dir_all(tmp)?;

        let series = source.series_in_range(mint, maxt)?;
        let mut chunks = ChunkWriter::new(chunk_dir(tmp), self.segment_size)?;
        let mut index = IndexWriter::new();
        let mut stats = BlockStats::default();

        for data in &series {
            let mut metas = Vec::with_capacity(data.samples.len() / MAX_SAMPLES_PER_CHUNK + 1);
            for part in data.samples.chunks(MAX_SAMPLES_PER_CHUNK) {
                let (Some(first), Some(last)) = (part.first(), part.last()) else {
                    continue;
                };
                let chunk_ref = chunks.write_chunk(&XorChunk::encode(part))?;
                metas.push(ChunkMeta {
                    min_time: first.t,
                    max_time: last.t,
                    chunk_ref,
                });
                stats.num_samples += part.len() as u64;
            }
            index.add_series(&data.labels, &metas)?;
            stats.num_series += 1;
        }

        stats.num_chunks = chunks.finish()?;
        index.write_to(&tmp.join(INDEX_FILENAME))?;
        write_tombstones(&tmp.join(TOMBSTONES_FILENAME), &[])?;

        let compaction = match parent {
            Some(parent) => BlockCompaction {
                level: parent.compaction.level + 1,
                sources: parent.compaction.sources.clone(),
            },
            None => BlockCompaction {
                level: 1,
                sources: vec![ulid],
            },
        };
        let meta = BlockMeta {
            ulid,
            min_time: mint,
            max_time: maxt,
            stats,
            compaction,
            version: META_VERSION,
        };
        write_meta(tmp, &meta)?;
        Ok(meta)
    }
}
