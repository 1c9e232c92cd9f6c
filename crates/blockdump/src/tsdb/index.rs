//! Block series index.
//!
//! ```text
//! magic "AIDX" | version u8 | series count u32
//! per series:   labels | chunk count u32 | (min_time i64, max_time i64, chunk_ref u64)*
//! crc32 u32 over everything before it
//! ```
//!
//! Series appear in label order.

use crate::error::{EngineError, EngineResult};
use crate::tsdb::chunks::ChunkRef;
use crate::tsdb::encoding::ByteReader;
use crate::tsdb::{Labels, Timestamp};
use std::fs::File;
use std::io::Write;
use std::path::Path;

const INDEX_MAGIC: [u8; 4] = *b"AIDX";
const INDEX_VERSION: u8 = 1;

/// Location and time bounds of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMeta {
    /// First sample timestamp in the chunk.
    pub min_time: Timestamp,
    /// Last sample timestamp in the chunk.
    pub max_time: Timestamp,
    /// Where the chunk lives in the segment files.
    pub chunk_ref: ChunkRef,
}

/// One series entry of the index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    /// Series labels.
    pub labels: Labels,
    /// Chunks in time order.
    pub chunks: Vec<ChunkMeta>,
}

/// Accumulates series entries and writes the index file.
pub struct IndexWriter {
    buf: Vec<u8>,
    series: u32,
    last: Option<Labels>,
}

impl IndexWriter {
    /// Creates an empty index writer.
    pub fn new() -> Self {
        let mut buf = Vec::with_capacity(4096);
        buf.extend_from_slice(&INDEX_MAGIC);
        buf.push(INDEX_VERSION);
        buf.extend_from_slice(&0u32.to_le_bytes());
        Self {
            buf,
            series: 0,
            last: None,
        }
    }

    /// Adds a series. Series must be added in strictly increasing label order.
    pub fn add_series(&mut self, labels: &Labels, chunks: &[ChunkMeta]) -> EngineResult<()> {
        if let Some(last) = &self.last {
            if labels <= last {
                return Err(EngineError::Corrupt(format!(
                    "series {} added out of order after {}",
                    labels, last
                )));
            }
        }

        labels.encode_into(&mut self.buf)?;
        self.buf
            .extend_from_slice(&(chunks.len() as u32).to_le_bytes());
        for chunk in chunks {
            self.buf.extend_from_slice(&chunk.min_time.to_le_bytes());
            self.buf.extend_from_slice(&chunk.max_time.to_le_bytes());
            self.buf.extend_from_slice(&chunk.chunk_ref.to_le_bytes());
        }

        self.series += 1;
        self.last = Some(labels.clone());
        Ok(())
    }

    /// Number of series added so far.
    pub fn series_count(&self) -> u32 {
        self.series
    }

    /// Writes the index to `path` and syncs it.
    pub fn write_to(mut self, path: &Path) -> EngineResult<()> {
        self.buf[5..9].copy_from_slice(&self.series.to_le_bytes());
        let crc = crc32fast::hash(&self.buf);

        let mut file = File::create(path)?;
        file.write_all(&self.buf)?;
        file.write_all(&crc.to_le_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

impl Default for IndexWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads and verifies an index file.
pub fn read_index(path: &Path) -> EngineResult<Vec<IndexEntry>> {
    let data = std::fs::read(path)?;
    if data.len() < 4 {
        return Err(EngineError::Corrupt("index file too short".to_string()));
    }
    let (body, crc_bytes) = data.split_at(data.len() - 4);
    let mut crc_reader = ByteReader::new(crc_bytes);
    let expected = crc_reader.u32()?;
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(EngineError::ChecksumMismatch { expected, actual });
    }

    let mut reader = ByteReader::new(body);
    let magic = reader.magic()?;
    if magic != INDEX_MAGIC {
        return Err(EngineError::InvalidMagic(magic));
    }
    let version = reader.u8()?;
    if version != INDEX_VERSION {
        return Err(EngineError::UnsupportedVersion(u16::from(version)));
    }

    let count = reader.u32()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let labels = Labels::decode(&mut reader)?;
        let chunk_count = reader.u32()? as usize;
        let mut chunks = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            chunks.push(ChunkMeta {
                min_time: reader.i64()?,
                max_time: reader.i64()?,
                chunk_ref: reader.u64()?,
            });
        }
        entries.push(IndexEntry { labels, chunks });
    }

    if reader.remaining() != 0 {
        return Err(EngineError::Corrupt(format!(
            "{} trailing bytes in index",
            reader.remaining()
        )));
    }
    Ok(entries)
}
