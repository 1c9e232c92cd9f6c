//! Chunk segment files stored under a block's `chunks/` directory.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Segment header (8 bytes)                      │
//! │  - Magic "ACHK", version u8, 3 reserved bytes │
//! ├──────────────────────────────────────────────┤
//! │ Chunk (repeated)                              │
//! │  - len u32 | encoding u8 | data | crc32 u32   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! A chunk reference packs the segment sequence number into the upper 32
//! bits and the byte offset of the chunk into the lower 32 bits.

use crate::error::{EngineError, EngineResult};
use crate::tsdb::encoding::ByteReader;
use crate::tsdb::gorilla::XorChunk;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Chunk segment magic bytes.
const CHUNKS_MAGIC: [u8; 4] = *b"ACHK";

/// Chunk segment format version.
const CHUNKS_VERSION: u8 = 1;

/// Segment header size in bytes.
const SEGMENT_HEADER_SIZE: u64 = 8;

/// Per-chunk framing overhead: length, encoding byte and CRC.
const CHUNK_OVERHEAD: u64 = 4 + 1 + 4;

/// Encoding tag for Gorilla XOR chunks.
const ENCODING_XOR: u8 = 1;

/// Default maximum size of one chunk segment file (512 MB).
pub const DEFAULT_CHUNK_SEGMENT_SIZE: u64 = 512 * 1024 * 1024;

/// Packed `(segment, offset)` chunk reference.
pub type ChunkRef = u64;

fn pack_ref(segment: u32, offset: u32) -> ChunkRef {
    (u64::from(segment) << 32) | u64::from(offset)
}

fn unpack_ref(chunk_ref: ChunkRef) -> (u32, u32) {
    ((chunk_ref >> 32) as u32, chunk_ref as u32)
}

/// Returns the path of a segment file, e.g. `chunks/000001`.
pub fn segment_file(dir: &Path, segment: u32) -> PathBuf {
    dir.join(format!("{:06}", segment))
}

/// Writes chunks into numbered segment files.
pub struct ChunkWriter {
    dir: PathBuf,
    segment_size: u64,
    current: Option<BufWriter<File>>,
    segment: u32,
    offset: u64,
    chunks_written: u64,
}

impl ChunkWriter {
    /// Creates a writer for `dir`, which is created if missing.
    pub fn new(dir: impl AsRef<Path>, segment_size: u64) -> EngineResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            segment_size,
            current: None,
            segment: 0,
            offset: 0,
            chunks_written: 0,
        })
    }

    /// Appends a chunk and returns its reference.
    pub fn write_chunk(&mut self, chunk: &XorChunk) -> EngineResult<ChunkRef> {
        let data = chunk.to_bytes();
        let frame_size = CHUNK_OVERHEAD + data.len() as u64;

        if self.current.is_none() || self.offset + frame_size > self.segment_size {
            self.cut_segment()?;
        }
        let offset = u32::try_from(self.offset).map_err(|_| {
            EngineError::Corrupt(format!("chunk offset {} exceeds 32 bits", self.offset))
        })?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[ENCODING_XOR]);
        hasher.update(&data);
        let crc = hasher.finalize();

        if let Some(writer) = self.current.as_mut() {
            writer.write_all(&(data.len() as u32).to_le_bytes())?;
            writer.write_all(&[ENCODING_XOR])?;
            writer.write_all(&data)?;
            writer.write_all(&crc.to_le_bytes())?;
        }

        self.offset += frame_size;
        self.chunks_written += 1;
        Ok(pack_ref(self.segment, offset))
    }

    fn cut_segment(&mut self) -> EngineResult<()> {
        self.finish_segment()?;

        self.segment += 1;
        let path = segment_file(&self.dir, self.segment);
        let mut writer = BufWriter::new(File::create(&path)?);
        writer.write_all(&CHUNKS_MAGIC)?;
        writer.write_all(&[CHUNKS_VERSION, 0, 0, 0])?;
        self.current = Some(writer);
        self.offset = SEGMENT_HEADER_SIZE;

        debug!("Cut chunk segment {}", path.display());
        Ok(())
    }

    fn finish_segment(&mut self) -> EngineResult<()> {
        if let Some(mut writer) = self.current.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Flushes and syncs the last segment; returns the number of chunks written.
    pub fn finish(mut self) -> EngineResult<u64> {
        self.finish_segment()?;
        Ok(self.chunks_written)
    }
}

/// Reads chunks from all segment files of a block.
pub struct ChunkReader {
    segments: BTreeMap<u32, Vec<u8>>,
}

impl ChunkReader {
    /// Loads every segment file in `dir`. File names that are not segment
    /// numbers are ignored.
    pub fn open(dir: impl AsRef<Path>) -> EngineResult<Self> {
        let mut segments = BTreeMap::new();
        for entry in fs::read_dir(dir.as_ref())? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(segment) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };

            let data = fs::read(entry.path())?;
            let mut reader = ByteReader::new(&data);
            let magic = reader.magic()?;
            if magic != CHUNKS_MAGIC {
                return Err(EngineError::InvalidMagic(magic));
            }
            let version = reader.u8()?;
            if version != CHUNKS_VERSION {
                return Err(EngineError::UnsupportedVersion(u16::from(version)));
            }
            segments.insert(segment, data);
        }
        Ok(Self { segments })
    }

    /// Number of segment files loaded.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Reads and verifies the chunk at `chunk_ref`.
    pub fn chunk(&self, chunk_ref: ChunkRef) -> EngineResult<XorChunk> {
        let (segment, offset) = unpack_ref(chunk_ref);
        let data = self.segments.get(&segment).ok_or_else(|| {
            EngineError::Corrupt(format!("chunk segment {:06} does not exist", segment))
        })?;
        let start = offset as usize;
        if start < SEGMENT_HEADER_SIZE as usize || start > data.len() {
            return Err(EngineError::Corrupt(format!(
                "chunk offset {} out of range for segment {:06}",
                offset, segment
            )));
        }

        let mut reader = ByteReader::new(&data[start..]);
        let len = reader.u32()? as usize;
        let encoding = reader.u8()?;
        let payload = reader.bytes(len)?;
        let expected = reader.u32()?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[encoding]);
        hasher.update(payload);
        let actual = hasher.finalize();
        if actual != expected {
            return Err(EngineError::ChecksumMismatch { expected, actual });
        }
        if encoding != ENCODING_XOR {
            return Err(EngineError::Corrupt(format!(
                "unknown chunk encoding {}",
                encoding
            )));
        }
        XorChunk::from_bytes(payload)
    }
}
