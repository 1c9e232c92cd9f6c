//! Tombstones file: deleted time intervals per index series.
//!
//! Blocks sealed from the head carry an empty tombstones file. Readers
//! still honor entries so blocks that had deletions applied elsewhere read
//! back correctly.

use crate::error::{EngineError, EngineResult};
use crate::tsdb::encoding::ByteReader;
use crate::tsdb::Timestamp;
use std::fs::File;
use std::io::Write;
use std::path::Path;

const TOMBSTONES_MAGIC: [u8; 4] = *b"ATMB";
const TOMBSTONES_VERSION: u8 = 1;

/// A deleted `[min_time, max_time]` interval of one series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tombstone {
    /// Position of the series in the block index.
    pub series: u32,
    /// First deleted timestamp.
    pub min_time: Timestamp,
    /// Last deleted timestamp.
    pub max_time: Timestamp,
}

impl Tombstone {
    /// Returns true if the tombstone deletes sample `t` of `series`.
    pub fn covers(&self, series: u32, t: Timestamp) -> bool {
        self.series == series && self.min_time <= t && t <= self.max_time
    }
}

/// Writes a tombstones file and syncs it.
pub fn write_tombstones(path: &Path, tombstones: &[Tombstone]) -> EngineResult<()> {
    let mut buf = Vec::with_capacity(9 + tombstones.len() * 20 + 4);
    buf.extend_from_slice(&TOMBSTONES_MAGIC);
    buf.push(TOMBSTONES_VERSION);
    buf.extend_from_slice(&(tombstones.len() as u32).to_le_bytes());
    for stone in tombstones {
        buf.extend_from_slice(&stone.series.to_le_bytes());
        buf.extend_from_slice(&stone.min_time.to_le_bytes());
        buf.extend_from_slice(&stone.max_time.to_le_bytes());
    }
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());

    let mut file = File::create(path)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    Ok(())
}

/// Reads and verifies a tombstones file.
pub fn read_tombstones(path: &Path) -> EngineResult<Vec<Tombstone>> {
    let data = std::fs::read(path)?;
    if data.len() < 4 {
        return Err(EngineError::Corrupt("tombstones file too short".to_string()));
    }
    let (body, crc_bytes) = data.split_at(data.len() - 4);
    let expected = ByteReader::new(crc_bytes).u32()?;
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(EngineError::ChecksumMismatch { expected, actual });
    }

    let mut reader = ByteReader::new(body);
    let magic = reader.magic()?;
    if magic != TOMBSTONES_MAGIC {
        return Err(EngineError::InvalidMagic(magic));
    }
    let version = reader.u8()?;
    if version != TOMBSTONES_VERSION {
        return Err(EngineError::UnsupportedVersion(u16::from(version)));
    }

    let count = reader.u32()? as usize;
    let mut stones = Vec::with_capacity(count);
    for _ in 0..count {
        stones.push(Tombstone {
            series: reader.u32()?,
            min_time: reader.i64()?,
            max_time: reader.i64()?,
        });
    }
    Ok(stones)
}
