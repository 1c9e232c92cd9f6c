//! Gorilla compression for chunk samples.
//!
//! # Timestamp Encoding (Delta-of-Delta)
//!
//! - First value: 64 bits raw
//! - Subsequent values, by delta-of-delta:
//!   - `0`: `'0'` (1 bit)
//!   - `[-63, 64]`: `'10'` + 7 bits
//!   - `[-255, 256]`: `'110'` + 9 bits
//!   - `[-2047, 2048]`: `'1110'` + 12 bits
//!   - else: `'1111'` + 64 bits
//!
//! # Value Encoding (XOR-based)
//!
//! - First value: 64 bits raw (IEEE 754)
//! - Subsequent values:
//!   - XOR = 0: `'0'` (1 bit)
//!   - Same window: `'10'` + meaningful bits
//!   - New window: `'11'` + 5 bits leading + 6 bits length + meaningful bits
//!
//! Millisecond scrape intervals rarely jitter by more than a few
//! milliseconds, so most timestamps cost one or nine bits.

use crate::error::{EngineError, EngineResult};
use crate::tsdb::encoding::ByteReader;
use crate::tsdb::Sample;
use bitvec::prelude::*;

/// Maximum number of samples cut into a single chunk.
pub const MAX_SAMPLES_PER_CHUNK: usize = 120;

/// Size of the serialized chunk header (count + two bit lengths).
const CHUNK_HEADER_SIZE: usize = 12;

/// A Gorilla-encoded chunk of samples for one series.
#[derive(Debug, Clone, PartialEq)]
pub struct XorChunk {
    timestamps: BitVec<u8, Msb0>,
    values: BitVec<u8, Msb0>,
    count: u32,
}

impl XorChunk {
    /// Compresses samples, which must be sorted by timestamp.
    pub fn encode(samples: &[Sample]) -> Self {
        let mut timestamps = BitVec::<u8, Msb0>::new();
        let mut values = BitVec::<u8, Msb0>::new();

        let mut ts_encoder = TimestampEncoder::new();
        let mut val_encoder = ValueEncoder::new();

        for sample in samples {
            ts_encoder.encode(sample.t, &mut timestamps);
            val_encoder.encode(sample.v, &mut values);
        }

        Self {
            timestamps,
            values,
            count: samples.len() as u32,
        }
    }

    /// Number of samples in the chunk.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Decompresses the chunk.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Corrupt` if either bit stream ends early.
    pub fn decode(&self) -> EngineResult<Vec<Sample>> {
        let mut ts_decoder = TimestampDecoder::new(&self.timestamps);
        let mut val_decoder = ValueDecoder::new(&self.values);

        let mut samples = Vec::with_capacity(self.count as usize);
        for i in 0..self.count {
            let t = ts_decoder.decode_next().ok_or_else(|| {
                EngineError::Corrupt(format!("chunk timestamp stream ends at sample {}", i))
            })?;
            let v = val_decoder.decode_next().ok_or_else(|| {
                EngineError::Corrupt(format!("chunk value stream ends at sample {}", i))
            })?;
            samples.push(Sample { t, v });
        }
        Ok(samples)
    }

    /// Serializes as `count | ts_bits | value_bits | ts bytes | value bytes`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let ts_raw = self.timestamps.as_raw_slice();
        let val_raw = self.values.as_raw_slice();
        let mut out = Vec::with_capacity(CHUNK_HEADER_SIZE + ts_raw.len() + val_raw.len());
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&(self.timestamps.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.values.len() as u32).to_le_bytes());
        out.extend_from_slice(ts_raw);
        out.extend_from_slice(val_raw);
        out
    }

    /// Parses a chunk written by [`XorChunk::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> EngineResult<Self> {
        let mut reader = ByteReader::new(bytes);
        let count = reader.u32()?;
        let ts_bits = reader.u32()? as usize;
        let val_bits = reader.u32()? as usize;

        let timestamps = read_bits(&mut reader, ts_bits)?;
        let values = read_bits(&mut reader, val_bits)?;
        if reader.remaining() != 0 {
            return Err(EngineError::Corrupt(format!(
                "{} trailing bytes after chunk",
                reader.remaining()
            )));
        }

        Ok(Self {
            timestamps,
            values,
            count,
        })
    }
}

fn read_bits(reader: &mut ByteReader<'_>, bits: usize) -> EngineResult<BitVec<u8, Msb0>> {
    let raw = reader.bytes(bits.div_ceil(8))?;
    let mut vec = BitVec::<u8, Msb0>::from_vec(raw.to_vec());
    vec.truncate(bits);
    Ok(vec)
}

fn push_bits(output: &mut BitVec<u8, Msb0>, value: u64, width: u32) {
    for i in (0..width).rev() {
        output.push((value >> i) & 1 == 1);
    }
}

/// Encoder for timestamps using delta-of-delta encoding.
struct TimestampEncoder {
    first: bool,
    prev_ts: i64,
    prev_delta: i64,
}

impl TimestampEncoder {
    fn new() -> Self {
        Self {
            first: true,
            prev_ts: 0,
            prev_delta: 0,
        }
    }

    fn encode(&mut self, timestamp: i64, output: &mut BitVec<u8, Msb0>) {
        if self.first {
            self.first = false;
            self.prev_ts = timestamp;
            self.prev_delta = 0;
            push_bits(output, timestamp as u64, 64);
            return;
        }

        let delta = timestamp.wrapping_sub(self.prev_ts);
        let dod = delta.wrapping_sub(self.prev_delta);

        if dod == 0 {
            output.push(false);
        } else if (-63..=64).contains(&dod) {
            push_bits(output, 0b10, 2);
            push_bits(output, (dod + 63) as u64, 7);
        } else if (-255..=256).contains(&dod) {
            push_bits(output, 0b110, 3);
            push_bits(output, (dod + 255) as u64, 9);
        } else if (-2047..=2048).contains(&dod) {
            push_bits(output, 0b1110, 4);
            push_bits(output, (dod + 2047) as u64, 12);
        } else {
            push_bits(output, 0b1111, 4);
            push_bits(output, dod as u64, 64);
        }

        self.prev_delta = delta;
        self.prev_ts = timestamp;
    }
}

/// Encoder for float values using XOR compression.
struct ValueEncoder {
    first: bool,
    prev_value: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl ValueEncoder {
    fn new() -> Self {
        Self {
            first: true,
            prev_value: 0,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    fn encode(&mut self, value: f64, output: &mut BitVec<u8, Msb0>) {
        let bits = value.to_bits();

        if self.first {
            self.first = false;
            self.prev_value = bits;
            push_bits(output, bits, 64);
            return;
        }

        let xor = bits ^ self.prev_value;
        if xor == 0 {
            output.push(false);
        } else {
            // Leading zero count must fit in 5 bits.
            let leading = xor.leading_zeros().min(31);
            let trailing = xor.trailing_zeros();

            if leading >= self.prev_leading && trailing >= self.prev_trailing {
                push_bits(output, 0b10, 2);
                let meaningful = 64 - self.prev_leading - self.prev_trailing;
                push_bits(output, xor >> self.prev_trailing, meaningful);
            } else {
                push_bits(output, 0b11, 2);
                let meaningful = 64 - leading - trailing;
                push_bits(output, leading as u64, 5);
                push_bits(output, (meaningful - 1) as u64, 6);
                push_bits(output, xor >> trailing, meaningful);

                self.prev_leading = leading;
                self.prev_trailing = trailing;
            }
        }

        self.prev_value = bits;
    }
}

struct BitReader<'a> {
    data: &'a BitSlice<u8, Msb0>,
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a BitSlice<u8, Msb0>) -> Self {
        Self { data, pos: 0 }
    }

    fn bit(&mut self) -> Option<bool> {
        let bit = self.data.get(self.pos).map(|b| *b)?;
        self.pos += 1;
        Some(bit)
    }

    fn bits(&mut self, width: u32) -> Option<u64> {
        let mut value = 0u64;
        for _ in 0..width {
            value = (value << 1) | u64::from(self.bit()?);
        }
        Some(value)
    }
}

/// Decoder for delta-of-delta encoded timestamps.
struct TimestampDecoder<'a> {
    reader: BitReader<'a>,
    first: bool,
    prev_ts: i64,
    prev_delta: i64,
}

impl<'a> TimestampDecoder<'a> {
    fn new(data: &'a BitSlice<u8, Msb0>) -> Self {
        Self {
            reader: BitReader::new(data),
            first: true,
            prev_ts: 0,
            prev_delta: 0,
        }
    }

    fn decode_next(&mut self) -> Option<i64> {
        if self.first {
            let ts = self.reader.bits(64)? as i64;
            self.first = false;
            self.prev_ts = ts;
            return Some(ts);
        }

        let dod = if !self.reader.bit()? {
            0
        } else if !self.reader.bit()? {
            self.reader.bits(7)? as i64 - 63
        } else if !self.reader.bit()? {
            self.reader.bits(9)? as i64 - 255
        } else if !self.reader.bit()? {
            self.reader.bits(12)? as i64 - 2047
        } else {
            self.reader.bits(64)? as i64
        };

        let delta = self.prev_delta.wrapping_add(dod);
        let ts = self.prev_ts.wrapping_add(delta);
        self.prev_delta = delta;
        self.prev_ts = ts;
        Some(ts)
    }
}

/// Decoder for XOR-encoded float values.
struct ValueDecoder<'a> {
    reader: BitReader<'a>,
    first: bool,
    prev_value: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl<'a> ValueDecoder<'a> {
    fn new(data: &'a BitSlice<u8, Msb0>) -> Self {
        Self {
            reader: BitReader::new(data),
            first: true,
            prev_value: 0,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    fn decode_next(&mut self) -> Option<f64> {
        if self.first {
            let bits = self.reader.bits(64)?;
            self.first = false;
            self.prev_value = bits;
            return Some(f64::from_bits(bits));
        }

        let xor = if !self.reader.bit()? {
            0
        } else if !self.reader.bit()? {
            let meaningful = 64 - self.prev_leading - self.prev_trailing;
            self.reader.bits(meaningful)? << self.prev_trailing
        } else {
            let leading = self.reader.bits(5)? as u32;
            let meaningful = self.reader.bits(6)? as u32 + 1;
            let trailing = 64u32.checked_sub(leading + meaningful)?;
            self.prev_leading = leading;
            self.prev_trailing = trailing;
            self.reader.bits(meaningful)? << trailing
        };

        let bits = self.prev_value ^ xor;
        self.prev_value = bits;
        Some(f64::from_bits(bits))
    }
}
