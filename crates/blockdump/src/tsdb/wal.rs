//! Write-Ahead Log (WAL) for the head.
//!
//! Every committed append is logged before it becomes visible in the head,
//! so the head can be rebuilt after a restart by replaying the log.
//!
//! ```text
//! Appender commit → WAL append → batch fsync → head insert
//! ```
//!
//! # Format
//!
//! Segments are named `segment_<id:016x>.wal` and start with a 22-byte
//! header (magic `AWAL`, version, segment id, creation time). Each record is
//! framed as `len u32 | crc32 u32 | payload`, where the payload is
//! `type u8 | sequence u64 | body`.
//!
//! - **Series** records introduce series references and their labels.
//! - **Samples** records carry `(ref, t, v)` triples for known references.
//!
//! A record whose encoding would exceed [`MAX_RECORD_SIZE`] is split into
//! several frames of the same type, each with its own sequence number.
//!
//! Replay tolerates a torn final record: everything before it is kept.

use crate::error::{EngineError, EngineResult};
use crate::tsdb::encoding::ByteReader;
use crate::tsdb::{Labels, SeriesRef, Timestamp};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default batch size for WAL writes.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default maximum segment size (128 MB).
pub const DEFAULT_SEGMENT_SIZE: usize = 128 * 1024 * 1024;

/// Largest payload a single frame may carry. Writers split records to stay
/// under it and readers treat anything longer as corruption.
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// `type u8 | sequence u64 | count u32`
const RECORD_HEADER_SIZE: usize = 13;

/// WAL segment file extension.
const SEGMENT_EXTENSION: &str = "wal";

/// WAL segment file prefix.
const SEGMENT_PREFIX: &str = "segment";

/// WAL file magic bytes.
const WAL_MAGIC: [u8; 4] = *b"AWAL";

/// WAL format version.
const WAL_VERSION: u16 = 1;

/// Sync mode for WAL durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync after each batch write (default, highest durability).
    #[default]
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability - for testing only).
    None,
}

/// Configuration for WAL behavior.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Maximum number of records buffered before an automatic flush.
    pub batch_size: usize,
    /// Maximum size of a single WAL segment file.
    pub segment_size: usize,
    /// Sync mode for durability guarantees.
    pub sync_mode: SyncMode,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            segment_size: DEFAULT_SEGMENT_SIZE,
            sync_mode: SyncMode::default(),
        }
    }
}

impl WalConfig {
    /// Creates a new WAL configuration with custom settings.
    pub fn new(batch_size: usize, segment_size: usize, sync_mode: SyncMode) -> Self {
        Self {
            batch_size,
            segment_size,
            sync_mode,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordType {
    Series = 1,
    Samples = 2,
}

/// A series reference introduced by the head.
#[derive(Debug, Clone, PartialEq)]
pub struct RefSeries {
    /// Head-local reference.
    pub series_ref: SeriesRef,
    /// Labels of the series.
    pub labels: Labels,
}

/// A sample addressed by series reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefSample {
    /// Head-local reference.
    pub series_ref: SeriesRef,
    /// Timestamp in milliseconds.
    pub t: Timestamp,
    /// Sample value.
    pub v: f64,
}

/// A single logical record in the Write-Ahead Log.
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    /// New series.
    Series(Vec<RefSeries>),
    /// Samples for existing series.
    Samples(Vec<RefSample>),
}

impl WalRecord {
    fn record_type(&self) -> RecordType {
        match self {
            Self::Series(_) => RecordType::Series,
            Self::Samples(_) => RecordType::Samples,
        }
    }

    fn entries(&self) -> usize {
        match self {
            Self::Series(series) => series.len(),
            Self::Samples(samples) => samples.len(),
        }
    }

    fn encode_entry(&self, idx: usize, buf: &mut Vec<u8>) -> EngineResult<()> {
        match self {
            Self::Series(series) => {
                let s = &series[idx];
                buf.extend_from_slice(&s.series_ref.to_le_bytes());
                s.labels.encode_into(buf)?;
            }
            Self::Samples(samples) => {
                let s = &samples[idx];
                buf.extend_from_slice(&s.series_ref.to_le_bytes());
                buf.extend_from_slice(&s.t.to_le_bytes());
                buf.extend_from_slice(&s.v.to_le_bytes());
            }
        }
        Ok(())
    }

    fn payload(record_type: RecordType, sequence: u64, count: u32, body: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(RECORD_HEADER_SIZE + body.len());
        bytes.push(record_type as u8);
        bytes.extend_from_slice(&sequence.to_le_bytes());
        bytes.extend_from_slice(&count.to_le_bytes());
        bytes.extend_from_slice(body);
        bytes
    }

    /// Encodes the record as one or more payloads no longer than `limit`,
    /// numbered from `first_sequence`.
    fn to_payloads(&self, first_sequence: u64, limit: usize) -> EngineResult<Vec<Vec<u8>>> {
        let record_type = self.record_type();
        let mut payloads = Vec::new();
        let mut body = Vec::new();
        let mut entry = Vec::new();
        let mut count = 0u32;

        for idx in 0..self.entries() {
            entry.clear();
            self.encode_entry(idx, &mut entry)?;
            let size = RECORD_HEADER_SIZE + entry.len();
            if size > limit {
                return Err(EngineError::RecordTooLarge { size, limit });
            }
            if size + body.len() > limit {
                let sequence = first_sequence + payloads.len() as u64;
                payloads.push(Self::payload(record_type, sequence, count, &body));
                body.clear();
                count = 0;
            }
            body.extend_from_slice(&entry);
            count += 1;
        }

        if count > 0 || payloads.is_empty() {
            let sequence = first_sequence + payloads.len() as u64;
            payloads.push(Self::payload(record_type, sequence, count, &body));
        }
        Ok(payloads)
    }

    fn from_payload(payload: &[u8]) -> EngineResult<(u64, Self)> {
        let mut reader = ByteReader::new(payload);
        let record_type = reader.u8()?;
        let sequence = reader.u64()?;
        let count = reader.u32()? as usize;

        let record = match record_type {
            x if x == RecordType::Series as u8 => {
                let mut series = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    let series_ref = reader.u64()?;
                    let labels = Labels::decode(&mut reader)?;
                    series.push(RefSeries { series_ref, labels });
                }
                Self::Series(series)
            }
            x if x == RecordType::Samples as u8 => {
                let mut samples = Vec::with_capacity(count.min(reader.remaining() / 24));
                for _ in 0..count {
                    samples.push(RefSample {
                        series_ref: reader.u64()?,
                        t: reader.i64()?,
                        v: reader.f64()?,
                    });
                }
                Self::Samples(samples)
            }
            other => {
                return Err(EngineError::Corrupt(format!(
                    "unknown WAL record type {}",
                    other
                )))
            }
        };

        if reader.remaining() != 0 {
            return Err(EngineError::Corrupt(format!(
                "{} trailing bytes in WAL record",
                reader.remaining()
            )));
        }
        Ok((sequence, record))
    }
}

/// WAL segment header.
#[derive(Debug, Clone)]
struct SegmentHeader {
    segment_id: u64,
    created_at: i64,
}

impl SegmentHeader {
    const SIZE: usize = 22; // 4 + 2 + 8 + 8

    fn new(segment_id: u64) -> Self {
        Self {
            segment_id,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0),
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> EngineResult<()> {
        writer.write_all(&WAL_MAGIC)?;
        writer.write_all(&WAL_VERSION.to_le_bytes())?;
        writer.write_all(&self.segment_id.to_le_bytes())?;
        writer.write_all(&self.created_at.to_le_bytes())?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> EngineResult<Self> {
        let mut buf = [0u8; Self::SIZE];
        reader.read_exact(&mut buf)?;
        let mut header = ByteReader::new(&buf);

        let magic = header.magic()?;
        if magic != WAL_MAGIC {
            return Err(EngineError::InvalidMagic(magic));
        }
        let version = header.u16()?;
        if version != WAL_VERSION {
            return Err(EngineError::UnsupportedVersion(version));
        }

        Ok(Self {
            segment_id: header.u64()?,
            created_at: header.i64()?,
        })
    }
}

/// Write-Ahead Log for head appends.
pub struct Wal {
    /// Directory containing WAL segments.
    log_dir: PathBuf,
    /// Current segment file being written to.
    current_segment: BufWriter<File>,
    /// Current segment ID.
    current_segment_id: u64,
    /// Current segment size in bytes.
    current_segment_size: usize,
    /// Next sequence number to assign.
    next_sequence: u64,
    /// WAL configuration.
    config: WalConfig,
    /// Encoded records waiting for the next flush.
    batch_buffer: Vec<Vec<u8>>,
}

impl Wal {
    /// Opens the WAL in `log_dir`, creating the directory if needed.
    ///
    /// Existing segments are left untouched; writing continues in a new
    /// segment after the highest existing segment ID.
    pub fn new(log_dir: impl AsRef<Path>, config: WalConfig) -> EngineResult<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();
        fs::create_dir_all(&log_dir)?;

        let (next_segment_id, next_sequence) = Self::scan_existing_segments(&log_dir)?;
        let current_segment = Self::create_segment(&log_dir, next_segment_id)?;

        let batch_capacity = config.batch_size;
        Ok(Self {
            log_dir,
            current_segment,
            current_segment_id: next_segment_id,
            current_segment_size: SegmentHeader::SIZE,
            next_sequence,
            config,
            batch_buffer: Vec::with_capacity(batch_capacity),
        })
    }

    fn create_segment(log_dir: &Path, segment_id: u64) -> EngineResult<BufWriter<File>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(Self::segment_path(log_dir, segment_id))?;
        let mut writer = BufWriter::new(file);
        SegmentHeader::new(segment_id).write_to(&mut writer)?;
        writer.flush()?;
        Ok(writer)
    }

    /// Determines the next segment ID and sequence number from existing segments.
    fn scan_existing_segments(log_dir: &Path) -> EngineResult<(u64, u64)> {
        let mut max_segment_id: Option<u64> = None;
        let mut max_sequence: u64 = 0;

        for path in Self::list_segments(log_dir)? {
            let Some(id) = Self::parse_segment_id(&path) else {
                continue;
            };
            max_segment_id = Some(max_segment_id.map_or(id, |max| max.max(id)));

            if let Ok(records) = Self::read_segment(&path) {
                if let Some((seq, _)) = records.last() {
                    max_sequence = max_sequence.max(*seq);
                }
            }
        }

        let next_segment_id = max_segment_id.map_or(0, |id| id + 1);
        Ok((next_segment_id, max_sequence + 1))
    }

    /// Generates the path for a segment file.
    fn segment_path(log_dir: &Path, segment_id: u64) -> PathBuf {
        log_dir.join(format!(
            "{}_{:016x}.{}",
            SEGMENT_PREFIX, segment_id, SEGMENT_EXTENSION
        ))
    }

    /// Parses the segment ID from a segment file path.
    fn parse_segment_id(path: &Path) -> Option<u64> {
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix(&format!("{}_", SEGMENT_PREFIX)))
            .and_then(|s| u64::from_str_radix(s, 16).ok())
    }

    /// Lists segment files in the WAL directory, sorted by name.
    fn list_segments(log_dir: &Path) -> EngineResult<Vec<PathBuf>> {
        let mut segments = Vec::new();
        for entry in fs::read_dir(log_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == SEGMENT_EXTENSION) {
                segments.push(path);
            }
        }
        segments.sort();
        Ok(segments)
    }

    /// Reads all records from a segment file.
    ///
    /// A damaged record ends the segment: records before it are returned.
    fn read_segment(path: &Path) -> EngineResult<Vec<(u64, WalRecord)>> {
        let mut reader = BufReader::new(File::open(path)?);
        let header = SegmentHeader::read_from(&mut reader)?;

        let mut records = Vec::new();
        loop {
            match Self::read_record(&mut reader) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        "Truncated WAL segment {} after {} records: {:?}",
                        header.segment_id,
                        records.len(),
                        e
                    );
                    break;
                }
            }
        }
        Ok(records)
    }

    /// Reads a single framed record.
    fn read_record<R: Read>(reader: &mut R) -> EngineResult<Option<(u64, WalRecord)>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len == 0 {
            return Ok(None);
        }
        if len > MAX_RECORD_SIZE {
            return Err(EngineError::Corrupt(format!(
                "WAL record length {} exceeds {}",
                len, MAX_RECORD_SIZE
            )));
        }

        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let expected = u32::from_le_bytes(crc_buf);

        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;

        let actual = crc32fast::hash(&data);
        if actual != expected {
            return Err(EngineError::ChecksumMismatch { expected, actual });
        }

        WalRecord::from_payload(&data).map(Some)
    }

    /// Appends a record; it is buffered until the batch fills or [`Wal::sync`]
    /// is called. Returns the sequence number of the record's first frame.
    pub fn append(&mut self, record: &WalRecord) -> EngineResult<u64> {
        let seq = self.next_sequence;
        let payloads = record.to_payloads(seq, MAX_RECORD_SIZE)?;
        self.next_sequence += payloads.len() as u64;
        self.batch_buffer.extend(payloads);

        if self.batch_buffer.len() >= self.config.batch_size {
            self.flush_batch()?;
        }
        Ok(seq)
    }

    /// Appends several records and flushes them together. Returns one
    /// sequence number per written frame.
    ///
    /// Nothing is buffered if any record cannot be encoded.
    pub fn append_batch(&mut self, records: &[WalRecord]) -> EngineResult<Vec<u64>> {
        let mut seq = self.next_sequence;
        let mut encoded = Vec::with_capacity(records.len());
        for record in records {
            let payloads = record.to_payloads(seq, MAX_RECORD_SIZE)?;
            seq += payloads.len() as u64;
            encoded.extend(payloads);
        }

        let sequences: Vec<u64> = (self.next_sequence..seq).collect();
        self.next_sequence = seq;
        self.batch_buffer.extend(encoded);
        self.flush_batch()?;
        Ok(sequences)
    }

    /// Flushes pending records to disk.
    fn flush_batch(&mut self) -> EngineResult<()> {
        if self.batch_buffer.is_empty() {
            return Ok(());
        }

        let estimated_size: usize = self.batch_buffer.iter().map(|p| p.len() + 8).sum();
        if self.current_segment_size + estimated_size > self.config.segment_size
            && self.current_segment_size > SegmentHeader::SIZE
        {
            self.rotate_segment()?;
        }

        let records = std::mem::take(&mut self.batch_buffer);
        for payload in &records {
            self.write_frame(payload)?;
        }

        self.current_segment.flush()?;
        match self.config.sync_mode {
            SyncMode::Fsync => self.current_segment.get_ref().sync_all()?,
            SyncMode::Fdatasync => self.current_segment.get_ref().sync_data()?,
            SyncMode::None => {}
        }

        debug!(
            "Flushed {} WAL records to segment {}",
            records.len(),
            self.current_segment_id
        );
        Ok(())
    }

    fn write_frame(&mut self, payload: &[u8]) -> EngineResult<()> {
        let crc = crc32fast::hash(payload);
        self.current_segment
            .write_all(&(payload.len() as u32).to_le_bytes())?;
        self.current_segment.write_all(&crc.to_le_bytes())?;
        self.current_segment.write_all(payload)?;
        self.current_segment_size += 8 + payload.len();
        Ok(())
    }

    /// Rotates to a new segment file.
    fn rotate_segment(&mut self) -> EngineResult<()> {
        self.current_segment.flush()?;
        self.current_segment.get_ref().sync_all()?;

        self.current_segment_id += 1;
        self.current_segment = Self::create_segment(&self.log_dir, self.current_segment_id)?;
        self.current_segment_size = SegmentHeader::SIZE;

        debug!("Rotated to WAL segment {}", self.current_segment_id);
        Ok(())
    }

    /// Reads every record in `log_dir` in sequence order without modifying
    /// the directory. Segments with an unreadable header are skipped.
    pub fn recover(log_dir: impl AsRef<Path>) -> EngineResult<Vec<WalRecord>> {
        let log_dir = log_dir.as_ref();
        let mut all = Vec::new();

        for segment_path in Self::list_segments(log_dir)? {
            match Self::read_segment(&segment_path) {
                Ok(records) => {
                    debug!(
                        "Recovered {} records from {}",
                        records.len(),
                        segment_path.display()
                    );
                    all.extend(records);
                }
                Err(e) => {
                    warn!(
                        "Failed to read WAL segment {}: {:?}",
                        segment_path.display(),
                        e
                    );
                }
            }
        }

        all.sort_by_key(|(seq, _)| *seq);
        debug!("Total recovered WAL records: {}", all.len());
        Ok(all.into_iter().map(|(_, record)| record).collect())
    }

    /// Forces a flush of any buffered records.
    pub fn sync(&mut self) -> EngineResult<()> {
        self.flush_batch()
    }

    /// Returns the next sequence number to be assigned.
    pub fn current_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Returns the number of buffered records.
    pub fn pending_count(&self) -> usize {
        self.batch_buffer.len()
    }

    /// Returns the current segment ID.
    pub fn current_segment_id(&self) -> u64 {
        self.current_segment_id
    }

    /// Returns the log directory path.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(e) = self.flush_batch() {
            warn!("Failed to flush WAL on drop: {:?}", e);
        }
    }
}
