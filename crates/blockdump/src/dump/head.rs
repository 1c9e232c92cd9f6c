//! Head access for dumps: WAL replay and flushing a window into a block.

use crate::config::DumpConfig;
use crate::error::{DumpError, EngineError, Result};
use crate::tsdb::{Head, LeveledCompactor, Timestamp, WAL_DIRNAME};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use ulid::Ulid;

/// Owns the head of the database being dumped.
pub struct HeadManager {
    wal_dir: PathBuf,
    head: Head,
}

impl HeadManager {
    /// Prepares a head over `<db_path>/wal`. Nothing is replayed until
    /// [`HeadManager::init`]; the WAL is only ever read.
    ///
    /// A missing WAL directory yields an empty head.
    pub fn open(db_path: &Path, config: &DumpConfig) -> Result<Self> {
        let wal_dir = db_path.join(WAL_DIRNAME);
        match fs::metadata(&wal_dir) {
            Ok(meta) if meta.is_dir() => {
                fs::read_dir(&wal_dir).map_err(|e| {
                    DumpError::engine("open wal", &wal_dir, EngineError::Io(e))
                })?;
            }
            Ok(_) => {
                return Err(DumpError::engine(
                    "open wal",
                    &wal_dir,
                    EngineError::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "not a directory",
                    )),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No WAL directory at {}", wal_dir.display());
            }
            Err(e) => return Err(DumpError::engine("open wal", &wal_dir, EngineError::Io(e))),
        }

        let head = Head::open(&wal_dir, config.chunk_range);
        Ok(Self { wal_dir, head })
    }

    /// Wraps a head that is already initialized.
    pub fn from_head(head: Head) -> Self {
        Self {
            wal_dir: PathBuf::new(),
            head,
        }
    }

    /// Replays the WAL, skipping samples older than `min_valid_time`.
    pub fn init(&self, min_valid_time: Timestamp) -> Result<()> {
        self.head
            .init(min_valid_time)
            .map_err(|e| DumpError::engine("replay wal", &self.wal_dir, e))?;
        debug!(
            "Head initialized from {}: {} series, {} samples",
            self.wal_dir.display(),
            self.head.num_series(),
            self.head.num_samples()
        );
        Ok(())
    }

    /// Smallest head timestamp, `i64::MAX` when empty.
    pub fn min_time(&self) -> Timestamp {
        self.head.min_time()
    }

    /// Largest head timestamp, `i64::MIN` when empty.
    pub fn max_time(&self) -> Timestamp {
        self.head.max_time()
    }

    /// True when the head holds no samples.
    pub fn is_empty(&self) -> bool {
        self.head.is_empty()
    }

    /// The managed head.
    pub fn head(&self) -> &Head {
        &self.head
    }

    /// Writes the head samples in `[mint, maxt]` as one new block directly
    /// under `dump_dir`.
    pub fn flush(
        &self,
        compactor: &LeveledCompactor,
        dump_dir: &Path,
        mint: Timestamp,
        maxt: Timestamp,
    ) -> Result<Ulid> {
        compactor
            .write(dump_dir, &self.head, mint, maxt, None)
            .map_err(|e| DumpError::engine("write head block", dump_dir, e))
    }
}
