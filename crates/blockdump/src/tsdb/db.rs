//! A writable database: sealed blocks plus a WAL-backed head.

use crate::error::{EngineError, EngineResult};
use crate::tsdb::compact::{exponential_block_ranges, LeveledCompactor};
use crate::tsdb::head::{Head, HeadAppender, DEFAULT_CHUNK_RANGE};
use crate::tsdb::meta::{classify_dir_name, read_meta, BlockDirKind, BlockMeta};
use crate::tsdb::wal::{Wal, WalConfig};
use crate::tsdb::WAL_DIRNAME;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Options for [`Db::open`].
#[derive(Debug, Clone)]
pub struct DbOptions {
    /// WAL settings.
    pub wal: WalConfig,
    /// Head chunk range in milliseconds.
    pub chunk_range: i64,
    /// Block ranges, smallest first. The first one sizes head compactions.
    pub block_ranges: Vec<i64>,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            wal: WalConfig::default(),
            chunk_range: DEFAULT_CHUNK_RANGE,
            block_ranges: exponential_block_ranges(DEFAULT_CHUNK_RANGE, 3, 5),
        }
    }
}

/// A database directory opened for writing.
pub struct Db {
    dir: PathBuf,
    head: Head,
    compactor: LeveledCompactor,
    blocks: RwLock<Vec<BlockMeta>>,
    compactions_enabled: AtomicBool,
}

impl Db {
    /// Opens (or creates) the database at `dir`.
    ///
    /// Leftover `*.tmp` block directories are removed, block metadata is
    /// loaded, and the head replays the WAL from the newest block's
    /// `maxTime` on.
    pub fn open(dir: impl AsRef<Path>, options: DbOptions) -> EngineResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let compactor = LeveledCompactor::new(options.block_ranges)?;

        let mut blocks = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.ends_with(".tmp") {
                warn!("Removing incomplete block {}", entry.path().display());
                fs::remove_dir_all(entry.path())?;
                continue;
            }
            if let BlockDirKind::Block(_) = classify_dir_name(name) {
                let (meta, _) = read_meta(&entry.path())?;
                blocks.push(meta);
            }
        }
        blocks.sort_by_key(|m| m.ulid);

        let min_valid = blocks
            .iter()
            .map(|m| m.max_time)
            .max()
            .unwrap_or(i64::MIN);
        let wal = Wal::new(dir.join(WAL_DIRNAME), options.wal)?;
        let head = Head::with_wal(wal, options.chunk_range);
        head.init(min_valid)?;

        info!(
            "Opened database {} with {} blocks, head {} samples",
            dir.display(),
            blocks.len(),
            head.num_samples()
        );
        Ok(Self {
            dir,
            head,
            compactor,
            blocks: RwLock::new(blocks),
            compactions_enabled: AtomicBool::new(true),
        })
    }

    /// Database directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The head.
    pub fn head(&self) -> &Head {
        &self.head
    }

    /// Returns a head appender.
    pub fn appender(&self) -> HeadAppender<'_> {
        self.head.appender()
    }

    /// Metadata of the sealed blocks, ordered by ULID.
    pub fn blocks(&self) -> EngineResult<Vec<BlockMeta>> {
        self.blocks
            .read()
            .map(|b| b.clone())
            .map_err(|_| EngineError::Corrupt("block list lock poisoned".to_string()))
    }

    /// Makes [`Db::compact`] a no-op until re-enabled.
    pub fn disable_compactions(&self) {
        self.compactions_enabled.store(false, Ordering::Relaxed);
    }

    /// Re-enables [`Db::compact`].
    pub fn enable_compactions(&self) {
        self.compactions_enabled.store(true, Ordering::Relaxed);
    }

    /// Seals the oldest head range into blocks while the head spans more
    /// than one and a half chunk ranges. Returns the new block ids.
    pub fn compact(&self) -> EngineResult<Vec<Ulid>> {
        if !self.compactions_enabled.load(Ordering::Relaxed) {
            debug!("Compactions disabled, skipping");
            return Ok(Vec::new());
        }

        let block_range = self.compactor.ranges()[0];
        let mut written = Vec::new();
        while let Some((min, max)) = self.head.range() {
            if max.saturating_sub(min) <= self.head.chunk_range() / 2 * 3 {
                break;
            }
            let mint = min - min.rem_euclid(block_range);
            // Samples at i64::MAX stay in the head so `maxt + 1` is a valid
            // truncation point.
            let maxt = mint.saturating_add(block_range - 1).min(i64::MAX - 1);

            let id = self
                .compactor
                .write(&self.dir, &self.head, mint, maxt, None)
                .map_err(|e| {
                    warn!("Head compaction [{}, {}] failed: {:?}", mint, maxt, e);
                    e
                })?;
            let (meta, _) = read_meta(&self.dir.join(id.to_string()))?;
            self.blocks
                .write()
                .map_err(|_| EngineError::Corrupt("block list lock poisoned".to_string()))?
                .push(meta);
            self.head.truncate(maxt + 1)?;
            written.push(id);
        }
        Ok(written)
    }

    /// Flushes the WAL and closes the database.
    pub fn close(self) -> EngineResult<()> {
        self.head.sync_wal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsdb::{Labels, SyncMode};
    use tempfile::TempDir;

    const HOUR: i64 = 60 * 60 * 1000;

    fn options() -> DbOptions {
        DbOptions {
            wal: WalConfig::new(8, 1024 * 1024, SyncMode::None),
            ..DbOptions::default()
        }
    }

    fn fill(db: &Db, from: i64, to: i64, step: i64) {
        let labels = Labels::from_pairs([("__name__", "cpu")]);
        let mut app = db.appender();
        let mut t = from;
        while t <= to {
            app.add(&labels, t, 1.0).unwrap();
            t += step;
        }
        app.commit().unwrap();
    }

    #[test]
    fn test_reopen_replays_head() {
        let temp_dir = TempDir::new().unwrap();
        {
            let db = Db::open(temp_dir.path(), options()).unwrap();
            fill(&db, 0, 9_000, 1000);
            db.close().unwrap();
        }
        let db = Db::open(temp_dir.path(), options()).unwrap();
        assert_eq!(db.head().range(), Some((0, 9_000)));
        assert!(db.blocks().unwrap().is_empty());
    }

    #[test]
    fn test_compact_seals_aligned_block() {
        let temp_dir = TempDir::new().unwrap();
        let db = Db::open(temp_dir.path(), options()).unwrap();
        fill(&db, 0, 4 * HOUR, 60_000);

        let ids = db.compact().unwrap();
        assert_eq!(ids.len(), 1);
        let blocks = db.blocks().unwrap();
        assert_eq!((blocks[0].min_time, blocks[0].max_time), (0, 2 * HOUR - 1));
        assert_eq!(db.head().range(), Some((2 * HOUR, 4 * HOUR)));
        db.close().unwrap();

        let reopened = Db::open(temp_dir.path(), options()).unwrap();
        assert_eq!(reopened.blocks().unwrap().len(), 1);
        assert_eq!(reopened.head().min_time(), 2 * HOUR);
    }

    #[test]
    fn test_disabled_compactions() {
        let temp_dir = TempDir::new().unwrap();
        let db = Db::open(temp_dir.path(), options()).unwrap();
        fill(&db, 0, 4 * HOUR, 60_000);

        db.disable_compactions();
        assert!(db.compact().unwrap().is_empty());
        db.enable_compactions();
        assert_eq!(db.compact().unwrap().len(), 1);
    }

    #[test]
    fn test_compact_near_max_timestamp() {
        let temp_dir = TempDir::new().unwrap();
        let block_range = 3 << 61;
        let db = Db::open(
            temp_dir.path(),
            DbOptions {
                block_ranges: vec![block_range],
                ..options()
            },
        )
        .unwrap();
        fill(&db, i64::MAX - 4 * HOUR, i64::MAX - 2 * HOUR, HOUR);
        let mut app = db.appender();
        app.add(&Labels::from_pairs([("__name__", "cpu")]), i64::MAX, 1.0)
            .unwrap();
        app.commit().unwrap();

        let ids = db.compact().unwrap();
        assert_eq!(ids.len(), 1);
        let blocks = db.blocks().unwrap();
        assert_eq!(
            (blocks[0].min_time, blocks[0].max_time),
            (block_range, i64::MAX - 1)
        );
        assert_eq!(blocks[0].stats.num_samples, 3);
        assert_eq!(db.head().range(), Some((i64::MAX, i64::MAX)));
    }

    #[test]
    fn test_open_removes_tmp_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let tmp = temp_dir.path().join("01BKGV7JBM69T2G1BGBGM6KB12.tmp");
        fs::create_dir_all(&tmp).unwrap();
        Db::open(temp_dir.path(), options()).unwrap();
        assert!(!tmp.exists());
    }
}
