//! Dump orchestration: open a database for a window, then dump it.

use crate::config::DumpConfig;
use crate::dump::catalog::{discover, Block};
use crate::dump::extract::{link_block, LinkedBlock};
use crate::dump::head::HeadManager;
use crate::dump::range::Window;
use crate::error::{DumpError, Result};
use crate::tsdb::{LeveledCompactor, Timestamp};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use ulid::Ulid;

/// What a dump produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpReport {
    /// Blocks hard-linked into the dump, in id order.
    pub linked: Vec<LinkedBlock>,
    /// Blocks outside the window.
    pub skipped: Vec<Ulid>,
    /// Block written from the head, if the head overlapped the window.
    pub head_block: Option<Ulid>,
}

/// A database opened for dumping one time window.
///
/// The block list is a snapshot taken when the dumper is opened. Nothing
/// stops another process from compacting the source directory meanwhile;
/// callers must make sure no writer is active.
pub struct Dumper {
    db_path: PathBuf,
    window: Window,
    blocks: Vec<Block>,
    head: HeadManager,
    compactor: LeveledCompactor,
    parallelism: usize,
}

impl std::fmt::Debug for Dumper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dumper")
            .field("db_path", &self.db_path)
            .field("window", &self.window)
            .field("blocks", &self.blocks)
            .field("compactor", &self.compactor)
            .field("parallelism", &self.parallelism)
            .finish_non_exhaustive()
    }
}

impl Dumper {
    /// Opens `db_path` for dumping `[start, end]` with default settings.
    pub fn open(db_path: impl AsRef<Path>, start: Timestamp, end: Timestamp) -> Result<Self> {
        Self::open_with_config(db_path, start, end, DumpConfig::default())
    }

    /// Opens `db_path` for dumping `[start, end]`.
    ///
    /// Discovers every block, then replays the WAL from the newest block's
    /// `maxTime` (or from the beginning when there are no blocks).
    pub fn open_with_config(
        db_path: impl AsRef<Path>,
        start: Timestamp,
        end: Timestamp,
        config: DumpConfig,
    ) -> Result<Self> {
        let db_path = db_path.as_ref();
        if db_path.as_os_str().is_empty() {
            return Err(DumpError::Config("database path is empty".to_string()));
        }
        let window = Window::new(start, end)?;
        config.validate()?;

        let blocks = discover(db_path)?;
        let lower_bound = Self::replay_lower_bound(&blocks);
        let head = HeadManager::open(db_path, &config)?;
        head.init(lower_bound)?;

        debug!(
            "Opened {} for window {}: {} blocks, head replayed from {}",
            db_path.display(),
            window,
            blocks.len(),
            lower_bound
        );
        Self::from_parts(db_path, window, blocks, head, &config)
    }

    /// Assembles a dumper from an existing block list and an initialized head.
    pub fn from_parts(
        db_path: impl AsRef<Path>,
        window: Window,
        blocks: Vec<Block>,
        head: HeadManager,
        config: &DumpConfig,
    ) -> Result<Self> {
        let db_path = db_path.as_ref();
        if db_path.as_os_str().is_empty() {
            return Err(DumpError::Config("database path is empty".to_string()));
        }
        config.validate()?;
        let compactor = LeveledCompactor::new(config.block_ranges())
            .map_err(|e| DumpError::engine("create compactor", db_path, e))?;

        Ok(Self {
            db_path: db_path.to_path_buf(),
            window,
            blocks,
            head,
            compactor,
            parallelism: config.parallelism,
        })
    }

    /// The head replay lower bound: the largest block `maxTime`, or
    /// `i64::MIN` without blocks.
    pub fn replay_lower_bound(blocks: &[Block]) -> Timestamp {
        blocks
            .iter()
            .map(|b| b.meta.max_time)
            .max()
            .unwrap_or(i64::MIN)
    }

    /// Source database directory.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// The dump window.
    pub fn window(&self) -> Window {
        self.window
    }

    /// Blocks discovered at open.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// The head.
    pub fn head(&self) -> &HeadManager {
        &self.head
    }

    /// Dumps the window into `dump_dir`.
    ///
    /// Overlapping blocks are hard-linked and the overlapping part of the
    /// head is written as one new block. In sequential mode the first error
    /// aborts the dump; with parallel linking every block is attempted and
    /// all failures are returned together. Whatever succeeded before a
    /// failure stays on disk.
    pub fn dump(&self, dump_dir: impl AsRef<Path>) -> Result<DumpReport> {
        let dump_dir = dump_dir.as_ref();
        if dump_dir.as_os_str().is_empty() {
            return Err(DumpError::Config("dump directory is empty".to_string()));
        }
        if resolve(dump_dir) == resolve(&self.db_path) {
            return Err(DumpError::Config(format!(
                "dump directory {} is the source directory",
                dump_dir.display()
            )));
        }
        fs::create_dir_all(dump_dir)
            .map_err(|e| DumpError::filesystem("create directory", dump_dir, e))?;

        let (selected, skipped): (Vec<&Block>, Vec<&Block>) = self
            .blocks
            .iter()
            .partition(|b| self.window.overlaps_meta(&b.meta));
        for block in &skipped {
            debug!(
                "Skipping block {} [{}, {}] outside {}",
                block.id, block.meta.min_time, block.meta.max_time, self.window
            );
        }

        let linked = if self.parallelism > 1 {
            self.link_parallel(&selected, dump_dir)?
        } else {
            selected
                .iter()
                .map(|block| link_block(block, dump_dir))
                .collect::<Result<Vec<_>>>()?
        };

        let head_block = self.flush_head(dump_dir)?;

        info!(
            "Dumped window {} of {} into {}: {} blocks linked, {} skipped, head block {:?}",
            self.window,
            self.db_path.display(),
            dump_dir.display(),
            linked.len(),
            skipped.len(),
            head_block
        );
        Ok(DumpReport {
            linked,
            skipped: skipped.iter().map(|b| b.id).collect(),
            head_block,
        })
    }

    fn link_parallel(&self, blocks: &[&Block], dump_dir: &Path) -> Result<Vec<LinkedBlock>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallelism)
            .build()
            .map_err(|e| DumpError::Config(format!("cannot build linking pool: {}", e)))?;

        let results: Vec<Result<LinkedBlock>> = pool.install(|| {
            blocks
                .par_iter()
                .map(|block| link_block(block, dump_dir))
                .collect()
        });

        let mut linked = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(block) => linked.push(block),
                Err(e) => errors.push(e),
            }
        }

        match errors.len() {
            0 => Ok(linked),
            1 => Err(errors.remove(0)),
            _ => Err(DumpError::Aggregate(errors)),
        }
    }

    fn flush_head(&self, dump_dir: &Path) -> Result<Option<Ulid>> {
        if self.head.is_empty() {
            return Ok(None);
        }
        let (min, max) = (self.head.min_time(), self.head.max_time());
        let Some((mint, maxt)) = self.window.intersect(min, max) else {
            debug!("Head [{}, {}] outside {}", min, max, self.window);
            return Ok(None);
        };
        self.head
            .flush(&self.compactor, dump_dir, mint, maxt)
            .map(Some)
    }
}

/// Resolves `path` to an absolute path, following symlinks for the part
/// that exists.
fn resolve(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => resolve(parent).join(name),
        (_, Some(name)) => resolve(Path::new(".")).join(name),
        _ => path.to_path_buf(),
    }
}
