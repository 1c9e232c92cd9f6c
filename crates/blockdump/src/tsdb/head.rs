//! In-memory head: the not-yet-sealed tail of the database.
//!
//! Samples become visible only after an appender commits them, and a commit
//! writes the WAL first:
//! ```text
//! add / add_fast → commit → WAL append + sync → head insert
//! ```
//!
//! A series is visible to every appender as soon as one of them creates it,
//! but its `Series` record is logged by whichever commit first carries a
//! sample for it. Commits hold the series write lock across the WAL append,
//! so the log order matches the order in which samples became visible.
//! Appenders pin the series they reference; a pinned series is neither
//! discarded on rollback nor dropped by truncation.
//!
//! A head opened read-only over an existing WAL directory replays it in
//! [`Head::init`] but never writes to it.

use crate::error::{EngineError, EngineResult};
use crate::tsdb::wal::{RefSample, RefSeries, Wal, WalRecord};
use crate::tsdb::{Labels, Sample, SeriesData, SeriesRef, SeriesSource, Timestamp};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Default head chunk range (2 hours in milliseconds).
pub const DEFAULT_CHUNK_RANGE: i64 = 2 * 60 * 60 * 1000;

/// Live counters of a head.
#[derive(Debug)]
pub struct HeadStats {
    num_samples: AtomicU64,
    num_series: AtomicU64,
    min_time: AtomicI64,
    max_time: AtomicI64,
}

impl HeadStats {
    fn new() -> Self {
        Self {
            num_samples: AtomicU64::new(0),
            num_series: AtomicU64::new(0),
            min_time: AtomicI64::new(i64::MAX),
            max_time: AtomicI64::new(i64::MIN),
        }
    }

    /// Number of samples held.
    pub fn num_samples(&self) -> u64 {
        self.num_samples.load(Ordering::Relaxed)
    }

    /// Number of series held.
    pub fn num_series(&self) -> u64 {
        self.num_series.load(Ordering::Relaxed)
    }

    /// Smallest sample timestamp, `i64::MAX` when empty.
    pub fn min_time(&self) -> Timestamp {
        self.min_time.load(Ordering::Relaxed)
    }

    /// Largest sample timestamp, `i64::MIN` when empty.
    pub fn max_time(&self) -> Timestamp {
        self.max_time.load(Ordering::Relaxed)
    }

    fn update_timestamp(&self, ts: Timestamp) {
        let mut current = self.min_time.load(Ordering::Relaxed);
        while ts < current {
            match self.min_time.compare_exchange_weak(
                current,
                ts,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(c) => current = c,
            }
        }

        let mut current = self.max_time.load(Ordering::Relaxed);
        while ts > current {
            match self.max_time.compare_exchange_weak(
                current,
                ts,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(c) => current = c,
            }
        }
    }

    fn reset(&self, num_series: u64, num_samples: u64, min: Timestamp, max: Timestamp) {
        self.num_series.store(num_series, Ordering::Relaxed);
        self.num_samples.store(num_samples, Ordering::Relaxed);
        self.min_time.store(min, Ordering::Relaxed);
        self.max_time.store(max, Ordering::Relaxed);
    }
}

struct MemSeries {
    labels: Labels,
    samples: BTreeMap<Timestamp, f64>,
    /// A `Series` record for this ref is in the WAL.
    logged: bool,
    /// Appenders holding uncommitted samples for this series.
    pins: AtomicUsize,
}

impl MemSeries {
    fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }
}

#[derive(Default)]
struct SeriesSet {
    by_ref: HashMap<SeriesRef, MemSeries>,
    by_hash: HashMap<u64, Vec<SeriesRef>>,
    next_ref: SeriesRef,
}

impl SeriesSet {
    fn lookup(&self, labels: &Labels) -> Option<SeriesRef> {
        self.by_hash.get(&labels.hash_value()).and_then(|refs| {
            refs.iter()
                .copied()
                .find(|r| self.by_ref.get(r).is_some_and(|s| &s.labels == labels))
        })
    }

    fn insert(&mut self, series_ref: SeriesRef, labels: Labels, logged: bool) {
        self.by_hash
            .entry(labels.hash_value())
            .or_default()
            .push(series_ref);
        self.by_ref.insert(
            series_ref,
            MemSeries {
                labels,
                samples: BTreeMap::new(),
                logged,
                pins: AtomicUsize::new(0),
            },
        );
        self.next_ref = self.next_ref.max(series_ref + 1);
    }

    fn remove(&mut self, series_ref: SeriesRef) {
        if let Some(series) = self.by_ref.remove(&series_ref) {
            let hash = series.labels.hash_value();
            if let Some(refs) = self.by_hash.get_mut(&hash) {
                refs.retain(|r| *r != series_ref);
                if refs.is_empty() {
                    self.by_hash.remove(&hash);
                }
            }
        }
    }

    /// Unpins `pinned` and removes every series in `created` that ended up
    /// without samples, WAL record or other pins. Returns how many were
    /// removed.
    fn release(
        &mut self,
        pinned: impl IntoIterator<Item = SeriesRef>,
        created: impl IntoIterator<Item = SeriesRef>,
    ) -> u64 {
        for series_ref in pinned {
            if let Some(series) = self.by_ref.get(&series_ref) {
                series.pins.fetch_sub(1, Ordering::AcqRel);
            }
        }

        let mut removed = 0;
        for series_ref in created {
            let unused = self.by_ref.get(&series_ref).is_some_and(|s| {
                s.samples.is_empty() && !s.logged && !s.is_pinned()
            });
            if unused {
                self.remove(series_ref);
                removed += 1;
            }
        }
        removed
    }
}

/// In-memory series store fed by appenders and rebuilt from the WAL.
pub struct Head {
    series: RwLock<SeriesSet>,
    stats: HeadStats,
    chunk_range: i64,
    min_valid_time: AtomicI64,
    wal_dir: Option<PathBuf>,
    wal: Option<Mutex<Wal>>,
}

impl Head {
    /// Creates an empty head without a WAL.
    pub fn new(chunk_range: i64) -> Self {
        Self {
            series: RwLock::new(SeriesSet::default()),
            stats: HeadStats::new(),
            chunk_range,
            min_valid_time: AtomicI64::new(i64::MIN),
            wal_dir: None,
            wal: None,
        }
    }

    /// Creates an empty head that replays `wal_dir` on [`Head::init`].
    ///
    /// The directory is only read. Commits made through this head are kept
    /// in memory and never logged.
    pub fn open(wal_dir: impl AsRef<Path>, chunk_range: i64) -> Self {
        Self {
            wal_dir: Some(wal_dir.as_ref().to_path_buf()),
            ..Self::new(chunk_range)
        }
    }

    /// Creates an empty head that replays and then appends to `wal`.
    pub fn with_wal(wal: Wal, chunk_range: i64) -> Self {
        Self {
            wal_dir: Some(wal.log_dir().to_path_buf()),
            wal: Some(Mutex::new(wal)),
            ..Self::new(chunk_range)
        }
    }

    /// Replays the WAL, dropping every sample older than `min_valid_time`.
    ///
    /// A missing WAL directory leaves the head empty.
    pub fn init(&self, min_valid_time: Timestamp) -> EngineResult<()> {
        self.min_valid_time.store(min_valid_time, Ordering::Relaxed);

        let Some(wal_dir) = &self.wal_dir else {
            return Ok(());
        };
        if !wal_dir.exists() {
            debug!("No WAL at {}, head starts empty", wal_dir.display());
            return Ok(());
        }

        let records = Wal::recover(wal_dir)?;
        let mut set = self.write_series()?;
        let mut replayed = 0u64;
        let mut skipped = 0u64;

        for record in records {
            match record {
                WalRecord::Series(series) => {
                    for s in series {
                        if !set.by_ref.contains_key(&s.series_ref) {
                            set.insert(s.series_ref, s.labels, true);
                            self.stats.num_series.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                WalRecord::Samples(samples) => {
                    for s in samples {
                        if s.t < min_valid_time {
                            skipped += 1;
                            continue;
                        }
                        match set.by_ref.get_mut(&s.series_ref) {
                            Some(series) => {
                                if series.samples.insert(s.t, s.v).is_none() {
                                    self.stats.num_samples.fetch_add(1, Ordering::Relaxed);
                                }
                                self.stats.update_timestamp(s.t);
                                replayed += 1;
                            }
                            None => {
                                warn!("WAL sample references unknown series {}", s.series_ref);
                            }
                        }
                    }
                }
            }
        }

        debug!(
            "Replayed {} samples from {} ({} below {} skipped)",
            replayed,
            wal_dir.display(),
            skipped,
            min_valid_time
        );
        Ok(())
    }

    fn read_series(&self) -> EngineResult<std::sync::RwLockReadGuard<'_, SeriesSet>> {
        self.series
            .read()
            .map_err(|_| EngineError::Corrupt("head series lock poisoned".to_string()))
    }

    fn write_series(&self) -> EngineResult<std::sync::RwLockWriteGuard<'_, SeriesSet>> {
        self.series
            .write()
            .map_err(|_| EngineError::Corrupt("head series lock poisoned".to_string()))
    }

    /// Smallest sample timestamp, `i64::MAX` when empty.
    pub fn min_time(&self) -> Timestamp {
        self.stats.min_time()
    }

    /// Largest sample timestamp, `i64::MIN` when empty.
    pub fn max_time(&self) -> Timestamp {
        self.stats.max_time()
    }

    /// True when the head holds no samples.
    pub fn is_empty(&self) -> bool {
        self.stats.num_samples() == 0
    }

    /// `(min_time, max_time)` or `None` when empty.
    pub fn range(&self) -> Option<(Timestamp, Timestamp)> {
        if self.is_empty() {
            None
        } else {
            Some((self.min_time(), self.max_time()))
        }
    }

    /// Number of series.
    pub fn num_series(&self) -> u64 {
        self.stats.num_series()
    }

    /// Number of samples.
    pub fn num_samples(&self) -> u64 {
        self.stats.num_samples()
    }

    /// Returns the head statistics.
    pub fn stats(&self) -> &HeadStats {
        &self.stats
    }

    /// Configured chunk range in milliseconds.
    pub fn chunk_range(&self) -> i64 {
        self.chunk_range
    }

    /// Oldest timestamp an appender accepts.
    pub fn min_valid_time(&self) -> Timestamp {
        self.min_valid_time.load(Ordering::Relaxed)
    }

    /// Drops every sample older than `mint` and series left without samples.
    pub fn truncate(&self, mint: Timestamp) -> EngineResult<()> {
        let mut set = self.write_series()?;

        let mut emptied = Vec::new();
        for (series_ref, series) in set.by_ref.iter_mut() {
            series.samples = series.samples.split_off(&mint);
            if series.samples.is_empty() && !series.is_pinned() {
                emptied.push(*series_ref);
            }
        }
        for series_ref in emptied {
            set.remove(series_ref);
        }

        let mut num_samples = 0u64;
        let mut min = i64::MAX;
        let mut max = i64::MIN;
        for series in set.by_ref.values() {
            num_samples += series.samples.len() as u64;
            if let Some((first, _)) = series.samples.first_key_value() {
                min = min.min(*first);
            }
            if let Some((last, _)) = series.samples.last_key_value() {
                max = max.max(*last);
            }
        }
        self.stats
            .reset(set.by_ref.len() as u64, num_samples, min, max);
        self.min_valid_time.fetch_max(mint, Ordering::Relaxed);

        debug!("Truncated head below {}, {} samples remain", mint, num_samples);
        Ok(())
    }

    /// Flushes buffered WAL records, if the head writes a WAL.
    pub fn sync_wal(&self) -> EngineResult<()> {
        if let Some(wal) = &self.wal {
            wal.lock()
                .map_err(|_| EngineError::Corrupt("WAL lock poisoned".to_string()))?
                .sync()?;
        }
        Ok(())
    }

    /// Returns a new appender. Nothing is visible until it commits.
    pub fn appender(&self) -> HeadAppender<'_> {
        HeadAppender {
            head: self,
            created: Vec::new(),
            pinned: HashSet::new(),
            samples: Vec::new(),
        }
    }

    fn check_bounds(&self, t: Timestamp) -> EngineResult<()> {
        let min_valid = self.min_valid_time();
        if t < min_valid {
            return Err(EngineError::OutOfBounds {
                timestamp: t,
                min_valid,
            });
        }
        Ok(())
    }
}

impl SeriesSource for Head {
    fn series_in_range(&self, mint: Timestamp, maxt: Timestamp) -> EngineResult<Vec<SeriesData>> {
        if mint > maxt {
            return Ok(Vec::new());
        }
        let set = self.read_series()?;
        let mut out: Vec<SeriesData> = set
            .by_ref
            .values()
            .filter_map(|series| {
                let samples: Vec<Sample> = series
                    .samples
                    .range(mint..=maxt)
                    .map(|(t, v)| Sample::new(*t, *v))
                    .collect();
                (!samples.is_empty()).then(|| SeriesData {
                    labels: series.labels.clone(),
                    samples,
                })
            })
            .collect();
        out.sort_by(|a, b| a.labels.cmp(&b.labels));
        Ok(out)
    }
}

/// Batches appends to a [`Head`].
pub struct HeadAppender<'a> {
    head: &'a Head,
    created: Vec<SeriesRef>,
    pinned: HashSet<SeriesRef>,
    samples: Vec<RefSample>,
}

impl HeadAppender<'_> {
    fn pin(&mut self, set: &SeriesSet, series_ref: SeriesRef) -> EngineResult<()> {
        let series = set
            .by_ref
            .get(&series_ref)
            .ok_or(EngineError::NotFound(series_ref))?;
        if self.pinned.insert(series_ref) {
            series.pins.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Adds a sample, creating the series if needed. Returns the series
    /// reference for use with [`HeadAppender::add_fast`].
    pub fn add(&mut self, labels: &Labels, t: Timestamp, v: f64) -> EngineResult<SeriesRef> {
        let head = self.head;
        head.check_bounds(t)?;

        let existing = {
            let set = head.read_series()?;
            let found = set.lookup(labels);
            if let Some(series_ref) = found {
                self.pin(&set, series_ref)?;
            }
            found
        };
        let series_ref = match existing {
            Some(series_ref) => series_ref,
            None => {
                let mut set = head.write_series()?;
                let series_ref = match set.lookup(labels) {
                    Some(series_ref) => series_ref,
                    None => {
                        let series_ref = set.next_ref;
                        set.insert(series_ref, labels.clone(), false);
                        head.stats.num_series.fetch_add(1, Ordering::Relaxed);
                        self.created.push(series_ref);
                        series_ref
                    }
                };
                self.pin(&set, series_ref)?;
                series_ref
            }
        };

        self.samples.push(RefSample { series_ref, t, v });
        Ok(series_ref)
    }

    /// Adds a sample to an existing series by reference.
    ///
    /// Fails with [`EngineError::NotFound`] if the reference is unknown, in
    /// which case callers fall back to [`HeadAppender::add`].
    pub fn add_fast(&mut self, series_ref: SeriesRef, t: Timestamp, v: f64) -> EngineResult<()> {
        let head = self.head;
        head.check_bounds(t)?;
        self.pin(&*head.read_series()?, series_ref)?;
        self.samples.push(RefSample { series_ref, t, v });
        Ok(())
    }

    /// Number of samples waiting for commit.
    pub fn pending(&self) -> usize {
        self.samples.len()
    }

    /// Logs the batch to the WAL (if any) and makes it visible. Returns the
    /// number of samples committed.
    ///
    /// Series referenced by the batch that have no WAL record yet are logged
    /// ahead of the samples. Fails with [`EngineError::NotFound`], without
    /// logging anything, if a referenced series no longer exists.
    pub fn commit(mut self) -> EngineResult<usize> {
        let head = self.head;
        let samples = std::mem::take(&mut self.samples);
        let mut set = head.write_series()?;

        let mut new_series = Vec::new();
        let mut seen = HashSet::new();
        for s in &samples {
            let series = set
                .by_ref
                .get(&s.series_ref)
                .ok_or(EngineError::NotFound(s.series_ref))?;
            if !series.logged && seen.insert(s.series_ref) {
                new_series.push(RefSeries {
                    series_ref: s.series_ref,
                    labels: series.labels.clone(),
                });
            }
        }

        if let Some(wal) = &head.wal {
            let mut wal = wal
                .lock()
                .map_err(|_| EngineError::Corrupt("WAL lock poisoned".to_string()))?;
            let mut records = Vec::with_capacity(2);
            if !new_series.is_empty() {
                records.push(WalRecord::Series(new_series));
            }
            if !samples.is_empty() {
                records.push(WalRecord::Samples(samples.clone()));
            }
            if !records.is_empty() {
                wal.append_batch(&records)?;
            }
        }

        for s in &samples {
            if let Some(series) = set.by_ref.get_mut(&s.series_ref) {
                series.logged = true;
                if series.samples.insert(s.t, s.v).is_none() {
                    head.stats.num_samples.fetch_add(1, Ordering::Relaxed);
                }
                head.stats.update_timestamp(s.t);
            }
        }

        let removed = set.release(self.pinned.drain(), self.created.drain(..));
        head.stats.num_series.fetch_sub(removed, Ordering::Relaxed);
        Ok(samples.len())
    }

    /// Discards pending samples and the series this appender created.
    pub fn rollback(mut self) -> EngineResult<()> {
        self.discard()
    }

    fn discard(&mut self) -> EngineResult<()> {
        self.samples.clear();
        if self.pinned.is_empty() && self.created.is_empty() {
            return Ok(());
        }
        let head = self.head;
        let mut set = head.write_series()?;
        let removed = set.release(self.pinned.drain(), self.created.drain(..));
        head.stats.num_series.fetch_sub(removed, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for HeadAppender<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.discard() {
            warn!("Failed to discard uncommitted appender state: {:?}", e);
        }
    }
}
