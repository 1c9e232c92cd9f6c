//! Bulk sample import into a [`Db`].
//!
//! Input is one sample per line in the form
//! `{__name__:"up", job:"api", __value__:1, __time__:1000}`. `__value__` and
//! `__time__` are reserved keys, every other pair is a label.
//!
//! Ingestion splits the samples into bounded batches, appends each batch on
//! a worker pool with its own appender, and sums the committed counts under
//! one lock once every worker has joined.

use crate::error::{EngineError, IngestError};
use crate::tsdb::{Db, Labels, SeriesRef, Timestamp};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Samples per batch when the caller passes zero.
pub const DEFAULT_INGEST_BATCH: usize = 1000;

const VALUE_KEY: &str = "__value__";
const TIME_KEY: &str = "__time__";

/// One parsed input line.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportSample {
    /// Series labels.
    pub labels: Labels,
    /// Sample value.
    pub value: f64,
    /// Sample timestamp in milliseconds, `0` when the line has none.
    pub timestamp: Timestamp,
}

/// Totals of an ingestion run.
#[derive(Debug, Default)]
pub struct IngestReport {
    /// Samples committed.
    pub samples: u64,
    /// Batches processed, failed ones included.
    pub batches: usize,
    /// Every batch failure.
    pub errors: Vec<IngestError>,
}

/// Parses sample lines until end of input or the first blank line.
///
/// Label sets seen before are dropped, keeping the first occurrence.
pub fn parse_sample_lines<R: BufRead>(reader: R) -> Result<Vec<ImportSample>, IngestError> {
    let mut samples = Vec::new();
    let mut seen = HashSet::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let cleaned: String = line
            .chars()
            .filter(|c| !matches!(c, '"' | '{' | '}'))
            .collect();
        if cleaned.trim().is_empty() {
            break;
        }

        let mut pairs = Vec::new();
        let mut value = 0.0;
        let mut timestamp = 0;
        for part in cleaned.split(',') {
            let (key, raw) = part.split_once(':').ok_or_else(|| IngestError::Parse {
                line: idx + 1,
                message: format!("expected key:value, got {:?}", part.trim()),
            })?;
            let (key, raw) = (key.trim(), raw.trim());
            match key {
                VALUE_KEY => {
                    value = raw.parse().map_err(|_| IngestError::Parse {
                        line: idx + 1,
                        message: format!("invalid value {:?}", raw),
                    })?;
                }
                TIME_KEY => {
                    timestamp = raw.parse().map_err(|_| IngestError::Parse {
                        line: idx + 1,
                        message: format!("invalid timestamp {:?}", raw),
                    })?;
                }
                _ => pairs.push((key.to_string(), raw.to_string())),
            }
        }

        let labels = Labels::new(pairs);
        if !seen.insert(labels.clone()) {
            continue;
        }
        samples.push(ImportSample {
            labels,
            value,
            timestamp,
        });
    }

    debug!("Parsed {} import samples", samples.len());
    Ok(samples)
}

/// Appends `samples` to `db` in batches of `batch_size` on the rayon pool.
///
/// A failed batch is rolled back and reported; other batches still commit.
pub fn ingest_sharded(db: &Db, samples: &[ImportSample], batch_size: usize) -> IngestReport {
    let batch_size = if batch_size == 0 {
        DEFAULT_INGEST_BATCH
    } else {
        batch_size
    };
    let report = Mutex::new(IngestReport::default());

    samples
        .par_chunks(batch_size)
        .enumerate()
        .for_each(|(batch, chunk)| {
            let result = ingest_batch(db, chunk);
            let Ok(mut report) = report.lock() else {
                warn!("Ingest accumulator poisoned, dropping batch {} result", batch);
                return;
            };
            report.batches += 1;
            match result {
                Ok(n) => report.samples += n,
                Err(source) => report.errors.push(IngestError::Engine { batch, source }),
            }
        });

    let report = report.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
    info!(
        "Ingested {} samples in {} batches ({} failed)",
        report.samples,
        report.batches,
        report.errors.len()
    );
    report
}

fn ingest_batch(db: &Db, chunk: &[ImportSample]) -> Result<u64, EngineError> {
    let mut app = db.appender();
    let mut refs: HashMap<&Labels, SeriesRef> = HashMap::new();

    for sample in chunk {
        match refs.get(&sample.labels) {
            Some(&series_ref) => match app.add_fast(series_ref, sample.timestamp, sample.value) {
                Ok(()) => {}
                Err(EngineError::NotFound(_)) => {
                    let series_ref = app.add(&sample.labels, sample.timestamp, sample.value)?;
                    refs.insert(&sample.labels, series_ref);
                }
                Err(e) => return Err(e),
            },
            None => {
                let series_ref = app.add(&sample.labels, sample.timestamp, sample.value)?;
                refs.insert(&sample.labels, series_ref);
            }
        }
    }

    Ok(app.commit()? as u64)
}
