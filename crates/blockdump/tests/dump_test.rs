//! Integration tests for time-range dumps.
//!
//! These tests verify:
//! - Window filtering of sealed blocks
//! - Hard-link fidelity of extracted files
//! - Head flush into exactly one new block
//! - Config and discovery failures before any mutation
//! - Error aggregation in parallel linking

use alopex_blockdump::dump::{discover, HeadManager};
use alopex_blockdump::tsdb::head::DEFAULT_CHUNK_RANGE;
use alopex_blockdump::tsdb::meta::read_meta;
use alopex_blockdump::tsdb::{BlockReader, Db, DbOptions, Head, Labels, LeveledCompactor};
use alopex_blockdump::{DumpConfig, DumpError, Dumper, Window};
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tempfile::TempDir;
use ulid::Ulid;

const HOUR: i64 = 60 * 60 * 1000;

/// Writes a block holding samples at `min` and `max` for two series.
fn write_block(db: &Path, min: i64, max: i64) -> Ulid {
    let head = Head::new(DEFAULT_CHUNK_RANGE);
    let mut app = head.appender();
    for job in ["api", "db"] {
        let labels = Labels::from_pairs([("__name__", "up"), ("job", job)]);
        app.add(&labels, min, 1.0).unwrap();
        app.add(&labels, max, 0.0).unwrap();
    }
    app.commit().unwrap();

    LeveledCompactor::new(vec![2 * HOUR])
        .unwrap()
        .write(db, &head, min, max, None)
        .unwrap()
}

fn head_with(samples: &[i64]) -> Head {
    let head = Head::new(DEFAULT_CHUNK_RANGE);
    let mut app = head.appender();
    let labels = Labels::from_pairs([("__name__", "up"), ("job", "head")]);
    for t in samples {
        app.add(&labels, *t, *t as f64).unwrap();
    }
    app.commit().unwrap();
    head
}

fn dir_names(dir: &Path) -> BTreeSet<String> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

fn snapshot(dir: &Path) -> Vec<String> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        for entry in fs::read_dir(&d).unwrap() {
            let path = entry.unwrap().path();
            out.push(path.strip_prefix(dir).unwrap().display().to_string());
            if path.is_dir() {
                stack.push(path);
            }
        }
    }
    out.sort();
    out
}

// ============================================================================
// Window selection
// ============================================================================

/// Window [1000, 5000] over A[0,900], B[2000,3000], C[6000,7000] and a head
/// spanning [4000, 4500]: only B is linked, plus one head block.
#[test]
fn test_window_selects_overlapping_block_and_head() {
    let db = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let a = write_block(db.path(), 0, 900);
    let b = write_block(db.path(), 2000, 3000);
    let c = write_block(db.path(), 6000, 7000);

    let blocks = discover(db.path()).unwrap();
    let head = HeadManager::from_head(head_with(&[4000, 4250, 4500]));
    let window = Window::new(1000, 5000).unwrap();
    let dumper =
        Dumper::from_parts(db.path(), window, blocks, head, &DumpConfig::default()).unwrap();

    let dump_dir = out.path().join("dump");
    let report = dumper.dump(&dump_dir).unwrap();

    assert_eq!(report.linked.len(), 1);
    assert_eq!(report.linked[0].id, b);
    let mut skipped = report.skipped.clone();
    skipped.sort();
    let mut expected = vec![a, c];
    expected.sort();
    assert_eq!(skipped, expected);

    let head_id = report.head_block.unwrap();
    let expected_dirs: BTreeSet<String> = [b.to_string(), head_id.to_string()].into_iter().collect();
    assert_eq!(dir_names(&dump_dir), expected_dirs);

    let (meta, _) = read_meta(&dump_dir.join(head_id.to_string())).unwrap();
    assert_eq!((meta.min_time, meta.max_time), (4000, 4500));
    assert_eq!(meta.stats.num_samples, 3);
}

/// A head block covers only the intersection of the window and the head.
#[test]
fn test_head_block_clipped_to_window() {
    let db = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let head = HeadManager::from_head(head_with(&[4000, 4500, 5500, 6000]));
    let window = Window::new(4200, 5600).unwrap();
    let dumper =
        Dumper::from_parts(db.path(), window, Vec::new(), head, &DumpConfig::default()).unwrap();

    let report = dumper.dump(out.path()).unwrap();
    let dir = out.path().join(report.head_block.unwrap().to_string());
    let (meta, _) = read_meta(&dir).unwrap();
    assert_eq!((meta.min_time, meta.max_time), (4200, 5600));

    let series = BlockReader::open(&dir).unwrap().series().unwrap();
    let times: Vec<i64> = series[0].samples.iter().map(|s| s.t).collect();
    assert_eq!(times, vec![4500, 5500]);
}

/// Blocks strictly outside the window and an empty head contribute nothing.
#[test]
fn test_out_of_window_blocks_excluded() {
    let db = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    write_block(db.path(), 0, 900);
    write_block(db.path(), 2000, 3000);

    let dumper = Dumper::open(db.path(), 3001, 10_000).unwrap();
    let report = dumper.dump(out.path()).unwrap();

    assert!(report.linked.is_empty());
    assert_eq!(report.skipped.len(), 2);
    assert_eq!(report.head_block, None);
    assert!(dir_names(out.path()).is_empty());
}

/// Boundary-touching blocks are included.
#[test]
fn test_boundary_touching_block_included() {
    let db = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let b = write_block(db.path(), 2000, 3000);

    let report = Dumper::open(db.path(), 3000, 3000)
        .unwrap()
        .dump(out.path())
        .unwrap();
    assert_eq!(report.linked[0].id, b);
}

// ============================================================================
// Hard-link fidelity
// ============================================================================

#[test]
fn test_linked_files_identical_to_source() {
    let db = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let id = write_block(db.path(), 0, 900);

    let report = Dumper::open(db.path(), i64::MIN, i64::MAX)
        .unwrap()
        .dump(out.path())
        .unwrap();
    assert_eq!(report.linked[0].files, 4);

    let src = db.path().join(id.to_string());
    let dst = out.path().join(id.to_string());
    for rel in ["meta.json", "index", "tombstones", "chunks/000001"] {
        assert_eq!(
            fs::read(src.join(rel)).unwrap(),
            fs::read(dst.join(rel)).unwrap(),
            "{} differs",
            rel
        );
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let a = fs::metadata(src.join(rel)).unwrap();
            let b = fs::metadata(dst.join(rel)).unwrap();
            assert_eq!(a.ino(), b.ino(), "{} is not a hard link", rel);
            assert!(a.nlink() >= 2);
        }
    }

    // The linked block is itself a valid block.
    let reader = BlockReader::open(&dst).unwrap();
    assert_eq!(reader.series().unwrap().len(), 2);
}

// ============================================================================
// Failure modes
// ============================================================================

#[test]
fn test_dump_into_source_is_config_error_without_mutation() {
    let db = TempDir::new().unwrap();
    write_block(db.path(), 0, 900);
    let before = snapshot(db.path());

    let dumper = Dumper::open(db.path(), i64::MIN, i64::MAX).unwrap();
    assert!(dumper.dump(db.path()).unwrap_err().is_config());
    assert!(dumper.dump(db.path().join(".")).unwrap_err().is_config());

    assert_eq!(snapshot(db.path()), before);
}

#[test]
fn test_unsupported_meta_version_fails_discovery() {
    let db = TempDir::new().unwrap();
    write_block(db.path(), 0, 900);
    let bad = write_block(db.path(), 1000, 1900);

    let meta_path = db.path().join(bad.to_string()).join("meta.json");
    let mut json: serde_json::Value = serde_json::from_slice(&fs::read(&meta_path).unwrap()).unwrap();
    json["version"] = serde_json::json!(2);
    fs::write(&meta_path, serde_json::to_vec(&json).unwrap()).unwrap();

    match Dumper::open(db.path(), i64::MIN, i64::MAX) {
        Err(DumpError::Discovery { path, .. }) => assert!(path.ends_with(bad.to_string())),
        Err(other) => panic!("expected discovery error, got {:?}", other),
        Ok(_) => panic!("expected discovery error"),
    }
}

#[test]
fn test_rerun_into_same_directory_fails() {
    let db = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    write_block(db.path(), 0, 900);

    let dumper = Dumper::open(db.path(), i64::MIN, i64::MAX).unwrap();
    dumper.dump(out.path()).unwrap();
    match dumper.dump(out.path()) {
        Err(DumpError::Filesystem { source, .. }) => {
            assert_eq!(source.kind(), ErrorKind::AlreadyExists)
        }
        other => panic!("expected filesystem error, got {:?}", other),
    }
}

#[test]
fn test_parallel_linking_collects_every_failure() {
    let db = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let ids: Vec<Ulid> = (0..3)
        .map(|i| write_block(db.path(), i * 1000, i * 1000 + 500))
        .collect();

    // Pre-existing files make two of the three blocks fail.
    for id in &ids[..2] {
        let dir = out.path().join(id.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("meta.json"), b"taken").unwrap();
    }

    let config = DumpConfig::default().with_parallelism(4);
    let dumper = Dumper::open_with_config(db.path(), i64::MIN, i64::MAX, config).unwrap();
    let err = dumper.dump(out.path()).unwrap_err();

    assert!(matches!(err, DumpError::Aggregate(_)));
    let leaves = err.leaves();
    assert_eq!(leaves.len(), 2);
    assert!(leaves
        .iter()
        .all(|e| matches!(e, DumpError::Filesystem { .. })));
    assert!(out
        .path()
        .join(ids[2].to_string())
        .join("index")
        .exists());
}

#[test]
fn test_parallel_and_sequential_agree() {
    let db = TempDir::new().unwrap();
    let seq_out = TempDir::new().unwrap();
    let par_out = TempDir::new().unwrap();
    for i in 0..6 {
        write_block(db.path(), i * 1000, i * 1000 + 999);
    }

    let seq = Dumper::open(db.path(), 1500, 4500)
        .unwrap()
        .dump(seq_out.path())
        .unwrap();
    let par = Dumper::open_with_config(
        db.path(),
        1500,
        4500,
        DumpConfig::default().with_parallelism(3),
    )
    .unwrap()
    .dump(par_out.path())
    .unwrap();

    let ids = |r: &alopex_blockdump::DumpReport| r.linked.iter().map(|b| b.id).collect::<Vec<_>>();
    assert_eq!(ids(&seq), ids(&par));
    assert_eq!(seq.linked.len(), 4);
    assert_eq!(dir_names(seq_out.path()), dir_names(par_out.path()));
}

// ============================================================================
// Head replay through a real database
// ============================================================================

/// Samples sealed into a block are not replayed into the head again, and the
/// unsealed tail is dumped as a new block.
#[test]
fn test_dump_captures_unsealed_head() {
    let db_dir = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    {
        let db = Db::open(db_dir.path(), DbOptions::default()).unwrap();
        let labels = Labels::from_pairs([("__name__", "cpu"), ("host", "a")]);
        let mut app = db.appender();
        let mut t = 0;
        while t <= 4 * HOUR {
            app.add(&labels, t, 1.0).unwrap();
            t += 60_000;
        }
        app.commit().unwrap();
        assert_eq!(db.compact().unwrap().len(), 1);
        db.disable_compactions();
        db.close().unwrap();
    }
    let wal_before = snapshot(&db_dir.path().join("wal"));

    let dumper = Dumper::open(db_dir.path(), 3 * HOUR, 5 * HOUR).unwrap();
    assert_eq!(dumper.head().min_time(), 2 * HOUR);
    assert_eq!(dumper.head().max_time(), 4 * HOUR);

    let report = dumper.dump(out.path()).unwrap();
    assert!(report.linked.is_empty());
    assert_eq!(report.skipped.len(), 1);

    let dir = out.path().join(report.head_block.unwrap().to_string());
    let reader = BlockReader::open(&dir).unwrap();
    assert_eq!(
        (reader.meta().min_time, reader.meta().max_time),
        (3 * HOUR, 4 * HOUR)
    );
    let series = reader.series().unwrap();
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].samples.len(), 61);

    assert_eq!(snapshot(&db_dir.path().join("wal")), wal_before);
}

/// A full-window dump reproduces every sample exactly once.
#[test]
fn test_full_window_covers_blocks_and_head() {
    let db_dir = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    {
        let db = Db::open(db_dir.path(), DbOptions::default()).unwrap();
        let labels = Labels::from_pairs([("__name__", "mem")]);
        let mut app = db.appender();
        for i in 0..=240 {
            app.add(&labels, i * 60_000, i as f64).unwrap();
        }
        app.commit().unwrap();
        db.compact().unwrap();
        db.close().unwrap();
    }

    let report = Dumper::open(db_dir.path(), i64::MIN, i64::MAX)
        .unwrap()
        .dump(out.path())
        .unwrap();
    assert_eq!(report.linked.len(), 1);
    assert!(report.head_block.is_some());

    let mut total = 0;
    for name in dir_names(out.path()) {
        let reader = BlockReader::open(out.path().join(name)).unwrap();
        total += reader
            .series()
            .unwrap()
            .iter()
            .map(|s| s.samples.len())
            .sum::<usize>();
    }
    assert_eq!(total, 241);
}
