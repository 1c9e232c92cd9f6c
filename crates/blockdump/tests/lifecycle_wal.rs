//! Integration tests for head recovery from the write-ahead log.

use alopex_blockdump::tsdb::head::DEFAULT_CHUNK_RANGE;
use alopex_blockdump::tsdb::{Db, DbOptions, Head, Labels, SyncMode, Wal, WalConfig, WalRecord};
use alopex_blockdump::Dumper;
use std::fs;
use std::thread;
use tempfile::TempDir;

fn options() -> DbOptions {
    DbOptions {
        wal: WalConfig::new(4, 64 * 1024, SyncMode::Fdatasync),
        ..DbOptions::default()
    }
}

/// Every committed batch survives a restart; uncommitted appends do not.
#[test]
fn test_restart_recovers_committed_batches() {
    let temp_dir = TempDir::new().unwrap();
    let labels = Labels::from_pairs([("__name__", "temp"), ("room", "lab")]);
    {
        let db = Db::open(temp_dir.path(), options()).unwrap();
        for batch in 0..20 {
            let mut app = db.appender();
            let r = app.add(&labels, batch * 1000, 1.0).unwrap();
            app.add_fast(r, batch * 1000 + 500, 2.0).unwrap();
            app.commit().unwrap();
        }
        let mut app = db.appender();
        app.add(&labels, 999_999, 0.0).unwrap();
        app.rollback().unwrap();
        db.close().unwrap();
    }

    let db = Db::open(temp_dir.path(), options()).unwrap();
    assert_eq!(db.head().num_samples(), 40);
    assert_eq!(db.head().range(), Some((0, 19_500)));
    assert_eq!(db.head().num_series(), 1);
}

/// Appenders sharing a series commit out of creation order, and a creator
/// rolls back under a live user; a restart replays exactly what committed.
#[test]
fn test_interleaved_appenders_on_shared_series() {
    let temp_dir = TempDir::new().unwrap();
    let lab = Labels::from_pairs([("__name__", "temp"), ("room", "lab")]);
    let hall = Labels::from_pairs([("__name__", "temp"), ("room", "hall")]);
    {
        let db = Db::open(temp_dir.path(), options()).unwrap();

        let mut first = db.appender();
        let mut second = db.appender();
        first.add(&lab, 1000, 1.0).unwrap();
        second.add(&lab, 2000, 2.0).unwrap();
        assert_eq!(second.commit().unwrap(), 1);
        assert_eq!(first.commit().unwrap(), 1);

        let mut creator = db.appender();
        let mut user = db.appender();
        creator.add(&hall, 3000, 3.0).unwrap();
        user.add(&hall, 4000, 4.0).unwrap();
        creator.rollback().unwrap();
        assert_eq!(user.commit().unwrap(), 1);

        assert_eq!(db.head().num_samples(), 3);
        db.close().unwrap();
    }

    let db = Db::open(temp_dir.path(), options()).unwrap();
    assert_eq!(db.head().num_samples(), 3);
    assert_eq!(db.head().num_series(), 2);
    assert_eq!(db.head().range(), Some((1000, 4000)));
    drop(db);

    let dumper = Dumper::open(temp_dir.path(), i64::MIN, i64::MAX).unwrap();
    assert_eq!(dumper.head().min_time(), 1000);
    assert_eq!(dumper.head().max_time(), 4000);
}

/// Threads committing and rolling back on the same series lose nothing
/// across a restart.
#[test]
fn test_concurrent_appenders_replay_every_sample() {
    const THREADS: i64 = 8;
    const BATCHES: i64 = 25;
    let temp_dir = TempDir::new().unwrap();
    let jobs: Vec<Labels> = (0..3)
        .map(|j| Labels::from_pairs([("job", j.to_string())]))
        .collect();
    let committed = (THREADS * (BATCHES - BATCHES / 5) * jobs.len() as i64) as u64;
    {
        let db = Db::open(temp_dir.path(), options()).unwrap();
        thread::scope(|scope| {
            for worker in 0..THREADS {
                let (db, jobs) = (&db, &jobs);
                scope.spawn(move || {
                    for batch in 0..BATCHES {
                        let t = (worker * BATCHES + batch) * 10;
                        let mut app = db.appender();
                        for (i, labels) in jobs.iter().enumerate() {
                            app.add(labels, t + i as i64, 1.0).unwrap();
                        }
                        if batch % 5 == 4 {
                            app.rollback().unwrap();
                        } else {
                            app.commit().unwrap();
                        }
                    }
                });
            }
        });
        assert_eq!(db.head().num_samples(), committed);
        db.close().unwrap();
    }

    let db = Db::open(temp_dir.path(), options()).unwrap();
    assert_eq!(db.head().num_samples(), committed);
    assert_eq!(db.head().num_series(), 3);
}

/// A torn trailing record is dropped; everything before it is replayed.
#[test]
fn test_torn_wal_tail_is_tolerated() {
    let temp_dir = TempDir::new().unwrap();
    let wal_dir = temp_dir.path().join("wal");
    {
        let db = Db::open(temp_dir.path(), options()).unwrap();
        let labels = Labels::from_pairs([("job", "x")]);
        for t in [1000, 2000, 3000] {
            let mut app = db.appender();
            app.add(&labels, t, 1.0).unwrap();
            app.commit().unwrap();
        }
        db.close().unwrap();
    }

    let mut segments: Vec<_> = fs::read_dir(&wal_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    segments.sort();
    let last = segments.last().unwrap();
    let data = fs::read(last).unwrap();
    fs::write(last, &data[..data.len() - 5]).unwrap();

    let records = Wal::recover(&wal_dir).unwrap();
    assert!(records.iter().any(|r| matches!(r, WalRecord::Series(_))));

    let head = Head::open(&wal_dir, DEFAULT_CHUNK_RANGE);
    head.init(i64::MIN).unwrap();
    assert_eq!(head.range(), Some((1000, 2000)));
}
