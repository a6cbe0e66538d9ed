//! End-to-end engine scenarios: durability, compaction, iteration and GC

use bytes::Bytes;
use lodedb_core::{Database, Entry, IteratorOptions, LodeError, Options};
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn options(dir: &Path) -> Options {
    init_tracing();
    let mut opts = Options::new(dir);
    opts.memtable_size = 64 * 1024;
    opts.max_table_size = 32 * 1024;
    opts.value_log_file_size = 256 * 1024;
    opts.value_gc_interval_ms = 0;
    opts
}

/// Options where every level overflows at once, so compaction pushes data
/// all the way down
fn tiny_levels(dir: &Path) -> Options {
    let mut opts = options(dir);
    opts.do_not_compact = true;
    opts.num_level_zero_tables = 1;
    opts.level_one_size = 1;
    opts.level_size_multiplier = 2;
    opts.max_levels = 4;
    opts
}

fn compact_all(db: &Database) {
    loop {
        let mut progressed = false;
        for level in 0..db.options().max_levels {
            while db.try_compact(level).unwrap() {
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
}

fn scan(db: &Database, opts: IteratorOptions) -> Vec<(Bytes, Bytes)> {
    db.iter(opts)
        .unwrap()
        .map(|item| {
            let item = item.unwrap();
            (item.key, item.value)
        })
        .collect()
}

fn files_with_ext(dir: &Path, ext: &str) -> BTreeSet<u64> {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| {
            let name = e.unwrap().file_name().into_string().unwrap();
            name.strip_suffix(&format!(".{}", ext))
                .and_then(|stem| stem.parse().ok())
        })
        .collect()
}

#[test]
fn test_batch_of_sequential_keys() -> anyhow::Result<()> {
    let temp_dir = TempDir::new()?;
    let db = Database::open(options(temp_dir.path()))?;

    let batch = (0..100)
        .map(|i| Entry::new(format!("key{}", i), format!("val{}", i)))
        .collect();
    db.write(batch)?;

    assert_eq!(db.get(b"key57")?, Some(Bytes::from("val57")));
    assert_eq!(db.get(b"key100")?, None);
    Ok(())
}

#[test]
fn test_last_operation_wins() -> anyhow::Result<()> {
    let temp_dir = TempDir::new()?;
    let db = Database::open(options(temp_dir.path()))?;

    db.put("key1", "val1")?;
    db.put("key1", "val2")?;
    db.delete("key1")?;
    db.put("key1", "val3")?;
    assert_eq!(db.get(b"key1")?, Some(Bytes::from("val3")));
    Ok(())
}

#[test]
fn test_last_operation_wins_across_flushes_and_compactions() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::open(tiny_levels(temp_dir.path())).unwrap();

    for round in 0..4 {
        for i in 0..50 {
            db.put(format!("k{:02}", i), format!("round{}-{}", round, i))
                .unwrap();
        }
        db.flush().unwrap();
        if round % 2 == 0 {
            compact_all(&db);
        }
    }
    for i in (0..50).step_by(3) {
        db.delete(format!("k{:02}", i)).unwrap();
    }
    db.flush().unwrap();
    for i in (0..50).step_by(6) {
        db.put(format!("k{:02}", i), format!("final-{}", i)).unwrap();
    }
    compact_all(&db);

    for i in 0..50 {
        let got = db.get(format!("k{:02}", i).as_bytes()).unwrap();
        let expected = if i % 6 == 0 {
            Some(Bytes::from(format!("final-{}", i)))
        } else if i % 3 == 0 {
            None
        } else {
            Some(Bytes::from(format!("round3-{}", i)))
        };
        assert_eq!(got, expected, "key k{:02}", i);
    }
}

#[test]
fn test_overwrite_ten_thousand_pointer_values() {
    let temp_dir = TempDir::new().unwrap();
    let mut opts = options(temp_dir.path());
    opts.memtable_size = 512 * 1024;
    opts.value_log_file_size = 1024 * 1024;
    let db = Database::open(opts).unwrap();

    let first = "a".repeat(64);
    let second = "b".repeat(256);
    for value in [&first, &second] {
        for chunk in (0..10_000).collect::<Vec<_>>().chunks(500) {
            let batch = chunk
                .iter()
                .map(|i| Entry::new(format!("key{:05}", i), format!("{}{}", value, i)))
                .collect();
            db.write(batch).unwrap();
        }
    }

    for i in 0..10_000 {
        assert_eq!(
            db.get(format!("key{:05}", i).as_bytes()).unwrap(),
            Some(Bytes::from(format!("{}{}", second, i)))
        );
    }
}

#[test]
fn test_concurrent_disjoint_writers() {
    let temp_dir = TempDir::new().unwrap();
    let mut opts = options(temp_dir.path());
    opts.memtable_size = 16 * 1024;
    opts.value_threshold = 8;
    opts.num_level_zero_tables = 2;
    opts.level_one_size = 64 * 1024;
    let db = Arc::new(Database::open(opts).unwrap());

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let db = db.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    db.put(format!("w{}-{:04}", t, i), format!("old-{}", i))
                        .unwrap();
                }
                for i in 0..500 {
                    db.put(format!("w{}-{:04}", t, i), format!("new-{}-{}", t, i))
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let items = scan(&db, IteratorOptions::default());
    assert_eq!(items.len(), 2000);
    for pair in items.windows(2) {
        assert!(pair[0].0 < pair[1].0);
    }
    for (key, value) in &items {
        let key = std::str::from_utf8(key).unwrap();
        let (t, i) = key[1..].split_once('-').unwrap();
        let i: u32 = i.parse().unwrap();
        assert_eq!(value, &Bytes::from(format!("new-{}-{}", t, i)));
    }
}

#[test]
fn test_forward_and_reverse_agree() {
    let temp_dir = TempDir::new().unwrap();
    let mut opts = tiny_levels(temp_dir.path());
    opts.value_threshold = 10;
    let db = Database::open(opts).unwrap();

    for i in 0..300 {
        db.put(format!("key{:03}", i), format!("value-number-{}", i))
            .unwrap();
        if i % 100 == 99 {
            db.flush().unwrap();
        }
    }
    db.try_compact(0).unwrap();
    for i in (0..300).step_by(7) {
        db.delete(format!("key{:03}", i)).unwrap();
    }

    let forward = scan(&db, IteratorOptions::default());
    let mut reverse = scan(
        &db,
        IteratorOptions {
            reverse: true,
            ..Default::default()
        },
    );
    reverse.reverse();
    assert_eq!(forward, reverse);
    assert_eq!(forward.len(), 300 - 43);
    assert!(forward.iter().all(|(k, _)| !k.starts_with(b"!lodedb!")));

    let prefetched = scan(
        &db,
        IteratorOptions {
            reverse: false,
            prefetch_size: 8,
        },
    );
    assert_eq!(forward, prefetched);
}

#[test]
fn test_rewind_restarts_and_sees_new_writes() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::open(options(temp_dir.path())).unwrap();
    for i in 0..20 {
        db.put(format!("k{:02}", i), "v").unwrap();
    }

    for prefetch_size in [0, 4] {
        let mut iter = db
            .iter(IteratorOptions {
                reverse: false,
                prefetch_size,
            })
            .unwrap();
        let head: Vec<_> = iter.by_ref().take(5).map(|r| r.unwrap().key).collect();
        assert_eq!(head.len(), 5);

        iter.rewind().unwrap();
        let all: Vec<_> = iter.by_ref().map(|r| r.unwrap().key).collect();
        assert_eq!(all.len(), 20);
        assert_eq!(all[0], Bytes::from("k00"));
        iter.close();
        assert!(iter.next().is_none());
    }

    let mut iter = db
        .iter(IteratorOptions {
            reverse: true,
            prefetch_size: 0,
        })
        .unwrap();
    assert_eq!(iter.next().unwrap().unwrap().key, Bytes::from("k19"));
    db.put("k20", "late").unwrap();
    iter.rewind().unwrap();
    assert_eq!(iter.next().unwrap().unwrap().key, Bytes::from("k20"));
}

#[test]
fn test_reopen_restores_data_and_file_set() {
    let temp_dir = TempDir::new().unwrap();
    let mut opts = options(temp_dir.path());
    opts.memtable_size = 8 * 1024;
    opts.num_level_zero_tables = 2;
    opts.level_one_size = 32 * 1024;
    opts.value_threshold = 20;

    {
        let db = Database::open(opts.clone()).unwrap();
        for i in 0..2000 {
            db.put(format!("key{:04}", i), format!("first-value-{:04}-with-padding", i))
                .unwrap();
        }
        for i in (0..2000).step_by(2) {
            db.put(format!("key{:04}", i), format!("second-{}", i)).unwrap();
        }
        for i in (0..2000).step_by(5) {
            db.delete(format!("key{:04}", i)).unwrap();
        }
        db.close().unwrap();
    }

    let db = Database::open(opts).unwrap();
    for i in 0..2000 {
        let got = db.get(format!("key{:04}", i).as_bytes()).unwrap();
        let expected = if i % 5 == 0 {
            None
        } else if i % 2 == 0 {
            Some(Bytes::from(format!("second-{}", i)))
        } else {
            Some(Bytes::from(format!("first-value-{:04}-with-padding", i)))
        };
        assert_eq!(got, expected, "key{:04}", i);
    }

    let live: BTreeSet<u64> = db
        .level_summaries()
        .iter()
        .flat_map(|l| l.tables.iter().map(|(id, _)| *id))
        .collect();
    assert_eq!(files_with_ext(temp_dir.path(), "sst"), live);
    let segments: BTreeSet<u64> = db.value_log_segments().into_iter().collect();
    assert_eq!(files_with_ext(temp_dir.path(), "vlog"), segments);
}

#[test]
fn test_deleted_key_never_resurrects() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::open(tiny_levels(temp_dir.path())).unwrap();

    db.put("doomed", "oldest").unwrap();
    db.put("bystander", "stays").unwrap();
    db.flush().unwrap();
    compact_all(&db);
    let last = db.level_summaries().last().unwrap().tables.len();
    assert!(last > 0);

    // A newer copy one level up, then the tombstone in L0
    db.put("doomed", "newer").unwrap();
    db.flush().unwrap();
    assert!(db.try_compact(0).unwrap());
    db.delete("doomed").unwrap();
    db.flush().unwrap();
    assert_eq!(db.get(b"doomed").unwrap(), None);

    compact_all(&db);
    assert_eq!(db.get(b"doomed").unwrap(), None);
    assert_eq!(db.get(b"bystander").unwrap(), Some(Bytes::from("stays")));
    let keys: Vec<_> = scan(&db, IteratorOptions::default())
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec![Bytes::from("bystander")]);

    // Everything collapsed into the last level
    let summaries = db.level_summaries();
    let (last, upper) = summaries.split_last().unwrap();
    assert!(upper.iter().all(|l| l.tables.is_empty()));
    assert!(!last.tables.is_empty());
}

#[test]
fn test_compaction_below_capacity_is_noop_and_converges() {
    let temp_dir = TempDir::new().unwrap();
    let mut opts = options(temp_dir.path());
    opts.do_not_compact = true;
    let db = Database::open(opts).unwrap();

    db.put("a", "1").unwrap();
    db.flush().unwrap();
    for level in 0..db.options().max_levels {
        assert!(!db.try_compact(level).unwrap());
    }
    drop(db);

    let db = Database::open(tiny_levels(temp_dir.path())).unwrap();
    for i in 0..100 {
        db.put(format!("k{}", i), "v").unwrap();
    }
    db.flush().unwrap();
    compact_all(&db);
    let settled = db.level_summaries();
    for level in 0..db.options().max_levels {
        assert!(!db.try_compact(level).unwrap());
    }
    assert_eq!(db.level_summaries(), settled);
    assert!(db.stats().compactions > 0);
}

#[test]
fn test_value_gc_reclaims_overwritten_segments() {
    let temp_dir = TempDir::new().unwrap();
    let mut opts = options(temp_dir.path());
    opts.do_not_compact = true;
    opts.value_threshold = 0;
    opts.value_log_file_size = 4 * 1024;
    let db = Database::open(opts.clone()).unwrap();

    let value = |gen: &str, i: u32| format!("{}-{:03}-{}", gen, i, "x".repeat(100));
    for i in 0..100 {
        db.put(format!("key{:03}", i), value("old", i)).unwrap();
    }
    let old_segments = db.value_log_segments();
    for i in 0..100 {
        db.put(format!("key{:03}", i), value("new", i)).unwrap();
    }
    db.flush().unwrap();

    let mut rounds = 0;
    while db.run_value_gc(0.0).unwrap() {
        rounds += 1;
    }
    assert!(rounds > 0);
    // Rewrites become durable with the next flush, which retires the segments
    db.flush().unwrap();

    let remaining: BTreeSet<u64> = db.value_log_segments().into_iter().collect();
    let reclaimed: Vec<_> = old_segments
        .iter()
        .filter(|fid| !remaining.contains(fid))
        .collect();
    assert!(!reclaimed.is_empty());
    assert_eq!(files_with_ext(temp_dir.path(), "vlog"), remaining);

    for i in 0..100 {
        assert_eq!(
            db.get(format!("key{:03}", i).as_bytes()).unwrap(),
            Some(Bytes::from(value("new", i)))
        );
    }
    drop(db);

    let db = Database::open(opts).unwrap();
    for i in 0..100 {
        assert_eq!(
            db.get(format!("key{:03}", i).as_bytes()).unwrap(),
            Some(Bytes::from(value("new", i)))
        );
    }
}

#[test]
fn test_flipped_value_log_byte_fails_one_read() {
    let temp_dir = TempDir::new().unwrap();
    let mut opts = options(temp_dir.path());
    opts.value_threshold = 0;
    let db = Database::open(opts).unwrap();

    // First record of segment 1: 13-byte header, 6-byte key, then the value
    db.put("victim", "v".repeat(64)).unwrap();
    db.put("healthy", "h".repeat(64)).unwrap();

    let file = OpenOptions::new()
        .write(true)
        .open(temp_dir.path().join("000001.vlog"))
        .unwrap();
    file.write_all_at(b"X", 13 + 6 + 10).unwrap();
    file.sync_all().unwrap();

    let err = db.get(b"victim").unwrap_err();
    assert!(matches!(err, LodeError::Corruption(_)), "{}", err);
    assert!(err.is_corruption());
    assert_eq!(db.get(b"healthy").unwrap(), Some(Bytes::from("h".repeat(64))));
}

#[test]
fn test_torn_manifest_tail_is_ignored() {
    let temp_dir = TempDir::new().unwrap();
    let opts = options(temp_dir.path());
    {
        let db = Database::open(opts.clone()).unwrap();
        db.put("durable", "yes").unwrap();
        db.flush().unwrap();
        db.close().unwrap();
    }
    {
        let mut manifest = OpenOptions::new()
            .append(true)
            .open(temp_dir.path().join("MANIFEST"))
            .unwrap();
        // Length prefix promising more bytes than follow
        manifest.write_all(&[200, 0, 0, 0, 1, 2]).unwrap();
    }

    let db = Database::open(opts).unwrap();
    assert_eq!(db.get(b"durable").unwrap(), Some(Bytes::from("yes")));
    db.put("after", "reopen").unwrap();
    db.flush().unwrap();
    assert_eq!(db.get(b"after").unwrap(), Some(Bytes::from("reopen")));
}

#[test]
fn test_damaged_manifest_length_refuses_open_and_keeps_tables() {
    let temp_dir = TempDir::new().unwrap();
    let mut opts = options(temp_dir.path());
    opts.do_not_compact = true;
    {
        let db = Database::open(opts.clone()).unwrap();
        for round in 0..3 {
            db.put(format!("key{}", round), "value").unwrap();
            db.flush().unwrap();
        }
        db.close().unwrap();
    }
    let tables = files_with_ext(temp_dir.path(), "sst");
    assert_eq!(tables.len(), 3);

    let path = temp_dir.path().join("MANIFEST");
    let mut bytes = fs::read(&path).unwrap();
    let len = bytes.len();
    // High byte of the first record's length
    bytes[3] ^= 0x10;
    fs::write(&path, &bytes).unwrap();

    let err = Database::open(opts).err().unwrap();
    assert!(err.is_corruption(), "{:?}", err);
    assert_eq!(fs::metadata(&path).unwrap().len(), len as u64);
    assert_eq!(files_with_ext(temp_dir.path(), "sst"), tables);
}

fn file_sizes(dir: &Path) -> Vec<(String, u64)> {
    let mut files: Vec<(String, u64)> = fs::read_dir(dir)
        .unwrap()
        .map(|e| {
            let e = e.unwrap();
            (e.file_name().into_string().unwrap(), e.metadata().unwrap().len())
        })
        .filter(|(name, _)| name != "LOCK")
        .collect();
    files.sort();
    files
}

#[test]
fn test_second_instance_is_read_only_and_changes_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let mut opts = options(temp_dir.path());
    opts.do_not_compact = true;

    let owner = Database::open(opts.clone()).unwrap();
    assert!(!owner.is_read_only());
    for i in 0..300 {
        owner.put(format!("key{:04}", i), format!("value{}", i)).unwrap();
    }
    owner.flush().unwrap();
    let before = file_sizes(temp_dir.path());

    {
        let reader = Database::open(opts.clone()).unwrap();
        assert!(reader.is_read_only());
        assert_eq!(reader.get(b"key0042").unwrap(), Some(Bytes::from("value42")));
        assert!(matches!(reader.put("other", "x"), Err(LodeError::ReadOnly)));
        assert!(matches!(reader.flush(), Err(LodeError::ReadOnly)));
        reader.close().unwrap();
    }
    assert_eq!(file_sizes(temp_dir.path()), before);

    for i in 300..600 {
        owner.put(format!("key{:04}", i), format!("value{}", i)).unwrap();
    }
    owner.flush().unwrap();
    owner.close().unwrap();
    drop(owner);

    let db = Database::open(opts).unwrap();
    assert!(!db.is_read_only());
    for i in 0..600 {
        assert_eq!(
            db.get(format!("key{:04}", i).as_bytes()).unwrap(),
            Some(Bytes::from(format!("value{}", i))),
            "key{:04}",
            i
        );
    }
}

#[test]
fn test_invalid_options_fail_at_open() {
    let temp_dir = TempDir::new().unwrap();
    let mut opts = options(temp_dir.path());
    opts.memtable_size = 0;
    assert!(matches!(Database::open(opts), Err(LodeError::Config(_))));
}
