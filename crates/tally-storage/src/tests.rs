use crate::error::StoreError;
use crate::{MemoryStore, MetricStore, SqliteStore, Storage, StoreConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tally_common::types::{Metric, MetricKind, MetricTable, MetricValue};
use tempfile::TempDir;

fn backends() -> Vec<(&'static str, Box<dyn MetricStore>)> {
    vec![
        ("memory", Box::new(MemoryStore::ephemeral())),
        ("sqlite", Box::new(SqliteStore::open(":memory:").unwrap())),
    ]
}

fn snapshot_path(dir: &TempDir) -> PathBuf {
    dir.path().join("metrics.json")
}

fn read_snapshot(path: &PathBuf) -> MetricTable {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

#[test]
fn counter_accumulates_and_gauge_overwrites() {
    for (name, store) in backends() {
        store.update(&Metric::counter("PollCount", 7)).unwrap();
        let total = store.update(&Metric::counter("PollCount", 22)).unwrap();
        assert_eq!(total, MetricValue::Counter(29), "{name}");
        assert_eq!(
            store.read("PollCount", MetricKind::Counter).unwrap(),
            MetricValue::Counter(29),
            "{name}"
        );

        store.update(&Metric::gauge("Alloc", 10.5)).unwrap();
        store.update(&Metric::gauge("Alloc", 3.2)).unwrap();
        assert_eq!(
            store.read("Alloc", MetricKind::Gauge).unwrap(),
            MetricValue::Gauge(3.2),
            "{name}"
        );
    }
}

#[test]
fn counter_sum_is_order_independent() {
    let deltas = [5_i64, -3, 40, 0, 11, -7];
    for (name, store) in backends() {
        for d in deltas.iter().rev() {
            store.update(&Metric::counter("c", *d)).unwrap();
        }
        assert_eq!(
            store.read("c", MetricKind::Counter).unwrap(),
            MetricValue::Counter(deltas.iter().sum()),
            "{name}"
        );
    }
}

#[test]
fn read_missing_is_not_found_and_creates_nothing() {
    for (name, store) in backends() {
        let err = store.read("nope", MetricKind::Gauge).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }), "{name}");
        assert!(store.read_all().unwrap().is_empty(), "{name}");

        store.update(&Metric::gauge("Alloc", 1.0)).unwrap();
        assert!(matches!(
            store.read("Alloc", MetricKind::Counter),
            Err(StoreError::NotFound { .. })
        ));
    }
}

#[test]
fn kind_mismatch_is_rejected() {
    for (name, store) in backends() {
        store.update(&Metric::gauge("x", 1.0)).unwrap();
        let err = store.update(&Metric::counter("x", 1)).unwrap_err();
        assert!(
            matches!(
                err,
                StoreError::KindMismatch {
                    stored: MetricKind::Gauge,
                    requested: MetricKind::Counter,
                    ..
                }
            ),
            "{name}: {err}"
        );
        assert!(err.is_client_error());
        assert!(store.read("x", MetricKind::Counter).is_err(), "{name}");
    }
}

#[test]
fn batch_with_one_invalid_record_changes_nothing() {
    for (name, store) in backends() {
        store.update(&Metric::counter("PollCount", 1)).unwrap();
        store.update(&Metric::gauge("Alloc", 1.0)).unwrap();
        store.update(&Metric::gauge("Taken", 1.0)).unwrap();
        let before = store.read_all().unwrap();

        let batch = vec![
            Metric::counter("PollCount", 5),
            Metric::gauge("Alloc", 9.0),
            Metric::gauge("Fresh", 2.0),
            Metric::counter("Taken", 1),
        ];
        assert!(store.update_batch(&batch).is_err(), "{name}");
        assert_eq!(store.read_all().unwrap(), before, "{name}");

        let bad_name = vec![Metric::gauge("Alloc", 2.0), Metric::gauge("", 1.0)];
        assert!(matches!(
            store.update_batch(&bad_name),
            Err(StoreError::Invalid(_))
        ));
        assert_eq!(store.read_all().unwrap(), before, "{name}");
    }
}

#[test]
fn batch_mixing_kinds_for_one_name_is_rejected() {
    for (name, store) in backends() {
        let batch = vec![Metric::gauge("dup", 1.0), Metric::counter("dup", 1)];
        assert!(store.update_batch(&batch).is_err(), "{name}");
        assert!(store.read_all().unwrap().is_empty(), "{name}");
    }
}

#[test]
fn batch_repeats_accumulate_in_order() {
    for (name, store) in backends() {
        let batch = vec![
            Metric::counter("c", 2),
            Metric::gauge("g", 1.0),
            Metric::counter("c", 3),
            Metric::gauge("g", 4.0),
        ];
        store.update_batch(&batch).unwrap();
        let table = store.read_all().unwrap();
        assert_eq!(table.counter.get("c"), Some(&5), "{name}");
        assert_eq!(table.gauge.get("g"), Some(&4.0), "{name}");
    }
}

#[test]
fn counter_overflow_rolls_back() {
    for (name, store) in backends() {
        store.update(&Metric::counter("big", i64::MAX - 1)).unwrap();
        let batch = vec![Metric::gauge("g", 1.0), Metric::counter("big", 2)];
        assert!(
            matches!(store.update_batch(&batch), Err(StoreError::Overflow(_))),
            "{name}"
        );
        assert_eq!(
            store.read("big", MetricKind::Counter).unwrap(),
            MetricValue::Counter(i64::MAX - 1)
        );
        assert!(store.read("g", MetricKind::Gauge).is_err(), "{name}");
    }
}

#[test]
fn concurrent_increments_are_linearizable() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 250;

    let stores: Vec<(&str, Arc<dyn MetricStore>)> = vec![
        ("memory", Arc::new(MemoryStore::ephemeral())),
        ("sqlite", Arc::new(SqliteStore::open(":memory:").unwrap())),
    ];
    for (name, store) in stores {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        store.update(&Metric::counter("hits", 1)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(
            store.read("hits", MetricKind::Counter).unwrap(),
            MetricValue::Counter((THREADS * PER_THREAD) as i64),
            "{name}"
        );
    }
}

#[test]
fn snapshot_round_trip_restores_identical_values() {
    let dir = TempDir::new().unwrap();
    let path = snapshot_path(&dir);

    let store = MemoryStore::new(Some(path.clone()), false);
    store.update(&Metric::counter("PollCount", 29)).unwrap();
    store.update(&Metric::gauge("Alloc", 3.2)).unwrap();
    store.update(&Metric::gauge("RandomValue", 0.123_456_789)).unwrap();
    store.close().unwrap();

    let written = read_snapshot(&path);
    assert_eq!(written.counter.get("PollCount"), Some(&29));

    let restored = MemoryStore::new(Some(path), false);
    assert_eq!(restored.restore_from_durable().unwrap(), 3);
    assert_eq!(restored.read_all().unwrap(), written);
}

#[test]
fn restore_replays_counters_through_update() {
    let dir = TempDir::new().unwrap();
    let path = snapshot_path(&dir);
    std::fs::write(&path, r#"{"gauge":{"Alloc":1.5},"counter":{"PollCount":10}}"#).unwrap();

    let store = MemoryStore::new(Some(path), false);
    store.update(&Metric::counter("PollCount", 5)).unwrap();
    store.update(&Metric::gauge("Alloc", 9.0)).unwrap();
    store.restore_from_durable().unwrap();

    assert_eq!(
        store.read("PollCount", MetricKind::Counter).unwrap(),
        MetricValue::Counter(15)
    );
    assert_eq!(
        store.read("Alloc", MetricKind::Gauge).unwrap(),
        MetricValue::Gauge(1.5)
    );
}

#[test]
fn restore_without_file_starts_empty() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new(Some(snapshot_path(&dir)), false);
    assert_eq!(store.restore_from_durable().unwrap(), 0);
    assert!(store.read_all().unwrap().is_empty());
}

#[test]
fn corrupt_snapshot_leaves_memory_untouched() {
    let dir = TempDir::new().unwrap();
    let path = snapshot_path(&dir);
    std::fs::write(&path, "{not json").unwrap();

    let store = MemoryStore::new(Some(path), false);
    store.update(&Metric::gauge("Alloc", 2.0)).unwrap();
    assert!(matches!(
        store.restore_from_durable(),
        Err(StoreError::Json(_))
    ));
    assert_eq!(
        store.read("Alloc", MetricKind::Gauge).unwrap(),
        MetricValue::Gauge(2.0)
    );
}

#[test]
fn write_through_persists_before_returning() {
    let dir = TempDir::new().unwrap();
    let path = snapshot_path(&dir);
    let store = MemoryStore::new(Some(path.clone()), true);
    assert!(store.is_write_through());

    store.update(&Metric::counter("PollCount", 7)).unwrap();
    assert_eq!(read_snapshot(&path).counter.get("PollCount"), Some(&7));

    store
        .update_batch(&[Metric::counter("PollCount", 22), Metric::gauge("Alloc", 3.2)])
        .unwrap();
    let on_disk = read_snapshot(&path);
    assert_eq!(on_disk.counter.get("PollCount"), Some(&29));
    assert_eq!(on_disk.gauge.get("Alloc"), Some(&3.2));
}

#[test]
fn write_through_failure_keeps_previous_memory_state() {
    let dir = TempDir::new().unwrap();
    // A regular file where the snapshot's parent directory should be.
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"").unwrap();
    let store = MemoryStore::new(Some(blocker.join("metrics.json")), true);

    let err = store.update(&Metric::counter("PollCount", 7)).unwrap_err();
    assert!(matches!(err, StoreError::Io { .. }));
    assert!(!err.is_client_error());
    assert!(store.read_all().unwrap().is_empty());
}

#[test]
fn periodic_mode_writes_only_on_flush() {
    let dir = TempDir::new().unwrap();
    let path = snapshot_path(&dir);
    let store = MemoryStore::new(Some(path.clone()), false);

    store.update(&Metric::gauge("Alloc", 1.0)).unwrap();
    assert!(!path.exists());
    store.flush().unwrap();
    assert_eq!(read_snapshot(&path).gauge.get("Alloc"), Some(&1.0));
}

#[test]
fn closed_store_rejects_calls() {
    for (name, store) in backends() {
        store.close().unwrap();
        assert!(matches!(store.ping(), Err(StoreError::Closed)), "{name}");
        assert!(matches!(
            store.update(&Metric::gauge("g", 1.0)),
            Err(StoreError::Closed)
        ));
        store.close().unwrap();
    }
}

#[test]
fn close_keeps_every_acknowledged_update() {
    for _ in 0..20 {
        let dir = TempDir::new().unwrap();
        let path = snapshot_path(&dir);
        let store = Arc::new(MemoryStore::new(Some(path.clone()), false));

        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                let mut acked = 0i64;
                while store.update(&Metric::counter("c", 1)).is_ok() {
                    acked += 1;
                }
                acked
            })
        };
        while store.read("c", MetricKind::Counter).is_err() {
            std::thread::yield_now();
        }
        store.close().unwrap();
        let acked = writer.join().unwrap();

        assert!(acked > 0);
        assert_eq!(read_snapshot(&path).counter.get("c"), Some(&acked));
    }
}

#[test]
fn sqlite_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    let dsn = dir.path().join("metrics.db");
    let dsn = dsn.to_str().unwrap();

    let store = SqliteStore::open(dsn).unwrap();
    store.update(&Metric::counter("PollCount", 7)).unwrap();
    store.update(&Metric::gauge("Alloc", 3.2)).unwrap();
    store.close().unwrap();

    let reopened = SqliteStore::open(dsn).unwrap();
    assert_eq!(reopened.restore_from_durable().unwrap(), 2);
    reopened.update(&Metric::counter("PollCount", 22)).unwrap();
    assert_eq!(
        reopened.read("PollCount", MetricKind::Counter).unwrap(),
        MetricValue::Counter(29)
    );
}

#[test]
fn factory_selects_backend_from_config() {
    let dir = TempDir::new().unwrap();

    let memory = Storage::open(&StoreConfig {
        interval_secs: 300,
        file: snapshot_path(&dir).display().to_string(),
        restore: true,
        database_dsn: None,
    })
    .unwrap();
    assert!(matches!(memory, Storage::Memory(_)));

    let durable = Storage::open(&StoreConfig {
        database_dsn: Some(":memory:".to_string()),
        ..StoreConfig::default()
    })
    .unwrap();
    assert!(matches!(durable, Storage::Durable(_)));
    assert!(durable.ping().is_ok());
    assert_eq!(durable.flush_interval(&StoreConfig::default()), None);
}

#[test]
fn flush_interval_only_for_periodic_file_store() {
    let dir = TempDir::new().unwrap();
    let periodic = StoreConfig {
        interval_secs: 5,
        file: snapshot_path(&dir).display().to_string(),
        restore: false,
        database_dsn: None,
    };
    let store = Storage::open(&periodic).unwrap();
    assert_eq!(
        store.flush_interval(&periodic),
        Some(std::time::Duration::from_secs(5))
    );

    let sync = StoreConfig {
        interval_secs: 0,
        ..periodic.clone()
    };
    let store = Storage::open(&sync).unwrap();
    assert_eq!(store.flush_interval(&sync), None);
    match store {
        Storage::Memory(m) => assert!(m.is_write_through()),
        Storage::Durable(_) => panic!("expected memory backend"),
    }

    let no_file = StoreConfig {
        file: String::new(),
        ..periodic
    };
    let store = Storage::open(&no_file).unwrap();
    assert_eq!(store.flush_interval(&no_file), None);
}
