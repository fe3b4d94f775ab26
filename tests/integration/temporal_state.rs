#![allow(missing_docs)]

use std::sync::Once;

use tempfile::tempdir;
use tidemark::{
    Cancellation, Error, KeyKind, Query, Result, StoreConfig, TemporalStateStore, TimePrecision,
    TimeRange, Timestamp, Value,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("tidemark=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn ts(millis: i64) -> Timestamp {
    Timestamp::from_millis(millis)
}

// Forty bytes: over the inline threshold, into the uid tier.
fn wide_key(name: &str) -> Value {
    Value::String(format!("{name:-<40}"))
}

#[test]
fn reads_see_the_latest_record_at_or_before() -> Result<()> {
    let dir = tempdir()?;
    let store = TemporalStateStore::open(dir.path().join("state.db"), StoreConfig::default())?;

    let mut writer = store.writer();
    writer.insert(&Value::from("alpha"), ts(10), &Value::Long(1))?;
    writer.insert(&Value::from("alpha"), ts(20), &Value::Long(2))?;
    writer.insert(&Value::from("beta"), ts(15), &Value::Long(3))?;
    writer.commit()?;

    assert!(store.get(&Value::from("alpha"), ts(9))?.is_none());

    let at_ten = store.get(&Value::from("alpha"), ts(10))?.unwrap();
    assert_eq!(at_ten.value, Value::Long(1));
    assert_eq!(at_ten.effective, ts(10));

    let between = store.get(&Value::from("alpha"), ts(15))?.unwrap();
    assert_eq!(between.value, Value::Long(1), "read between versions sees the earlier one");

    let after = store.get(&Value::from("alpha"), ts(99))?.unwrap();
    assert_eq!(after.value, Value::Long(2));
    assert_eq!(after.key, Value::from("alpha"));

    assert_eq!(store.get(&Value::from("beta"), ts(15))?.unwrap().value, Value::Long(3));
    assert!(store.get(&Value::from("gamma"), ts(50))?.is_none());
    assert_eq!(store.count()?, 3);
    Ok(())
}

#[test]
fn search_streams_in_key_then_time_order() -> Result<()> {
    let dir = tempdir()?;
    let config = StoreConfig {
        key: KeyKind::Long,
        ..StoreConfig::default()
    };
    let store = TemporalStateStore::open(dir.path().join("state.db"), config)?;

    let mut writer = store.writer();
    writer.insert(&Value::Long(2), ts(0), &Value::from("late key"))?;
    writer.insert(&Value::Long(1), ts(2), &Value::from("second"))?;
    writer.insert(&Value::Long(1), ts(1), &Value::from("first"))?;
    writer.commit()?;

    let mut seen = Vec::new();
    let delivered = store.search(&Query::default(), &Cancellation::new(), |entry| {
        seen.push((entry.key, entry.effective));
        Ok(true)
    })?;
    assert_eq!(delivered, 3);
    assert_eq!(
        seen,
        vec![
            (Value::Long(1), ts(1)),
            (Value::Long(1), ts(2)),
            (Value::Long(2), ts(0)),
        ]
    );
    Ok(())
}

#[test]
fn point_reads_leave_lookup_tables_untouched() -> Result<()> {
    let dir = tempdir()?;
    let store = TemporalStateStore::open(dir.path().join("state.db"), StoreConfig::default())?;

    assert!(store.get(&wide_key("never-written"), ts(5))?.is_none());
    assert_eq!(store.lookup_rows()?, 0, "a miss must not intern the probe key");

    let mut writer = store.writer();
    writer.insert(&wide_key("present"), ts(1), &Value::Long(7))?;
    writer.commit()?;
    assert_eq!(store.lookup_rows()?, 1);

    assert!(store.get(&wide_key("still-absent"), ts(5))?.is_none());
    let probe = Query {
        key: Some(wide_key("also-absent")),
        ..Query::default()
    };
    assert_eq!(store.search(&probe, &Cancellation::new(), |_| Ok(true))?, 0);
    assert_eq!(store.lookup_rows()?, 1);
    Ok(())
}

#[test]
fn overwrite_false_keeps_the_first_record() -> Result<()> {
    let dir = tempdir()?;
    let config = StoreConfig {
        overwrite: false,
        ..StoreConfig::default()
    };
    let store = TemporalStateStore::open(dir.path().join("state.db"), config)?;

    let mut writer = store.writer();
    writer.insert(&Value::from("key"), ts(10), &Value::from("original"))?;
    writer.insert(&Value::from("key"), ts(10), &Value::from("usurper"))?;
    writer.commit()?;

    assert_eq!(store.count()?, 1);
    let entry = store.get(&Value::from("key"), ts(10))?.unwrap();
    assert_eq!(entry.value, Value::from("original"));
    Ok(())
}

#[test]
fn search_filters_by_key_and_time_window() -> Result<()> {
    let dir = tempdir()?;
    let store = TemporalStateStore::open(dir.path().join("state.db"), StoreConfig::default())?;

    let mut writer = store.writer();
    for at in [1, 2, 3] {
        writer.insert(&Value::from("watched"), ts(at), &Value::Long(at))?;
    }
    writer.insert(&Value::from("other"), ts(2), &Value::Long(99))?;
    writer.commit()?;

    let query = Query {
        key: Some(Value::from("watched")),
        time: Some(TimeRange::new(ts(2), ts(4))),
    };
    let mut seen = Vec::new();
    let delivered = store.search(&query, &Cancellation::new(), |entry| {
        seen.push(entry.effective);
        Ok(true)
    })?;
    assert_eq!(delivered, 2);
    assert_eq!(seen, vec![ts(2), ts(3)]);

    // The consumer can stop the stream after any record.
    let mut first = None;
    let delivered = store.search(&query, &Cancellation::new(), |entry| {
        first = Some(entry.effective);
        Ok(false)
    })?;
    assert_eq!(delivered, 1);
    assert_eq!(first, Some(ts(2)));
    Ok(())
}

#[test]
fn retention_expires_by_effective_time_and_sweeps_lookups() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let store = TemporalStateStore::open(dir.path().join("state.db"), StoreConfig::default())?;

    let mut writer = store.writer();
    for i in 0..8 {
        writer.insert(&wide_key(&format!("key-{i}")), ts(i), &Value::Long(i))?;
    }
    writer.commit()?;
    assert_eq!(store.lookup_rows()?, 8);

    let cancel = Cancellation::new();
    let stats = store.remove_old_data(ts(3), true, &cancel)?;
    assert_eq!(stats.expired, 3);
    assert_eq!(stats.retained, 5);
    assert_eq!(store.count()?, 5);
    assert_eq!(store.lookup_rows()?, 5, "expired keys lose their lookup rows");

    for i in 0..3 {
        assert!(store.get(&wide_key(&format!("key-{i}")), ts(99))?.is_none());
    }
    for i in 3..8 {
        let entry = store.get(&wide_key(&format!("key-{i}")), ts(99))?.unwrap();
        assert_eq!(entry.value, Value::Long(i));
    }

    // Same cutoff again: nothing left to expire or sweep.
    let again = store.remove_old_data(ts(3), true, &cancel)?;
    assert_eq!(again.expired, 0);
    assert_eq!(again.lookups.removed, 0);
    assert_eq!(store.count()?, 5);
    Ok(())
}

#[test]
fn retention_by_insert_time_uses_the_write_clock() -> Result<()> {
    let dir = tempdir()?;
    let store = TemporalStateStore::open(dir.path().join("state.db"), StoreConfig::default())?;

    let mut writer = store.writer();
    writer.insert(&Value::from("a"), ts(1), &Value::Long(1))?;
    writer.insert(&Value::from("b"), ts(2), &Value::Long(2))?;
    writer.commit()?;

    let cancel = Cancellation::new();
    let nothing = store.remove_old_data(ts(0), false, &cancel)?;
    assert_eq!(nothing.expired, 0, "records were inserted after the epoch");

    let future = Timestamp::now().saturating_add_millis(60_000);
    let all = store.remove_old_data(future, false, &cancel)?;
    assert_eq!(all.expired, 2);
    assert_eq!(store.count()?, 0);
    Ok(())
}

#[test]
fn merge_copies_and_reinterns_records() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let source = TemporalStateStore::open(dir.path().join("source.db"), StoreConfig::default())?;
    let dest = TemporalStateStore::open(dir.path().join("dest.db"), StoreConfig::default())?;

    let mut writer = source.writer();
    for i in 0..4 {
        writer.insert(&wide_key(&format!("key-{i}")), ts(i), &Value::Long(i))?;
    }
    writer.commit()?;

    let merged = dest.merge_from(&source, &Cancellation::new())?;
    assert_eq!(merged, 4);
    assert_eq!(dest.count()?, 4);
    assert_eq!(dest.lookup_rows()?, 4);
    for i in 0..4 {
        let theirs = source.get(&wide_key(&format!("key-{i}")), ts(i))?.unwrap();
        let ours = dest.get(&wide_key(&format!("key-{i}")), ts(i))?.unwrap();
        assert_eq!(ours.value, theirs.value);
        assert_eq!(ours.inserted, theirs.inserted, "merge keeps insert times");
    }
    Ok(())
}

#[test]
fn merge_rejects_a_different_format() -> Result<()> {
    let dir = tempdir()?;
    let store = TemporalStateStore::open(dir.path().join("state.db"), StoreConfig::default())?;
    let other = TemporalStateStore::open(dir.path().join("compact.db"), StoreConfig::compact())?;

    let err = store.merge_from(&other, &Cancellation::new()).unwrap_err();
    assert!(matches!(err, Error::Schema(_)));
    Ok(())
}

#[test]
fn reopen_rejects_a_changed_configuration() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("state.db");
    let store = TemporalStateStore::open(&path, StoreConfig::default())?;
    drop(store);

    let changed = StoreConfig {
        time: TimePrecision::Second,
        ..StoreConfig::default()
    };
    let err = TemporalStateStore::open(&path, changed).unwrap_err();
    assert!(matches!(err, Error::Schema(_)));

    // The original configuration still opens.
    TemporalStateStore::open(&path, StoreConfig::default())?;
    Ok(())
}

#[test]
fn cancelled_maintenance_stops_between_records() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let store = TemporalStateStore::open(dir.path().join("state.db"), StoreConfig::default())?;

    let mut writer = store.writer();
    for i in 0..5 {
        writer.insert(&Value::from(format!("k{i}")), ts(i), &Value::Long(i))?;
    }
    writer.commit()?;

    let cancel = Cancellation::new();
    cancel.cancel();
    let err = store.remove_old_data(ts(99), true, &cancel).unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(store.count()?, 5, "a cancelled pass leaves the data in place");

    let stats = store.remove_old_data(ts(99), true, &Cancellation::new())?;
    assert_eq!(stats.expired, 5);
    Ok(())
}

#[test]
fn second_precision_truncates_effective_times() -> Result<()> {
    let dir = tempdir()?;
    let store = TemporalStateStore::open(dir.path().join("state.db"), StoreConfig::compact())?;

    let mut writer = store.writer();
    writer.insert(&Value::from("key"), ts(1_999), &Value::Long(1))?;
    writer.commit()?;

    let entry = store.get(&Value::from("key"), ts(1_999))?.unwrap();
    assert_eq!(entry.effective, ts(1_000), "stored at second precision");
    assert!(store.get(&Value::from("key"), ts(999))?.is_none());
    Ok(())
}
