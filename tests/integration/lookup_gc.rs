#![allow(missing_docs)]

use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use tempfile::tempdir;
use tidemark::{
    Cancellation, KeyKind, Result, StoreConfig, TemporalStateStore, Timestamp, Value,
};

fn ts(millis: i64) -> Timestamp {
    Timestamp::from_millis(millis)
}

fn key_of_len(len: usize) -> Value {
    Value::String("k".repeat(len))
}

#[test]
fn interning_reuses_rows_across_reopens() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("state.db");
    let key = key_of_len(40);

    let store = TemporalStateStore::open(&path, StoreConfig::default())?;
    let mut writer = store.writer();
    writer.insert(&key, ts(1), &Value::Long(1))?;
    writer.insert(&key, ts(2), &Value::Long(2))?;
    writer.commit()?;
    assert_eq!(store.lookup_rows()?, 1, "one key, one lookup row");
    drop(store);

    let store = TemporalStateStore::open(&path, StoreConfig::default())?;
    let mut writer = store.writer();
    writer.insert(&key, ts(3), &Value::Long(3))?;
    writer.commit()?;

    assert_eq!(store.lookup_rows()?, 1);
    assert_eq!(store.count()?, 3);
    for at in 1..=3 {
        let entry = store.get(&key, ts(at))?.unwrap();
        assert_eq!(entry.value, Value::Long(at));
    }
    Ok(())
}

#[test]
fn key_tiers_follow_raw_length() -> Result<()> {
    let dir = tempdir()?;
    let store = TemporalStateStore::open(dir.path().join("state.db"), StoreConfig::default())?;

    // Inline up to 32 bytes, interned by uid up to 511, hashed past that.
    let inline = key_of_len(32);
    let interned = key_of_len(33);
    let widest_uid = key_of_len(511);
    let hashed = key_of_len(512);

    let mut writer = store.writer();
    writer.insert(&inline, ts(1), &Value::Long(1))?;
    writer.insert(&interned, ts(2), &Value::Long(2))?;
    writer.insert(&widest_uid, ts(3), &Value::Long(3))?;
    writer.insert(&hashed, ts(4), &Value::Long(4))?;
    writer.commit()?;

    assert_eq!(store.lookup_rows()?, 3, "inline keys take no lookup rows");
    assert_eq!(store.hash_clashes()?, 0);

    assert_eq!(store.get(&inline, ts(1))?.unwrap().value, Value::Long(1));
    assert_eq!(store.get(&interned, ts(2))?.unwrap().value, Value::Long(2));
    assert_eq!(store.get(&widest_uid, ts(3))?.unwrap().value, Value::Long(3));
    let entry = store.get(&hashed, ts(4))?.unwrap();
    assert_eq!(entry.value, Value::Long(4));
    assert_eq!(entry.key, hashed, "hashed keys read back intact");
    Ok(())
}

#[test]
fn partial_expiry_keeps_shared_lookup_rows() -> Result<()> {
    let dir = tempdir()?;
    let store = TemporalStateStore::open(dir.path().join("state.db"), StoreConfig::default())?;
    let key = key_of_len(40);

    let mut writer = store.writer();
    writer.insert(&key, ts(0), &Value::Long(0))?;
    writer.insert(&key, ts(10), &Value::Long(10))?;
    writer.commit()?;

    let stats = store.remove_old_data(ts(5), true, &Cancellation::new())?;
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.retained, 1);
    assert_eq!(stats.lookups.removed, 0, "the key is still referenced");

    assert_eq!(store.lookup_rows()?, 1);
    assert!(store.get(&key, ts(0))?.is_none());
    assert_eq!(store.get(&key, ts(99))?.unwrap().value, Value::Long(10));
    Ok(())
}

#[test]
fn value_rows_are_swept_when_unreferenced() -> Result<()> {
    let dir = tempdir()?;
    let config = StoreConfig {
        key: KeyKind::Long,
        ..StoreConfig::default()
    };
    let store = TemporalStateStore::open(dir.path().join("state.db"), config)?;

    let doomed = Value::String("v".repeat(40));
    let shared = Value::String("w".repeat(40));
    let mut writer = store.writer();
    writer.insert(&Value::Long(1), ts(0), &doomed)?;
    writer.insert(&Value::Long(2), ts(0), &shared)?;
    writer.insert(&Value::Long(3), ts(10), &shared)?;
    writer.commit()?;
    assert_eq!(store.lookup_rows()?, 2, "two distinct interned values");

    let stats = store.remove_old_data(ts(5), true, &Cancellation::new())?;
    assert_eq!(stats.expired, 2);
    assert_eq!(stats.lookups.removed, 1, "only the orphaned value goes");

    assert_eq!(store.lookup_rows()?, 1);
    assert_eq!(store.get(&Value::Long(3), ts(99))?.unwrap().value, shared);
    Ok(())
}

#[test]
fn hash_rows_are_swept_like_uid_rows() -> Result<()> {
    let dir = tempdir()?;
    let store = TemporalStateStore::open(dir.path().join("state.db"), StoreConfig::default())?;

    let doomed = key_of_len(600);
    let kept = Value::String("x".repeat(600));
    let mut writer = store.writer();
    writer.insert(&doomed, ts(0), &Value::Long(0))?;
    writer.insert(&kept, ts(10), &Value::Long(10))?;
    writer.commit()?;
    assert_eq!(store.lookup_rows()?, 2);

    let stats = store.remove_old_data(ts(5), true, &Cancellation::new())?;
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.lookups.removed, 1);

    assert_eq!(store.lookup_rows()?, 1);
    assert!(store.get(&doomed, ts(99))?.is_none());
    assert_eq!(store.get(&kept, ts(99))?.unwrap().value, Value::Long(10));
    Ok(())
}

#[test]
fn sweep_is_a_noop_while_rows_remain() -> Result<()> {
    let dir = tempdir()?;
    let store = TemporalStateStore::open(dir.path().join("state.db"), StoreConfig::default())?;

    let mut writer = store.writer();
    writer.insert(&key_of_len(40), ts(1), &Value::Long(1))?;
    writer.insert(&key_of_len(41), ts(2), &Value::Long(2))?;
    writer.commit()?;

    let cancel = Cancellation::new();
    let stats = store.sweep_unused_lookups(&cancel)?;
    assert_eq!(stats.scanned, 2);
    assert_eq!(stats.removed, 0);
    assert_eq!(store.lookup_rows()?, 2);
    assert_eq!(store.count()?, 2);

    let future = Timestamp::now().saturating_add_millis(60_000);
    store.remove_old_data(future, false, &cancel)?;
    assert_eq!(store.lookup_rows()?, 0, "nothing references the rows now");
    let stats = store.sweep_unused_lookups(&cancel)?;
    assert_eq!(stats.scanned, 0);
    Ok(())
}

#[test]
fn retention_excludes_a_live_writer() -> Result<()> {
    let dir = tempdir()?;
    let store = Arc::new(TemporalStateStore::open(
        dir.path().join("state.db"),
        StoreConfig::default(),
    )?);
    let key = key_of_len(40);

    let mut writer = store.writer();
    writer.insert(&key, ts(0), &Value::Long(0))?;
    writer.commit()?;

    // A live writer re-references the interned key while every committed
    // record carrying it is about to expire. If the retention pass could
    // run between this writer's batches, its mark phase would miss the new
    // record and the sweep would drop the lookup row it depends on.
    let mut writer = store.writer();
    writer.insert(&key, ts(50), &Value::Long(50))?;

    let (started_tx, started_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();
    let background = Arc::clone(&store);
    let pass = thread::spawn(move || {
        started_tx.send(()).expect("send started");
        let stats = background.remove_old_data(ts(10), true, &Cancellation::new());
        done_tx.send(()).expect("send done");
        stats
    });
    started_rx.recv().expect("recv started");
    thread::sleep(Duration::from_millis(100));
    assert!(
        done_rx.try_recv().is_err(),
        "retention ran alongside a live writer"
    );

    writer.commit()?;
    let stats = pass.join().expect("join")?;
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.retained, 1);
    assert_eq!(stats.lookups.removed, 0, "the key is still referenced");

    assert_eq!(store.lookup_rows()?, 1);
    assert_eq!(store.get(&key, ts(99))?.unwrap().value, Value::Long(50));
    Ok(())
}
