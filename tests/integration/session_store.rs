#![allow(missing_docs)]

use tempfile::tempdir;
use tidemark::{
    Cancellation, Error, Query, Result, SessionStore, StoreConfig, TimeRange, Timestamp, Value,
};

fn ts(millis: i64) -> Timestamp {
    Timestamp::from_millis(millis)
}

fn wide_key(name: &str) -> Value {
    Value::String(format!("{name:-<40}"))
}

#[test]
fn session_bounds_are_inclusive() -> Result<()> {
    let dir = tempdir()?;
    let store = SessionStore::open(dir.path().join("sessions.db"), StoreConfig::default())?;

    let mut writer = store.writer();
    writer.insert(&Value::from("user"), ts(10), ts(20), false)?;
    writer.commit()?;

    assert!(!store.in_session(&Value::from("user"), ts(9))?);
    assert!(store.in_session(&Value::from("user"), ts(10))?);
    assert!(store.in_session(&Value::from("user"), ts(15))?);
    assert!(store.in_session(&Value::from("user"), ts(20))?);
    assert!(!store.in_session(&Value::from("user"), ts(21))?);
    assert!(!store.in_session(&Value::from("other"), ts(15))?);
    Ok(())
}

#[test]
fn point_sessions_are_legal_and_bad_bounds_are_not() -> Result<()> {
    let dir = tempdir()?;
    let store = SessionStore::open(dir.path().join("sessions.db"), StoreConfig::default())?;

    let mut writer = store.writer();
    writer.insert(&Value::from("blip"), ts(5), ts(5), false)?;
    let err = writer
        .insert(&Value::from("blip"), ts(9), ts(8), false)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    writer.commit()?;

    assert!(store.in_session(&Value::from("blip"), ts(5))?);
    assert!(!store.in_session(&Value::from("blip"), ts(4))?);
    assert!(!store.in_session(&Value::from("blip"), ts(6))?);
    assert_eq!(store.count()?, 1);
    Ok(())
}

#[test]
fn get_session_returns_the_covering_row() -> Result<()> {
    let dir = tempdir()?;
    let store = SessionStore::open(dir.path().join("sessions.db"), StoreConfig::default())?;

    let mut writer = store.writer();
    writer.insert(&Value::from("user"), ts(10), ts(20), false)?;
    writer.insert(&Value::from("user"), ts(20), ts(30), false)?;
    writer.commit()?;

    let late = store.get_session(&Value::from("user"), ts(25))?.unwrap();
    assert_eq!((late.start, late.end), (ts(20), ts(30)));

    // Both rows cover t=20; the earlier one wins.
    let shared = store.get_session(&Value::from("user"), ts(20))?.unwrap();
    assert_eq!((shared.start, shared.end), (ts(10), ts(20)));
    assert_eq!(shared.key, Value::from("user"));

    assert!(store.get_session(&Value::from("user"), ts(35))?.is_none());
    assert!(store.get_session(&Value::from("user"), ts(5))?.is_none());
    Ok(())
}

#[test]
fn condense_joins_overlapping_and_abutting_rows() -> Result<()> {
    let dir = tempdir()?;
    let store = SessionStore::open(dir.path().join("sessions.db"), StoreConfig::default())?;

    let mut writer = store.writer();
    writer.insert(&Value::from("user"), ts(0), ts(10), false)?;
    writer.insert(&Value::from("user"), ts(10), ts(20), false)?;
    writer.insert(&Value::from("user"), ts(30), ts(40), false)?;
    writer.commit()?;

    let cancel = Cancellation::new();
    let stats = store.condense(ts(100), &cancel)?;
    assert_eq!(stats.scanned, 3);
    assert_eq!(stats.merged, 1);
    assert_eq!(store.count()?, 2);

    let joined = store.get_session(&Value::from("user"), ts(15))?.unwrap();
    assert_eq!((joined.start, joined.end), (ts(0), ts(20)));
    assert!(store.in_session(&Value::from("user"), ts(35))?);
    assert!(!store.in_session(&Value::from("user"), ts(25))?);

    // A second pass finds nothing left to join.
    let again = store.condense(ts(100), &cancel)?;
    assert_eq!(again.merged, 0);
    assert_eq!(store.count()?, 2);
    Ok(())
}

#[test]
fn condense_leaves_rows_past_the_horizon_alone() -> Result<()> {
    let dir = tempdir()?;
    let store = SessionStore::open(dir.path().join("sessions.db"), StoreConfig::default())?;

    let mut writer = store.writer();
    writer.insert(&Value::from("user"), ts(0), ts(10), false)?;
    writer.insert(&Value::from("user"), ts(10), ts(20), false)?;
    writer.commit()?;

    // The joining row starts at 10, not before 5: nothing merges.
    let stats = store.condense(ts(5), &Cancellation::new())?;
    assert_eq!(stats.merged, 0);
    assert_eq!(store.count()?, 2);

    let stats = store.condense(ts(11), &Cancellation::new())?;
    assert_eq!(stats.merged, 1);
    assert_eq!(store.count()?, 1);
    Ok(())
}

#[test]
fn terminal_rows_seal_their_chain() -> Result<()> {
    let dir = tempdir()?;
    let store = SessionStore::open(dir.path().join("sessions.db"), StoreConfig::default())?;

    let mut writer = store.writer();
    writer.insert(&Value::from("user"), ts(0), ts(10), true)?;
    writer.insert(&Value::from("user"), ts(10), ts(20), false)?;
    writer.commit()?;

    let stats = store.condense(ts(100), &Cancellation::new())?;
    assert_eq!(stats.merged, 0, "nothing merges over a terminal row");
    assert_eq!(store.count()?, 2);

    let mut spans = Vec::new();
    store.search(&Query::default(), &Cancellation::new(), |entry| {
        spans.push((entry.start, entry.end, entry.terminal));
        Ok(true)
    })?;
    assert_eq!(spans, vec![(ts(0), ts(10), true), (ts(10), ts(20), false)]);
    Ok(())
}

#[test]
fn search_coalesces_contiguous_rows() -> Result<()> {
    let dir = tempdir()?;
    let store = SessionStore::open(dir.path().join("sessions.db"), StoreConfig::default())?;

    let mut writer = store.writer();
    writer.insert(&Value::from("a"), ts(0), ts(10), false)?;
    writer.insert(&Value::from("a"), ts(5), ts(15), false)?;
    writer.insert(&Value::from("a"), ts(40), ts(50), false)?;
    writer.insert(&Value::from("b"), ts(12), ts(14), false)?;
    writer.commit()?;

    let mut seen = Vec::new();
    let delivered = store.search(&Query::default(), &Cancellation::new(), |entry| {
        seen.push((entry.key, entry.start, entry.end));
        Ok(true)
    })?;
    assert_eq!(delivered, 3);
    assert_eq!(
        seen,
        vec![
            (Value::from("a"), ts(0), ts(15)),
            (Value::from("a"), ts(40), ts(50)),
            (Value::from("b"), ts(12), ts(14)),
        ]
    );
    Ok(())
}

#[test]
fn search_filters_by_key_and_window_and_stops_early() -> Result<()> {
    let dir = tempdir()?;
    let store = SessionStore::open(dir.path().join("sessions.db"), StoreConfig::default())?;

    let mut writer = store.writer();
    writer.insert(&Value::from("a"), ts(0), ts(10), false)?;
    writer.insert(&Value::from("a"), ts(40), ts(50), false)?;
    writer.insert(&Value::from("b"), ts(0), ts(10), false)?;
    writer.commit()?;

    let query = Query {
        key: Some(Value::from("a")),
        time: Some(TimeRange::new(ts(45), ts(60))),
    };
    let mut seen = Vec::new();
    let delivered = store.search(&query, &Cancellation::new(), |entry| {
        seen.push((entry.start, entry.end));
        Ok(true)
    })?;
    assert_eq!(delivered, 1);
    assert_eq!(seen, vec![(ts(40), ts(50))]);

    // A session ending exactly at the window start still overlaps it.
    let edge = Query {
        key: Some(Value::from("a")),
        time: Some(TimeRange::new(ts(10), ts(20))),
    };
    assert_eq!(store.search(&edge, &Cancellation::new(), |_| Ok(true))?, 1);

    let mut calls = 0;
    let delivered = store.search(&Query::default(), &Cancellation::new(), |_| {
        calls += 1;
        Ok(false)
    })?;
    assert_eq!(delivered, 1);
    assert_eq!(calls, 1);
    Ok(())
}

#[test]
fn retention_keeps_sessions_straddling_the_cutoff() -> Result<()> {
    let dir = tempdir()?;
    let store = SessionStore::open(dir.path().join("sessions.db"), StoreConfig::default())?;

    let mut writer = store.writer();
    writer.insert(&wide_key("old"), ts(0), ts(40), false)?;
    writer.insert(&wide_key("straddler"), ts(45), ts(55), false)?;
    writer.insert(&wide_key("young"), ts(60), ts(70), false)?;
    writer.commit()?;
    assert_eq!(store.lookup_rows()?, 3);

    let stats = store.remove_old_data(ts(50), true, &Cancellation::new())?;
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.retained, 2);
    assert_eq!(store.lookup_rows()?, 2, "the expired key lost its lookup row");

    assert!(!store.in_session(&wide_key("old"), ts(20))?);
    let kept = store.get_session(&wide_key("straddler"), ts(46))?.unwrap();
    assert_eq!((kept.start, kept.end), (ts(45), ts(55)), "straddler kept whole");
    assert!(store.in_session(&wide_key("young"), ts(65))?);
    Ok(())
}

#[test]
fn merge_preserves_terminal_flags_and_insert_times() -> Result<()> {
    let dir = tempdir()?;
    let source = SessionStore::open(dir.path().join("source.db"), StoreConfig::default())?;
    let dest = SessionStore::open(dir.path().join("dest.db"), StoreConfig::default())?;

    let mut writer = source.writer();
    writer.insert(&wide_key("a"), ts(0), ts(10), true)?;
    writer.insert(&wide_key("b"), ts(5), ts(15), false)?;
    writer.commit()?;

    let merged = dest.merge_from(&source, &Cancellation::new())?;
    assert_eq!(merged, 2);
    assert_eq!(dest.count()?, 2);
    assert_eq!(dest.lookup_rows()?, 2);

    let theirs = source.get_session(&wide_key("a"), ts(5))?.unwrap();
    let ours = dest.get_session(&wide_key("a"), ts(5))?.unwrap();
    assert!(ours.terminal);
    assert_eq!(ours.inserted, theirs.inserted);
    Ok(())
}

#[test]
fn merge_rejects_a_different_format() -> Result<()> {
    let dir = tempdir()?;
    let store = SessionStore::open(dir.path().join("sessions.db"), StoreConfig::default())?;
    let other = SessionStore::open(dir.path().join("compact.db"), StoreConfig::compact())?;

    let err = store.merge_from(&other, &Cancellation::new()).unwrap_err();
    assert!(matches!(err, Error::Schema(_)));
    Ok(())
}
