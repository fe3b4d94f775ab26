//! The three store species and the query plumbing they share.

pub mod ranged;
pub mod session;
pub mod temporal;

use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use redb::ReadableTable;
use tracing::info;

use crate::codec::ord;
use crate::codec::value::Timestamp;
use crate::env::{Batch, StoreEnv, DATA};
use crate::error::{Error, Result};
use crate::lookup::used::{SweepStats, UsedRecorder};

/// Cooperative cancellation for long maintenance passes.
///
/// Maintenance polls the token between records. A cancelled pass aborts its
/// open transaction and surfaces [`Error::Cancelled`]; batches committed
/// before that point stay in place, and rerunning the pass finishes the
/// remainder.
#[derive(Clone, Debug, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    /// A token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; takes effect at the next poll.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Half-open time window `[from, until)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeRange {
    /// Inclusive lower bound.
    pub from: Timestamp,
    /// Exclusive upper bound.
    pub until: Timestamp,
}

impl TimeRange {
    /// Builds the window `[from, until)`.
    pub fn new(from: Timestamp, until: Timestamp) -> Self {
        Self { from, until }
    }

    /// Whether `at` falls inside the window.
    pub fn contains(&self, at: Timestamp) -> bool {
        self.from <= at && at < self.until
    }

    /// Whether the inclusive span `[start, end]` overlaps the window.
    pub fn overlaps(&self, start: Timestamp, end: Timestamp) -> bool {
        start < self.until && end >= self.from
    }
}

/// Row filter for the search operations. An empty query matches everything.
#[derive(Clone, Debug, Default)]
pub struct Query {
    /// Restrict to one key.
    pub key: Option<crate::codec::value::Value>,
    /// Restrict to a time window; which time it applies to depends on the
    /// store.
    pub time: Option<TimeRange>,
}

impl Query {
    pub(crate) fn matches_at(&self, at: Timestamp) -> bool {
        self.time.map_or(true, |window| window.contains(at))
    }

    pub(crate) fn matches_span(&self, start: Timestamp, end: Timestamp) -> bool {
        self.time.map_or(true, |window| window.overlaps(start, end))
    }
}

/// Outcome of a retention pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceStats {
    /// Rows removed as expired.
    pub expired: u64,
    /// Rows kept.
    pub retained: u64,
    /// What the follow-up lookup sweep did.
    pub lookups: SweepStats,
}

/// Outcome of a session condense pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CondenseStats {
    /// Session rows examined.
    pub scanned: u64,
    /// Rows absorbed into a merged session.
    pub merged: u64,
}

/// Insert time from the fixed head of a stored value.
pub(crate) fn read_inserted(value_bytes: &[u8]) -> Result<Timestamp> {
    let head: [u8; 8] = value_bytes
        .get(..8)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| Error::corrupt("stored value shorter than its insert time"))?;
    Ok(Timestamp::from_millis(ord::decode_i64(head)))
}

/// Shared retention walk: deletes rows whose expiry time predates `cutoff`,
/// marks the lookup references of every retained row, then sweeps lookup
/// rows nothing marked. Passing no cutoff turns the walk into a pure
/// mark-and-sweep.
///
/// Deletes are collected per batch and applied after the scan so the commit
/// cadence never splits a scan step. The cursor restarts after the last
/// scanned row, which keeps a cancelled pass resumable.
///
/// The whole pass runs behind the store's writer gate. The mark and sweep
/// phases span several committed batches, and a writer slipping in between
/// them could re-reference a lookup row the mark phase never saw.
pub(crate) fn retention_pass<F>(
    env: &StoreEnv,
    batch_size: usize,
    cancel: &Cancellation,
    cutoff: Option<Timestamp>,
    key_recorder: Option<&UsedRecorder<'_>>,
    value_recorder: Option<&UsedRecorder<'_>>,
    expiry: F,
) -> Result<MaintenanceStats>
where
    F: Fn(&[u8], &[u8]) -> Result<Timestamp>,
{
    let mut stats = MaintenanceStats::default();
    if cutoff.is_none() && key_recorder.is_none() && value_recorder.is_none() {
        return Ok(stats);
    }

    let _gate = env.lock_writes();
    let mut batch = Batch::new(env, batch_size);
    {
        let txn = batch.txn()?;
        for recorder in [key_recorder, value_recorder].into_iter().flatten() {
            recorder.reset(txn)?;
        }
    }

    let mut cursor: Option<Vec<u8>> = None;
    loop {
        let mut doomed: Vec<Vec<u8>> = Vec::new();
        let mut finished = true;
        let mut processed = 0usize;
        {
            let txn = batch.txn()?;
            let data = txn.open_table(DATA)?;
            let range = match &cursor {
                Some(last) => {
                    data.range::<&[u8]>((Bound::Excluded(last.as_slice()), Bound::Unbounded))?
                }
                None => data.range::<&[u8]>(..)?,
            };
            let mut last_seen: Option<Vec<u8>> = None;
            for item in range {
                cancel.check()?;
                let (k, v) = item?;
                let key_bytes = k.value();
                let value_bytes = v.value();
                let expired = match cutoff {
                    Some(cutoff) => expiry(key_bytes, value_bytes)? < cutoff,
                    None => false,
                };
                if expired {
                    stats.expired += 1;
                    doomed.push(key_bytes.to_vec());
                } else {
                    stats.retained += 1;
                    if let Some(recorder) = key_recorder {
                        recorder.record(txn, key_bytes)?;
                    }
                    if let Some(recorder) = value_recorder {
                        recorder.record(txn, value_bytes)?;
                    }
                }
                last_seen = Some(key_bytes.to_vec());
                processed += 1;
                if processed >= batch_size {
                    finished = false;
                    break;
                }
            }
            if let Some(last) = last_seen {
                cursor = Some(last);
            }
        }
        if !doomed.is_empty() {
            let txn = batch.txn()?;
            let mut data = txn.open_table(DATA)?;
            for key_bytes in &doomed {
                data.remove(key_bytes.as_slice())?;
            }
        }
        batch.note_ops(processed)?;
        if finished {
            break;
        }
    }

    for recorder in [key_recorder, value_recorder].into_iter().flatten() {
        stats
            .lookups
            .absorb(recorder.sweep(&mut batch, cancel, batch_size)?);
    }
    batch.commit()?;
    info!(
        expired = stats.expired,
        retained = stats.retained,
        lookups_removed = stats.lookups.removed,
        "retention pass finished"
    );
    Ok(stats)
}
