//! Ranged state: records keyed by half-open `u64` ranges, read by point.

use std::path::Path;

use parking_lot::MutexGuard;
use redb::{ReadableTable, ReadableTableMetadata};
use tracing::info;

use crate::codec::ord;
use crate::codec::value::{Timestamp, Value};
use crate::codec::Cursor;
use crate::config::{Format, StoreConfig, StoreKind};
use crate::env::{Batch, StoreEnv, DATA};
use crate::error::{Error, Result};
use crate::store::{self, read_inserted, Cancellation, MaintenanceStats, Query};

/// One ranged record covering `[key_start, key_end)`.
#[derive(Clone, Debug, PartialEq)]
pub struct RangedEntry {
    /// Inclusive lower key bound.
    pub key_start: u64,
    /// Exclusive upper key bound.
    pub key_end: u64,
    /// Wall-clock time the record was written.
    pub inserted: Timestamp,
    /// Record value.
    pub value: Value,
}

fn range_key(key_start: u64, key_end: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&key_start.to_be_bytes());
    out[8..].copy_from_slice(&key_end.to_be_bytes());
    out
}

fn split_range_key(bytes: &[u8]) -> Result<(u64, u64)> {
    let mut cur = Cursor::new(bytes);
    let key_start = u64::from_be_bytes(cur.take_array::<8>()?);
    let key_end = u64::from_be_bytes(cur.take_array::<8>()?);
    cur.finish()?;
    Ok((key_start, key_end))
}

/// Store of values keyed by non-empty `u64` ranges. Ranges may overlap; a
/// point read returns the covering range with the greatest start.
pub struct RangedStateStore {
    env: StoreEnv,
    format: Format,
    config: StoreConfig,
}

impl RangedStateStore {
    /// Opens or creates a ranged state store at `path`. The configured key
    /// kind and value mode are ignored: range bounds are stored as fixed
    /// eight-byte keys and values are always written inline.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let format = Format::new(StoreKind::RangedState, &config);
        let env = StoreEnv::open(path.as_ref(), &format, &[])?;
        Ok(Self {
            env,
            format,
            config,
        })
    }

    /// The store file.
    pub fn path(&self) -> &Path {
        self.env.path()
    }

    /// Starts a batching writer. Writers and maintenance passes exclude
    /// each other, so a second writer (or a maintenance call) blocks until
    /// the first commits or drops.
    pub fn writer(&self) -> RangedWriter<'_> {
        let gate = self.env.lock_writes();
        RangedWriter {
            store: self,
            batch: Batch::new(&self.env, self.config.batch_size),
            _gate: gate,
        }
    }

    fn insert_row(
        &self,
        batch: &mut Batch<'_>,
        key_start: u64,
        key_end: u64,
        value: &Value,
        inserted: Timestamp,
    ) -> Result<()> {
        if key_start >= key_end {
            return Err(Error::InvalidArgument(format!(
                "range start {key_start} must be below its end {key_end}"
            )));
        }
        {
            let txn = batch.txn()?;
            let key_buf = range_key(key_start, key_end);
            let mut value_buf = Vec::with_capacity(8 + value.encoded_len());
            value_buf.extend_from_slice(&ord::encode_i64(inserted.millis()));
            value.write(&mut value_buf)?;
            let mut data = txn.open_table(DATA)?;
            if self.config.overwrite || data.get(&key_buf[..])?.is_none() {
                data.insert(&key_buf[..], value_buf.as_slice())?;
            }
        }
        batch.note_op()
    }

    /// The record covering `key`, if any. When covering ranges overlap the
    /// one with the greatest start wins.
    pub fn get_state(&self, key: u64) -> Result<Option<RangedEntry>> {
        let rtx = self.env.begin_read()?;
        let data = rtx.open_table(DATA)?;
        let probe = range_key(key, u64::MAX);
        let mut range = data.range(..=&probe[..])?;
        while let Some(item) = range.next_back() {
            let (k, v) = item?;
            let (key_start, key_end) = split_range_key(k.value())?;
            if key_end > key {
                return Ok(Some(decode_entry(key_start, key_end, v.value())?));
            }
        }
        Ok(None)
    }

    /// Streams records matching `query` to `consumer` in range order. A
    /// `Long` query key restricts to ranges covering that point; the time
    /// window filters on insert time. The consumer returns `false` to stop
    /// early. Returns the number of records delivered.
    pub fn search<F>(&self, query: &Query, cancel: &Cancellation, mut consumer: F) -> Result<u64>
    where
        F: FnMut(RangedEntry) -> Result<bool>,
    {
        let point = match &query.key {
            Some(Value::Long(k)) => match u64::try_from(*k) {
                Ok(k) => Some(k),
                Err(_) => return Ok(0),
            },
            Some(other) => {
                return Err(Error::InvalidArgument(format!(
                    "ranged stores take a long query key, not {}",
                    other.type_name()
                )))
            }
            None => None,
        };

        let rtx = self.env.begin_read()?;
        let data = rtx.open_table(DATA)?;
        let mut delivered = 0u64;
        for item in data.range::<&[u8]>(..)? {
            cancel.check()?;
            let (k, v) = item?;
            let (key_start, key_end) = split_range_key(k.value())?;
            if let Some(point) = point {
                if key_start > point {
                    break;
                }
                if key_end <= point {
                    continue;
                }
            }
            let entry = decode_entry(key_start, key_end, v.value())?;
            if !query.matches_at(entry.inserted) {
                continue;
            }
            delivered += 1;
            if !consumer(entry)? {
                break;
            }
        }
        Ok(delivered)
    }

    /// Deletes records inserted before `cutoff`. Work commits in batches;
    /// cancelling between batches leaves the store consistent and a rerun
    /// finishes the remainder.
    pub fn remove_old_data(
        &self,
        cutoff: Timestamp,
        cancel: &Cancellation,
    ) -> Result<MaintenanceStats> {
        store::retention_pass(
            &self.env,
            self.config.batch_size,
            cancel,
            Some(cutoff),
            None,
            None,
            |_, value_bytes| read_inserted(value_bytes),
        )
    }

    /// Copies every record from `source` into this store. Both stores must
    /// carry identical formats. Rows copy verbatim; the overwrite setting
    /// of this store decides collisions.
    pub fn merge_from(&self, source: &RangedStateStore, cancel: &Cancellation) -> Result<u64> {
        if self.format != source.format {
            return Err(Error::Schema(format!(
                "cannot merge: source format {:?} differs from {:?}",
                source.format, self.format
            )));
        }
        let rtx = source.env.begin_read()?;
        let data = rtx.open_table(DATA)?;
        let _gate = self.env.lock_writes();
        let mut batch = Batch::new(&self.env, self.config.batch_size);
        let mut merged = 0u64;
        for item in data.range::<&[u8]>(..)? {
            cancel.check()?;
            let (k, v) = item?;
            {
                let txn = batch.txn()?;
                let mut dest = txn.open_table(DATA)?;
                if self.config.overwrite || dest.get(k.value())?.is_none() {
                    dest.insert(k.value(), v.value())?;
                }
            }
            batch.note_op()?;
            merged += 1;
        }
        batch.commit()?;
        info!(rows = merged, source = %source.path().display(), "merged store");
        Ok(merged)
    }

    /// Number of records.
    pub fn count(&self) -> Result<u64> {
        let rtx = self.env.begin_read()?;
        Ok(rtx.open_table(DATA)?.len()?)
    }
}

fn decode_entry(key_start: u64, key_end: u64, value_bytes: &[u8]) -> Result<RangedEntry> {
    let mut cur = Cursor::new(value_bytes);
    let inserted = Timestamp::from_millis(ord::decode_i64(cur.take_array::<8>()?));
    let value = Value::read(&mut cur)?;
    cur.finish()?;
    Ok(RangedEntry {
        key_start,
        key_end,
        inserted,
        value,
    })
}

/// Batching writer for a ranged state store. The writer holds the store's
/// writer gate for its whole lifetime.
pub struct RangedWriter<'a> {
    store: &'a RangedStateStore,
    batch: Batch<'a>,
    _gate: MutexGuard<'a, ()>,
}

impl RangedWriter<'_> {
    /// Inserts one record covering `[key_start, key_end)`.
    pub fn insert(&mut self, key_start: u64, key_end: u64, value: &Value) -> Result<()> {
        self.store
            .insert_row(&mut self.batch, key_start, key_end, value, Timestamp::now())
    }

    /// Commits outstanding work.
    pub fn commit(self) -> Result<()> {
        self.batch.commit()
    }

    /// Discards uncommitted work.
    pub fn abort(self) -> Result<()> {
        self.batch.abort()
    }
}
