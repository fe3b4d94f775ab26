//! Temporal state: keyed records versioned by effective time.

use std::path::Path;

use parking_lot::MutexGuard;
use redb::{ReadableTable, ReadableTableMetadata};
use tracing::info;

use crate::buffer::ByteBufferPool;
use crate::codec::ord;
use crate::codec::value::{Timestamp, Value};
use crate::codec::Cursor;
use crate::config::{Format, StoreConfig, StoreKind};
use crate::env::{decode_meta_u64, Batch, Snapshot, StoreEnv, CLASH_ROW, DATA, META};
use crate::error::{Error, Result};
use crate::key::TemporalKeyCodec;
use crate::lookup::used::SweepStats;
use crate::lookup::ValueSerde;
use crate::store::{self, read_inserted, Cancellation, MaintenanceStats, Query};

/// One temporal record.
#[derive(Clone, Debug, PartialEq)]
pub struct StateEntry {
    /// Record key.
    pub key: Value,
    /// Effective time the record speaks for.
    pub effective: Timestamp,
    /// Wall-clock time the record was written.
    pub inserted: Timestamp,
    /// Record value.
    pub value: Value,
}

/// Append-oriented store of keyed state, where each key carries one record
/// per effective time and a read at `t` sees the latest record at or before
/// `t`.
#[derive(Debug)]
pub struct TemporalStateStore {
    env: StoreEnv,
    key: TemporalKeyCodec,
    value: ValueSerde,
    pool: ByteBufferPool,
    format: Format,
    config: StoreConfig,
}

impl TemporalStateStore {
    /// Opens or creates a temporal state store at `path`.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let format = Format::new(StoreKind::TemporalState, &config);
        let key = TemporalKeyCodec::new(
            config.key,
            config.time,
            &config.lookups,
            config.resolve_cache,
        );
        let value = ValueSerde::new(config.value, &config.lookups, config.resolve_cache);
        let mut tables = Vec::new();
        key.push_table_names(&mut tables);
        value.push_table_names(&mut tables);
        let env = StoreEnv::open(path.as_ref(), &format, &tables)?;
        Ok(Self {
            env,
            key,
            value,
            pool: ByteBufferPool::default(),
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
    pub fn writer(&self) -> TemporalWriter<'_> {
        let gate = self.env.lock_writes();
        TemporalWriter {
            store: self,
            batch: Batch::new(&self.env, self.config.batch_size),
            _gate: gate,
        }
    }

    fn insert_row(
        &self,
        batch: &mut Batch<'_>,
        key: &Value,
        effective: Timestamp,
        value: &Value,
        inserted: Timestamp,
    ) -> Result<()> {
        {
            let (txn, clashes) = batch.parts()?;
            self.pool.with(self.key.encoded_upper(key), |key_buf| {
                self.key.write(txn, &mut *clashes, key, effective, key_buf)?;
                self.pool
                    .with(8 + self.value.encoded_upper(value), |value_buf| {
                        value_buf.extend_from_slice(&ord::encode_i64(inserted.millis()));
                        self.value
                            .write(txn, &mut *clashes, &self.pool, value, value_buf)?;
                        let mut data = txn.open_table(DATA)?;
                        if self.config.overwrite || data.get(key_buf.as_slice())?.is_none() {
                            data.insert(key_buf.as_slice(), value_buf.as_slice())?;
                        }
                        Ok(())
                    })
            })?;
        }
        batch.note_op()
    }

    /// Latest record for `key` effective at or before `at`.
    pub fn get(&self, key: &Value, at: Timestamp) -> Result<Option<StateEntry>> {
        let rtx = self.env.begin_read()?;
        let snap = Snapshot::Read(&rtx);
        self.pool.with(self.key.encoded_upper(key), |key_buf| {
            if !self.key.write_for_get(&snap, key, at, key_buf)? {
                return Ok(None);
            }
            let want = key_buf.len();
            let split = want - self.key.time_width();
            let mut low = Vec::with_capacity(want);
            low.extend_from_slice(&key_buf[..split]);
            self.key.pad_min(&mut low);

            let data = rtx.open_table(DATA)?;
            let mut range = data.range(low.as_slice()..=key_buf.as_slice())?;
            // Raw string prefixes of longer keys can fall inside this
            // window; the fixed row length separates them.
            while let Some(item) = range.next_back() {
                let (k, v) = item?;
                if k.value().len() != want {
                    continue;
                }
                return Ok(Some(self.decode_entry(&snap, k.value(), v.value())?));
            }
            Ok(None)
        })
    }

    /// Streams records matching `query` to `consumer` in key order; the
    /// time window filters on effective time. The consumer returns `false`
    /// to stop early. Returns the number of records delivered.
    pub fn search<F>(&self, query: &Query, cancel: &Cancellation, mut consumer: F) -> Result<u64>
    where
        F: FnMut(StateEntry) -> Result<bool>,
    {
        let rtx = self.env.begin_read()?;
        let snap = Snapshot::Read(&rtx);
        let prefix = match &query.key {
            Some(key) => {
                let mut buf = Vec::new();
                if !self.key.prefix_for_get(&snap, key, &mut buf)? {
                    return Ok(0);
                }
                Some(buf)
            }
            None => None,
        };

        let data = rtx.open_table(DATA)?;
        let mut delivered = 0u64;
        let mut visit = |k: &[u8], v: &[u8], want: Option<usize>| -> Result<bool> {
            cancel.check()?;
            if let Some(want) = want {
                if k.len() != want {
                    return Ok(true);
                }
            }
            let entry = self.decode_entry(&snap, k, v)?;
            if !query.matches_at(entry.effective) {
                return Ok(true);
            }
            delivered += 1;
            consumer(entry)
        };
        match prefix {
            Some(prefix) => {
                let want = prefix.len() + self.key.time_width();
                let mut low = prefix.clone();
                self.key.pad_min(&mut low);
                let mut high = prefix;
                self.key.pad_max(&mut high);
                for item in data.range(low.as_slice()..=high.as_slice())? {
                    let (k, v) = item?;
                    if !visit(k.value(), v.value(), Some(want))? {
                        break;
                    }
                }
            }
            None => {
                for item in data.range::<&[u8]>(..)? {
                    let (k, v) = item?;
                    if !visit(k.value(), v.value(), None)? {
                        break;
                    }
                }
            }
        }
        Ok(delivered)
    }

    fn decode_entry(
        &self,
        snap: &Snapshot<'_>,
        key_bytes: &[u8],
        value_bytes: &[u8],
    ) -> Result<StateEntry> {
        let (key, effective) = self.key.read(snap, &self.pool, key_bytes)?;
        let mut cur = Cursor::new(value_bytes);
        let inserted = Timestamp::from_millis(ord::decode_i64(cur.take_array::<8>()?));
        let value = self.value.read(snap, &self.pool, &mut cur)?;
        cur.finish()?;
        Ok(StateEntry {
            key,
            effective,
            inserted,
            value,
        })
    }

    /// Deletes records older than `cutoff`, then sweeps lookup rows nothing
    /// references any more.
    ///
    /// With `use_state_time` the effective time decides expiry, otherwise
    /// the insert time. Work commits in batches; cancelling between batches
    /// leaves the store consistent and a rerun finishes the remainder.
    pub fn remove_old_data(
        &self,
        cutoff: Timestamp,
        use_state_time: bool,
        cancel: &Cancellation,
    ) -> Result<MaintenanceStats> {
        let key_recorder = self.key.recorder();
        let value_recorder = self.value.recorder(8);
        store::retention_pass(
            &self.env,
            self.config.batch_size,
            cancel,
            Some(cutoff),
            key_recorder.as_ref(),
            value_recorder.as_ref(),
            |key_bytes, value_bytes| {
                if use_state_time {
                    self.key.read_time(key_bytes)
                } else {
                    read_inserted(value_bytes)
                }
            },
        )
    }

    /// Drops every lookup row no record references.
    pub fn sweep_unused_lookups(&self, cancel: &Cancellation) -> Result<SweepStats> {
        let key_recorder = self.key.recorder();
        let value_recorder = self.value.recorder(8);
        let stats = store::retention_pass(
            &self.env,
            self.config.batch_size,
            cancel,
            None,
            key_recorder.as_ref(),
            value_recorder.as_ref(),
            |_, _| Ok(Timestamp::MIN),
        )?;
        Ok(stats.lookups)
    }

    /// Copies every record from `source` into this store.
    ///
    /// Both stores must carry identical formats. When no lookup tier is in
    /// play rows copy verbatim; otherwise each record is resolved against
    /// the source and re-interned here. Insert times survive the merge, and
    /// the overwrite setting of this store decides collisions.
    pub fn merge_from(&self, source: &TemporalStateStore, cancel: &Cancellation) -> Result<u64> {
        if self.format != source.format {
            return Err(Error::Schema(format!(
                "cannot merge: source format {:?} differs from {:?}",
                source.format, self.format
            )));
        }
        let raw = !self.key.uses_lookup() && !self.value.uses_lookup();
        let rtx = source.env.begin_read()?;
        let snap = Snapshot::Read(&rtx);
        let data = rtx.open_table(DATA)?;
        let _gate = self.env.lock_writes();
        let mut batch = Batch::new(&self.env, self.config.batch_size);
        let mut merged = 0u64;
        for item in data.range::<&[u8]>(..)? {
            cancel.check()?;
            let (k, v) = item?;
            if raw {
                {
                    let txn = batch.txn()?;
                    let mut dest = txn.open_table(DATA)?;
                    if self.config.overwrite || dest.get(k.value())?.is_none() {
                        dest.insert(k.value(), v.value())?;
                    }
                }
                batch.note_op()?;
            } else {
                let entry = source.decode_entry(&snap, k.value(), v.value())?;
                self.insert_row(&mut batch, &entry.key, entry.effective, &entry.value, entry.inserted)?;
            }
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

    /// Rows across the lookup tables, key side plus value side.
    pub fn lookup_rows(&self) -> Result<u64> {
        let rtx = self.env.begin_read()?;
        let snap = Snapshot::Read(&rtx);
        Ok(self.key.lookup_rows(&snap)? + self.value.lookup_rows(&snap)?)
    }

    /// Total hash clashes recorded over the store's lifetime.
    pub fn hash_clashes(&self) -> Result<u64> {
        let rtx = self.env.begin_read()?;
        let meta = rtx.open_table(META)?;
        match meta.get(CLASH_ROW)? {
            Some(raw) => decode_meta_u64(raw.value()),
            None => Ok(0),
        }
    }
}

/// Batching writer for a temporal store.
///
/// Dropping the writer without calling [`TemporalWriter::commit`] discards
/// work since the last full batch. The writer holds the store's writer gate
/// for its whole lifetime.
pub struct TemporalWriter<'a> {
    store: &'a TemporalStateStore,
    batch: Batch<'a>,
    _gate: MutexGuard<'a, ()>,
}

impl TemporalWriter<'_> {
    /// Inserts one record at its effective time.
    pub fn insert(&mut self, key: &Value, effective: Timestamp, value: &Value) -> Result<()> {
        self.store
            .insert_row(&mut self.batch, key, effective, value, Timestamp::now())
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
