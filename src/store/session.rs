//! Session state: keyed membership intervals, coalesced on read and
//! rewritten in place by the condense pass.

use std::ops::Bound;
use std::path::Path;

use parking_lot::MutexGuard;
use redb::{ReadableTable, ReadableTableMetadata};
use tracing::info;

use crate::buffer::ByteBufferPool;
use crate::codec::ord;
use crate::codec::value::{Timestamp, Value};
use crate::config::{Format, StoreConfig, StoreKind};
use crate::env::{decode_meta_u64, Batch, Snapshot, StoreEnv, CLASH_ROW, DATA, META};
use crate::error::{Error, Result};
use crate::key::SessionKeyCodec;
use crate::lookup::used::SweepStats;
use crate::store::{
    self, read_inserted, Cancellation, CondenseStats, MaintenanceStats, Query,
};

/// One session interval. Both bounds are inclusive; a point session with
/// `start == end` is legal.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionEntry {
    /// Session key.
    pub key: Value,
    /// First time inside the session.
    pub start: Timestamp,
    /// Last time inside the session.
    pub end: Timestamp,
    /// A terminal session is never extended over by condense or by the
    /// coalescing reads.
    pub terminal: bool,
    /// Wall-clock time the record was written.
    pub inserted: Timestamp,
}

// Row value layout: [insert time: 8][terminal: 1].
fn encode_session_value(inserted: Timestamp, terminal: bool) -> [u8; 9] {
    let mut out = [0u8; 9];
    out[..8].copy_from_slice(&ord::encode_i64(inserted.millis()));
    out[8] = u8::from(terminal);
    out
}

fn read_terminal(value_bytes: &[u8]) -> Result<bool> {
    if value_bytes.len() != 9 {
        return Err(Error::corrupt("session value is not nine bytes"));
    }
    match value_bytes[8] {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(Error::corrupt("session terminal flag is not 0/1")),
    }
}

/// An open run of overlapping same-key rows, carried across scan batches.
struct SessionRun {
    prefix: Vec<u8>,
    start: Timestamp,
    end: Timestamp,
    terminal: bool,
    inserted: Timestamp,
    keys: Vec<Vec<u8>>,
}

impl SessionRun {
    fn begin(prefix: &[u8], start: Timestamp, end: Timestamp, terminal: bool, inserted: Timestamp) -> Self {
        Self {
            prefix: prefix.to_vec(),
            start,
            end,
            terminal,
            inserted,
            keys: Vec::new(),
        }
    }

    /// Whether the row may extend this run: same key, no gap, and the run
    /// has not been sealed by a terminal row.
    fn joins(&self, prefix: &[u8], start: Timestamp) -> bool {
        !self.terminal && self.prefix == prefix && start <= self.end
    }

    fn extend(&mut self, end: Timestamp, terminal: bool, inserted: Timestamp) {
        if end > self.end {
            self.end = end;
        }
        self.terminal = terminal;
        if inserted > self.inserted {
            self.inserted = inserted;
        }
    }
}

/// Store of keyed sessions, where a read at `t` asks whether `t` falls
/// inside any recorded interval for the key.
pub struct SessionStore {
    env: StoreEnv,
    key: SessionKeyCodec,
    pool: ByteBufferPool,
    format: Format,
    config: StoreConfig,
}

impl SessionStore {
    /// Opens or creates a session store at `path`. The configured value
    /// mode is ignored: session rows carry only their insert time and the
    /// terminal flag.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let format = Format::new(StoreKind::Session, &config);
        let key = SessionKeyCodec::new(
            config.key,
            config.time,
            &config.lookups,
            config.resolve_cache,
        );
        let mut tables = Vec::new();
        key.push_table_names(&mut tables);
        let env = StoreEnv::open(path.as_ref(), &format, &tables)?;
        Ok(Self {
            env,
            key,
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
    pub fn writer(&self) -> SessionWriter<'_> {
        let gate = self.env.lock_writes();
        SessionWriter {
            store: self,
            batch: Batch::new(&self.env, self.config.batch_size),
            _gate: gate,
        }
    }

    fn insert_row(
        &self,
        batch: &mut Batch<'_>,
        key: &Value,
        start: Timestamp,
        end: Timestamp,
        terminal: bool,
        inserted: Timestamp,
    ) -> Result<()> {
        if start > end {
            return Err(Error::InvalidArgument(format!(
                "session start {start} is after its end {end}"
            )));
        }
        {
            let (txn, clashes) = batch.parts()?;
            self.pool.with(self.key.encoded_upper(key), |key_buf| {
                self.key
                    .write(txn, &mut *clashes, key, start, end, key_buf)?;
                let value_buf = encode_session_value(inserted, terminal);
                let mut data = txn.open_table(DATA)?;
                if self.config.overwrite || data.get(key_buf.as_slice())?.is_none() {
                    data.insert(key_buf.as_slice(), &value_buf[..])?;
                }
                Ok(())
            })?;
        }
        batch.note_op()
    }

    /// The session covering `at` for `key`, if any.
    ///
    /// Walks backwards from the probe and keeps the earliest covering row
    /// of a contiguous chain, stopping at the first gap below `at`.
    pub fn get_session(&self, key: &Value, at: Timestamp) -> Result<Option<SessionEntry>> {
        let rtx = self.env.begin_read()?;
        let snap = Snapshot::Read(&rtx);
        self.pool.with(self.key.encoded_upper(key), |probe| {
            if !self.key.prefix_for_get(&snap, key, probe)? {
                return Ok(None);
            }
            let prefix_len = probe.len();
            self.key.encode_time(at, probe)?;
            self.key.pad_max(probe);
            let want = prefix_len + 2 * self.key.time_width();
            let mut low = Vec::with_capacity(want);
            low.extend_from_slice(&probe[..prefix_len]);
            self.key.pad_min(&mut low);
            self.key.pad_min(&mut low);

            let data = rtx.open_table(DATA)?;
            let mut range = data.range(low.as_slice()..=probe.as_slice())?;
            let mut found: Option<(Vec<u8>, Vec<u8>)> = None;
            while let Some(item) = range.next_back() {
                let (k, v) = item?;
                if k.value().len() != want {
                    continue;
                }
                let (_, end) = self.key.span(k.value())?;
                if end < at {
                    break;
                }
                found = Some((k.value().to_vec(), v.value().to_vec()));
            }
            match found {
                Some((k, v)) => Ok(Some(self.decode_entry(&snap, &k, &v)?)),
                None => Ok(None),
            }
        })
    }

    /// Whether `at` falls inside any session for `key`.
    pub fn in_session(&self, key: &Value, at: Timestamp) -> Result<bool> {
        Ok(self.get_session(key, at)?.is_some())
    }

    /// Streams sessions matching `query` to `consumer` in key order,
    /// coalescing overlapping or abutting same-key rows into one entry as
    /// it goes. The time window filters on the stored spans before they
    /// coalesce. The consumer returns `false` to stop early. Returns the
    /// number of sessions delivered.
    pub fn search<F>(&self, query: &Query, cancel: &Cancellation, mut consumer: F) -> Result<u64>
    where
        F: FnMut(SessionEntry) -> Result<bool>,
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
        let mut run: Option<SessionRun> = None;
        let mut emit = |run: SessionRun| -> Result<bool> {
            let key = self.key.read_prefix(&snap, &self.pool, &run.prefix)?;
            consumer(SessionEntry {
                key,
                start: run.start,
                end: run.end,
                terminal: run.terminal,
                inserted: run.inserted,
            })
        };

        let mut scan = |k: &[u8], v: &[u8], want: Option<usize>| -> Result<Option<SessionRun>> {
            cancel.check()?;
            if let Some(want) = want {
                if k.len() != want {
                    return Ok(None);
                }
            }
            let split = self.key.split(k)?;
            let (start, end) = self.key.span(k)?;
            if !query.matches_span(start, end) {
                return Ok(None);
            }
            let inserted = read_inserted(v)?;
            let terminal = read_terminal(v)?;
            let joins = match &run {
                Some(open) => open.joins(&k[..split], start),
                None => false,
            };
            if joins {
                if let Some(open) = run.as_mut() {
                    open.extend(end, terminal, inserted);
                }
                Ok(None)
            } else {
                Ok(run.replace(SessionRun::begin(
                    &k[..split],
                    start,
                    end,
                    terminal,
                    inserted,
                )))
            }
        };

        match prefix {
            Some(prefix) => {
                let want = prefix.len() + 2 * self.key.time_width();
                let mut low = prefix.clone();
                self.key.pad_min(&mut low);
                self.key.pad_min(&mut low);
                let mut high = prefix;
                self.key.pad_max(&mut high);
                self.key.pad_max(&mut high);
                for item in data.range(low.as_slice()..=high.as_slice())? {
                    let (k, v) = item?;
                    if let Some(done) = scan(k.value(), v.value(), Some(want))? {
                        delivered += 1;
                        if !emit(done)? {
                            return Ok(delivered);
                        }
                    }
                }
            }
            None => {
                for item in data.range::<&[u8]>(..)? {
                    let (k, v) = item?;
                    if let Some(done) = scan(k.value(), v.value(), None)? {
                        delivered += 1;
                        if !emit(done)? {
                            return Ok(delivered);
                        }
                    }
                }
            }
        }
        if let Some(done) = run.take() {
            delivered += 1;
            if !emit(done)? {
                return Ok(delivered);
            }
        }
        Ok(delivered)
    }

    fn decode_entry(
        &self,
        snap: &Snapshot<'_>,
        key_bytes: &[u8],
        value_bytes: &[u8],
    ) -> Result<SessionEntry> {
        let (key, start, end) = self.key.read(snap, &self.pool, key_bytes)?;
        let inserted = read_inserted(value_bytes)?;
        let terminal = read_terminal(value_bytes)?;
        Ok(SessionEntry {
            key,
            start,
            end,
            terminal,
            inserted,
        })
    }

    /// Rewrites each chain of overlapping or abutting same-key rows whose
    /// later members start before `before` into one row covering the union
    /// interval. Strictly row-reducing and idempotent. A terminal row ends
    /// its chain; nothing merges over it.
    pub fn condense(&self, before: Timestamp, cancel: &Cancellation) -> Result<CondenseStats> {
        let mut stats = CondenseStats::default();
        let cap = self.config.batch_size;
        let _gate = self.env.lock_writes();
        let mut batch = Batch::new(&self.env, self.config.batch_size);
        let mut run: Option<SessionRun> = None;
        let mut cursor: Option<Vec<u8>> = None;
        loop {
            let mut closes: Vec<SessionRun> = Vec::new();
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
                    stats.scanned += 1;
                    let split = self.key.split(key_bytes)?;
                    let (start, end) = self.key.span(key_bytes)?;
                    let terminal = read_terminal(v.value())?;
                    let extends = match &run {
                        Some(open) => start < before && open.joins(&key_bytes[..split], start),
                        None => false,
                    };
                    if extends {
                        if let Some(open) = run.as_mut() {
                            open.extend(end, terminal, Timestamp::MIN);
                            open.keys.push(key_bytes.to_vec());
                        }
                    } else {
                        if let Some(done) = run.take() {
                            if done.keys.len() > 1 {
                                closes.push(done);
                            }
                        }
                        let mut next =
                            SessionRun::begin(&key_bytes[..split], start, end, terminal, Timestamp::MIN);
                        next.keys.push(key_bytes.to_vec());
                        run = Some(next);
                    }
                    last_seen = Some(key_bytes.to_vec());
                    processed += 1;
                    if processed >= cap {
                        finished = false;
                        break;
                    }
                }
                if let Some(last) = last_seen {
                    cursor = Some(last);
                }
            }
            for done in &closes {
                stats.merged += self.rewrite_run(&mut batch, done)?;
            }
            batch.note_ops(processed)?;
            if finished {
                break;
            }
        }
        if let Some(done) = run.take() {
            if done.keys.len() > 1 {
                stats.merged += self.rewrite_run(&mut batch, &done)?;
            }
        }
        batch.commit()?;
        info!(
            scanned = stats.scanned,
            merged = stats.merged,
            "condense finished"
        );
        Ok(stats)
    }

    /// Replaces the rows of one closed run with a single row covering the
    /// union interval. The merged key reuses the run's prefix bytes, so no
    /// lookup rows are touched.
    fn rewrite_run(&self, batch: &mut Batch<'_>, run: &SessionRun) -> Result<u64> {
        {
            let txn = batch.txn()?;
            let mut data = txn.open_table(DATA)?;
            for key in &run.keys {
                data.remove(key.as_slice())?;
            }
            let mut merged = Vec::with_capacity(run.prefix.len() + 2 * self.key.time_width());
            merged.extend_from_slice(&run.prefix);
            self.key.encode_time(run.start, &mut merged)?;
            self.key.encode_time(run.end, &mut merged)?;
            let value_buf = encode_session_value(Timestamp::now(), run.terminal);
            data.insert(merged.as_slice(), &value_buf[..])?;
        }
        batch.note_ops(run.keys.len() + 1)?;
        Ok((run.keys.len() - 1) as u64)
    }

    /// Deletes sessions that ended before `cutoff`, then sweeps lookup rows
    /// nothing references any more.
    ///
    /// With `use_state_time` the session end decides expiry, otherwise the
    /// insert time. A session straddling the cutoff is retained whole.
    pub fn remove_old_data(
        &self,
        cutoff: Timestamp,
        use_state_time: bool,
        cancel: &Cancellation,
    ) -> Result<MaintenanceStats> {
        let key_recorder = self.key.recorder();
        store::retention_pass(
            &self.env,
            self.config.batch_size,
            cancel,
            Some(cutoff),
            key_recorder.as_ref(),
            None,
            |key_bytes, value_bytes| {
                if use_state_time {
                    Ok(self.key.span(key_bytes)?.1)
                } else {
                    read_inserted(value_bytes)
                }
            },
        )
    }

    /// Drops every lookup row no session references.
    pub fn sweep_unused_lookups(&self, cancel: &Cancellation) -> Result<SweepStats> {
        let key_recorder = self.key.recorder();
        let stats = store::retention_pass(
            &self.env,
            self.config.batch_size,
            cancel,
            None,
            key_recorder.as_ref(),
            None,
            |_, _| Ok(Timestamp::MIN),
        )?;
        Ok(stats.lookups)
    }

    /// Copies every session from `source` into this store. Both stores
    /// must carry identical formats; insert times survive the merge.
    pub fn merge_from(&self, source: &SessionStore, cancel: &Cancellation) -> Result<u64> {
        if self.format != source.format {
            return Err(Error::Schema(format!(
                "cannot merge: source format {:?} differs from {:?}",
                source.format, self.format
            )));
        }
        let raw = !self.key.uses_lookup();
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
                self.insert_row(
                    &mut batch,
                    &entry.key,
                    entry.start,
                    entry.end,
                    entry.terminal,
                    entry.inserted,
                )?;
            }
            merged += 1;
        }
        batch.commit()?;
        info!(rows = merged, source = %source.path().display(), "merged store");
        Ok(merged)
    }

    /// Number of session rows (condense may shrink this without losing
    /// coverage).
    pub fn count(&self) -> Result<u64> {
        let rtx = self.env.begin_read()?;
        Ok(rtx.open_table(DATA)?.len()?)
    }

    /// Rows across the key-side lookup tables.
    pub fn lookup_rows(&self) -> Result<u64> {
        let rtx = self.env.begin_read()?;
        let snap = Snapshot::Read(&rtx);
        self.key.lookup_rows(&snap)
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

/// Batching writer for a session store. The writer holds the store's
/// writer gate for its whole lifetime.
pub struct SessionWriter<'a> {
    store: &'a SessionStore,
    batch: Batch<'a>,
    _gate: MutexGuard<'a, ()>,
}

impl SessionWriter<'_> {
    /// Inserts one session interval (inclusive bounds). A terminal session
    /// is never merged over by condense.
    pub fn insert(
        &mut self,
        key: &Value,
        start: Timestamp,
        end: Timestamp,
        terminal: bool,
    ) -> Result<()> {
        self.store
            .insert_row(&mut self.batch, key, start, end, terminal, Timestamp::now())
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
