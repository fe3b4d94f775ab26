//! Engine plumbing shared by the stores: file open and format validation,
//! the meta table, read snapshots and batched write transactions.

use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard};
use redb::{
    Database, ReadTransaction, ReadableTable, ReadableTableMetadata, TableDefinition,
    WriteTransaction,
};
use tracing::{debug, trace};

use crate::config::Format;
use crate::error::{Error, Result};
use crate::lookup::hash::ClashLog;

/// Primary record table.
pub(crate) const DATA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("data");

/// Store metadata: the format row, uid counters and the clash tally.
pub(crate) const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

pub(crate) const FORMAT_ROW: &str = "format";
pub(crate) const CLASH_ROW: &str = "hash.clashes";

/// Definition for a runtime-named byte table.
pub(crate) fn byte_table(name: &str) -> TableDefinition<'_, &'static [u8], &'static [u8]> {
    TableDefinition::new(name)
}

/// Decodes an eight-byte big-endian meta counter row.
pub(crate) fn decode_meta_u64(raw: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| Error::corrupt("meta counter row is not eight bytes"))?;
    Ok(u64::from_be_bytes(bytes))
}

/// One open store file.
///
/// The engine serializes write transactions on its own, but maintenance
/// passes commit in batches and must stay exclusive across all of them: a
/// row written between a mark batch and the sweep could reference a lookup
/// row the sweep is about to delete. The writer gate closes that window;
/// every mutating entry point holds it for its whole duration.
#[derive(Debug)]
pub(crate) struct StoreEnv {
    db: Database,
    path: PathBuf,
    write_gate: Mutex<()>,
}

impl StoreEnv {
    /// Opens or creates the store file.
    ///
    /// A new file gets the format row and all named tables up front; an
    /// existing file must carry a format row equal to `format` or the open
    /// fails before anything is touched.
    pub(crate) fn open(path: &Path, format: &Format, tables: &[String]) -> Result<Self> {
        let db = Database::create(path)?;
        let wtx = db.begin_write()?;
        {
            let mut meta = wtx.open_table(META)?;
            let existing = meta.get(FORMAT_ROW)?.map(|raw| raw.value().to_vec());
            match existing {
                Some(raw) => {
                    let stored: Format = serde_json::from_slice(&raw)
                        .map_err(|e| Error::Schema(format!("unreadable format row: {e}")))?;
                    if stored != *format {
                        return Err(Error::Schema(format!(
                            "format mismatch: file carries {stored:?}, open requested {format:?}"
                        )));
                    }
                }
                None => {
                    let raw = serde_json::to_vec(format)
                        .map_err(|e| Error::Schema(e.to_string()))?;
                    meta.insert(FORMAT_ROW, raw.as_slice())?;
                }
            }
            wtx.open_table(DATA)?;
            for name in tables {
                wtx.open_table(byte_table(name))?;
            }
        }
        wtx.commit()?;
        debug!(path = %path.display(), "opened store");
        Ok(Self {
            db,
            path: path.to_path_buf(),
            write_gate: Mutex::new(()),
        })
    }

    /// Takes the writer gate; the caller holds the guard for as long as its
    /// mutations must not interleave with other writers.
    pub(crate) fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_gate.lock()
    }

    pub(crate) fn begin_read(&self) -> Result<ReadTransaction> {
        Ok(self.db.begin_read()?)
    }

    pub(crate) fn begin_write(&self) -> Result<WriteTransaction> {
        Ok(self.db.begin_write()?)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

/// A point-read view over whichever transaction the caller already holds.
///
/// Lookup probes and resolves run on both sides of the read/write split;
/// this keeps their code identical in both cases.
pub(crate) enum Snapshot<'a> {
    Read(&'a ReadTransaction),
    Write(&'a WriteTransaction),
}

impl Snapshot<'_> {
    /// Point lookup in a named byte table. A table no write transaction
    /// ever created holds no rows.
    pub(crate) fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self {
            Snapshot::Read(txn) => match txn.open_table(byte_table(table)) {
                Ok(table) => Ok(table.get(key)?.map(|guard| guard.value().to_vec())),
                Err(redb::TableError::TableDoesNotExist(_)) => Ok(None),
                Err(e) => Err(e.into()),
            },
            Snapshot::Write(txn) => {
                let table = txn.open_table(byte_table(table))?;
                let value = table.get(key)?.map(|guard| guard.value().to_vec());
                Ok(value)
            }
        }
    }

    /// Row count of a named byte table.
    pub(crate) fn table_len(&self, table: &str) -> Result<u64> {
        match self {
            Snapshot::Read(txn) => match txn.open_table(byte_table(table)) {
                Ok(table) => Ok(table.len()?),
                Err(redb::TableError::TableDoesNotExist(_)) => Ok(0),
                Err(e) => Err(e.into()),
            },
            Snapshot::Write(txn) => Ok(txn.open_table(byte_table(table))?.len()?),
        }
    }
}

/// Batching write core shared by the store writers.
///
/// The transaction begins lazily on first use and commits either explicitly
/// or once `batch_size` operations have accumulated. Dropping the batch
/// without committing discards uncommitted work. The engine admits a single
/// live write transaction per file, so a second batch on the same store
/// blocks until the first finishes.
pub(crate) struct Batch<'env> {
    env: &'env StoreEnv,
    txn: Option<WriteTransaction>,
    pending: usize,
    batch_size: usize,
    clashes: ClashLog,
}

impl<'env> Batch<'env> {
    pub(crate) fn new(env: &'env StoreEnv, batch_size: usize) -> Self {
        Self {
            env,
            txn: None,
            pending: 0,
            batch_size,
            clashes: ClashLog::default(),
        }
    }

    /// The live transaction, beginning one if none is open.
    pub(crate) fn txn(&mut self) -> Result<&WriteTransaction> {
        if self.txn.is_none() {
            trace!("beginning write transaction");
            self.txn = Some(self.env.begin_write()?);
        }
        Ok(self.txn.as_ref().expect("just initialized"))
    }

    /// Transaction plus clash log, for interning flows that feed both.
    pub(crate) fn parts(&mut self) -> Result<(&WriteTransaction, &mut ClashLog)> {
        if self.txn.is_none() {
            self.txn = Some(self.env.begin_write()?);
        }
        Ok((
            self.txn.as_ref().expect("just initialized"),
            &mut self.clashes,
        ))
    }

    /// Records one completed operation, committing when the batch is full.
    pub(crate) fn note_op(&mut self) -> Result<()> {
        self.note_ops(1)
    }

    /// Records several completed operations at once.
    pub(crate) fn note_ops(&mut self, ops: usize) -> Result<()> {
        self.pending += ops;
        if self.pending >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Commits the open transaction, folding the clash tally into meta.
    pub(crate) fn flush(&mut self) -> Result<()> {
        if let Some(txn) = self.txn.take() {
            let new_clashes = self.clashes.take_new();
            if new_clashes > 0 {
                let mut meta = txn.open_table(META)?;
                let total = match meta.get(CLASH_ROW)? {
                    Some(raw) => decode_meta_u64(raw.value())? + new_clashes,
                    None => new_clashes,
                };
                meta.insert(CLASH_ROW, total.to_be_bytes().as_slice())?;
            }
            txn.commit()?;
            trace!(ops = self.pending, "committed write batch");
        }
        self.pending = 0;
        Ok(())
    }

    /// Commits outstanding work and consumes the batch.
    pub(crate) fn commit(mut self) -> Result<()> {
        self.flush()
    }

    /// Discards uncommitted work.
    pub(crate) fn abort(mut self) -> Result<()> {
        self.pending = 0;
        if let Some(txn) = self.txn.take() {
            txn.abort()?;
        }
        Ok(())
    }
}
