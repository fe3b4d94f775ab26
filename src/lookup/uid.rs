//! Sequential-id interning for mid-sized byte strings.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use redb::{ReadableTable, WriteTransaction};
use tracing::trace;

use crate::codec::unsigned::UnsignedBytes;
use crate::env::{byte_table, decode_meta_u64, Snapshot, META};
use crate::error::{Error, Result};

/// Interns byte strings as fixed-width sequential ids.
///
/// The forward table maps value bytes to the id, the reverse table maps the
/// id back. The next-id counter lives in the meta table and only moves
/// forward, so an id removed by a sweep is never handed out again; that is
/// what makes the resolve cache safe to keep across sweeps.
#[derive(Debug)]
pub(crate) struct UidLookupTable {
    fwd_name: String,
    rev_name: String,
    counter_row: String,
    width: UnsignedBytes,
    cache: Option<Mutex<LruCache<u64, Arc<[u8]>>>>,
}

impl UidLookupTable {
    pub(crate) fn new(prefix: &str, width: UnsignedBytes, cache_entries: usize) -> Self {
        Self {
            fwd_name: format!("{prefix}.uid.fwd"),
            rev_name: format!("{prefix}.uid.rev"),
            counter_row: format!("{prefix}.uid.next"),
            width,
            cache: NonZeroUsize::new(cache_entries)
                .map(|entries| Mutex::new(LruCache::new(entries))),
        }
    }

    /// Width of one id reference in bytes.
    pub(crate) fn ref_len(&self) -> usize {
        self.width.width()
    }

    pub(crate) fn fwd_name(&self) -> &str {
        &self.fwd_name
    }

    pub(crate) fn rev_name(&self) -> &str {
        &self.rev_name
    }

    pub(crate) fn push_table_names(&self, out: &mut Vec<String>) {
        out.push(self.fwd_name.clone());
        out.push(self.rev_name.clone());
    }

    /// Appends the id for `bytes` to `out`, interning them first if they
    /// have never been seen.
    pub(crate) fn get_or_create(
        &self,
        txn: &WriteTransaction,
        bytes: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let mut fwd = txn.open_table(byte_table(&self.fwd_name))?;
        if let Some(found) = fwd.get(bytes)? {
            out.extend_from_slice(found.value());
            return Ok(());
        }

        let mut meta = txn.open_table(META)?;
        let next = match meta.get(self.counter_row.as_str())? {
            Some(raw) => decode_meta_u64(raw.value())?,
            None => 0,
        };
        let successor = match next.checked_add(1) {
            Some(n) if next <= self.width.max_value() => n,
            _ => {
                return Err(Error::CapacityExceeded {
                    what: "uid lookup ids",
                    limit: self.width.max_value(),
                })
            }
        };
        meta.insert(self.counter_row.as_str(), successor.to_be_bytes().as_slice())?;
        drop(meta);

        let mut id = Vec::with_capacity(self.width.width());
        self.width.put(&mut id, next)?;
        fwd.insert(bytes, id.as_slice())?;
        drop(fwd);
        let mut rev = txn.open_table(byte_table(&self.rev_name))?;
        rev.insert(id.as_slice(), bytes)?;
        trace!(id = next, len = bytes.len(), table = %self.fwd_name, "interned value");
        out.extend_from_slice(&id);
        Ok(())
    }

    /// Appends the existing id for `bytes`, or reports that the bytes were
    /// never interned. Never writes.
    pub(crate) fn probe(
        &self,
        snap: &Snapshot<'_>,
        bytes: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<bool> {
        match snap.get(&self.fwd_name, bytes)? {
            Some(id) => {
                out.extend_from_slice(&id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Appends the value bytes behind an id reference.
    pub(crate) fn resolve(
        &self,
        snap: &Snapshot<'_>,
        reference: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let id = self.width.get(reference)?;
        if let Some(cache) = &self.cache {
            if let Some(bytes) = cache.lock().get(&id) {
                out.extend_from_slice(bytes);
                return Ok(());
            }
        }
        match snap.get(&self.rev_name, reference)? {
            Some(bytes) => {
                if let Some(cache) = &self.cache {
                    cache.lock().put(id, Arc::from(bytes.as_slice()));
                }
                out.extend_from_slice(&bytes);
                Ok(())
            }
            None => Err(Error::corrupt(format!("dangling uid reference {id}"))),
        }
    }

    pub(crate) fn purge_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.lock().clear();
        }
    }

    /// Interned entries, counted from the forward table.
    pub(crate) fn row_count(&self, snap: &Snapshot<'_>) -> Result<u64> {
        snap.table_len(&self.fwd_name)
    }
}
