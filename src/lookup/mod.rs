//! Tiered interning of oversized byte strings.
//!
//! Encoded keys and values stay small by routing anything over the inline
//! threshold through a lookup table: mid-sized strings get a sequential id,
//! anything larger is keyed by content digest. Rows then carry a fixed-width
//! reference instead of the bytes themselves.

pub(crate) mod hash;
pub(crate) mod uid;
pub mod used;

use redb::WriteTransaction;

use crate::buffer::ByteBufferPool;
use crate::codec::value::Value;
use crate::codec::Cursor;
use crate::codec::unsigned::UnsignedBytes;
use crate::config::{LookupConfig, ValueMode};
use crate::env::Snapshot;
use crate::error::{Error, Result};
use crate::lookup::hash::{ClashLog, HashLookupTable};
use crate::lookup::uid::UidLookupTable;
use crate::lookup::used::UsedRecorder;

/// Payload stored inline behind a length.
pub(crate) const TAG_DIRECT: u8 = 0;
/// Payload behind a sequential id.
pub(crate) const TAG_UID: u8 = 1;
/// Payload behind a content digest.
pub(crate) const TAG_HASH: u8 = 2;

/// Routes byte strings through the storage tiers by observed length.
#[derive(Debug)]
pub(crate) struct LookupSerde {
    prefix: String,
    direct_threshold: usize,
    max_key_len: usize,
    len_width: UnsignedBytes,
    uid: UidLookupTable,
    hash: HashLookupTable,
}

impl LookupSerde {
    pub(crate) fn new(prefix: &str, lookups: &LookupConfig, cache_entries: usize) -> Self {
        Self {
            prefix: prefix.to_string(),
            direct_threshold: lookups.direct_threshold,
            max_key_len: lookups.max_key_len,
            len_width: lookups.len_width(),
            uid: UidLookupTable::new(prefix, lookups.uid_width(), cache_entries),
            hash: HashLookupTable::new(prefix, lookups.hash_width),
        }
    }

    pub(crate) fn push_table_names(&self, out: &mut Vec<String>) {
        self.uid.push_table_names(out);
        self.hash.push_table_names(out);
    }

    /// Upper bound on the encoded size of a payload of `len` bytes.
    pub(crate) fn encoded_upper(&self, len: usize) -> usize {
        1 + self.len_width.width() + len
    }

    /// Encodes `bytes` into `out`, interning through a lookup table when
    /// they are over the inline threshold.
    pub(crate) fn write(
        &self,
        txn: &WriteTransaction,
        clashes: &mut ClashLog,
        bytes: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<()> {
        if bytes.len() <= self.direct_threshold {
            out.push(TAG_DIRECT);
            self.len_width.put(out, bytes.len() as u64)?;
            out.extend_from_slice(bytes);
        } else if bytes.len() <= self.max_key_len {
            out.push(TAG_UID);
            self.uid.get_or_create(txn, bytes, out)?;
        } else {
            out.push(TAG_HASH);
            self.hash.get_or_create(txn, bytes, clashes, out)?;
        }
        Ok(())
    }

    /// Read-side encoding: appends what `write` would have produced, but
    /// never touches the lookup tables. `false` means the bytes were never
    /// interned, so no stored row can reference them.
    pub(crate) fn write_for_get(
        &self,
        snap: &Snapshot<'_>,
        bytes: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<bool> {
        if bytes.len() <= self.direct_threshold {
            out.push(TAG_DIRECT);
            self.len_width.put(out, bytes.len() as u64)?;
            out.extend_from_slice(bytes);
            Ok(true)
        } else if bytes.len() <= self.max_key_len {
            out.push(TAG_UID);
            if self.uid.probe(snap, bytes, out)? {
                Ok(true)
            } else {
                out.pop();
                Ok(false)
            }
        } else {
            out.push(TAG_HASH);
            if self.hash.probe(snap, bytes, out)? {
                Ok(true)
            } else {
                out.pop();
                Ok(false)
            }
        }
    }

    /// Decodes one encoded payload from `cur`, resolving references back to
    /// the original bytes.
    pub(crate) fn read(
        &self,
        snap: &Snapshot<'_>,
        cur: &mut Cursor<'_>,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        match cur.take_u8()? {
            TAG_DIRECT => {
                let len = self.len_width.get(cur.take(self.len_width.width())?)? as usize;
                out.extend_from_slice(cur.take(len)?);
            }
            TAG_UID => {
                let reference = cur.take(self.uid.ref_len())?;
                self.uid.resolve(snap, reference, out)?;
            }
            TAG_HASH => {
                let reference = cur.take(self.hash.ref_len())?;
                self.hash.resolve(snap, reference, out)?;
            }
            other => return Err(Error::corrupt(format!("unknown lookup tag {other:#04x}"))),
        }
        Ok(())
    }

    /// Recorder over both tables for rows whose lookup region sits between
    /// `skip_lead` and `skip_trail` fixed bytes.
    pub(crate) fn recorder(&self, skip_lead: usize, skip_trail: usize) -> UsedRecorder<'_> {
        UsedRecorder::new(
            Some(&self.uid),
            Some(&self.hash),
            format!("{}.used", self.prefix),
            true,
            skip_lead,
            skip_trail,
        )
    }

    pub(crate) fn lookup_rows(&self, snap: &Snapshot<'_>) -> Result<u64> {
        Ok(self.uid.row_count(snap)? + self.hash.row_count(snap)?)
    }
}

/// How record values are written into the row.
#[derive(Debug)]
pub(crate) enum ValueSerde {
    /// The tagged value encoding lands in the row as-is.
    Direct,
    /// The tagged value encoding is routed through the lookup tiers.
    Lookup(LookupSerde),
}

impl ValueSerde {
    pub(crate) fn new(mode: ValueMode, lookups: &LookupConfig, cache_entries: usize) -> Self {
        match mode {
            ValueMode::Direct => ValueSerde::Direct,
            ValueMode::Lookup => ValueSerde::Lookup(LookupSerde::new("value", lookups, cache_entries)),
        }
    }

    pub(crate) fn push_table_names(&self, out: &mut Vec<String>) {
        if let ValueSerde::Lookup(serde) = self {
            serde.push_table_names(out);
        }
    }

    pub(crate) fn uses_lookup(&self) -> bool {
        matches!(self, ValueSerde::Lookup(_))
    }

    /// Upper bound on the encoded size of `value`.
    pub(crate) fn encoded_upper(&self, value: &Value) -> usize {
        match self {
            ValueSerde::Direct => value.encoded_len(),
            ValueSerde::Lookup(serde) => serde.encoded_upper(value.encoded_len()),
        }
    }

    pub(crate) fn write(
        &self,
        txn: &WriteTransaction,
        clashes: &mut ClashLog,
        pool: &ByteBufferPool,
        value: &Value,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        match self {
            ValueSerde::Direct => value.write(out),
            ValueSerde::Lookup(serde) => pool.with(value.encoded_len(), |scratch| {
                value.write(scratch)?;
                serde.write(txn, clashes, scratch, out)
            }),
        }
    }

    pub(crate) fn read(
        &self,
        snap: &Snapshot<'_>,
        pool: &ByteBufferPool,
        cur: &mut Cursor<'_>,
    ) -> Result<Value> {
        match self {
            ValueSerde::Direct => Value::read(cur),
            ValueSerde::Lookup(serde) => pool.with(64, |scratch| {
                serde.read(snap, cur, scratch)?;
                Value::decode(scratch)
            }),
        }
    }

    /// Recorder for rows whose value region starts after `skip_lead` fixed
    /// bytes. `None` when values are stored inline.
    pub(crate) fn recorder(&self, skip_lead: usize) -> Option<UsedRecorder<'_>> {
        match self {
            ValueSerde::Direct => None,
            ValueSerde::Lookup(serde) => Some(serde.recorder(skip_lead, 0)),
        }
    }

    pub(crate) fn lookup_rows(&self, snap: &Snapshot<'_>) -> Result<u64> {
        match self {
            ValueSerde::Direct => Ok(0),
            ValueSerde::Lookup(serde) => serde.lookup_rows(snap),
        }
    }
}
