//! Key prefix encoding and the composite row keys built from it: the
//! prefix-plus-time temporal key and the prefix-plus-span session key.

use redb::WriteTransaction;

use crate::buffer::ByteBufferPool;
use crate::codec::ord;
use crate::codec::time::{TimeCodec, TimePrecision};
use crate::codec::value::{Timestamp, Value};
use crate::codec::Cursor;
use crate::config::{KeyKind, LookupConfig};
use crate::env::Snapshot;
use crate::error::{Error, Result};
use crate::lookup::hash::{ClashLog, HashLookupTable};
use crate::lookup::uid::UidLookupTable;
use crate::lookup::used::UsedRecorder;
use crate::lookup::LookupSerde;

fn utf8_value(bytes: &[u8]) -> Result<Value> {
    match std::str::from_utf8(bytes) {
        Ok(s) => Ok(Value::String(s.to_string())),
        Err(_) => Err(Error::corrupt("key bytes are not valid UTF-8")),
    }
}

/// Encodes the non-temporal part of a row key.
///
/// Scalar kinds write their order-preserving fixed-width form inline. The
/// string-backed kinds either store the bytes raw or route them through a
/// lookup table, depending on the configured strategy.
#[derive(Debug)]
pub(crate) enum KeySerde {
    Bool,
    Short,
    Int,
    Long,
    Float,
    Double,
    String { max_len: usize },
    Uid(UidLookupTable),
    Hash(HashLookupTable),
    Auto(LookupSerde),
}

impl KeySerde {
    pub(crate) fn new(kind: KeyKind, lookups: &LookupConfig, cache_entries: usize) -> Self {
        match kind {
            KeyKind::Bool => KeySerde::Bool,
            KeyKind::Short => KeySerde::Short,
            KeyKind::Int => KeySerde::Int,
            KeyKind::Long => KeySerde::Long,
            KeyKind::Float => KeySerde::Float,
            KeyKind::Double => KeySerde::Double,
            KeyKind::String => KeySerde::String {
                max_len: lookups.max_key_len,
            },
            KeyKind::Uid => KeySerde::Uid(UidLookupTable::new(
                "key",
                lookups.uid_width(),
                cache_entries,
            )),
            KeyKind::Hash => KeySerde::Hash(HashLookupTable::new("key", lookups.hash_width)),
            KeyKind::Auto => KeySerde::Auto(LookupSerde::new("key", lookups, cache_entries)),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            KeySerde::Bool => "bool",
            KeySerde::Short => "short",
            KeySerde::Int => "int",
            KeySerde::Long => "long",
            KeySerde::Float => "float",
            KeySerde::Double => "double",
            KeySerde::String { .. } => "string",
            KeySerde::Uid(_) => "uid",
            KeySerde::Hash(_) => "hash",
            KeySerde::Auto(_) => "auto",
        }
    }

    fn mismatch(&self, got: &Value) -> Error {
        Error::InvalidArgument(format!(
            "key kind {} cannot take a {} value",
            self.kind_name(),
            got.type_name()
        ))
    }

    /// String payload for the string-backed kinds. Zero-length keys are
    /// reserved.
    fn string_bytes<'v>(&self, key: &'v Value) -> Result<&'v [u8]> {
        match key {
            Value::String(s) if s.is_empty() => Err(Error::InvalidArgument(
                "string keys must not be empty".into(),
            )),
            Value::String(s) => Ok(s.as_bytes()),
            other => Err(self.mismatch(other)),
        }
    }

    /// Raw string prefixes share the row with the trailing time region, so
    /// they must be bounded for the split to be unambiguous.
    fn check_raw_len(&self, bytes: &[u8], max_len: usize) -> Result<()> {
        if bytes.len() > max_len {
            return Err(Error::InvalidArgument(format!(
                "string key of {} bytes exceeds the {max_len} byte limit",
                bytes.len()
            )));
        }
        Ok(())
    }

    pub(crate) fn push_table_names(&self, out: &mut Vec<String>) {
        match self {
            KeySerde::Uid(table) => table.push_table_names(out),
            KeySerde::Hash(table) => table.push_table_names(out),
            KeySerde::Auto(serde) => serde.push_table_names(out),
            _ => {}
        }
    }

    pub(crate) fn uses_lookup(&self) -> bool {
        matches!(self, KeySerde::Uid(_) | KeySerde::Hash(_) | KeySerde::Auto(_))
    }

    /// Upper bound on the encoded prefix size for `key`.
    pub(crate) fn encoded_upper(&self, key: &Value) -> usize {
        match self {
            KeySerde::Bool => 1,
            KeySerde::Short => 2,
            KeySerde::Int | KeySerde::Float => 4,
            KeySerde::Long | KeySerde::Double => 8,
            KeySerde::String { .. } => key.encoded_len(),
            KeySerde::Uid(table) => table.ref_len(),
            KeySerde::Hash(table) => table.ref_len(),
            KeySerde::Auto(serde) => match key {
                Value::String(s) => serde.encoded_upper(s.len()),
                other => other.encoded_len(),
            },
        }
    }

    /// Encodes the prefix for `key` into `out`, interning where the kind
    /// calls for it.
    pub(crate) fn write_prefix(
        &self,
        txn: &WriteTransaction,
        clashes: &mut ClashLog,
        key: &Value,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        match (self, key) {
            (KeySerde::Bool, Value::Bool(v)) => out.push(u8::from(*v)),
            (KeySerde::Short, Value::Short(v)) => out.extend_from_slice(&ord::encode_i16(*v)),
            (KeySerde::Int, Value::Int(v)) => out.extend_from_slice(&ord::encode_i32(*v)),
            (KeySerde::Long, Value::Long(v)) => out.extend_from_slice(&ord::encode_i64(*v)),
            (KeySerde::Float, Value::Float(v)) => out.extend_from_slice(&ord::encode_f32(*v)),
            (KeySerde::Double, Value::Double(v)) => out.extend_from_slice(&ord::encode_f64(*v)),
            (KeySerde::String { max_len }, _) => {
                let bytes = self.string_bytes(key)?;
                self.check_raw_len(bytes, *max_len)?;
                out.extend_from_slice(bytes);
            }
            (KeySerde::Uid(table), _) => table.get_or_create(txn, self.string_bytes(key)?, out)?,
            (KeySerde::Hash(table), _) => {
                table.get_or_create(txn, self.string_bytes(key)?, clashes, out)?
            }
            (KeySerde::Auto(serde), _) => serde.write(txn, clashes, self.string_bytes(key)?, out)?,
            (_, other) => return Err(self.mismatch(other)),
        }
        Ok(())
    }

    /// Read-side prefix encoding. Never writes; `false` means the key was
    /// never interned and therefore has no rows.
    pub(crate) fn prefix_for_get(
        &self,
        snap: &Snapshot<'_>,
        key: &Value,
        out: &mut Vec<u8>,
    ) -> Result<bool> {
        match (self, key) {
            (KeySerde::Bool, Value::Bool(v)) => out.push(u8::from(*v)),
            (KeySerde::Short, Value::Short(v)) => out.extend_from_slice(&ord::encode_i16(*v)),
            (KeySerde::Int, Value::Int(v)) => out.extend_from_slice(&ord::encode_i32(*v)),
            (KeySerde::Long, Value::Long(v)) => out.extend_from_slice(&ord::encode_i64(*v)),
            (KeySerde::Float, Value::Float(v)) => out.extend_from_slice(&ord::encode_f32(*v)),
            (KeySerde::Double, Value::Double(v)) => out.extend_from_slice(&ord::encode_f64(*v)),
            (KeySerde::String { max_len }, _) => {
                let bytes = self.string_bytes(key)?;
                self.check_raw_len(bytes, *max_len)?;
                out.extend_from_slice(bytes);
            }
            (KeySerde::Uid(table), _) => return table.probe(snap, self.string_bytes(key)?, out),
            (KeySerde::Hash(table), _) => return table.probe(snap, self.string_bytes(key)?, out),
            (KeySerde::Auto(serde), _) => {
                return serde.write_for_get(snap, self.string_bytes(key)?, out)
            }
            (_, other) => return Err(self.mismatch(other)),
        }
        Ok(true)
    }

    /// Decodes a stored prefix back into the key value.
    pub(crate) fn read_prefix(
        &self,
        snap: &Snapshot<'_>,
        pool: &ByteBufferPool,
        prefix: &[u8],
    ) -> Result<Value> {
        match self {
            KeySerde::Bool => match prefix {
                [0] => Ok(Value::Bool(false)),
                [1] => Ok(Value::Bool(true)),
                _ => Err(Error::corrupt("bool key prefix is not a single 0/1 byte")),
            },
            KeySerde::Short => Ok(Value::Short(ord::decode_i16(fixed_prefix(prefix)?))),
            KeySerde::Int => Ok(Value::Int(ord::decode_i32(fixed_prefix(prefix)?))),
            KeySerde::Long => Ok(Value::Long(ord::decode_i64(fixed_prefix(prefix)?))),
            KeySerde::Float => Ok(Value::Float(ord::decode_f32(fixed_prefix(prefix)?))),
            KeySerde::Double => Ok(Value::Double(ord::decode_f64(fixed_prefix(prefix)?))),
            KeySerde::String { .. } => utf8_value(prefix),
            KeySerde::Uid(table) => pool.with(64, |scratch| {
                table.resolve(snap, prefix, scratch)?;
                utf8_value(scratch)
            }),
            KeySerde::Hash(table) => pool.with(64, |scratch| {
                table.resolve(snap, prefix, scratch)?;
                utf8_value(scratch)
            }),
            KeySerde::Auto(serde) => pool.with(64, |scratch| {
                let mut cur = Cursor::new(prefix);
                serde.read(snap, &mut cur, scratch)?;
                cur.finish()?;
                utf8_value(scratch)
            }),
        }
    }

    /// Recorder for key-side lookups; `None` when the kind stores inline.
    pub(crate) fn recorder(&self, skip_trail: usize) -> Option<UsedRecorder<'_>> {
        match self {
            KeySerde::Uid(table) => Some(UsedRecorder::new(
                Some(table),
                None,
                "key.used".to_string(),
                false,
                0,
                skip_trail,
            )),
            KeySerde::Hash(table) => Some(UsedRecorder::new(
                None,
                Some(table),
                "key.used".to_string(),
                false,
                0,
                skip_trail,
            )),
            KeySerde::Auto(serde) => Some(serde.recorder(0, skip_trail)),
            _ => None,
        }
    }

    pub(crate) fn lookup_rows(&self, snap: &Snapshot<'_>) -> Result<u64> {
        match self {
            KeySerde::Uid(table) => table.row_count(snap),
            KeySerde::Hash(table) => table.row_count(snap),
            KeySerde::Auto(serde) => serde.lookup_rows(snap),
            _ => Ok(0),
        }
    }
}

fn fixed_prefix<const N: usize>(prefix: &[u8]) -> Result<[u8; N]> {
    prefix
        .try_into()
        .map_err(|_| Error::corrupt(format!("key prefix is not {N} bytes")))
}

/// Full temporal row key: encoded prefix followed by the fixed-width
/// effective time.
#[derive(Debug)]
pub(crate) struct TemporalKeyCodec {
    serde: KeySerde,
    time: TimeCodec,
}

impl TemporalKeyCodec {
    pub(crate) fn new(
        kind: KeyKind,
        precision: TimePrecision,
        lookups: &LookupConfig,
        cache_entries: usize,
    ) -> Self {
        Self {
            serde: KeySerde::new(kind, lookups, cache_entries),
            time: TimeCodec::new(precision),
        }
    }

    pub(crate) fn time_width(&self) -> usize {
        self.time.width()
    }

    pub(crate) fn push_table_names(&self, out: &mut Vec<String>) {
        self.serde.push_table_names(out);
    }

    pub(crate) fn uses_lookup(&self) -> bool {
        self.serde.uses_lookup()
    }

    pub(crate) fn encoded_upper(&self, key: &Value) -> usize {
        self.serde.encoded_upper(key) + self.time.width()
    }

    pub(crate) fn write(
        &self,
        txn: &WriteTransaction,
        clashes: &mut ClashLog,
        key: &Value,
        effective: Timestamp,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        self.serde.write_prefix(txn, clashes, key, out)?;
        self.time.encode(effective, out)
    }

    /// Read-side key encoding for a point lookup at `at`.
    pub(crate) fn write_for_get(
        &self,
        snap: &Snapshot<'_>,
        key: &Value,
        at: Timestamp,
        out: &mut Vec<u8>,
    ) -> Result<bool> {
        if !self.serde.prefix_for_get(snap, key, out)? {
            return Ok(false);
        }
        self.time.encode(at, out)?;
        Ok(true)
    }

    pub(crate) fn prefix_for_get(
        &self,
        snap: &Snapshot<'_>,
        key: &Value,
        out: &mut Vec<u8>,
    ) -> Result<bool> {
        self.serde.prefix_for_get(snap, key, out)
    }

    /// Decodes a stored row key into the key value and its effective time.
    pub(crate) fn read(
        &self,
        snap: &Snapshot<'_>,
        pool: &ByteBufferPool,
        bytes: &[u8],
    ) -> Result<(Value, Timestamp)> {
        let split = bytes
            .len()
            .checked_sub(self.time.width())
            .ok_or_else(|| Error::corrupt("row key shorter than its time region"))?;
        let key = self.serde.read_prefix(snap, pool, &bytes[..split])?;
        let effective = self.time.decode(&bytes[split..])?;
        Ok((key, effective))
    }

    /// Effective time alone, without resolving the prefix.
    pub(crate) fn read_time(&self, bytes: &[u8]) -> Result<Timestamp> {
        let split = bytes
            .len()
            .checked_sub(self.time.width())
            .ok_or_else(|| Error::corrupt("row key shorter than its time region"))?;
        self.time.decode(&bytes[split..])
    }

    pub(crate) fn recorder(&self) -> Option<UsedRecorder<'_>> {
        self.serde.recorder(self.time.width())
    }

    pub(crate) fn pad_min(&self, out: &mut Vec<u8>) {
        self.time.pad_min(out);
    }

    pub(crate) fn pad_max(&self, out: &mut Vec<u8>) {
        self.time.pad_max(out);
    }

    pub(crate) fn lookup_rows(&self, snap: &Snapshot<'_>) -> Result<u64> {
        self.serde.lookup_rows(snap)
    }
}

/// Full session row key: encoded prefix followed by the fixed-width start
/// and end times.
pub(crate) struct SessionKeyCodec {
    serde: KeySerde,
    time: TimeCodec,
}

impl SessionKeyCodec {
    pub(crate) fn new(
        kind: KeyKind,
        precision: TimePrecision,
        lookups: &LookupConfig,
        cache_entries: usize,
    ) -> Self {
        Self {
            serde: KeySerde::new(kind, lookups, cache_entries),
            time: TimeCodec::new(precision),
        }
    }

    pub(crate) fn time_width(&self) -> usize {
        self.time.width()
    }

    pub(crate) fn push_table_names(&self, out: &mut Vec<String>) {
        self.serde.push_table_names(out);
    }

    pub(crate) fn uses_lookup(&self) -> bool {
        self.serde.uses_lookup()
    }

    pub(crate) fn encoded_upper(&self, key: &Value) -> usize {
        self.serde.encoded_upper(key) + 2 * self.time.width()
    }

    pub(crate) fn write(
        &self,
        txn: &WriteTransaction,
        clashes: &mut ClashLog,
        key: &Value,
        start: Timestamp,
        end: Timestamp,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        self.serde.write_prefix(txn, clashes, key, out)?;
        self.time.encode(start, out)?;
        self.time.encode(end, out)
    }

    pub(crate) fn prefix_for_get(
        &self,
        snap: &Snapshot<'_>,
        key: &Value,
        out: &mut Vec<u8>,
    ) -> Result<bool> {
        self.serde.prefix_for_get(snap, key, out)
    }

    /// Splits a stored row key into its prefix region and the span region.
    pub(crate) fn split(&self, bytes: &[u8]) -> Result<usize> {
        bytes
            .len()
            .checked_sub(2 * self.time.width())
            .ok_or_else(|| Error::corrupt("session key shorter than its span region"))
    }

    /// Start and end times alone, without resolving the prefix.
    pub(crate) fn span(&self, bytes: &[u8]) -> Result<(Timestamp, Timestamp)> {
        let split = self.split(bytes)?;
        let width = self.time.width();
        let start = self.time.decode(&bytes[split..split + width])?;
        let end = self.time.decode(&bytes[split + width..])?;
        Ok((start, end))
    }

    /// Decodes a stored row key into the key value and its span.
    pub(crate) fn read(
        &self,
        snap: &Snapshot<'_>,
        pool: &ByteBufferPool,
        bytes: &[u8],
    ) -> Result<(Value, Timestamp, Timestamp)> {
        let split = self.split(bytes)?;
        let key = self.serde.read_prefix(snap, pool, &bytes[..split])?;
        let (start, end) = self.span(bytes)?;
        Ok((key, start, end))
    }

    /// Decodes a bare prefix region back into the key value.
    pub(crate) fn read_prefix(
        &self,
        snap: &Snapshot<'_>,
        pool: &ByteBufferPool,
        prefix: &[u8],
    ) -> Result<Value> {
        self.serde.read_prefix(snap, pool, prefix)
    }

    pub(crate) fn recorder(&self) -> Option<UsedRecorder<'_>> {
        self.serde.recorder(2 * self.time.width())
    }

    pub(crate) fn pad_min(&self, out: &mut Vec<u8>) {
        self.time.pad_min(out);
    }

    pub(crate) fn pad_max(&self, out: &mut Vec<u8>) {
        self.time.pad_max(out);
    }

    pub(crate) fn encode_time(&self, at: Timestamp, out: &mut Vec<u8>) -> Result<()> {
        self.time.encode(at, out)
    }

    pub(crate) fn lookup_rows(&self, snap: &Snapshot<'_>) -> Result<u64> {
        self.serde.lookup_rows(snap)
    }
}
