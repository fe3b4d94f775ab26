//! The typed value union and its canonical tagged binary form.
//!
//! Every value is encoded as a one-byte type tag followed by the type's
//! payload. Fixed-width numeric payloads use the order-preserving encoders
//! from [`crate::codec::ord`], so two encodings of the same type compare
//! (bytewise, unsigned) exactly as the values compare. Decoding consumes
//! precisely the bytes that encoding produced; anything else is corruption.

use std::fmt;

use crate::codec::{ord, Cursor};
use crate::error::{Error, Result};

pub(crate) const TAG_NULL: u8 = 0;
pub(crate) const TAG_BOOL: u8 = 1;
pub(crate) const TAG_SHORT: u8 = 2;
pub(crate) const TAG_INT: u8 = 3;
pub(crate) const TAG_LONG: u8 = 4;
pub(crate) const TAG_FLOAT: u8 = 5;
pub(crate) const TAG_DOUBLE: u8 = 6;
pub(crate) const TAG_STRING: u8 = 7;
pub(crate) const TAG_INSTANT: u8 = 8;

/// An instant in time, stored as milliseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The earliest representable instant.
    pub const MIN: Timestamp = Timestamp(i64::MIN);
    /// The latest representable instant.
    pub const MAX: Timestamp = Timestamp(i64::MAX);

    /// Builds a timestamp from epoch milliseconds.
    pub fn from_millis(millis: i64) -> Self {
        Timestamp(millis)
    }

    /// The current wall-clock instant, saturating at the representable
    /// bounds.
    pub fn now() -> Self {
        let millis = match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            Ok(since) => i64::try_from(since.as_millis()).unwrap_or(i64::MAX),
            Err(before) => i64::try_from(before.duration().as_millis())
                .map(i64::wrapping_neg)
                .unwrap_or(i64::MIN),
        };
        Timestamp(millis)
    }

    /// Milliseconds since the Unix epoch.
    pub fn millis(&self) -> i64 {
        self.0
    }

    /// This instant shifted forward by `delta` milliseconds, saturating at
    /// the representable bounds.
    pub fn saturating_add_millis(&self, delta: i64) -> Self {
        Timestamp(self.0.saturating_add(delta))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match time::OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.0) * 1_000_000) {
            Ok(odt) => match odt.format(&time::format_description::well_known::Rfc3339) {
                Ok(s) => f.write_str(&s),
                Err(_) => write!(f, "{}ms", self.0),
            },
            Err(_) => write!(f, "{}ms", self.0),
        }
    }
}

/// A scalar value as stored in keys and records.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// The absent value; a tag with no payload.
    Null,
    /// A boolean, one payload byte.
    Bool(bool),
    /// A 16-bit signed integer.
    Short(i16),
    /// A 32-bit signed integer.
    Int(i32),
    /// A 64-bit signed integer.
    Long(i64),
    /// A 32-bit float, total-ordered on disk.
    Float(f32),
    /// A 64-bit float, total-ordered on disk.
    Double(f64),
    /// UTF-8 text, length-prefixed.
    String(String),
    /// An instant, stored at millisecond precision.
    Instant(Timestamp),
}

impl Value {
    /// The on-disk type tag for this value.
    pub fn type_tag(&self) -> u8 {
        match self {
            Value::Null => TAG_NULL,
            Value::Bool(_) => TAG_BOOL,
            Value::Short(_) => TAG_SHORT,
            Value::Int(_) => TAG_INT,
            Value::Long(_) => TAG_LONG,
            Value::Float(_) => TAG_FLOAT,
            Value::Double(_) => TAG_DOUBLE,
            Value::String(_) => TAG_STRING,
            Value::Instant(_) => TAG_INSTANT,
        }
    }

    /// Human-readable type name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Short(_) => "short",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Instant(_) => "instant",
        }
    }

    /// Exact number of bytes [`Value::write`] will append.
    pub fn encoded_len(&self) -> usize {
        match self {
            Value::Null => 1,
            Value::Bool(_) => 2,
            Value::Short(_) => 3,
            Value::Int(_) | Value::Float(_) => 5,
            Value::Long(_) | Value::Double(_) | Value::Instant(_) => 9,
            Value::String(s) => 1 + 4 + s.len(),
        }
    }

    /// Appends the tagged encoding of this value.
    pub fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        out.push(self.type_tag());
        match self {
            Value::Null => {}
            Value::Bool(b) => out.push(u8::from(*b)),
            Value::Short(v) => out.extend_from_slice(&ord::encode_i16(*v)),
            Value::Int(v) => out.extend_from_slice(&ord::encode_i32(*v)),
            Value::Long(v) => out.extend_from_slice(&ord::encode_i64(*v)),
            Value::Float(v) => out.extend_from_slice(&ord::encode_f32(*v)),
            Value::Double(v) => out.extend_from_slice(&ord::encode_f64(*v)),
            Value::String(s) => {
                if s.len() > u32::MAX as usize {
                    return Err(Error::InvalidArgument(format!(
                        "string value of {} bytes exceeds the length prefix",
                        s.len()
                    )));
                }
                out.extend_from_slice(&(s.len() as u32).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::Instant(ts) => out.extend_from_slice(&ord::encode_i64(ts.millis())),
        }
        Ok(())
    }

    /// Decodes one value, advancing the cursor past it.
    pub(crate) fn read(cur: &mut Cursor<'_>) -> Result<Value> {
        let tag = cur.take_u8()?;
        match tag {
            TAG_NULL => Ok(Value::Null),
            TAG_BOOL => match cur.take_u8()? {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                other => Err(Error::corrupt(format!("bool payload byte {other:#04x}"))),
            },
            TAG_SHORT => Ok(Value::Short(ord::decode_i16(cur.take_array()?))),
            TAG_INT => Ok(Value::Int(ord::decode_i32(cur.take_array()?))),
            TAG_LONG => Ok(Value::Long(ord::decode_i64(cur.take_array()?))),
            TAG_FLOAT => Ok(Value::Float(ord::decode_f32(cur.take_array()?))),
            TAG_DOUBLE => Ok(Value::Double(ord::decode_f64(cur.take_array()?))),
            TAG_STRING => {
                let len = u32::from_be_bytes(cur.take_array()?) as usize;
                let body = cur.take(len)?;
                let s = std::str::from_utf8(body)
                    .map_err(|_| Error::corrupt("string payload is not valid UTF-8"))?;
                Ok(Value::String(s.to_owned()))
            }
            TAG_INSTANT => Ok(Value::Instant(Timestamp::from_millis(ord::decode_i64(
                cur.take_array()?,
            )))),
            other => Err(Error::corrupt(format!("unknown value tag {other:#04x}"))),
        }
    }

    /// Decodes a value that must occupy the whole slice.
    pub fn decode(bytes: &[u8]) -> Result<Value> {
        let mut cur = Cursor::new(bytes);
        let value = Value::read(&mut cur)?;
        cur.finish()?;
        Ok(value)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Short(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Timestamp> for Value {
    fn from(v: Timestamp) -> Self {
        Value::Instant(v)
    }
}
