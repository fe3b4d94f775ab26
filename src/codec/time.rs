//! Fixed-width trailing timestamps for composite keys.
//!
//! The time region sits at the end of every temporal key, so its width must
//! be constant for a given store: readers slice it off by length alone.
//! Precision is a format parameter chosen at store creation.

use serde::{Deserialize, Serialize};

use crate::codec::ord;
use crate::codec::value::Timestamp;
use crate::error::{Error, Result};

/// Precision, and therefore width, of the trailing time region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimePrecision {
    /// Eight bytes, sign-biased epoch milliseconds. The default.
    Millisecond,
    /// Four bytes, unsigned epoch seconds. Halves the time region at the
    /// cost of range: only 1970-01-01 through 2106-02-07 is encodable.
    Second,
}

/// Encoder/decoder for one store's trailing time region.
#[derive(Clone, Copy, Debug)]
pub struct TimeCodec {
    precision: TimePrecision,
}

impl TimeCodec {
    /// Builds the codec for the given precision.
    pub fn new(precision: TimePrecision) -> Self {
        Self { precision }
    }

    /// The configured precision.
    pub fn precision(&self) -> TimePrecision {
        self.precision
    }

    /// Width of the time region in bytes.
    pub fn width(&self) -> usize {
        match self.precision {
            TimePrecision::Millisecond => 8,
            TimePrecision::Second => 4,
        }
    }

    /// Appends the fixed-width encoding of `ts`. Second precision truncates
    /// toward negative infinity and rejects instants outside its range.
    pub fn encode(&self, ts: Timestamp, out: &mut Vec<u8>) -> Result<()> {
        match self.precision {
            TimePrecision::Millisecond => {
                out.extend_from_slice(&ord::encode_i64(ts.millis()));
            }
            TimePrecision::Second => {
                let secs = ts.millis().div_euclid(1000);
                let secs = u32::try_from(secs).map_err(|_| {
                    Error::InvalidArgument(format!(
                        "instant {ts} is outside the second-precision range"
                    ))
                })?;
                out.extend_from_slice(&secs.to_be_bytes());
            }
        }
        Ok(())
    }

    /// Decodes a time region that must be exactly [`TimeCodec::width`] long.
    pub fn decode(&self, src: &[u8]) -> Result<Timestamp> {
        if src.len() != self.width() {
            return Err(Error::corrupt(format!(
                "time region is {} bytes, expected {}",
                src.len(),
                self.width()
            )));
        }
        match self.precision {
            TimePrecision::Millisecond => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(src);
                Ok(Timestamp::from_millis(ord::decode_i64(bytes)))
            }
            TimePrecision::Second => {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(src);
                let secs = u32::from_be_bytes(bytes);
                Ok(Timestamp::from_millis(i64::from(secs) * 1000))
            }
        }
    }

    /// Appends the byte-minimal time region, for scan lower bounds.
    pub fn pad_min(&self, out: &mut Vec<u8>) {
        out.extend(std::iter::repeat(0x00).take(self.width()));
    }

    /// Appends the byte-maximal time region, for inclusive scan upper bounds.
    pub fn pad_max(&self, out: &mut Vec<u8>) {
        out.extend(std::iter::repeat(0xff).take(self.width()));
    }
}
