//! Minimum-width big-endian encoding of non-negative integers.
//!
//! A width is chosen once, from the largest value a field must ever hold,
//! and every value of that field is then encoded in exactly that many
//! bytes. Big-endian keeps unsigned lexicographic order equal to numeric
//! order, so the encodings are safe to embed in sorted keys.

use crate::error::{Error, Result};

/// A fixed encoding width between one and eight bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnsignedBytes {
    len: usize,
}

impl UnsignedBytes {
    /// The widest supported encoding.
    pub const MAX_LEN: usize = 8;

    /// Returns the codec for an explicit width.
    pub fn of_len(len: usize) -> Result<Self> {
        if len == 0 || len > Self::MAX_LEN {
            return Err(Error::InvalidArgument(format!(
                "unsigned width must be 1..={}, got {len}",
                Self::MAX_LEN
            )));
        }
        Ok(Self { len })
    }

    /// Returns the narrowest codec able to hold `max`.
    pub fn for_value(max: u64) -> Self {
        let bits = 64 - max.leading_zeros() as usize;
        Self { len: bits.div_ceil(8).max(1) }
    }

    /// Width of every encoding produced by this codec, in bytes.
    pub fn width(&self) -> usize {
        self.len
    }

    /// Largest value this width can represent.
    pub fn max_value(&self) -> u64 {
        if self.len == Self::MAX_LEN {
            u64::MAX
        } else {
            (1u64 << (self.len * 8)) - 1
        }
    }

    /// Appends the fixed-width encoding of `v`, rejecting overflow rather
    /// than truncating.
    pub fn put(&self, out: &mut Vec<u8>, v: u64) -> Result<()> {
        if v > self.max_value() {
            return Err(Error::CapacityExceeded {
                what: "unsigned value exceeds encoding width",
                limit: self.max_value(),
            });
        }
        out.extend_from_slice(&v.to_be_bytes()[Self::MAX_LEN - self.len..]);
        Ok(())
    }

    /// Reads one fixed-width value from the front of `src`.
    pub fn get(&self, src: &[u8]) -> Result<u64> {
        let head = src.get(..self.len).ok_or_else(|| {
            Error::corrupt(format!(
                "unsigned field truncated: need {} bytes, have {}",
                self.len,
                src.len()
            ))
        })?;
        let mut bytes = [0u8; Self::MAX_LEN];
        bytes[Self::MAX_LEN - self.len..].copy_from_slice(head);
        Ok(u64::from_be_bytes(bytes))
    }
}
