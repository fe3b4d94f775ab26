//! Binary codecs: order-preserving primitives, minimum-width unsigned
//! integers, the tagged value form, and fixed-width trailing timestamps.

pub mod ord;
pub mod time;
pub mod unsigned;
pub mod value;

use crate::error::{Error, Result};

/// A bounds-checked cursor over persisted bytes. Overruns surface as
/// `CorruptRecord` rather than panics because the input comes off disk.
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.off.checked_add(n).ok_or_else(|| {
            Error::corrupt(format!("record offset overflow taking {n} bytes"))
        })?;
        if end > self.buf.len() {
            return Err(Error::corrupt(format!(
                "record truncated: need {n} bytes, {} remain",
                self.remaining()
            )));
        }
        let slice = &self.buf[self.off..end];
        self.off = end;
        Ok(slice)
    }

    pub(crate) fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.off)
    }

    /// Fails when decode left trailing bytes behind.
    pub(crate) fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::corrupt(format!(
                "{} trailing bytes after record",
                self.remaining()
            )));
        }
        Ok(())
    }
}
