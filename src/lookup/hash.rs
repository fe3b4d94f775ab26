//! Content-hash interning for oversized byte strings.

use redb::{ReadableTable, WriteTransaction};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use tracing::warn;
use xxhash_rust::xxh64::xxh64;

use crate::config::HashWidth;
use crate::env::{byte_table, Snapshot};
use crate::error::{Error, Result};

/// Digest function feeding the hash lookup table.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Hasher {
    /// xxHash64 with a zero seed.
    Xxh64,
    /// Constant digest, to force clash chains in tests.
    #[cfg(test)]
    Fixed(u64),
}

impl Hasher {
    fn digest(&self, bytes: &[u8]) -> u64 {
        match self {
            Hasher::Xxh64 => xxh64(bytes, 0),
            #[cfg(test)]
            Hasher::Fixed(digest) => *digest,
        }
    }
}

/// Per-writer tally of digest clashes, folded into the meta table when the
/// owning batch commits.
#[derive(Debug, Default)]
pub(crate) struct ClashLog {
    warned: FxHashSet<u64>,
    new_clashes: u64,
}

impl ClashLog {
    fn note(&mut self, digest: u64) {
        self.new_clashes += 1;
        if self.warned.insert(digest) {
            warn!(
                digest = %hex::encode(digest.to_be_bytes()),
                "hash clash, chaining a disambiguator"
            );
        }
    }

    pub(crate) fn take_new(&mut self) -> u64 {
        std::mem::take(&mut self.new_clashes)
    }
}

/// Interns byte strings keyed by their content digest.
///
/// A reference is the stored digest followed by a one-byte disambiguator.
/// Distinct values that share a digest chain through successive
/// disambiguators; the chain is capped at 256 entries per digest.
#[derive(Debug)]
pub(crate) struct HashLookupTable {
    name: String,
    width: HashWidth,
    hasher: Hasher,
}

impl HashLookupTable {
    pub(crate) fn new(prefix: &str, width: HashWidth) -> Self {
        Self {
            name: format!("{prefix}.hash"),
            width,
            hasher: Hasher::Xxh64,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_hasher(prefix: &str, width: HashWidth, hasher: Hasher) -> Self {
        Self {
            name: format!("{prefix}.hash"),
            width,
            hasher,
        }
    }

    /// Width of one reference in bytes: digest plus disambiguator.
    pub(crate) fn ref_len(&self) -> usize {
        self.width.width() + 1
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn push_table_names(&self, out: &mut Vec<String>) {
        out.push(self.name.clone());
    }

    /// Digest bytes for `bytes` with a zero disambiguator appended.
    fn reference(&self, bytes: &[u8]) -> (u64, SmallVec<[u8; 9]>) {
        let digest = self.hasher.digest(bytes);
        let mut reference = SmallVec::new();
        match self.width {
            HashWidth::Four => {
                let folded = ((digest >> 32) as u32) ^ (digest as u32);
                reference.extend_from_slice(&folded.to_be_bytes());
            }
            HashWidth::Eight => reference.extend_from_slice(&digest.to_be_bytes()),
        }
        reference.push(0);
        (digest, reference)
    }

    /// Appends the reference for `bytes` to `out`, interning them first if
    /// no chain entry holds them yet.
    pub(crate) fn get_or_create(
        &self,
        txn: &WriteTransaction,
        bytes: &[u8],
        clashes: &mut ClashLog,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let (digest, mut reference) = self.reference(bytes);
        let last = reference.len() - 1;
        let mut table = txn.open_table(byte_table(&self.name))?;
        for seq in 0..=u8::MAX {
            reference[last] = seq;
            let matched = table
                .get(reference.as_slice())?
                .map(|guard| guard.value() == bytes);
            match matched {
                Some(true) => {
                    out.extend_from_slice(&reference);
                    return Ok(());
                }
                Some(false) => continue,
                None => {
                    table.insert(reference.as_slice(), bytes)?;
                    if seq > 0 {
                        clashes.note(digest);
                    }
                    out.extend_from_slice(&reference);
                    return Ok(());
                }
            }
        }
        Err(Error::CapacityExceeded {
            what: "hash clash chain",
            limit: u64::from(u8::MAX) + 1,
        })
    }

    /// Appends the existing reference for `bytes`, or reports that the bytes
    /// were never interned. Never writes.
    pub(crate) fn probe(
        &self,
        snap: &Snapshot<'_>,
        bytes: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<bool> {
        let (_, mut reference) = self.reference(bytes);
        let last = reference.len() - 1;
        for seq in 0..=u8::MAX {
            reference[last] = seq;
            match snap.get(&self.name, reference.as_slice())? {
                Some(existing) if existing == bytes => {
                    out.extend_from_slice(&reference);
                    return Ok(true);
                }
                Some(_) => continue,
                None => return Ok(false),
            }
        }
        Ok(false)
    }

    /// Appends the value bytes behind a reference.
    pub(crate) fn resolve(
        &self,
        snap: &Snapshot<'_>,
        reference: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<()> {
        match snap.get(&self.name, reference)? {
            Some(bytes) => {
                out.extend_from_slice(&bytes);
                Ok(())
            }
            None => Err(Error::corrupt("dangling hash reference")),
        }
    }

    /// Interned entries.
    pub(crate) fn row_count(&self, snap: &Snapshot<'_>) -> Result<u64> {
        snap.table_len(&self.name)
    }
}
