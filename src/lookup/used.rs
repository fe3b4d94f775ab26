//! Mark and sweep over the lookup tables.

use std::ops::Bound;

use redb::{ReadableTable, WriteTransaction};

use crate::env::{byte_table, Batch};
use crate::error::{Error, Result};
use crate::lookup::hash::HashLookupTable;
use crate::lookup::uid::UidLookupTable;
use crate::lookup::{TAG_DIRECT, TAG_HASH, TAG_UID};
use crate::store::Cancellation;

/// Outcome of a lookup-table sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Lookup rows examined.
    pub scanned: u64,
    /// Unreferenced rows removed.
    pub removed: u64,
}

impl SweepStats {
    pub(crate) fn absorb(&mut self, other: SweepStats) {
        self.scanned += other.scanned;
        self.removed += other.removed;
    }
}

/// Marks the lookup references that survive a retention pass, then removes
/// every lookup row nothing marked.
///
/// Marks land in a scratch table that lives for one maintenance run and is
/// dropped after the sweep. A leftover scratch table from an interrupted
/// run is cleared by [`UsedRecorder::reset`] before the next mark pass, so
/// stale marks never leak into a later sweep.
pub(crate) struct UsedRecorder<'a> {
    uid: Option<&'a UidLookupTable>,
    hash: Option<&'a HashLookupTable>,
    used_name: String,
    tagged: bool,
    skip_lead: usize,
    skip_trail: usize,
}

impl<'a> UsedRecorder<'a> {
    /// `skip_lead` and `skip_trail` cut the fixed regions off a row before
    /// the reference is inspected; `tagged` says the remaining slice starts
    /// with a tier tag rather than being a bare reference.
    pub(crate) fn new(
        uid: Option<&'a UidLookupTable>,
        hash: Option<&'a HashLookupTable>,
        used_name: String,
        tagged: bool,
        skip_lead: usize,
        skip_trail: usize,
    ) -> Self {
        Self {
            uid,
            hash,
            used_name,
            tagged,
            skip_lead,
            skip_trail,
        }
    }

    /// Drops any scratch marks left behind by an interrupted earlier run.
    pub(crate) fn reset(&self, txn: &WriteTransaction) -> Result<()> {
        txn.delete_table(byte_table(&self.used_name))?;
        Ok(())
    }

    /// Marks the lookup reference inside one row region as still in use.
    pub(crate) fn record(&self, txn: &WriteTransaction, region: &[u8]) -> Result<()> {
        let end = region
            .len()
            .checked_sub(self.skip_trail)
            .ok_or_else(|| Error::corrupt("row shorter than its fixed regions"))?;
        let slice = region
            .get(self.skip_lead..end)
            .ok_or_else(|| Error::corrupt("row shorter than its fixed regions"))?;
        if self.tagged {
            let (tag, reference) = slice
                .split_first()
                .ok_or_else(|| Error::corrupt("empty lookup region"))?;
            match *tag {
                TAG_DIRECT => Ok(()),
                TAG_UID => self.mark(txn, TAG_UID, reference, self.uid.map(UidLookupTable::ref_len)),
                TAG_HASH => {
                    self.mark(txn, TAG_HASH, reference, self.hash.map(HashLookupTable::ref_len))
                }
                other => Err(Error::corrupt(format!("unknown lookup tag {other:#04x}"))),
            }
        } else if self.uid.is_some() {
            self.mark(txn, TAG_UID, slice, self.uid.map(UidLookupTable::ref_len))
        } else {
            self.mark(txn, TAG_HASH, slice, self.hash.map(HashLookupTable::ref_len))
        }
    }

    fn mark(
        &self,
        txn: &WriteTransaction,
        tag: u8,
        reference: &[u8],
        expected_len: Option<usize>,
    ) -> Result<()> {
        let expected =
            expected_len.ok_or_else(|| Error::corrupt("reference to an unconfigured tier"))?;
        if reference.len() != expected {
            return Err(Error::corrupt(format!(
                "lookup reference is {} bytes, expected {expected}",
                reference.len()
            )));
        }
        let mut key = Vec::with_capacity(reference.len() + 1);
        key.push(tag);
        key.extend_from_slice(reference);
        let mut used = txn.open_table(byte_table(&self.used_name))?;
        used.insert(key.as_slice(), &b""[..])?;
        Ok(())
    }

    /// Removes every lookup row the mark pass did not touch, then drops the
    /// scratch table.
    pub(crate) fn sweep(
        &self,
        batch: &mut Batch<'_>,
        cancel: &Cancellation,
        cap: usize,
    ) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        if let Some(uid) = self.uid {
            let swept =
                self.sweep_table(batch, cancel, cap, TAG_UID, uid.rev_name(), Some(uid.fwd_name()))?;
            stats.absorb(swept);
            uid.purge_cache();
        }
        if let Some(hash) = self.hash {
            stats.absorb(self.sweep_table(batch, cancel, cap, TAG_HASH, hash.name(), None)?);
        }
        let txn = batch.txn()?;
        txn.delete_table(byte_table(&self.used_name))?;
        Ok(stats)
    }

    /// Batched walk of one lookup table, deleting unmarked rows. For uid
    /// tables the primary is the reverse table (keyed by reference) and the
    /// forward row is mirrored away alongside it.
    fn sweep_table(
        &self,
        batch: &mut Batch<'_>,
        cancel: &Cancellation,
        cap: usize,
        tag: u8,
        primary: &str,
        mirror: Option<&str>,
    ) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        let mut cursor: Option<Vec<u8>> = None;
        loop {
            let mut doomed: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
            let mut finished = true;
            {
                let txn = batch.txn()?;
                let table = txn.open_table(byte_table(primary))?;
                let used = txn.open_table(byte_table(&self.used_name))?;
                let range = match &cursor {
                    Some(last) => {
                        table.range::<&[u8]>((Bound::Excluded(last.as_slice()), Bound::Unbounded))?
                    }
                    None => table.range::<&[u8]>(..)?,
                };
                let mut last_seen: Option<Vec<u8>> = None;
                let mut processed = 0usize;
                for item in range {
                    cancel.check()?;
                    let (key, value) = item?;
                    stats.scanned += 1;
                    let mut probe = Vec::with_capacity(key.value().len() + 1);
                    probe.push(tag);
                    probe.extend_from_slice(key.value());
                    if used.get(probe.as_slice())?.is_none() {
                        doomed.push((key.value().to_vec(), value.value().to_vec()));
                    }
                    last_seen = Some(key.value().to_vec());
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
            let removed = doomed.len();
            if removed > 0 {
                let txn = batch.txn()?;
                {
                    let mut table = txn.open_table(byte_table(primary))?;
                    for (key, _) in &doomed {
                        table.remove(key.as_slice())?;
                    }
                }
                if let Some(mirror) = mirror {
                    let mut table = txn.open_table(byte_table(mirror))?;
                    for (_, value) in &doomed {
                        table.remove(value.as_slice())?;
                    }
                }
                stats.removed += removed as u64;
            }
            batch.note_ops(removed)?;
            if finished {
                break;
            }
        }
        Ok(stats)
    }
}
