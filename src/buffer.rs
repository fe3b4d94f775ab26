//! Reusable byte buffers for encode/decode scratch space.
//!
//! Key assembly and value encoding need short-lived buffers on every call.
//! The pool keeps one free list per capacity class so hot paths stop
//! allocating; borrows are scoped and the buffer always comes back, whatever
//! path the caller exits through.

use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

// Capacity classes grow in powers of ten. Requests beyond the largest class
// are served with a plain allocation that is never retained.
const CLASS_CAPACITIES: [usize; 6] = [64, 640, 6_400, 64_000, 640_000, 6_400_000];

const DEFAULT_MAX_PER_CLASS: usize = 50;

/// Pool of reusable `Vec<u8>` scratch buffers, grouped by capacity class.
#[derive(Debug)]
pub struct ByteBufferPool {
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
    max_per_class: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    discarded: AtomicU64,
}

impl Default for ByteBufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PER_CLASS)
    }
}

impl ByteBufferPool {
    /// Creates a pool retaining at most `max_per_class` idle buffers per
    /// capacity class.
    pub fn new(max_per_class: usize) -> Self {
        Self {
            classes: CLASS_CAPACITIES.iter().map(|_| Mutex::new(Vec::new())).collect(),
            max_per_class,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Borrows a cleared buffer with at least `min_capacity` bytes of
    /// capacity. The buffer returns to the pool when the guard drops.
    pub fn acquire(&self, min_capacity: usize) -> PooledBuf<'_> {
        let class = class_for(min_capacity);
        let buf = match class {
            Some(idx) => match self.classes[idx].lock().pop() {
                Some(mut buf) => {
                    buf.clear();
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    buf
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    Vec::with_capacity(CLASS_CAPACITIES[idx])
                }
            },
            // Oversized request: allocate exactly, never retain.
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(min_capacity)
            }
        };
        PooledBuf { pool: self, class, buf }
    }

    /// Runs `f` with a borrowed scratch buffer, returning the buffer to the
    /// pool on every exit path.
    pub fn with<R>(
        &self,
        min_capacity: usize,
        f: impl FnOnce(&mut Vec<u8>) -> crate::Result<R>,
    ) -> crate::Result<R> {
        let mut buf = self.acquire(min_capacity);
        f(&mut buf)
    }

    /// Counters since the pool was created: (hits, misses, discarded).
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.discarded.load(Ordering::Relaxed),
        )
    }

    fn release(&self, class: Option<usize>, buf: Vec<u8>) {
        if let Some(idx) = class {
            let mut free = self.classes[idx].lock();
            if free.len() < self.max_per_class {
                free.push(buf);
                return;
            }
        }
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }
}

fn class_for(min_capacity: usize) -> Option<usize> {
    CLASS_CAPACITIES.iter().position(|&cap| cap >= min_capacity)
}

/// Scoped borrow of a pool buffer. Contents are invalid after the guard
/// drops; callers must copy anything they need to keep.
pub struct PooledBuf<'a> {
    pool: &'a ByteBufferPool,
    class: Option<usize>,
    buf: Vec<u8>,
}

impl Deref for PooledBuf<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        self.pool.release(self.class, mem::take(&mut self.buf));
    }
}
