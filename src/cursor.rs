//! The current position.
//!
//! Dequeuers agree on where the minimum lives through a single 64-bit word: the upper half holds
//! a bucket index, the lower half a stamp that is unique per update. Comparing whole words lets a
//! thread detect that another thread moved the cursor, even back to the same index, since it
//! last looked.

use std::cell::Cell;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::{Acquire, SeqCst};

use crossbeam_utils::CachePadded;

/// A packed `(index, stamp)` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Position(u64);

impl Position {
    #[inline]
    pub(crate) fn new(index: u32, stamp: u32) -> Self {
        Position((u64::from(index) << 32) | u64::from(stamp))
    }

    #[inline]
    pub(crate) fn index(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[cfg(test)]
    pub(crate) fn stamp(self) -> u32 {
        self.0 as u32
    }
}

/// Generates stamps that are unique across threads.
///
/// A stamp is the Cantor pairing of the thread id with a per-thread sequence number, so two
/// threads never need to see each other's counters to avoid collisions. The pairing is cheap to
/// compute and never inverted.
#[derive(Debug)]
pub(crate) struct Stamps {
    lid: u64,
    seq: Cell<u64>,
}

impl Stamps {
    pub(crate) fn new(lid: u32) -> Self {
        Stamps {
            lid: u64::from(lid),
            seq: Cell::new(0),
        }
    }

    pub(crate) fn next(&self) -> u32 {
        let k1 = self.lid;
        let k2 = self.seq.get();
        self.seq.set(k2.wrapping_add(1));
        let sum = k1.wrapping_add(k2);
        let paired = (sum.wrapping_mul(sum.wrapping_add(1)) >> 1).wrapping_add(k2);
        paired as u32
    }
}

/// How an enqueuer pulls the cursor back toward a freshly inserted event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CursorPolicy {
    /// Retry while the event's bucket is at or below the cursor and the event is still live.
    Basic,
    /// Move the cursor only when the event landed in an empty bucket, with one attempt at the
    /// cursor as first read and further attempts only while the cursor is strictly above.
    Smart,
}

impl Default for CursorPolicy {
    fn default() -> Self {
        CursorPolicy::Smart
    }
}

pub(crate) struct Cursor {
    current: CachePadded<AtomicU64>,
}

impl Cursor {
    pub(crate) fn new(index: u32) -> Self {
        Cursor {
            current: CachePadded::new(AtomicU64::new(Position::new(index, 0).0)),
        }
    }

    #[inline]
    pub(crate) fn load(&self) -> Position {
        Position(self.current.load(Acquire))
    }

    /// Replaces `old` with `new`. Fails if any thread updated the cursor in between.
    #[inline]
    pub(crate) fn compare_and_set(&self, old: Position, new: Position) -> bool {
        self.current
            .compare_exchange(old.0, new.0, SeqCst, Acquire)
            .is_ok()
    }

    /// Pulls the cursor back to `index` while that is still useful.
    ///
    /// `is_live` reports whether the inserted event has not been dequeued yet; once it has, there
    /// is nothing left to point at.
    pub(crate) fn flush<F>(&self, index: u32, stamps: &Stamps, is_live: F)
    where
        F: Fn() -> bool,
    {
        let new = Position::new(index, stamps.next());
        loop {
            let old = self.load();
            if index > old.index() || !is_live() || self.compare_and_set(old, new) {
                return;
            }
        }
    }

    /// Like `flush`, but acts only if the event landed in an empty bucket.
    ///
    /// A non-empty bucket already had an event whose own insertion pulled the cursor down.
    pub(crate) fn smart_flush<F>(&self, index: u32, was_empty: bool, stamps: &Stamps, is_live: F)
    where
        F: Fn() -> bool,
    {
        if !was_empty {
            return;
        }
        let new = Position::new(index, stamps.next());
        let first = self.load();
        if index > first.index() || !is_live() || self.compare_and_set(first, new) {
            return;
        }
        loop {
            let old = self.load();
            if index >= old.index() || !is_live() || self.compare_and_set(old, new) {
                return;
            }
        }
    }
}
