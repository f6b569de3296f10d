//! Segmented bucket directory.
//!
//! The directory grows by appending segments, each doubling total capacity, so existing bucket
//! heads never move. Mapping a bucket index to its segment uses the position of the index's most
//! significant bit relative to that of the initial size.
//!
//! Dechev, Pirkelbauer, Stroustrup.  Lock-free Dynamically Resizable Arrays.  OPODIS 2006.

use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};

use tracing::debug;

use crate::atomic::{Atomic, Owned, Ptr};
use crate::node::Node;
use crate::scope::{unprotected, Scope};

/// Number of directory slots.
pub(crate) const MAX_SEGMENTS: usize = 32;

/// Bucket indices must stay below this bound, which keeps every doubling within `u32` and every
/// segment within `MAX_SEGMENTS` slots.
pub const MAX_CAPACITY: u32 = 1 << 31;

/// Returns the bucket index of `timestamp`.
///
/// Negative timestamps land in bucket zero; indices saturate at `u32::MAX`.
#[inline]
pub(crate) fn index_of(timestamp: f64, bucket_width: f64) -> u32 {
    (timestamp / bucket_width) as u32
}

/// Position of the most significant set bit. `value` must be non-zero.
#[inline]
fn msb(value: u32) -> u32 {
    31 - value.leading_zeros()
}

/// A contiguous run of bucket heads.
struct Segment<T> {
    heads: Box<[Node<T>]>,
}

impl<T> Segment<T> {
    /// Heads for buckets `first..first + len`.
    fn new(first: u32, len: u32, bucket_width: f64, tail: Ptr<Node<T>>) -> Self {
        let heads = (first..first + len)
            .map(|i| Node::head(f64::from(i) * bucket_width, tail))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Segment { heads }
    }
}

pub(crate) struct Table<T> {
    init_size: u32,
    init_msb: u32,
    segments: [Atomic<Segment<T>>; MAX_SEGMENTS],
}

impl<T> Table<T> {
    /// Creates a table with `init_size` buckets, all pointing at `tail`.
    ///
    /// `init_size` must be a power of two.
    pub(crate) fn new(init_size: u32, bucket_width: f64, tail: Ptr<Node<T>>) -> Self {
        assert!(init_size.is_power_of_two(), "initial size must be a power of two");
        let mut segments: [Atomic<Segment<T>>; MAX_SEGMENTS] = Default::default();
        let first = Segment::new(0, init_size, bucket_width, tail);
        segments[0] = Atomic::from_owned(Owned::new(first));
        Table {
            init_size,
            init_msb: msb(init_size),
            segments,
        }
    }

    /// Splits a bucket index into a directory slot and an offset within that segment.
    #[inline]
    pub(crate) fn locate(&self, index: u32) -> (usize, usize) {
        if index < self.init_size {
            (0, index as usize)
        } else {
            let bit = msb(index);
            ((bit - self.init_msb + 1) as usize, (index & !(1 << bit)) as usize)
        }
    }

    /// Returns the head of bucket `index`.
    ///
    /// The segment holding `index` must already be installed.
    pub(crate) fn bucket<'scope>(&self, index: u32, scope: &'scope Scope) -> &'scope Node<T> {
        let (slot, offset) = self.locate(index);
        let segment = self.segments[slot].load(Acquire, scope);
        debug_assert!(!segment.is_null(), "bucket {} is not installed", index);
        unsafe { &segment.deref().heads[offset] }
    }

    /// Installs the segment that doubles capacity from `old_size` buckets.
    ///
    /// Returns `true` if this call installed it; losers discard their allocation.
    pub(crate) fn grow(
        &self,
        old_size: u32,
        bucket_width: f64,
        tail: Ptr<Node<T>>,
        scope: &Scope,
    ) -> bool {
        let (slot, _) = self.locate(old_size);
        if !self.segments[slot].load(Acquire, scope).is_null() {
            return false;
        }

        let segment = Owned::new(Segment::new(old_size, old_size, bucket_width, tail));
        match self.segments[slot].compare_and_set_owned(Ptr::null(), segment, AcqRel, scope) {
            Ok(_) => {
                debug!(slot, from = old_size, to = old_size * 2, "installed bucket segment");
                true
            }
            Err(_) => false,
        }
    }

    /// Calls `f` on every installed bucket head, in index order.
    pub(crate) fn for_each_head<'scope, F>(&self, scope: &'scope Scope, mut f: F)
    where
        F: FnMut(u32, &'scope Node<T>),
        T: 'scope,
    {
        let mut index = 0;
        for slot in &self.segments {
            let segment = slot.load(Acquire, scope);
            match unsafe { segment.as_ref() } {
                Some(segment) => {
                    for head in segment.heads.iter() {
                        f(index, head);
                        index += 1;
                    }
                }
                None => return,
            }
        }
    }
}

impl<T> Drop for Table<T> {
    fn drop(&mut self) {
        unsafe {
            unprotected(|scope| {
                for slot in &self.segments {
                    let segment = slot.load(Relaxed, scope);
                    if !segment.is_null() {
                        drop(segment.into_owned());
                    }
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(init_size: u32) -> (Table<()>, Box<Node<()>>) {
        let tail = Box::new(Node::tail());
        let table = Table::new(init_size, 1.0, Ptr::from_raw(&*tail));
        (table, tail)
    }

    #[test]
    fn locate_covers_every_bucket_once() {
        let (table, _tail) = table(4);
        let mut expected = vec![(0, 0), (0, 1), (0, 2), (0, 3)];
        for slot in 1..6 {
            let len = 4usize << (slot - 1);
            expected.extend((0..len).map(|offset| (slot, offset)));
        }
        for (index, want) in expected.into_iter().enumerate() {
            assert_eq!(table.locate(index as u32), want, "index {}", index);
        }
    }

    #[test]
    fn locate_from_size_one() {
        let (table, _tail) = table(1);
        assert_eq!(table.locate(0), (0, 0));
        assert_eq!(table.locate(1), (1, 0));
        assert_eq!(table.locate(3), (2, 1));
        assert_eq!(table.locate(MAX_CAPACITY - 1), (31, (MAX_CAPACITY / 2 - 1) as usize));
    }

    #[test]
    fn grow_installs_once() {
        let (table, tail) = table(2);
        unsafe {
            unprotected(|scope| {
                let tail = Ptr::from_raw(&*tail);
                assert!(table.grow(2, 1.0, tail, scope));
                assert!(!table.grow(2, 1.0, tail, scope));
                assert!(table.grow(4, 1.0, tail, scope));

                let head = table.bucket(5, scope);
                assert_eq!(head.timestamp, 5.0);
                assert!(!head.is_data());
                assert_eq!(head.next.load(Relaxed, scope), tail);

                let mut seen = Vec::new();
                table.for_each_head(scope, |i, h| seen.push((i, h.timestamp)));
                assert_eq!(seen.len(), 8);
                assert_eq!(seen[3], (3, 3.0));
                assert_eq!(seen[7], (7, 7.0));
            })
        }
    }

    #[test]
    fn index_saturates() {
        assert_eq!(index_of(-3.0, 1.0), 0);
        assert_eq!(index_of(2.99, 1.0), 2);
        assert_eq!(index_of(f64::INFINITY, 1.0), u32::MAX);
    }
}
