use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::atomic::{Atomic, Ptr};

/// Two timestamps closer than this are treated as equal.
#[inline]
pub(crate) fn same_time(a: f64, b: f64) -> bool {
    (a - b).abs() < f64::EPSILON
}

/// An entry in a bucket list, the staging list, or the shared tail.
///
/// Bucket heads and the tail carry no payload and have a zero `counter`. Data nodes have a
/// counter of at least one: the position of the event among events with the same timestamp.
pub(crate) struct Node<T> {
    /// The successor. If the tag is 1, this node is logically deleted.
    pub(crate) next: Atomic<Node<T>>,
    pub(crate) timestamp: f64,
    /// Tie-break sequence. Rewritten only while the node is privately owned by an inserter.
    pub(crate) counter: AtomicU32,
    /// Order of first staging, or 0 if the node went straight into the table. Among equal
    /// timestamps, staged nodes were enqueued before any unstaged one and sort by ticket.
    pub(crate) ticket: AtomicU64,
    data: MaybeUninit<T>,

    /// Next run in the owning thread's deferred-free chain.
    pub(crate) retired_next: Atomic<Node<T>>,
    /// Number of consecutive nodes, starting here, retired together.
    pub(crate) run: AtomicU32,
    /// Set once the node has been handed to a deferred-free chain.
    pub(crate) retired: AtomicBool,
}

unsafe impl<T: Send> Send for Node<T> {}
unsafe impl<T: Send> Sync for Node<T> {}

impl<T> Node<T> {
    fn with(timestamp: f64, counter: u32, data: MaybeUninit<T>, next: Ptr<Node<T>>) -> Self {
        Node {
            next: Atomic::from_ptr(next),
            timestamp,
            counter: AtomicU32::new(counter),
            ticket: AtomicU64::new(0),
            data,
            retired_next: Atomic::null(),
            run: AtomicU32::new(0),
            retired: AtomicBool::new(false),
        }
    }

    /// A placeholder heading a bucket whose first timestamp is `timestamp`.
    pub(crate) fn head(timestamp: f64, tail: Ptr<Node<T>>) -> Self {
        Self::with(timestamp, 0, MaybeUninit::uninit(), tail)
    }

    /// The queue-wide terminator of every list.
    pub(crate) fn tail() -> Self {
        Self::with(f64::INFINITY, 0, MaybeUninit::uninit(), Ptr::null())
    }

    /// A data node carrying `value`.
    pub(crate) fn event(timestamp: f64, value: T) -> Self {
        Self::with(timestamp, 1, MaybeUninit::new(value), Ptr::null())
    }

    #[inline]
    pub(crate) fn counter(&self) -> u32 {
        self.counter.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn ticket(&self) -> u64 {
        self.ticket.load(Ordering::Relaxed)
    }

    /// Returns `true` if this node must stay in front of an event at `timestamp` carrying
    /// `ticket`.
    #[inline]
    pub(crate) fn precedes(&self, timestamp: f64, ticket: u64) -> bool {
        if same_time(self.timestamp, timestamp) {
            let mine = self.ticket();
            ticket == 0 || (mine != 0 && mine < ticket)
        } else {
            self.timestamp < timestamp
        }
    }

    /// Returns `true` if this node carries a payload.
    #[inline]
    pub(crate) fn is_data(&self) -> bool {
        self.counter() != 0
    }

    /// Moves the payload out.
    ///
    /// # Safety
    ///
    /// Must be a data node, and the caller must be the thread whose CAS marked it deleted.
    pub(crate) unsafe fn take(&self) -> T {
        ptr::read(self.data.as_ptr())
    }

    /// Drops the payload in place.
    ///
    /// # Safety
    ///
    /// Must be a live data node owned exclusively by the caller.
    pub(crate) unsafe fn drop_data(&mut self) {
        ptr::drop_in_place(self.data.as_mut_ptr());
    }
}

/// Head of a staging list.
///
/// `capacity` is the number of buckets the table covered when this list started collecting
/// events; anything hashing below it may go straight into the table.
pub(crate) struct Staging<T> {
    pub(crate) capacity: u32,
    /// The staged events. If the tag is 1, the list is frozen and being drained.
    pub(crate) next: Atomic<Node<T>>,
    /// Link in the queue's list of retired staging heads.
    pub(crate) parked: Atomic<Staging<T>>,
}

unsafe impl<T: Send> Send for Staging<T> {}
unsafe impl<T: Send> Sync for Staging<T> {}

impl<T> Staging<T> {
    pub(crate) fn new(capacity: u32, first: Ptr<Node<T>>) -> Self {
        Staging {
            capacity,
            next: Atomic::from_ptr(first),
            parked: Atomic::null(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_within_epsilon() {
        assert!(same_time(3.0, 3.0));
        assert!(same_time(0.1 + 0.2, 0.3));
        assert!(!same_time(1.0, 1.0 + 1e-9));
    }

    #[test]
    fn placeholders_are_not_data() {
        let tail = Node::<u32>::tail();
        assert!(!tail.is_data());
        let head = Node::<u32>::head(2.0, Ptr::from_raw(&tail));
        assert!(!head.is_data());
        let mut node = Node::event(2.5, String::from("payload"));
        assert!(node.is_data());
        assert_eq!(node.counter(), 1);
        unsafe { node.drop_data() };
    }

    #[test]
    fn staged_events_go_first_among_ties() {
        let direct = Node::event(1.0, ());
        let early = Node::event(1.0, ());
        early.ticket.store(3, Ordering::Relaxed);

        // An unstaged newcomer queues behind everything with its timestamp.
        assert!(direct.precedes(1.0, 0));
        assert!(early.precedes(1.0, 0));
        // A staged one passes unstaged events and later tickets only.
        assert!(!direct.precedes(1.0, 5));
        assert!(early.precedes(1.0, 5));
        assert!(!early.precedes(1.0, 2));
        assert!(!early.precedes(0.5, 0));
        assert!(early.precedes(1.5, 9));
    }
}
