//! The non-blocking calendar queue.
//!
//! Events are hashed by timestamp into buckets of fixed width. Buckets live in a segmented table
//! that doubles on demand; events beyond the table's reach wait in a staging list until an
//! expansion makes room for them. Dequeuers start from a shared cursor and walk forward to the
//! first live event.
//!
//! Marotta, Ianni, Pellegrini, Quaglia.  A Non-Blocking Priority Queue for the Pending Event Set.
//! SIMUTOOLS 2016.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use crossbeam_utils::{Backoff, CachePadded};
use tracing::debug;

use crate::atomic::{Atomic, Owned, Ptr};
use crate::bucket::{self, Ctx};
use crate::config::Config;
use crate::cursor::{Cursor, CursorPolicy, Position, Stamps};
use crate::handle::Handle;
use crate::node::{Node, Staging};
use crate::registry::Registry;
use crate::scope::{unprotected, with_scope, Scope};
use crate::table::{index_of, Table, MAX_CAPACITY};

/// An event taken out of the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<T> {
    timestamp: f64,
    counter: u32,
    payload: T,
}

impl<T> Event<T> {
    /// The timestamp reported for an empty queue.
    pub const INFINITY: f64 = f64::INFINITY;

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Position of this event among events enqueued with the same timestamp, starting at one.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }
}

/// A lock-free priority queue of timestamped events.
///
/// Threads interact with the queue through a [`Handle`] obtained from [`register`].
///
/// # Examples
///
/// ```
/// use nbqueue::Queue;
///
/// let queue = Queue::new(2, 1.0, false);
/// let handle = queue.register(0);
///
/// handle.enqueue(0.5, "a");
/// handle.enqueue(1.5, "b");
/// handle.enqueue(0.2, "c");
///
/// assert_eq!(handle.dequeue().map(|e| *e.payload()), Some("c"));
/// assert_eq!(handle.dequeue().map(|e| *e.payload()), Some("a"));
/// assert_eq!(handle.dequeue().map(|e| *e.payload()), Some("b"));
/// assert!(handle.dequeue().is_none());
/// ```
///
/// [`Handle`]: struct.Handle.html
/// [`register`]: #method.register
pub struct Queue<T> {
    cursor: Cursor,
    /// Where events beyond the table's capacity are parked.
    staging: CachePadded<Atomic<Staging<T>>>,
    /// The previous staging list, frozen and being moved into the table.
    todo: CachePadded<Atomic<Staging<T>>>,
    /// Number of buckets dequeuers may scan; every one of them is installed.
    dequeue_size: CachePadded<AtomicU32>,
    table: Table<T>,
    tail: Box<Node<T>>,
    /// Staging heads that were replaced, freed with the queue.
    parked: Atomic<Staging<T>>,
    /// Source of staging tickets.
    tickets: AtomicU64,
    registry: Registry<T>,
    bucket_width: f64,
    init_size: u32,
    collaborative: bool,
    policy: CursorPolicy,
}

unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Queue<T> {
    /// Creates a queue with `init_size` buckets of `bucket_width` time units each.
    ///
    /// `init_size` is rounded up to a power of two. If `collaborative` is set, every enqueue
    /// helps move staged events into the table after an expansion.
    ///
    /// # Panics
    ///
    /// Panics if `bucket_width` is not a positive finite number.
    pub fn new(init_size: u32, bucket_width: f64, collaborative: bool) -> Self {
        let init_size = init_size.max(1).checked_next_power_of_two().unwrap_or(MAX_CAPACITY);
        Config {
            init_size,
            bucket_width,
            collaborative_drain: collaborative,
            ..Config::default()
        }
        .build()
        .unwrap_or_else(|e| panic!("invalid queue parameters: {}", e))
    }

    pub(crate) fn with_config(config: &Config) -> Self {
        let tail = Box::new(Node::tail());
        let tail_ptr = Ptr::from_raw(&*tail);
        let init_size = config.init_size;

        Queue {
            cursor: Cursor::new(init_size - 1),
            staging: CachePadded::new(Atomic::from_owned(Owned::new(Staging::new(
                init_size, tail_ptr,
            )))),
            todo: CachePadded::new(Atomic::from_owned(Owned::new(Staging::new(
                0,
                tail_ptr.marked(),
            )))),
            dequeue_size: CachePadded::new(AtomicU32::new(init_size)),
            table: Table::new(init_size, config.bucket_width, tail_ptr),
            tail,
            parked: Atomic::null(),
            tickets: AtomicU64::new(0),
            registry: Registry::new(),
            bucket_width: config.bucket_width,
            init_size,
            collaborative: config.collaborative_drain,
            policy: config.cursor,
        }
    }

    /// Registers the calling thread under `lid` and returns its handle.
    ///
    /// `lid` seeds the stamps that order cursor updates, so threads using the queue at the same
    /// time should pick distinct ids. An id whose previous handle was dropped reuses that
    /// handle's state, including nodes still waiting to be pruned.
    pub fn register(&self, lid: u32) -> Handle<'_, T> {
        Handle::new(self, self.registry.register(lid), Stamps::new(lid))
    }

    /// Time span covered by one bucket.
    pub fn bucket_width(&self) -> f64 {
        self.bucket_width
    }

    /// Initial number of buckets.
    pub fn init_size(&self) -> u32 {
        self.init_size
    }

    /// Number of buckets currently scanned by dequeuers.
    pub fn capacity(&self) -> u32 {
        self.dequeue_size.load(Acquire)
    }

    /// Returns `true` if no live event was seen.
    ///
    /// This is a snapshot: concurrent operations may change the answer before it is returned.
    pub fn is_empty(&self) -> bool {
        with_scope(|scope| {
            let tail = self.tail_ptr();
            let size = self.dequeue_size.load(Acquire);
            for index in self.cursor.load().index()..size {
                let mut curr = self.table.bucket(index, scope).next.load(Acquire, scope);
                while curr != tail {
                    let next = unsafe { curr.deref() }.next.load(Acquire, scope);
                    if !next.is_marked() {
                        return false;
                    }
                    curr = next.unmarked();
                }
            }

            let staging = unsafe { self.staging.load(Acquire, scope).deref() };
            let todo = unsafe { self.todo.load(Acquire, scope).deref() };
            staging.next.load(Acquire, scope) == tail
                && todo.next.load(Acquire, scope).unmarked() == tail
        })
    }

    #[inline]
    pub(crate) fn tail_ptr<'scope>(&self) -> Ptr<'scope, Node<T>> {
        Ptr::from_raw(&*self.tail)
    }

    #[inline]
    pub(crate) fn table(&self) -> &Table<T> {
        &self.table
    }

    #[inline]
    pub(crate) fn registry(&self) -> &Registry<T> {
        &self.registry
    }

    #[inline]
    pub(crate) fn index_of(&self, timestamp: f64) -> u32 {
        index_of(timestamp, self.bucket_width)
    }

    /// Inserts a new event. Returns `true` if it went straight into the table.
    pub(crate) fn enqueue(&self, timestamp: f64, payload: T, ctx: Ctx<T>, stamps: &Stamps) -> bool {
        assert!(!timestamp.is_nan(), "cannot enqueue an event at NaN");
        let index = self.index_of(timestamp);
        assert!(
            index < MAX_CAPACITY,
            "timestamp {} lies beyond the last addressable bucket",
            timestamp
        );

        let node = Owned::new(Node::event(timestamp, payload)).into_ptr(ctx.scope);
        let placed = self.insert(node, ctx);

        if let Some(was_empty) = placed {
            let live = || is_live(node, ctx.scope);
            match self.policy {
                CursorPolicy::Basic => self.cursor.flush(index, stamps, live),
                CursorPolicy::Smart => self.cursor.smart_flush(index, was_empty, stamps, live),
            }
        }

        if self.collaborative {
            self.drain(ctx, stamps);
        }
        placed.is_some()
    }

    /// Places `node` in its bucket, or in the staging list if the table does not reach it yet.
    ///
    /// Returns `Some(was_empty)` for a table insertion and `None` if the node was staged.
    fn insert(&self, node: Ptr<Node<T>>, ctx: Ctx<T>) -> Option<bool> {
        let n = unsafe { node.deref() };
        let index = self.index_of(n.timestamp);
        let backoff = Backoff::new();

        loop {
            let staging = unsafe { self.staging.load(Acquire, ctx.scope).deref() };
            let first = staging.next.load(Acquire, ctx.scope);

            // A frozen list is about to be replaced by a fresh one.
            if first.is_marked() {
                backoff.snooze();
                continue;
            }
            if index < staging.capacity {
                break;
            }
            if n.ticket() == 0 {
                n.ticket.store(self.tickets.fetch_add(1, Relaxed) + 1, Relaxed);
            }

            n.next.store(first, Relaxed);
            if staging
                .next
                .compare_and_set(first, node, Release, ctx.scope)
                .is_ok()
            {
                return None;
            }
            backoff.spin();
        }

        let head = self.table.bucket(index, ctx.scope);
        Some(bucket::insert(head, node, ctx))
    }

    /// Removes the event with the smallest timestamp, or returns `None` if the queue was observed
    /// empty.
    pub(crate) fn dequeue(&self, ctx: Ctx<T>, stamps: &Stamps) -> Option<Event<T>> {
        'retry: loop {
            let old = self.cursor.load();
            let mut index = old.index();
            let head = self.table.bucket(index, ctx.scope);

            let (candidate, candidate_next) = match bucket::first_live(head, ctx) {
                Some(found) => found,
                None => continue,
            };

            if candidate == ctx.tail {
                // This bucket is exhausted; point the cursor at the next one.
                index += 1;
                loop {
                    let size = self.dequeue_size.load(Acquire);
                    if index < size {
                        break;
                    }
                    if self.is_drained(size, ctx.scope) {
                        return None;
                    }
                    if !self.expand(size, ctx, stamps) {
                        continue 'retry;
                    }
                }
                self.cursor.compare_and_set(old, Position::new(index, stamps.next()));
                continue;
            }

            let c = unsafe { candidate.deref() };
            debug_assert!(c.is_data(), "bucket head linked inside a bucket list");
            if c.next
                .compare_and_set(candidate_next, candidate_next.marked(), AcqRel, ctx.scope)
                .is_ok()
            {
                return Some(Event {
                    timestamp: c.timestamp,
                    counter: c.counter(),
                    payload: unsafe { c.take() },
                });
            }
        }
    }

    /// Returns `true` if nothing is staged and nothing waits to be moved into a table of `size`
    /// buckets.
    fn is_drained(&self, size: u32, scope: &Scope) -> bool {
        let staging = unsafe { self.staging.load(Acquire, scope).deref() };
        staging.capacity == size && staging.next.load(Acquire, scope) == self.tail_ptr()
    }

    /// Doubles the table from `old_size` buckets, cooperating with any thread doing the same.
    ///
    /// Returns `true` once dequeuers may scan beyond `old_size`.
    fn expand(&self, old_size: u32, ctx: Ctx<T>, stamps: &Stamps) -> bool {
        let size = self.dequeue_size.load(Acquire);
        if size != old_size {
            return size > old_size;
        }
        assert!(old_size < MAX_CAPACITY, "bucket table cannot grow past {}", MAX_CAPACITY);
        let new_size = old_size * 2;

        let staging = self.staging.load(Acquire, ctx.scope);
        if unsafe { staging.deref() }.capacity == old_size {
            self.table.grow(old_size, self.bucket_width, ctx.tail, ctx.scope);

            // The current staging list becomes the todo list.
            let todo = self.todo.load(Acquire, ctx.scope);
            if unsafe { todo.deref() }.capacity < old_size
                && self
                    .todo
                    .compare_and_set(todo, staging, AcqRel, ctx.scope)
                    .is_ok()
            {
                self.park(todo, ctx.scope);
            }

            let fresh = Owned::new(Staging::new(new_size, ctx.tail));
            if self
                .staging
                .compare_and_set_owned(staging, fresh, AcqRel, ctx.scope)
                .is_ok()
            {
                debug!(from = old_size, to = new_size, "expanding bucket table");
            }
        }

        // Freeze the todo list so no more events get staged on it.
        let backoff = Backoff::new();
        loop {
            let todo = unsafe { self.todo.load(Acquire, ctx.scope).deref() };
            let first = todo.next.load(Acquire, ctx.scope);
            if first.is_marked()
                || todo
                    .next
                    .compare_and_set(first, first.marked(), AcqRel, ctx.scope)
                    .is_ok()
            {
                break;
            }
            backoff.spin();
        }

        self.drain(ctx, stamps);

        if self
            .dequeue_size
            .compare_exchange(old_size, new_size, AcqRel, Acquire)
            .is_ok()
        {
            debug!(size = new_size, "bucket table expanded");
        }
        self.dequeue_size.load(Acquire) > old_size
    }

    /// Moves events off the todo list until it is empty.
    pub(crate) fn drain(&self, ctx: Ctx<T>, stamps: &Stamps) {
        loop {
            let todo = unsafe { self.todo.load(Acquire, ctx.scope).deref() };
            if todo.next.load(Acquire, ctx.scope).unmarked() == ctx.tail {
                return;
            }
            self.drain_one(todo, ctx, stamps);
        }
    }

    /// Pops one event off a frozen `todo` list and inserts it again.
    fn drain_one(&self, todo: &Staging<T>, ctx: Ctx<T>, stamps: &Stamps) {
        let backoff = Backoff::new();
        loop {
            let first = todo.next.load(Acquire, ctx.scope);
            let node = first.unmarked();
            if node == ctx.tail {
                return;
            }
            let succ = unsafe { node.deref() }.next.load(Acquire, ctx.scope);

            // Only a frozen list may be drained, hence the marked expectation.
            if todo
                .next
                .compare_and_set(node.marked(), succ.marked(), AcqRel, ctx.scope)
                .is_ok()
            {
                self.reinsert(node, ctx, stamps);
                return;
            }
            backoff.snooze();
        }
    }

    /// Inserts a node popped off the todo list.
    ///
    /// Dequeuers may have scanned past its bucket while it was in flight, so the cursor is pulled
    /// back to it whether or not the bucket was empty.
    fn reinsert(&self, node: Ptr<Node<T>>, ctx: Ctx<T>, stamps: &Stamps) {
        if self.insert(node, ctx).is_some() {
            let index = self.index_of(unsafe { node.deref() }.timestamp);
            self.cursor.flush(index, stamps, || is_live(node, ctx.scope));
        }
    }

    /// Keeps a replaced staging head alive until the queue is dropped.
    fn park(&self, staging: Ptr<Staging<T>>, scope: &Scope) {
        let s = unsafe { staging.deref() };
        let mut head = self.parked.load(Acquire, scope);
        loop {
            s.parked.store(head, Relaxed);
            match self.parked.compare_and_set(head, staging, Release, scope) {
                Ok(()) => return,
                Err(h) => head = h,
            }
        }
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Queue")
            .field("bucket_width", &self.bucket_width)
            .field("capacity", &self.capacity())
            .field("cursor", &self.cursor.load().index())
            .field("collaborative", &self.collaborative)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Returns `true` if `node` has not been dequeued.
#[inline]
fn is_live<T>(node: Ptr<Node<T>>, scope: &Scope) -> bool {
    !unsafe { node.deref() }.next.load(Acquire, scope).is_marked()
}

/// Frees every node of the list starting at `curr`, dropping payloads of live events.
unsafe fn free_list<'scope, T>(
    mut curr: Ptr<'scope, Node<T>>,
    tail: Ptr<Node<T>>,
    scope: &'scope Scope,
) {
    while curr != tail {
        let mut node = curr.into_owned();
        let next = node.next.load(Relaxed, scope);
        if !next.is_marked() && node.is_data() {
            node.drop_data();
        }
        drop(node);
        curr = next.unmarked();
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        unsafe {
            unprotected(|scope| {
                let tail = self.tail_ptr();

                self.table.for_each_head(scope, |_, head| {
                    free_list(head.next.load(Relaxed, scope).unmarked(), tail, scope);
                });

                for local in self.registry.iter(scope) {
                    let mut run = local.take_chain(scope);
                    while !run.is_null() {
                        let next_run = run.deref().retired_next.load(Relaxed, scope);
                        crate::prune::free_run(run, f64::INFINITY, scope);
                        run = next_run;
                    }
                }

                let mut stagings = vec![
                    self.staging.load(Relaxed, scope),
                    self.todo.load(Relaxed, scope),
                ];
                let mut parked = self.parked.load(Relaxed, scope);
                while !parked.is_null() {
                    stagings.push(parked);
                    parked = parked.deref().parked.load(Relaxed, scope);
                }
                for staging in stagings {
                    free_list(staging.deref().next.load(Relaxed, scope).unmarked(), tail, scope);
                    drop(staging.into_owned());
                }
            })
        }
    }
}
