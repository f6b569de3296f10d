//! Per-thread access to a queue.
//!
//! Every operation needs to know who is calling: the caller's stamps order its cursor updates,
//! and its registry entry collects the nodes it unlinks. A `Handle` bundles both.

use std::fmt;

use crate::bucket::Ctx;
use crate::cursor::Stamps;
use crate::queue::{Event, Queue};
use crate::registry::Local;
use crate::scope::{with_scope, Scope};

/// A thread's registration with a [`Queue`].
///
/// Created by [`Queue::register`]. Dropping the handle releases the registration, which the
/// next handle registered under the same id adopts.
///
/// A handle can be moved to another thread but not shared between threads.
///
/// [`Queue`]: struct.Queue.html
/// [`Queue::register`]: struct.Queue.html#method.register
pub struct Handle<'q, T: 'q> {
    queue: &'q Queue<T>,
    local: &'q Local<T>,
    stamps: Stamps,
}

impl<'q, T> Handle<'q, T> {
    pub(crate) fn new(queue: &'q Queue<T>, local: &'q Local<T>, stamps: Stamps) -> Self {
        Handle {
            queue,
            local,
            stamps,
        }
    }

    /// Returns the id this handle was registered with.
    pub fn lid(&self) -> u32 {
        self.local.lid()
    }

    /// Returns the queue this handle belongs to.
    pub fn queue(&self) -> &'q Queue<T> {
        self.queue
    }

    fn with_ctx<F, R>(&self, f: F) -> R
    where
        F: for<'scope> FnOnce(Ctx<'scope, T>) -> R,
    {
        with_scope(|scope: &Scope| {
            f(Ctx {
                tail: self.queue.tail_ptr(),
                local: self.local,
                scope,
            })
        })
    }

    /// Inserts `payload` at `timestamp`.
    ///
    /// Returns `true` if the event went straight into the bucket table and `false` if it was
    /// staged to wait for the table to grow. Either way it will be dequeued in order.
    ///
    /// # Panics
    ///
    /// Panics if `timestamp` is NaN, or if it hashes at or beyond [`MAX_CAPACITY`] buckets.
    ///
    /// [`MAX_CAPACITY`]: constant.MAX_CAPACITY.html
    pub fn enqueue(&self, timestamp: f64, payload: T) -> bool {
        self.with_ctx(|ctx| self.queue.enqueue(timestamp, payload, ctx, &self.stamps))
    }

    /// Removes and returns the event with the smallest timestamp.
    ///
    /// Events sharing a timestamp come out in the order they went in. Returns `None` if the
    /// queue was observed empty.
    pub fn dequeue(&self) -> Option<Event<T>> {
        self.with_ctx(|ctx| self.queue.dequeue(ctx, &self.stamps))
    }

    /// Frees dequeued events below `threshold`, returning how many nodes were freed.
    ///
    /// The deferred-free chains of all threads are pruned, not only this one's.
    ///
    /// # Safety
    ///
    /// No thread may be inside an operation touching events below `threshold`, and no event
    /// below `threshold` may be enqueued afterwards. A live event found below the threshold
    /// aborts the process.
    pub unsafe fn prune(&self, threshold: f64) -> usize {
        with_scope(|scope| self.queue.prune(threshold, scope))
    }
}

impl<'q, T> Drop for Handle<'q, T> {
    fn drop(&mut self) {
        self.local.release();
    }
}

impl<'q, T> fmt::Debug for Handle<'q, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Handle").field("lid", &self.lid()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BinaryHeap;
    use std::cmp::Reverse;

    use crossbeam_utils::thread;
    use proptest::prelude::*;
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;

    use crate::{Config, CursorPolicy, Queue};

    #[test]
    fn lid_survives_reregistration() {
        let queue = Queue::<()>::new(2, 1.0, false);
        let a = queue.register(3);
        assert_eq!(a.lid(), 3);
        drop(a);
        let b = queue.register(3);
        assert_eq!(b.lid(), 3);
        assert_eq!(format!("{:?}", b), "Handle { lid: 3 }");
    }

    #[test]
    fn matches_binary_heap() {
        let mut rng = StdRng::seed_from_u64(7);
        let queue = Queue::new(4, 0.25, false);
        let handle = queue.register(0);
        let mut heap = BinaryHeap::new();

        for seq in 0..2_000u64 {
            if rng.gen_bool(0.6) {
                // Integral halves give plenty of ties.
                let ts = f64::from(rng.gen_range(0u32..400)) / 2.0;
                handle.enqueue(ts, seq);
                heap.push(Reverse(((ts * 2.0) as u64, seq)));
            } else {
                let want = heap.pop().map(|Reverse((_, seq))| seq);
                assert_eq!(handle.dequeue().map(|e| e.into_payload()), want);
            }
        }
        while let Some(Reverse((_, seq))) = heap.pop() {
            assert_eq!(handle.dequeue().map(|e| e.into_payload()), Some(seq));
        }
        assert!(handle.dequeue().is_none());
    }

    fn concurrent(collaborative: bool, cursor: CursorPolicy) {
        const THREADS: u32 = 4;
        const PER_THREAD: u32 = 2_000;

        let queue: Queue<u32> = Config {
            init_size: 2,
            bucket_width: 1.0,
            collaborative_drain: collaborative,
            cursor,
        }
        .build()
        .unwrap();

        let received = thread::scope(|s| {
            let workers: Vec<_> = (0..THREADS)
                .map(|lid| {
                    let queue = &queue;
                    s.spawn(move |_| {
                        let handle = queue.register(lid);
                        let mut rng = StdRng::seed_from_u64(u64::from(lid));
                        let mut got = Vec::new();
                        for i in 0..PER_THREAD {
                            let ts = rng.gen_range(0.0..500.0);
                            handle.enqueue(ts, lid * PER_THREAD + i);
                            if i % 2 == 1 {
                                got.extend(handle.dequeue().map(|e| e.into_payload()));
                            }
                        }
                        got
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect::<Vec<_>>()
        })
        .unwrap();

        let handle = queue.register(THREADS);
        let mut all = received;
        while let Some(e) = handle.dequeue() {
            all.push(e.into_payload());
        }
        all.sort_unstable();
        let expected: Vec<u32> = (0..THREADS * PER_THREAD).collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn concurrent_smart() {
        concurrent(false, CursorPolicy::Smart);
    }

    #[test]
    fn concurrent_basic() {
        concurrent(false, CursorPolicy::Basic);
    }

    #[test]
    fn concurrent_collaborative() {
        concurrent(true, CursorPolicy::Smart);
    }

    proptest! {
        #[test]
        fn dequeues_in_order(stamps in prop::collection::vec(0u32..1_000, 1..200)) {
            let queue = Queue::new(1, 1.5, false);
            let handle = queue.register(0);
            for (i, ts) in stamps.iter().enumerate() {
                handle.enqueue(f64::from(*ts) / 4.0, i);
            }

            let mut last = (f64::NEG_INFINITY, 0);
            let mut count = 0;
            while let Some(e) = handle.dequeue() {
                let key = (e.timestamp(), *e.payload());
                prop_assert!(key > last, "{:?} after {:?}", key, last);
                last = key;
                count += 1;
            }
            prop_assert_eq!(count, stamps.len());
        }
    }
}
