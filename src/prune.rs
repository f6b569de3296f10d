//! Reclamation of dequeued events.
//!
//! A dequeued node stays reachable until some thread unlinks it, and an unlinked node stays on
//! its unlinker's deferred-free chain until a prune proves nobody can be looking at it. The proof
//! comes from the caller: in a simulation, no thread ever touches events older than the global
//! virtual time, so everything hashing below it can go.

use std::process;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};

use scopeguard::guard;
use tracing::{error, trace};

use crate::atomic::Ptr;
use crate::node::Node;
use crate::queue::Queue;
use crate::scope::Scope;

#[cold]
fn violation(what: &str, timestamp: f64, threshold: f64) -> ! {
    error!(timestamp, threshold, "{}; the queue is corrupted", what);
    process::abort()
}

/// Frees the run of retired nodes starting at `start`. Returns how many were freed.
///
/// Only dequeued nodes are ever unlinked, so every node of the run must carry the mark.
///
/// # Safety
///
/// The run must have been detached from its deferred-free chain, and no thread may be traversing
/// it.
pub(crate) unsafe fn free_run<T>(start: Ptr<Node<T>>, threshold: f64, scope: &Scope) -> usize {
    let len = start.deref().run.load(Relaxed);
    let mut curr = start;
    for _ in 0..len {
        let node = curr.into_owned();
        debug_assert!(node.retired.load(Relaxed));
        let next = node.next.load(Relaxed, scope);
        if !next.is_marked() {
            violation("live event found on a deferred-free chain", node.timestamp, threshold);
        }
        curr = next.unmarked();
    }
    len as usize
}

impl<T> Queue<T> {
    /// Frees every deleted node hashing below the bucket of `threshold`.
    ///
    /// # Safety
    ///
    /// No thread may be accessing, or later enqueue, an event below `threshold`.
    pub(crate) unsafe fn prune(&self, threshold: f64, scope: &Scope) -> usize {
        let end = self.index_of(threshold);
        let tail = self.tail_ptr();
        let mut freed = 0;

        // Cut whole buckets off. Whatever is still linked must have been dequeued.
        for index in 0..end.min(self.capacity()) {
            let head = self.table().bucket(index, scope);
            let first = head.next.load(Acquire, scope);
            if first == tail || head.next.compare_and_set(first, tail, AcqRel, scope).is_err() {
                continue;
            }

            let mut curr = first;
            while curr != tail {
                let node = curr.into_owned();
                let next = node.next.load(Acquire, scope);
                if !next.is_marked() {
                    violation(
                        "live event found below the pruning threshold",
                        node.timestamp,
                        threshold,
                    );
                }
                freed += 1;
                curr = next.unmarked();
            }
        }

        for local in self.registry().iter(scope) {
            let mut run = local.take_chain(scope);

            // Runs that survive go back onto the chain, even if freeing panics midway.
            let mut kept = guard((Ptr::null(), Ptr::null()), |(first, last)| {
                if !first.is_null() {
                    local.push_chain(first, last, scope);
                }
            });

            while !run.is_null() {
                let r = run.deref();
                let next_run = r.retired_next.load(Acquire, scope);

                if self.index_of(r.timestamp) < end {
                    freed += free_run(run, threshold, scope);
                } else {
                    let (first, last) = &mut *kept;
                    if first.is_null() {
                        *first = run;
                    } else {
                        last.deref().retired_next.store(run, Relaxed);
                    }
                    *last = run;
                }
                run = next_run;
            }
        }

        trace!(threshold, freed, "pruned deleted events");
        freed
    }
}
