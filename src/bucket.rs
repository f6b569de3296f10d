//! Harris's lock-free sorted list, one per bucket.
//!
//! Harris.  A Pragmatic Implementation of Non-Blocking Linked-Lists.  DISC 2001.
//!
//! A node is logically deleted once its own `next` link carries the mark. Any thread walking the
//! list may then unlink a whole run of deleted nodes with one CAS on the last live predecessor;
//! the winner of that CAS hands the run to its deferred-free chain.

use std::ptr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use cfg_if::cfg_if;
use crossbeam_utils::Backoff;

use crate::atomic::Ptr;
use crate::node::{same_time, Node};
use crate::registry::Local;
use crate::scope::Scope;

/// What a list operation needs besides the list itself.
pub(crate) struct Ctx<'scope, T: 'scope> {
    /// The terminator shared by every list.
    pub(crate) tail: Ptr<'scope, Node<T>>,
    /// The calling thread's entry, receiving unlinked runs.
    pub(crate) local: &'scope Local<T>,
    pub(crate) scope: &'scope Scope,
}

impl<'scope, T> Clone for Ctx<'scope, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'scope, T> Copy for Ctx<'scope, T> {}

cfg_if! {
    if #[cfg(feature = "sanitize")] {
        /// Checks that `node` sits in order between `left` and `right`.
        fn check_window<T>(
            left: &Node<T>,
            node: &Node<T>,
            right: Ptr<Node<T>>,
            tail: Ptr<Node<T>>,
        ) {
            assert!(
                left.timestamp <= node.timestamp || same_time(left.timestamp, node.timestamp),
                "left neighbour {} after new event {}",
                left.timestamp,
                node.timestamp,
            );
            if right != tail {
                let right = unsafe { right.deref() };
                assert!(
                    node.timestamp < right.timestamp,
                    "right neighbour {} not after new event {}",
                    right.timestamp,
                    node.timestamp,
                );
            }
        }
    } else {
        #[inline(always)]
        fn check_window<T>(_: &Node<T>, _: &Node<T>, _: Ptr<Node<T>>, _: Ptr<Node<T>>) {}
    }
}

/// Finds the window for an event at `timestamp` in the list starting at `head`.
///
/// Returns `(left, right)` where `left` is the last live node that precedes the event and
/// `right` is the live node following it, or the tail. Unstaged events (`ticket` 0) queue up
/// behind every event with the same timestamp.
pub(crate) fn search<'scope, T>(
    head: &'scope Node<T>,
    timestamp: f64,
    ticket: u64,
    ctx: Ctx<'scope, T>,
) -> (&'scope Node<T>, Ptr<'scope, Node<T>>) {
    let backoff = Backoff::new();
    loop {
        let mut left = head;
        let mut left_next = head.next.load(Acquire, ctx.scope);
        let mut run = 0;

        let mut curr = head;
        let mut curr_next = left_next;
        let right = loop {
            if curr_next.is_marked() {
                run += 1;
            } else {
                left = curr;
                left_next = curr_next;
                run = 0;
            }

            let succ = curr_next.unmarked();
            curr = unsafe { succ.deref() };
            curr_next = curr.next.load(Acquire, ctx.scope);

            if succ == ctx.tail || !(curr_next.is_marked() || curr.precedes(timestamp, ticket)) {
                break succ;
            }
        };

        // Unlink the deleted nodes between `left` and `right`.
        if left_next != right {
            if left
                .next
                .compare_and_set(left_next, right, Release, ctx.scope)
                .is_err()
            {
                backoff.spin();
                continue;
            }
            ctx.local.retire(left_next, run, ctx.scope);
        }

        if right == ctx.tail
            || !unsafe { right.deref() }
                .next
                .load(Acquire, ctx.scope)
                .is_marked()
        {
            return (left, right);
        }
        backoff.spin();
    }
}

/// Links `node` into the list starting at `head`.
///
/// Returns `true` if the bucket held no live event when the node went in.
pub(crate) fn insert<T>(head: &Node<T>, node: Ptr<Node<T>>, ctx: Ctx<T>) -> bool {
    let new = unsafe { node.deref() };
    let backoff = Backoff::new();
    loop {
        let (left, right) = search(head, new.timestamp, new.ticket(), ctx);
        check_window(left, new, right, ctx.tail);

        let counter = if same_time(left.timestamp, new.timestamp) {
            left.counter() + 1
        } else {
            1
        };
        new.counter.store(counter, Relaxed);
        new.next.store(right, Relaxed);

        if left
            .next
            .compare_and_set(right, node, Release, ctx.scope)
            .is_ok()
        {
            return ptr::eq(left, head) && right == ctx.tail;
        }
        backoff.spin();
    }
}

/// Finds the first live node after `head`, unlinking any deleted run in front of it.
///
/// Returns the node together with the value of its `next` link as observed, or `None` if the
/// unlink lost a race and the caller should start over.
pub(crate) fn first_live<'scope, T>(
    head: &'scope Node<T>,
    ctx: Ctx<'scope, T>,
) -> Option<(Ptr<'scope, Node<T>>, Ptr<'scope, Node<T>>)> {
    let head_next = head.next.load(Acquire, ctx.scope);
    let mut curr = head_next;
    let mut curr_next = unsafe { curr.deref() }.next.load(Acquire, ctx.scope);
    let mut run = 0;

    while curr_next.is_marked() {
        run += 1;
        curr = curr_next.unmarked();
        curr_next = unsafe { curr.deref() }.next.load(Acquire, ctx.scope);
    }

    if head_next != curr {
        if head
            .next
            .compare_and_set(head_next, curr, Release, ctx.scope)
            .is_err()
        {
            return None;
        }
        ctx.local.retire(head_next, run, ctx.scope);
    }

    Some((curr, curr_next))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering::SeqCst;

    use super::*;
    use crate::atomic::Owned;
    use crate::registry::Registry;
    use crate::scope::unprotected;

    /// Collects `(timestamp, counter, deleted)` for every node reachable from `head`.
    fn dump<T>(head: &Node<T>, ctx: Ctx<T>) -> Vec<(f64, u32, bool)> {
        let mut out = Vec::new();
        let mut curr = head.next.load(SeqCst, ctx.scope).unmarked();
        while curr != ctx.tail {
            let n = unsafe { curr.deref() };
            let next = n.next.load(SeqCst, ctx.scope);
            out.push((n.timestamp, n.counter(), next.is_marked()));
            curr = next.unmarked();
        }
        out
    }

    fn free_list<T>(head: &Node<T>, ctx: Ctx<T>) {
        let mut curr = head.next.load(SeqCst, ctx.scope).unmarked();
        while curr != ctx.tail {
            let next = unsafe { curr.deref() }.next.load(SeqCst, ctx.scope).unmarked();
            drop(unsafe { curr.into_owned() });
            curr = next;
        }
    }

    #[test]
    fn sorted_with_fifo_counters() {
        let registry = Registry::<char>::new();
        let local = registry.register(0);
        unsafe {
            unprotected(|scope| {
                let tail = Owned::new(Node::tail()).into_ptr(scope);
                let ctx = Ctx { tail, local, scope };
                let head = Node::head(0.0, tail);

                let mut empties = Vec::new();
                for &(ts, c) in &[(0.5, 'a'), (0.2, 'b'), (0.5, 'c'), (0.7, 'd'), (0.5, 'e')] {
                    let node = Owned::new(Node::event(ts, c)).into_ptr(scope);
                    empties.push(insert(&head, node, ctx));
                }
                assert_eq!(empties, vec![true, false, false, false, false]);

                let got = dump(&head, ctx);
                assert_eq!(
                    got,
                    vec![
                        (0.2, 1, false),
                        (0.5, 1, false),
                        (0.5, 2, false),
                        (0.5, 3, false),
                        (0.7, 1, false),
                    ]
                );

                free_list(&head, ctx);
                drop(tail.into_owned());
            })
        }
    }

    #[test]
    fn search_unlinks_deleted_runs() {
        let registry = Registry::<u32>::new();
        let local = registry.register(0);
        unsafe {
            unprotected(|scope| {
                let tail = Owned::new(Node::tail()).into_ptr(scope);
                let ctx = Ctx { tail, local, scope };
                let head = Node::head(0.0, tail);

                let mut nodes = Vec::new();
                for (i, ts) in [0.1, 0.2, 0.3, 0.4].iter().enumerate() {
                    let node = Owned::new(Node::event(*ts, i as u32)).into_ptr(scope);
                    insert(&head, node, ctx);
                    nodes.push(node);
                }

                // Logically delete 0.2 and 0.3.
                for node in &nodes[1..3] {
                    let n = node.deref();
                    let next = n.next.load(SeqCst, scope);
                    n.next.store(next.marked(), SeqCst);
                }

                let (left, right) = search(&head, 0.35, 0, ctx);
                assert_eq!(left.timestamp, 0.1);
                assert_eq!(right, nodes[3]);
                assert_eq!(dump(&head, ctx).len(), 2);

                let chain = local.take_chain(scope);
                assert_eq!(chain, nodes[1]);
                assert_eq!(chain.deref().run.load(SeqCst), 2);

                free_list(&head, ctx);
                for node in &nodes[1..3] {
                    drop(node.into_owned());
                }
                drop(tail.into_owned());
            })
        }
    }

    #[test]
    fn first_live_skips_deleted() {
        let registry = Registry::<u32>::new();
        let local = registry.register(0);
        unsafe {
            unprotected(|scope| {
                let tail = Owned::new(Node::tail()).into_ptr(scope);
                let ctx = Ctx { tail, local, scope };
                let head = Node::head(0.0, tail);

                let (curr, _) = first_live(&head, ctx).unwrap();
                assert_eq!(curr, tail);

                let a = Owned::new(Node::event(0.1, 1)).into_ptr(scope);
                let b = Owned::new(Node::event(0.2, 2)).into_ptr(scope);
                insert(&head, a, ctx);
                insert(&head, b, ctx);
                a.deref().next.store(b.marked(), SeqCst);

                let (curr, curr_next) = first_live(&head, ctx).unwrap();
                assert_eq!(curr, b);
                assert_eq!(curr_next, tail);
                assert_eq!(head.next.load(SeqCst, scope), b);
                assert_eq!(local.take_chain(scope), a);

                free_list(&head, ctx);
                drop(a.into_owned());
                drop(tail.into_owned());
            })
        }
    }
}
