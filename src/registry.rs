use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use crossbeam_utils::Backoff;

use crate::atomic::{Atomic, Owned, Ptr};
use crate::node::Node;
use crate::scope::{unprotected, with_scope, Scope};

/// State of a thread registered with a queue.
///
/// Its main content is the deferred-free chain: runs of nodes this thread physically unlinked
/// from bucket lists. They cannot be freed on the spot because other threads may still be
/// traversing them, so they wait here for `prune`.
pub(crate) struct Local<T> {
    lid: u32,
    /// Whether a live handle currently owns this entry.
    in_use: AtomicBool,
    /// Head of the deferred-free chain, linked through `Node::retired_next`.
    retired: Atomic<Node<T>>,
    /// The next entry in the registry.
    next: Atomic<Local<T>>,
}

impl<T> Local<T> {
    pub(crate) fn lid(&self) -> u32 {
        self.lid
    }

    /// Releases the entry so a later handle with the same id can adopt it.
    pub(crate) fn release(&self) {
        self.in_use.store(false, Release);
    }

    /// Appends the run of `len` consecutive nodes starting at `start` to the chain.
    ///
    /// The run must be unlinked from its list, and this thread must be the one that unlinked it.
    pub(crate) fn retire(&self, start: Ptr<Node<T>>, len: u32, scope: &Scope) {
        debug_assert!(len > 0);
        let first = unsafe { start.deref() };
        first.run.store(len, Relaxed);

        let mut node = start;
        for _ in 0..len {
            let n = unsafe { node.deref() };
            n.retired.store(true, Relaxed);
            node = n.next.load(Relaxed, scope).unmarked();
        }

        self.push_chain(start, start, scope);
    }

    /// Pushes the already linked chain `first..=last` onto the deferred-free chain.
    pub(crate) fn push_chain(&self, first: Ptr<Node<T>>, last: Ptr<Node<T>>, scope: &Scope) {
        let last = unsafe { last.deref() };
        let backoff = Backoff::new();
        let mut head = self.retired.load(Relaxed, scope);
        loop {
            last.retired_next.store(head, Relaxed);
            match self.retired.compare_and_set(head, first, Release, scope) {
                Ok(()) => return,
                Err(h) => {
                    head = h;
                    backoff.spin();
                }
            }
        }
    }

    /// Detaches the whole deferred-free chain.
    pub(crate) fn take_chain<'scope>(&self, scope: &'scope Scope) -> Ptr<'scope, Node<T>> {
        self.retired.swap(Ptr::null(), AcqRel, scope)
    }
}

/// The list of threads that registered with a queue.
///
/// Entries are never removed while the queue lives, since their deferred-free chains may still
/// hold nodes waiting for `prune`. A released entry is adopted by the next registration with the
/// same id.
pub(crate) struct Registry<T> {
    head: Atomic<Local<T>>,
}

impl<T> Registry<T> {
    pub(crate) fn new() -> Self {
        Registry {
            head: Atomic::null(),
        }
    }

    /// Registers thread `lid` and returns its entry.
    ///
    /// Entries live as long as the registry, so the reference is not bound to a scope.
    pub(crate) fn register(&self, lid: u32) -> &Local<T> {
        let raw = with_scope(|scope| self.register_raw(lid, scope));
        unsafe { &*raw }
    }

    fn register_raw(&self, lid: u32, scope: &Scope) -> *const Local<T> {
        for local in self.iter(scope) {
            if local.lid == lid
                && local
                    .in_use
                    .compare_exchange(false, true, AcqRel, Relaxed)
                    .is_ok()
            {
                return local;
            }
        }

        let mut new = Owned::new(Local {
            lid,
            in_use: AtomicBool::new(true),
            retired: Atomic::null(),
            next: Atomic::null(),
        });

        let mut head = self.head.load(Acquire, scope);
        loop {
            new.next.store(head, Relaxed);

            // Try installing the new entry as the new head.
            match self.head.compare_and_set_owned(head, new, AcqRel, scope) {
                Ok(n) => return n.as_raw(),
                Err((h, n)) => {
                    head = h;
                    new = n;
                }
            }
        }
    }

    /// Returns an iterator over all registered entries, released ones included.
    pub(crate) fn iter<'scope>(&self, scope: &'scope Scope) -> Iter<'scope, T> {
        Iter {
            curr: self.head.load(Acquire, scope),
            scope,
        }
    }
}

impl<T> Drop for Registry<T> {
    fn drop(&mut self) {
        unsafe {
            unprotected(|scope| {
                let mut curr = self.head.load(Relaxed, scope);
                while let Some(c) = curr.as_ref() {
                    let succ = c.next.load(Relaxed, scope);
                    drop(curr.into_owned());
                    curr = succ;
                }
            })
        }
    }
}

pub(crate) struct Iter<'scope, T: 'scope> {
    scope: &'scope Scope,
    curr: Ptr<'scope, Local<T>>,
}

impl<'scope, T> Iterator for Iter<'scope, T> {
    type Item = &'scope Local<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let c = unsafe { self.curr.as_ref() }?;
        self.curr = c.next.load(Acquire, self.scope);
        Some(c)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering::SeqCst;

    use super::*;

    #[test]
    fn released_entries_are_adopted() {
        let registry = Registry::<u32>::new();
        unsafe {
            unprotected(|scope| {
                let a = registry.register(1);
                let b = registry.register(1);
                assert!(!std::ptr::eq(a, b));

                a.release();
                let c = registry.register(1);
                assert!(std::ptr::eq(a, c));

                let d = registry.register(2);
                assert_eq!(d.lid(), 2);
                assert_eq!(registry.iter(scope).count(), 3);
            })
        }
    }

    #[test]
    fn retire_links_runs() {
        let registry = Registry::<u32>::new();
        unsafe {
            unprotected(|scope| {
                let local = registry.register(0);
                let tail = Owned::new(Node::tail()).into_ptr(scope);
                let b = Owned::new(Node::event(1.5, 2)).into_ptr(scope);
                b.deref().next.store(tail.marked(), SeqCst);
                let a = Owned::new(Node::event(1.0, 1)).into_ptr(scope);
                a.deref().next.store(b.marked(), SeqCst);

                local.retire(a, 2, scope);
                assert!(a.deref().retired.load(SeqCst));
                assert!(b.deref().retired.load(SeqCst));
                assert!(!tail.deref().retired.load(SeqCst));

                let chain = local.take_chain(scope);
                assert_eq!(chain, a);
                assert_eq!(chain.deref().run.load(SeqCst), 2);
                assert!(chain.deref().retired_next.load(SeqCst, scope).is_null());
                assert!(local.take_chain(scope).is_null());

                drop(a.into_owned());
                drop(b.into_owned());
                drop(tail.into_owned());
            })
        }
    }
}
