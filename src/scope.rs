use std::marker::PhantomData;

/// A witness that the current thread is inside a queue operation.
///
/// Pointers loaded from an [`Atomic`] borrow the scope, so they cannot outlive the operation
/// that loaded them. Reclamation of what they point to is governed by `prune`, whose caller
/// promises that nothing still in use lies below the pruning threshold.
///
/// This type is bound to the thread that created it and is neither `Send` nor `Sync`.
///
/// [`Atomic`]: struct.Atomic.html
#[derive(Debug)]
pub struct Scope {
    _marker: PhantomData<*mut ()>, // !Send + !Sync
}

/// Runs `f` within a fresh scope.
///
/// Used by the queue operations themselves, which are only reachable through a registered
/// [`Handle`](struct.Handle.html).
pub(crate) fn with_scope<F, R>(f: F) -> R
where
    F: FnOnce(&Scope) -> R,
{
    let scope = &Scope {
        _marker: PhantomData,
    };
    f(scope)
}

/// Runs `f` within a scope that is not tied to any registered thread.
///
/// # Safety
///
/// No other thread may be accessing the structure concurrently, as is the case during
/// construction and destruction of a queue.
pub unsafe fn unprotected<F, R>(f: F) -> R
where
    F: FnOnce(&Scope) -> R,
{
    with_scope(f)
}
