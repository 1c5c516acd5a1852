//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive: a leaf cell holding a
//! value and the observers that read it.
//!
//! # How Signals Work
//!
//! 1. When a signal is read during a tracked evaluation (memo/effect),
//!    the reader is recorded as an observer.
//!
//! 2. When the signal's value changes, direct observers are marked
//!    `Dirty` and transitive observers `Check`; nothing recomputes until
//!    it is read or flushed.
//!
//! 3. A write of an equal value (per the signal's equality predicate) is
//!    a no-op for observers.
//!
//! Signals can also hold a *pending* value: [`Signal::set_future`]
//! accepts a future whose eventual output becomes the value. Until it
//! settles the signal reports `loading()`, and a resolution that has
//! been superseded by a later write is ignored.
//!
//! A `Signal<T>` handle is `Copy`; all copies address the same cell. The
//! cell itself lives until its owning scope is disposed.

use std::any::Any;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::rc::Rc;

use futures::future::FutureExt;

use crate::error::{ErrorPayload, Result};
use crate::graph::{EqualsFn, NodeId, NodeKind};

use super::runtime;

/// A reactive signal holding a value of type `T`.
///
/// # Example
///
/// ```rust,ignore
/// let count = Signal::new(0);
///
/// // Read the value (tracked inside memos/effects)
/// let value = count.get();
///
/// // Update the value (marks observers)
/// count.set(5);
/// ```
pub struct Signal<T> {
    id: NodeId,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone + 'static> Signal<T> {
    /// Create a signal using `==` as the early-cutoff predicate.
    pub fn new(value: T) -> Self
    where
        T: PartialEq,
    {
        Self::with_equals(value, |prev, next| prev == next)
    }

    /// Create a signal with a custom equality predicate. The predicate
    /// must not read cells.
    pub fn with_equals(value: T, equals: impl Fn(&T, &T) -> bool + 'static) -> Self {
        Self::create(value, Some(erase_equals(equals)))
    }

    /// Create a signal that notifies observers on every write, equal or
    /// not.
    pub fn never_equal(value: T) -> Self {
        Self::create(value, None)
    }

    fn create(value: T, equals: Option<EqualsFn>) -> Self {
        let id = runtime::with_engine(|e| {
            let id = e.create_node(NodeKind::Source);
            let node = e.node_mut(id).expect("freshly created node exists");
            node.value = Some(Rc::new(value));
            node.equals = equals;
            id
        });
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// The cell's unique ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the current value, recording a dependency when called inside a
    /// tracked evaluation.
    ///
    /// # Panics
    ///
    /// Panics when the cell is disposed or carries a latched error; use
    /// [`try_get`](Self::try_get) for error-aware reads.
    pub fn get(&self) -> T {
        match self.try_get() {
            Ok(value) => value,
            Err(err) => panic!("signal read failed: {err}"),
        }
    }

    /// Get the current value, surfacing disposal, a latched error, or a
    /// not-yet-resolved first value.
    pub fn try_get(&self) -> Result<T> {
        runtime::read_with(self.id, clone_value::<T>)
    }

    /// Get the current value without recording a dependency.
    pub fn get_untracked(&self) -> T {
        match self.try_get_untracked() {
            Ok(value) => value,
            Err(err) => panic!("signal read failed: {err}"),
        }
    }

    /// Untracked, error-aware read.
    pub fn try_get_untracked(&self) -> Result<T> {
        runtime::peek_with(self.id, clone_value::<T>)
    }

    /// Like [`try_get`](Self::try_get), but raises
    /// [`CellError::NotReady`](crate::error::CellError::NotReady) while
    /// the cell is loading and subscribes the caller to the loading
    /// channel so resolution re-triggers it. Inside a computation,
    /// propagate the sentinel with `?` to keep the previous value.
    pub fn wait(&self) -> Result<T> {
        runtime::wait_with(self.id, clone_value::<T>)
    }

    /// Whether the value depends on an unresolved future. Tracked
    /// through the loading channel only: value changes never invalidate
    /// a caller that reads just `loading()`.
    pub fn loading(&self) -> bool {
        match runtime::read_loading(self.id) {
            Ok(loading) => loading,
            Err(err) => panic!("signal read failed: {err}"),
        }
    }

    /// Whether a computation error is latched. Tracked through the error
    /// channel; returns the boolean without raising the payload.
    pub fn error(&self) -> bool {
        match runtime::read_error(self.id) {
            Ok(errored) => errored,
            Err(err) => panic!("signal read failed: {err}"),
        }
    }

    /// Set a new value, marking observers when it fails the equality
    /// predicate.
    pub fn set(&self, value: T) {
        runtime::write(self.id, Rc::new(value));
    }

    /// Update the value using a function of the current one.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = f(&self.get_untracked());
        self.set(next);
    }

    /// Hand the cell a pending value.
    ///
    /// The signal reports `loading()` until the future settles. The
    /// resolution commits through the cooperative executor (driven by
    /// [`flush_sync`](crate::reactive::flush_sync)) and is ignored if a
    /// later `set`, `set_future`, or disposal superseded it.
    pub fn set_future(&self, fut: impl std::future::Future<Output = anyhow::Result<T>> + 'static) {
        let mapped = fut
            .map(|result| {
                result
                    .map(|value| Rc::new(value) as Rc<dyn Any>)
                    .map_err(ErrorPayload::new)
            })
            .boxed_local();
        runtime::accept_future(self.id, mapped);
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Signal<T> {}

impl<T: Clone + Debug + 'static> Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.id.raw())
            .field("value", &self.try_get_untracked().ok())
            .finish()
    }
}

/// Downcast a stored value back to `T`. The erased type always matches
/// the handle's type parameter by construction.
pub(crate) fn clone_value<T: Clone + 'static>(value: &dyn Any) -> T {
    value
        .downcast_ref::<T>()
        .expect("stored value matches the handle type")
        .clone()
}

/// Erase a typed equality predicate.
pub(crate) fn erase_equals<T: 'static>(equals: impl Fn(&T, &T) -> bool + 'static) -> EqualsFn {
    Rc::new(move |a: &dyn Any, b: &dyn Any| {
        match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
            (Some(a), Some(b)) => equals(a, b),
            _ => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::flush_sync;
    use futures::channel::oneshot;

    #[test]
    fn signal_get_and_set() {
        let signal = Signal::new(0);
        assert_eq!(signal.get(), 0);

        signal.set(42);
        assert_eq!(signal.get(), 42);
    }

    #[test]
    fn signal_update() {
        let signal = Signal::new(10);
        signal.update(|v| v + 5);
        assert_eq!(signal.get(), 15);
    }

    #[test]
    fn signal_copies_share_state() {
        let signal1 = Signal::new(0);
        let signal2 = signal1;

        signal1.set(42);
        assert_eq!(signal2.get(), 42);

        signal2.set(100);
        assert_eq!(signal1.get(), 100);
    }

    #[test]
    fn signal_ids_are_unique() {
        let s1 = Signal::new(0);
        let s2 = Signal::new(0);
        let s3 = Signal::new(0);

        assert_ne!(s1.id(), s2.id());
        assert_ne!(s2.id(), s3.id());
        assert_ne!(s1.id(), s3.id());
    }

    #[test]
    fn pending_value_settles_on_flush() {
        let (tx, rx) = oneshot::channel::<i32>();
        let signal = Signal::new(0);

        signal.set_future(async move { Ok(rx.await?) });
        assert!(signal.loading());
        // The previous value stays readable while pending.
        assert_eq!(signal.get(), 0);

        tx.send(5).expect("receiver alive");
        flush_sync();

        assert!(!signal.loading());
        assert_eq!(signal.get(), 5);
    }

    #[test]
    fn later_write_supersedes_pending_future() {
        let (tx, rx) = oneshot::channel::<i32>();
        let signal = Signal::new(0);

        signal.set_future(async move { Ok(rx.await?) });
        signal.set(7);
        assert!(!signal.loading());

        tx.send(99).expect("receiver alive");
        flush_sync();

        // The stale resolution must not clobber the direct write.
        assert_eq!(signal.get(), 7);
    }

    #[test]
    fn failed_future_latches_error() {
        let (tx, rx) = oneshot::channel::<i32>();
        let signal = Signal::new(0);

        signal.set_future(async move {
            let _ = rx.await;
            Err(anyhow::anyhow!("fetch failed"))
        });
        tx.send(0).expect("receiver alive");
        flush_sync();

        assert!(signal.error());
        assert!(signal.try_get().is_err());

        // A fresh write clears the latch.
        signal.set(3);
        assert!(!signal.error());
        assert_eq!(signal.get(), 3);
    }

    #[test]
    fn wait_raises_not_ready_while_pending() {
        let (_tx, rx) = oneshot::channel::<i32>();
        let signal = Signal::new(1);

        assert_eq!(signal.wait().expect("settled"), 1);

        signal.set_future(async move { Ok(rx.await?) });
        assert!(matches!(
            signal.wait(),
            Err(crate::error::CellError::NotReady)
        ));
    }
}
