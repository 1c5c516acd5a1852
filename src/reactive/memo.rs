//! Memo Implementation
//!
//! A Memo is a cached derived value that re-evaluates only when its
//! inputs change.
//!
//! # How Memos Work
//!
//! 1. On first access, the memo runs its computation, recording every
//!    cell it reads as a source.
//!
//! 2. A write upstream marks the memo (`Dirty` when a direct source
//!    changed, `Check` when only a transitive one might have).
//!
//! 3. On next access, a `Check` memo validates its sources in order and
//!    recomputes only if one of them actually produced a different value.
//!
//! 4. Computations with a stable dependency set reuse their source list
//!    allocation run over run.
//!
//! The computation receives the memo's previous value (`None` on the
//! first run), which makes reducer-style memos possible; pure memos can
//! ignore the argument.
//!
//! # Errors and pending values
//!
//! [`Memo::try_new`] accepts a fallible computation: an `Err` is latched
//! on the cell and re-raised on every read until a later run succeeds.
//! [`Memo::new_async`] accepts a computation that may return a pending
//! value ([`Eval::Pending`]); while it is unresolved the memo reports
//! `loading()` and keeps its previous value.

use std::any::Any;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture};

use crate::error::{CellError, ErrorPayload, Result};
use crate::graph::{ComputeFn, ComputeOutcome, EqualsFn, NodeId, NodeKind};

use super::runtime;
use super::signal::{clone_value, erase_equals};

/// What an asynchronous computation produced: a settled value or a
/// pending one.
pub enum Eval<T> {
    /// The value is available now.
    Ready(T),
    /// The value arrives when the future settles.
    Pending(LocalBoxFuture<'static, anyhow::Result<T>>),
}

impl<T> Eval<T> {
    /// Box a future as a pending value.
    pub fn pending(fut: impl std::future::Future<Output = anyhow::Result<T>> + 'static) -> Self {
        Eval::Pending(fut.boxed_local())
    }
}

impl<T> From<T> for Eval<T> {
    fn from(value: T) -> Self {
        Eval::Ready(value)
    }
}

/// A cached derived value that recomputes only when its inputs change.
///
/// A `Memo<T>` handle is `Copy`; all copies address the same cell.
pub struct Memo<T> {
    id: NodeId,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone + 'static> Memo<T> {
    /// Create a memo using `==` as the early-cutoff predicate.
    ///
    /// The computation receives the previous value, `None` on the first
    /// run. It is not run until the memo is first read.
    pub fn new(f: impl Fn(Option<&T>) -> T + 'static) -> Self
    where
        T: PartialEq,
    {
        Self::with_equals(f, |prev, next| prev == next)
    }

    /// Create a memo with a custom equality predicate. The predicate
    /// must not read cells.
    pub fn with_equals(
        f: impl Fn(Option<&T>) -> T + 'static,
        equals: impl Fn(&T, &T) -> bool + 'static,
    ) -> Self {
        Self::create(erase_infallible(f), Some(erase_equals(equals)))
    }

    /// Create a memo whose observers are marked on every recomputation.
    pub fn never_equal(f: impl Fn(Option<&T>) -> T + 'static) -> Self {
        Self::create(erase_infallible(f), None)
    }

    /// Create a memo with a fallible computation.
    ///
    /// An `Err` is latched: reads raise the payload until a later run
    /// succeeds. A [`CellError::NotReady`] propagated out of the
    /// computation (from [`wait`](Self::wait) on a loading source) is
    /// absorbed instead, keeping the previous value.
    pub fn try_new(f: impl Fn(Option<&T>) -> anyhow::Result<T> + 'static) -> Self
    where
        T: PartialEq,
    {
        Self::create(
            erase_fallible(f),
            Some(erase_equals(|prev: &T, next: &T| prev == next)),
        )
    }

    /// Create a memo whose computation may return a pending value.
    ///
    /// While the returned future is unresolved the memo reports
    /// `loading()` and keeps its previous value; a resolution superseded
    /// by a later rerun is ignored.
    pub fn new_async(f: impl Fn(Option<&T>) -> Eval<T> + 'static) -> Self
    where
        T: PartialEq,
    {
        Self::create(
            erase_async(f),
            Some(erase_equals(|prev: &T, next: &T| prev == next)),
        )
    }

    fn create(compute: ComputeFn, equals: Option<EqualsFn>) -> Self {
        let id = runtime::with_engine(|e| {
            let id = e.create_node(NodeKind::Derived);
            let node = e.node_mut(id).expect("freshly created node exists");
            node.compute = Some(compute);
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

    /// Get the current value, validating (and recomputing if needed)
    /// first.
    ///
    /// # Panics
    ///
    /// Panics when the cell is disposed, carries a latched error, or has
    /// no value yet because its very first computation is still pending;
    /// use [`try_get`](Self::try_get) for error-aware reads.
    pub fn get(&self) -> T {
        match self.try_get() {
            Ok(value) => value,
            Err(err) => panic!("memo read failed: {err}"),
        }
    }

    /// Get the current value, surfacing disposal, a latched error, or a
    /// not-yet-resolved first value.
    pub fn try_get(&self) -> Result<T> {
        runtime::read_with(self.id, clone_value::<T>)
    }

    /// Get the current value without recording a dependency. The memo is
    /// still validated first.
    pub fn get_untracked(&self) -> T {
        super::scope::untrack(|| self.get())
    }

    /// Untracked, error-aware read. The memo is still validated first.
    pub fn try_get_untracked(&self) -> Result<T> {
        super::scope::untrack(|| self.try_get())
    }

    /// Like [`try_get`](Self::try_get), but raises
    /// [`CellError::NotReady`] while the memo is loading and subscribes
    /// the caller to the loading channel. Inside a computation,
    /// propagate the sentinel with `?` to keep the previous value.
    pub fn wait(&self) -> Result<T> {
        runtime::wait_with(self.id, clone_value::<T>)
    }

    /// Whether the value depends on an unresolved future, its own or an
    /// upstream one. Tracked through the loading channel only.
    pub fn loading(&self) -> bool {
        match runtime::read_loading(self.id) {
            Ok(loading) => loading,
            Err(err) => panic!("memo read failed: {err}"),
        }
    }

    /// Whether a computation error is latched. Tracked through the error
    /// channel; returns the boolean without raising the payload.
    pub fn error(&self) -> bool {
        match runtime::read_error(self.id) {
            Ok(errored) => errored,
            Err(err) => panic!("memo read failed: {err}"),
        }
    }
}

impl<T> Clone for Memo<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Memo<T> {}

impl<T: Clone + Debug + 'static> Debug for Memo<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memo").field("id", &self.id.raw()).finish()
    }
}

// ----------------------------------------------------------------------
// Computation erasure
// ----------------------------------------------------------------------

fn downcast_prev<T: 'static>(prev: Option<&dyn Any>) -> Option<&T> {
    prev.and_then(|p| p.downcast_ref::<T>())
}

fn erase_infallible<T: Clone + 'static>(f: impl Fn(Option<&T>) -> T + 'static) -> ComputeFn {
    Rc::new(move |prev| ComputeOutcome::Ready(Rc::new(f(downcast_prev(prev)))))
}

fn erase_fallible<T: Clone + 'static>(
    f: impl Fn(Option<&T>) -> anyhow::Result<T> + 'static,
) -> ComputeFn {
    Rc::new(move |prev| match f(downcast_prev(prev)) {
        Ok(value) => ComputeOutcome::Ready(Rc::new(value)),
        Err(err) => match err.downcast_ref::<CellError>() {
            Some(CellError::NotReady) => ComputeOutcome::NotReady,
            _ => ComputeOutcome::Failed(ErrorPayload::new(err)),
        },
    })
}

fn erase_async<T: Clone + 'static>(f: impl Fn(Option<&T>) -> Eval<T> + 'static) -> ComputeFn {
    Rc::new(move |prev| match f(downcast_prev(prev)) {
        Eval::Ready(value) => ComputeOutcome::Ready(Rc::new(value)),
        Eval::Pending(fut) => ComputeOutcome::Pending(
            fut.map(|result| {
                result
                    .map(|value| Rc::new(value) as Rc<dyn Any>)
                    .map_err(ErrorPayload::new)
            })
            .boxed_local(),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{flush_sync, Signal};
    use futures::channel::oneshot;
    use std::cell::Cell;

    #[test]
    fn memo_computes_on_first_access() {
        let runs = Rc::new(Cell::new(0));
        let runs_inner = runs.clone();

        let memo = Memo::new(move |_| {
            runs_inner.set(runs_inner.get() + 1);
            42
        });

        // Lazy: nothing ran yet.
        assert_eq!(runs.get(), 0);

        assert_eq!(memo.get(), 42);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn memo_caches_value_when_clean() {
        let runs = Rc::new(Cell::new(0));
        let runs_inner = runs.clone();

        let memo = Memo::new(move |_| {
            runs_inner.set(runs_inner.get() + 1);
            42
        });

        assert_eq!(memo.get(), 42);
        assert_eq!(memo.get(), 42);
        assert_eq!(memo.get(), 42);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn memo_tracks_signal_dependency() {
        let signal = Signal::new(10);
        let memo = Memo::new(move |_| signal.get() * 2);

        assert_eq!(memo.get(), 20);

        signal.set(5);
        assert_eq!(memo.get(), 10);
    }

    #[test]
    fn memo_depends_on_memo() {
        let base = Signal::new(5);
        let doubled = Memo::new(move |_| base.get() * 2);
        let plus_ten = Memo::new(move |_| doubled.get() + 10);

        assert_eq!(doubled.get(), 10);
        assert_eq!(plus_ten.get(), 20);

        base.set(10);
        assert_eq!(doubled.get(), 20);
        assert_eq!(plus_ten.get(), 30);
    }

    #[test]
    fn unchanged_source_skips_recompute() {
        let runs = Rc::new(Cell::new(0));
        let runs_inner = runs.clone();

        let signal = Signal::new(4);
        // Parity collapses many inputs to one output.
        let parity = Memo::new(move |_| signal.get() % 2);
        let observer = Memo::new(move |_| {
            runs_inner.set(runs_inner.get() + 1);
            parity.get() * 100
        });

        assert_eq!(observer.get(), 0);
        assert_eq!(runs.get(), 1);

        // Parity unchanged: the downstream memo validates without rerun.
        signal.set(6);
        assert_eq!(observer.get(), 0);
        assert_eq!(runs.get(), 1);

        signal.set(7);
        assert_eq!(observer.get(), 100);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn memo_receives_previous_value() {
        let signal = Signal::new(1);
        // A reducer: accumulates every observed value.
        let total = Memo::new(move |prev: Option<&i32>| prev.copied().unwrap_or(0) + signal.get());

        assert_eq!(total.get(), 1);

        signal.set(10);
        assert_eq!(total.get(), 11);

        signal.set(5);
        assert_eq!(total.get(), 16);
    }

    #[test]
    fn stable_dependency_sets_reuse_the_source_list() {
        let a = Signal::new(1);
        let b = Signal::new(2);
        let sum = Memo::never_equal(move |_| a.get() + b.get());
        assert_eq!(sum.get(), 3);

        let before = super::runtime::with_engine(|e| {
            e.node(sum.id()).expect("memo exists").sources.as_ptr()
        });
        a.set(10);
        assert_eq!(sum.get(), 12);
        let after = super::runtime::with_engine(|e| {
            e.node(sum.id()).expect("memo exists").sources.as_ptr()
        });

        // Same reads in the same order: the source list is untouched.
        assert_eq!(before, after);
    }

    #[test]
    fn try_memo_latches_and_recovers() {
        let signal = Signal::new(1);
        let memo = Memo::try_new(move |_| {
            let v = signal.get();
            if v == 1 {
                Err(anyhow::anyhow!("one is not allowed"))
            } else {
                Ok(v * 2)
            }
        });

        assert!(memo.try_get().is_err());
        assert!(memo.error());

        signal.set(2);
        assert_eq!(memo.get(), 4);
        assert!(!memo.error());
    }

    #[test]
    fn error_propagates_through_readers() {
        let signal = Signal::new(1);
        let failing = Memo::try_new(move |_| {
            if signal.get() == 1 {
                Err(anyhow::anyhow!("bad state"))
            } else {
                Ok(2)
            }
        });
        let reader = Memo::try_new(move |_| Ok(failing.try_get()? + 1));

        assert!(reader.try_get().is_err());

        signal.set(2);
        assert_eq!(reader.get(), 3);
    }

    #[test]
    fn async_memo_loads_then_settles() {
        let (tx, rx) = oneshot::channel::<i32>();
        let rx = Rc::new(Cell::new(Some(rx)));
        let memo = Memo::new_async(move |_| {
            let rx = rx.take().expect("single evaluation");
            Eval::pending(async move { Ok(rx.await?) })
        });

        assert!(memo.loading());
        assert!(matches!(memo.try_get(), Err(CellError::NotReady)));

        tx.send(9).expect("receiver alive");
        flush_sync();

        assert!(!memo.loading());
        assert_eq!(memo.get(), 9);
    }

    #[test]
    fn wait_short_circuits_and_retains_previous() {
        let (tx, rx) = oneshot::channel::<i32>();
        let rx = Rc::new(Cell::new(Some(rx)));
        let gate = Signal::new(false);

        let upstream = Memo::new_async(move |_| {
            if gate.get() {
                let rx = rx.take().expect("single pending evaluation");
                Eval::pending(async move { Ok(rx.await?) })
            } else {
                Eval::Ready(1)
            }
        });
        let downstream = Memo::try_new(move |_| Ok(upstream.wait()? * 10));

        assert_eq!(downstream.get(), 10);

        // Upstream goes pending: downstream keeps its previous value and
        // reports loading.
        gate.set(true);
        assert_eq!(downstream.get(), 10);
        assert!(downstream.loading());

        tx.send(4).expect("receiver alive");
        flush_sync();

        assert_eq!(downstream.get(), 40);
        assert!(!downstream.loading());
    }
}
