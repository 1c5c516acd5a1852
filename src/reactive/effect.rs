//! Effect Implementation
//!
//! An Effect is a side-effecting computation that reruns whenever its
//! dependencies change.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs immediately to establish its initial
//!    dependencies.
//!
//! 2. When any dependency changes, the effect enqueues itself on the
//!    pending queue (once per cycle).
//!
//! 3. [`flush_sync`](crate::reactive::flush_sync) drains the queue.
//!    Before rerunning, the effect's previous run is torn down: cells it
//!    created are disposed and its cleanups fire.
//!
//! # Differences from Memo
//!
//! - Memos return a value; effects do not, and nothing observes them.
//! - Memos are lazy (compute on access); effects are eager (queued on
//!   notification).
//! - An error inside an effect is not latched: it routes through the
//!   owner chain to the nearest [`catch_error`](crate::reactive::catch_error)
//!   handler, and is a top-level failure if none is installed.
//!
//! # Ownership
//!
//! The handle does not own the cell: dropping an `Effect` changes
//! nothing. The effect lives until its owning scope is disposed.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{CellError, ErrorPayload};
use crate::graph::{ComputeFn, ComputeOutcome, NodeId, NodeKind};

use super::runtime;

/// A side-effecting computation that reruns when its dependencies change.
///
/// # Example
///
/// ```rust,ignore
/// let count = Signal::new(0);
///
/// Effect::new(move || {
///     println!("count is {}", count.get());
/// });
///
/// count.set(5);
/// flush_sync(); // prints "count is 5"
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Effect {
    id: NodeId,
}

impl Effect {
    /// Create an effect. Runs immediately, then on every flush where a
    /// dependency changed.
    pub fn new(f: impl FnMut() + 'static) -> Self {
        let f = RefCell::new(f);
        Self::create(Rc::new(move |_| {
            (&mut *f.borrow_mut())();
            ComputeOutcome::Ready(Rc::new(()))
        }))
    }

    /// Create an effect with a fallible body.
    ///
    /// An `Err` routes through the owner chain to the nearest error
    /// handler. A [`CellError::NotReady`] propagated out of the body
    /// (from `wait` on a loading source) is absorbed; the effect reruns
    /// when the source settles.
    pub fn try_new(f: impl FnMut() -> anyhow::Result<()> + 'static) -> Self {
        let f = RefCell::new(f);
        Self::create(Rc::new(move |_| match (&mut *f.borrow_mut())() {
            Ok(()) => ComputeOutcome::Ready(Rc::new(())),
            Err(err) => match err.downcast_ref::<CellError>() {
                Some(CellError::NotReady) => ComputeOutcome::NotReady,
                _ => ComputeOutcome::Failed(ErrorPayload::new(err)),
            },
        }))
    }

    fn create(compute: ComputeFn) -> Self {
        let id = runtime::with_engine(|e| {
            let id = e.create_node(NodeKind::Effect);
            let node = e.node_mut(id).expect("freshly created node exists");
            node.compute = Some(compute);
            // Effects have no observers; the unit result never notifies.
            node.equals = Some(Rc::new(|_, _| true));
            id
        });
        let _ = runtime::update_if_necessary(id);
        Self { id }
    }

    /// The cell's unique ID.
    pub fn id(&self) -> NodeId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{create_root, flush_sync, on_cleanup, Signal};
    use std::cell::Cell;

    #[test]
    fn effect_runs_on_creation() {
        let runs = Rc::new(Cell::new(0));
        let runs_inner = runs.clone();

        let _effect = Effect::new(move || {
            runs_inner.set(runs_inner.get() + 1);
        });

        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn effect_reruns_on_flush_after_change() {
        let signal = Signal::new(0);
        let seen = Rc::new(Cell::new(-1));
        let seen_inner = seen.clone();

        let _effect = Effect::new(move || {
            seen_inner.set(signal.get());
        });
        assert_eq!(seen.get(), 0);

        signal.set(42);
        // Not yet: effects rerun at flush, not at write.
        assert_eq!(seen.get(), 0);

        flush_sync();
        assert_eq!(seen.get(), 42);
    }

    #[test]
    fn effect_runs_once_per_flush_cycle() {
        let a = Signal::new(0);
        let b = Signal::new(0);
        let runs = Rc::new(Cell::new(0));
        let runs_inner = runs.clone();

        let _effect = Effect::new(move || {
            let _ = a.get() + b.get();
            runs_inner.set(runs_inner.get() + 1);
        });
        assert_eq!(runs.get(), 1);

        // Two writes in the same tick, one rerun.
        a.set(1);
        b.set(2);
        flush_sync();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn unchanged_write_does_not_rerun_effect() {
        let signal = Signal::new(5);
        let runs = Rc::new(Cell::new(0));
        let runs_inner = runs.clone();

        let _effect = Effect::new(move || {
            let _ = signal.get();
            runs_inner.set(runs_inner.get() + 1);
        });
        assert_eq!(runs.get(), 1);

        signal.set(5);
        flush_sync();
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn effect_cleanup_fires_before_rerun() {
        let signal = Signal::new(0);
        let cleanups = Rc::new(Cell::new(0));
        let cleanups_inner = cleanups.clone();

        create_root(|root| {
            let _effect = Effect::new(move || {
                let _ = signal.get();
                let cleanups = cleanups_inner.clone();
                on_cleanup(move || cleanups.set(cleanups.get() + 1));
            });
            assert_eq!(cleanups.get(), 0);

            signal.set(1);
            flush_sync();
            // Rerun tore down the previous run first.
            assert_eq!(cleanups.get(), 1);

            root.dispose();
        });
        assert_eq!(cleanups.get(), 2);
    }

    #[test]
    fn effect_error_routes_to_handler() {
        use crate::reactive::catch_error;

        let signal = Signal::new(0);
        let caught = Rc::new(Cell::new(0));
        let caught_inner = caught.clone();

        create_root(|_| {
            catch_error(
                move || {
                    let _effect = Effect::try_new(move || {
                        if signal.get() == 1 {
                            Err(anyhow::anyhow!("effect failed"))
                        } else {
                            Ok(())
                        }
                    });
                },
                move |_err| {
                    caught_inner.set(caught_inner.get() + 1);
                    Ok(())
                },
            );
        });
        assert_eq!(caught.get(), 0);

        signal.set(1);
        flush_sync();
        assert_eq!(caught.get(), 1);
    }
}
