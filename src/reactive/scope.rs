//! Ownership Scopes
//!
//! The owner tree is separate from the reactive graph: it governs
//! lifetimes and error-context lookup, nothing else. Every evaluation
//! runs with a *current owner*; any cell constructed during it becomes a
//! child of that owner and is torn down before the owner reruns or when
//! the owner's scope is disposed.
//!
//! Disposal ordering is LIFO within a scope and post-order across the
//! tree: children are disposed depth-first before the owner's own
//! callbacks run, and callbacks within one scope fire in reverse
//! registration order.

use std::any::TypeId;
use std::rc::Rc;

use crate::error::ErrorPayload;
use crate::graph::{NodeId, NodeKind};

use super::runtime::{dispose_node, with_engine};

/// Handle to a scope in the owner tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner(pub(crate) NodeId);

/// Disposer handle passed to the closure of [`create_root`].
#[derive(Debug, Clone, Copy)]
pub struct RootHandle {
    id: NodeId,
}

impl RootHandle {
    /// The root's owner, for re-entering the scope later.
    pub fn owner(&self) -> Owner {
        Owner(self.id)
    }

    /// Tear down everything created under this root.
    pub fn dispose(self) {
        dispose_node(self.id);
    }
}

/// Create a detached owner scope and run `f` under it, untracked.
///
/// The closure receives a [`RootHandle`]; nothing created inside the
/// root is disposed until the handle's `dispose` is called.
pub fn create_root<R>(f: impl FnOnce(RootHandle) -> R) -> R {
    let id = with_engine(|e| e.create_detached(NodeKind::Scope));
    let _guard = OwnerGuard::enter(Some(id), ObserverMode::Clear);
    f(RootHandle { id })
}

/// Run `f` with `owner` as the current owner, restoring the previous
/// owner on any exit.
pub fn with_owner<R>(owner: Owner, f: impl FnOnce() -> R) -> R {
    let _guard = OwnerGuard::enter(Some(owner.0), ObserverMode::Keep);
    f()
}

/// Run `f` without an observer: reads inside record no dependencies. The
/// current owner is retained.
pub fn untrack<R>(f: impl FnOnce() -> R) -> R {
    let _guard = OwnerGuard::enter_observer_only();
    f()
}

/// The owner evaluation is currently running under, if any.
pub fn current_owner() -> Option<Owner> {
    with_engine(|e| e.current_owner.map(Owner))
}

/// Register a disposal callback on the current owner.
///
/// Callbacks run in reverse registration order when the owner is
/// disposed or reruns. Fails silently when there is no current owner.
pub fn on_cleanup(cb: impl FnOnce() + 'static) {
    with_engine(|e| {
        if let Some(owner) = e.current_owner {
            e.add_cleanup(owner, Box::new(cb));
        }
    });
}

// ----------------------------------------------------------------------
// Context
// ----------------------------------------------------------------------

/// Install a context value on the current owner, visible to descendants
/// through [`use_context`].
pub fn provide_context<T: 'static>(value: T) {
    with_engine(|e| {
        if let Some(owner) = e.current_owner {
            e.set_context(owner, TypeId::of::<T>(), Rc::new(value));
        }
    });
}

/// Walk owner links upward returning the nearest provided `T`.
pub fn use_context<T: Clone + 'static>() -> Option<T> {
    with_engine(|e| {
        let start = e.current_owner?;
        let (_, entry) = e.lookup_context(start, TypeId::of::<T>())?;
        entry.downcast_ref::<T>().cloned()
    })
}

// ----------------------------------------------------------------------
// Error routing
// ----------------------------------------------------------------------

/// Context entry holding an installed error handler.
#[derive(Clone)]
struct ErrorHandler(Rc<dyn Fn(ErrorPayload) -> anyhow::Result<()>>);

/// Install `handler` in the context of a fresh child scope and run `f`
/// under it.
///
/// Errors raised by effects inside the scope route to the nearest
/// handler. A handler returning `Err` re-raises to the next outer
/// handler; with no handler left the error is a top-level failure.
pub fn catch_error<R>(
    f: impl FnOnce() -> R,
    handler: impl Fn(ErrorPayload) -> anyhow::Result<()> + 'static,
) -> R {
    let scope = with_engine(|e| e.create_node(NodeKind::Scope));
    with_engine(|e| {
        e.set_context(
            scope,
            TypeId::of::<ErrorHandler>(),
            Rc::new(ErrorHandler(Rc::new(handler))),
        );
    });
    with_owner(Owner(scope), f)
}

/// Route an effect error up the owner chain.
///
/// Finds the nearest installed handler starting at `origin`; if the
/// handler itself fails, the replacement error continues from the
/// handler's parent. With no handler the error is fatal.
pub(crate) fn handle_error(origin: NodeId, payload: ErrorPayload) {
    let mut start = Some(origin);
    let mut payload = payload;
    loop {
        let found = with_engine(|e| {
            let start = start?;
            e.lookup_context(start, TypeId::of::<ErrorHandler>())
        });
        let Some((owner, entry)) = found else {
            panic!("unhandled effect error: {payload}");
        };
        let handler = entry
            .downcast_ref::<ErrorHandler>()
            .expect("error-handler context entry has handler type")
            .clone();
        match (handler.0.as_ref())(payload.clone()) {
            Ok(()) => return,
            Err(err) => {
                payload = ErrorPayload::new(err);
                start = with_engine(|e| e.node(owner).and_then(|n| n.parent));
            }
        }
    }
}

// ----------------------------------------------------------------------
// Guards
// ----------------------------------------------------------------------

enum ObserverMode {
    /// Leave the current observer in place (`with_owner`).
    Keep,
    /// Clear the observer for the duration (`create_root`).
    Clear,
}

/// Restores the previous owner (and observer, where cleared) on drop,
/// normal exit and unwinding alike.
struct OwnerGuard {
    saved_owner: Option<NodeId>,
    saved_observer: Option<Option<NodeId>>,
}

impl OwnerGuard {
    fn enter(owner: Option<NodeId>, mode: ObserverMode) -> Self {
        with_engine(|e| {
            let saved_owner = std::mem::replace(&mut e.current_owner, owner);
            let saved_observer = match mode {
                ObserverMode::Keep => None,
                ObserverMode::Clear => Some(e.current_observer.take()),
            };
            Self {
                saved_owner,
                saved_observer,
            }
        })
    }

    fn enter_observer_only() -> Self {
        with_engine(|e| Self {
            saved_owner: e.current_owner,
            saved_observer: Some(e.current_observer.take()),
        })
    }
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        let saved_owner = self.saved_owner;
        let saved_observer = self.saved_observer.take();
        with_engine(|e| {
            e.current_owner = saved_owner;
            if let Some(observer) = saved_observer {
                e.current_observer = observer;
            }
        });
    }
}
