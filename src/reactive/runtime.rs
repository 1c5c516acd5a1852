//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects signals, memos,
//! and effects. It owns the thread-local propagation engine, drives
//! pull-validation and recomputation, resolves pending futures on a
//! cooperative executor, and drains the effect queue.
//!
//! # How It Works
//!
//! 1. A write pushes marks down the graph: direct observers become
//!    `Dirty`, transitive observers `Check`. Nothing is evaluated.
//!
//! 2. A read pulls: if the cell is not `Clean`, its sources are validated
//!    in order, and the cell recomputes only if one of them actually
//!    changed.
//!
//! 3. Effects are the only eagerly rerun cells. They enqueue when marked
//!    and rerun during [`flush_sync`], ancestors before descendants.
//!
//! # Borrow discipline
//!
//! The engine lives in a thread-local `RefCell`. Every borrow in this
//! module is short and released before any user code runs: computations,
//! cleanups, equality aside, and error handlers all execute with the
//! engine free, so they can read and create cells re-entrantly.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use futures::executor::{LocalPool, LocalSpawner};
use futures::future::LocalBoxFuture;
use futures::task::LocalSpawnExt;
use tracing::{debug, trace, warn};

use crate::error::{CellError, ErrorPayload, Result};
use crate::graph::{CellState, Engine, NodeId, NodeKind, Scratch};

use super::scope;

thread_local! {
    static ENGINE: RefCell<Engine> = RefCell::new(Engine::new());
    static EXECUTOR: RefCell<LocalPool> = RefCell::new(LocalPool::new());
    static SPAWNER: LocalSpawner = EXECUTOR.with(|pool| pool.borrow().spawner());
}

/// Run `f` with the engine borrowed. The closure must not call back into
/// user code; orchestration that does lives in the free functions below.
pub(crate) fn with_engine<R>(f: impl FnOnce(&mut Engine) -> R) -> R {
    ENGINE.with(|engine| f(&mut engine.borrow_mut()))
}

/// Number of live nodes, side-channel gates included. Test hook.
pub fn node_count() -> usize {
    with_engine(|e| e.node_count())
}

// ----------------------------------------------------------------------
// Reads
// ----------------------------------------------------------------------

/// Tracked read of a cell's value.
///
/// Validates first when the cell has a computation, records the
/// dependency, folds the cell's loading state into the running
/// evaluation, and raises a latched error.
pub(crate) fn read_with<R>(id: NodeId, f: impl FnOnce(&dyn Any) -> R) -> Result<R> {
    let has_compute = with_engine(|e| match e.node(id) {
        Some(n) => Ok(n.compute.is_some()),
        None => Err(CellError::Disposed),
    })?;
    if has_compute {
        update_if_necessary(id)?;
    }
    with_engine(|e| {
        e.track_read(id);
        let (loading, error, value) = match e.node(id) {
            Some(n) => (n.is_loading(), n.error.clone(), n.value.clone()),
            None => return Err(CellError::Disposed),
        };
        if loading && e.current_observer.is_some() {
            e.scratch.loading = true;
        }
        if let Some(payload) = error {
            return Err(CellError::Computation(payload));
        }
        match value {
            Some(v) => Ok(f(v.as_ref())),
            None => Err(CellError::NotReady),
        }
    })
}

/// Untracked read: same checks as [`read_with`], no dependency recorded
/// and no loading fold-in.
pub(crate) fn peek_with<R>(id: NodeId, f: impl FnOnce(&dyn Any) -> R) -> Result<R> {
    with_engine(|e| {
        let node = e.node(id).ok_or(CellError::Disposed)?;
        if let Some(payload) = node.error.clone() {
            return Err(CellError::Computation(payload));
        }
        match &node.value {
            Some(v) => Ok(f(v.as_ref())),
            None => Err(CellError::NotReady),
        }
    })
}

/// Like [`read_with`], but raises the `NotReady` sentinel while the cell
/// is loading and subscribes the caller to the loading channel so
/// resolution re-triggers it.
pub(crate) fn wait_with<R>(id: NodeId, f: impl FnOnce(&dyn Any) -> R) -> Result<R> {
    let has_compute = with_engine(|e| match e.node(id) {
        Some(n) => Ok(n.compute.is_some()),
        None => Err(CellError::Disposed),
    })?;
    if has_compute {
        update_if_necessary(id)?;
    }
    let loading = with_engine(|e| e.node(id).map(|n| n.is_loading()).ok_or(CellError::Disposed))?;
    if loading {
        with_engine(|e| {
            e.track_read(id);
            if e.current_observer.is_some() {
                e.scratch.loading = true;
                if let Some(gate) = e.loading_gate_of(id) {
                    e.track_read(gate);
                }
            }
        });
        return Err(CellError::NotReady);
    }
    read_with(id, f)
}

/// Tracked read of the loading channel: subscribes to the loading gate
/// only, so value changes never invalidate the caller.
pub(crate) fn read_loading(id: NodeId) -> Result<bool> {
    validate_origin(id)?;
    with_engine(|e| {
        let gate = e.loading_gate_of(id).ok_or(CellError::Disposed)?;
        e.track_read(gate);
        Ok(e.is_loading(id))
    })
}

/// Tracked read of the error channel. Returns the boolean without
/// raising the stored payload.
pub(crate) fn read_error(id: NodeId) -> Result<bool> {
    validate_origin(id)?;
    with_engine(|e| {
        let gate = e.error_gate_of(id).ok_or(CellError::Disposed)?;
        e.track_read(gate);
        Ok(e.node(id).is_some_and(|n| n.is_errored()))
    })
}

/// Side-channel reads still force the origin current: a derived cell that
/// never evaluated has not produced its future or error yet.
fn validate_origin(id: NodeId) -> Result<()> {
    let has_compute = with_engine(|e| match e.node(id) {
        Some(n) => Ok(n.compute.is_some()),
        None => Err(CellError::Disposed),
    })?;
    if has_compute {
        update_if_necessary(id)?;
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Writes
// ----------------------------------------------------------------------

/// Commit a settled value to a leaf cell.
pub(crate) fn write(id: NodeId, value: Rc<dyn Any>) {
    with_engine(|e| {
        debug_assert!(
            !observer_is_derived(e),
            "writing a cell inside a derived computation is undefined"
        );
        e.commit_write(id, value);
    });
}

fn observer_is_derived(engine: &Engine) -> bool {
    engine
        .current_observer
        .and_then(|o| engine.node(o))
        .is_some_and(|n| n.kind == NodeKind::Derived)
}

/// Accept a pending future for a cell. The resolution is dispatched as a
/// cooperative task and applies only if it has not been superseded by a
/// later write or future in the meantime.
pub(crate) fn accept_future(
    id: NodeId,
    fut: LocalBoxFuture<'static, std::result::Result<Rc<dyn Any>, ErrorPayload>>,
) {
    let Some(epoch) = with_engine(|e| e.begin_pending(id)) else {
        return;
    };
    let task = async move {
        let result = fut.await;
        if !with_engine(|e| e.pending_is_current(id, epoch)) {
            trace!(id = id.raw(), epoch, "stale future resolution ignored");
            return;
        }
        match result {
            Ok(value) => {
                with_engine(|e| {
                    e.commit_write(id, value);
                });
            }
            Err(payload) => with_engine(|e| e.set_error(id, payload)),
        }
    };
    let spawned = SPAWNER.with(|spawner| spawner.spawn_local(task));
    if let Err(err) = spawned {
        warn!(id = id.raw(), %err, "failed to dispatch future resolution");
    }
}

// ----------------------------------------------------------------------
// Validation and recomputation
// ----------------------------------------------------------------------

/// Pull-validate a node: make its value current, recomputing only if a
/// source actually changed. Returns whether the node is loading.
pub(crate) fn update_if_necessary(id: NodeId) -> Result<bool> {
    let (state, kind) = with_engine(|e| (e.state(id), e.node(id).map(|n| n.kind)));
    match state {
        CellState::Disposed => return Err(CellError::Disposed),
        CellState::Clean => return Ok(with_engine(|e| e.is_loading(id))),
        CellState::Check | CellState::Dirty => {}
    }

    // A gate projects its origin: validating the gate validates the
    // origin, which fires the gate's own Dirty marks on transitions.
    if let Some(NodeKind::Gate { origin }) = kind {
        let _ = update_if_necessary(origin);
        with_engine(|e| {
            if let Some(n) = e.node_mut(id) {
                n.state = CellState::Clean;
            }
        });
        return Ok(false);
    }

    if state == CellState::Check {
        let sources = with_engine(|e| e.node(id).map(|n| n.sources.clone()).unwrap_or_default());
        let mut any_loading = false;
        for source in sources {
            if let Ok(loading) = update_if_necessary(source) {
                any_loading |= loading;
            }
            // A source discovered a change and promoted us; the remaining
            // sources may not even be read by the new evaluation.
            if with_engine(|e| e.state(id)) == CellState::Dirty {
                break;
            }
        }
        if with_engine(|e| e.state(id)) == CellState::Dirty {
            run_update(id)?;
        } else {
            with_engine(|e| {
                if let Some(n) = e.node_mut(id) {
                    n.state = CellState::Clean;
                }
                e.update_waiting(id, any_loading);
            });
        }
    } else {
        run_update(id)?;
    }
    Ok(with_engine(|e| e.is_loading(id)))
}

/// Rerun a node's computation: tear down the previous run's scope,
/// evaluate under a fresh tracking frame, commit the outcome, and swap in
/// the new source set.
pub(crate) fn run_update(id: NodeId) -> Result<()> {
    use crate::graph::ComputeOutcome;

    let taken = with_engine(|e| {
        e.node_mut(id).map(|n| {
            (
                std::mem::take(&mut n.children),
                std::mem::take(&mut n.cleanups),
            )
        })
    });
    let Some((children, cleanups)) = taken else {
        return Err(CellError::Disposed);
    };
    for child in children.into_iter().rev() {
        dispose_node(child);
    }
    for cleanup in cleanups.into_iter().rev() {
        cleanup();
    }

    let (compute, prev) = with_engine(|e| match e.node(id) {
        Some(n) => (n.compute.clone(), n.value.clone()),
        None => (None, None),
    });
    let Some(compute) = compute else {
        with_engine(|e| {
            if let Some(n) = e.node_mut(id) {
                n.state = CellState::Clean;
            }
        });
        return Ok(());
    };

    trace!(id = id.raw(), "rerun");
    let guard = FrameGuard::enter(id);
    let outcome = (compute.as_ref())(prev.as_deref());
    let scratch = guard.finish();

    // The node may have disposed itself through its own owner; committing
    // against a missing record is a no-op either way.
    let kind = with_engine(|e| e.node(id).map(|n| n.kind));
    let mut routed_error = None;
    match outcome {
        ComputeOutcome::Ready(value) => {
            with_engine(|e| {
                e.commit_write(id, value);
            });
        }
        ComputeOutcome::Failed(payload) => {
            if kind == Some(NodeKind::Effect) {
                // Effects are terminal: errors surface through the owner
                // chain once the graph is consistent again.
                routed_error = Some(payload);
            } else {
                with_engine(|e| e.set_error(id, payload));
            }
        }
        ComputeOutcome::NotReady => {
            // Previous value retained; the loading subscription recorded
            // by `wait` re-triggers this node on resolution.
        }
        ComputeOutcome::Pending(fut) => accept_future(id, fut),
    }
    with_engine(|e| e.commit_sources(id, scratch));
    if let Some(payload) = routed_error {
        scope::handle_error(id, payload);
    }
    Ok(())
}

/// Saved evaluation state, restored even when a computation unwinds.
struct FrameGuard {
    saved: Option<(Option<NodeId>, Option<NodeId>, Scratch)>,
}

impl FrameGuard {
    fn enter(id: NodeId) -> Self {
        let saved = with_engine(|e| {
            let owner = e.current_owner.replace(id);
            let observer = e.current_observer.replace(id);
            let scratch = std::mem::take(&mut e.scratch);
            (owner, observer, scratch)
        });
        Self { saved: Some(saved) }
    }

    /// Restore the saved state and hand back this run's scratch.
    fn finish(mut self) -> Scratch {
        let (owner, observer, scratch) = self.saved.take().expect("frame finished twice");
        with_engine(|e| {
            e.current_owner = owner;
            e.current_observer = observer;
            std::mem::replace(&mut e.scratch, scratch)
        })
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if let Some((owner, observer, scratch)) = self.saved.take() {
            with_engine(|e| {
                e.current_owner = owner;
                e.current_observer = observer;
                e.scratch = scratch;
            });
        }
    }
}

// ----------------------------------------------------------------------
// Disposal
// ----------------------------------------------------------------------

/// Dispose a node and its subtree: children depth-first in reverse
/// creation order, then the node's own cleanups in reverse registration
/// order, then edge teardown.
pub(crate) fn dispose_node(id: NodeId) {
    let taken = with_engine(|e| {
        e.node_mut(id).map(|n| {
            n.state = CellState::Disposed;
            (
                std::mem::take(&mut n.children),
                std::mem::take(&mut n.cleanups),
            )
        })
    });
    let Some((children, cleanups)) = taken else {
        return;
    };
    trace!(id = id.raw(), "dispose");
    for child in children.into_iter().rev() {
        dispose_node(child);
    }
    for cleanup in cleanups.into_iter().rev() {
        cleanup();
    }
    with_engine(|e| {
        e.unlink(id);
        e.remove(id);
    });
}

// ----------------------------------------------------------------------
// Effect flushing
// ----------------------------------------------------------------------

/// Drain the effect queue synchronously.
///
/// Each pass first drives the cooperative executor so settled futures
/// commit their values, then validates every queued effect down its
/// non-clean owner-ancestor chain, so a parent effect reruns before its
/// children even when both are dirty in the same cycle. Re-entrant calls
/// while a flush is running are no-ops.
pub fn flush_sync() {
    let already = with_engine(|e| std::mem::replace(&mut e.flushing, true));
    if already {
        return;
    }
    struct FlushReset;
    impl Drop for FlushReset {
        fn drop(&mut self) {
            with_engine(|e| e.flushing = false);
        }
    }
    let _reset = FlushReset;

    loop {
        run_executor();
        let queue = with_engine(|e| e.take_pending_effects());
        if queue.is_empty() {
            break;
        }
        debug!(count = queue.len(), "flushing effects");
        for id in queue {
            match with_engine(|e| e.state(id)) {
                // Validated transitively by an earlier effect, or gone.
                CellState::Clean | CellState::Disposed => continue,
                CellState::Check | CellState::Dirty => {}
            }
            for ancestor in with_engine(|e| e.ancestor_chain(id)) {
                let _ = update_if_necessary(ancestor);
            }
        }
    }
}

fn run_executor() {
    EXECUTOR.with(|pool| {
        if let Ok(mut pool) = pool.try_borrow_mut() {
            pool.run_until_stalled();
        }
    });
}
