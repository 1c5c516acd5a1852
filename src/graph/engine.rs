//! Propagation Engine
//!
//! The engine owns every node in the dependency graph and implements the
//! primitive graph operations: dependency recording, push-marking after a
//! write, early-cutoff commits, loading/error transitions, and the
//! pending-effect queue.
//!
//! # Push-pull
//!
//! Writes push: `notify` walks observer edges marking descendants `Check`
//! (direct observers `Dirty`) without evaluating anything. Reads pull:
//! validation and recomputation live in the runtime layer
//! (`reactive::runtime`), which drives these primitives with short,
//! non-reentrant borrows so user computations never run while the engine
//! is held.
//!
//! # Design Decisions
//!
//! 1. A centralized store (`HashMap<NodeId, Node>`) rather than
//!    distributed linked nodes: ids are plain copyable handles, back-edges
//!    cannot dangle (a stale id misses the map), and disposal is a map
//!    removal.
//!
//! 2. Source lists are ordered and rebuilt with a retained-prefix scratch
//!    so computations with stable dependency sets allocate nothing.
//!
//! 3. Observer lists are unordered; removal swaps the last element into
//!    the freed slot.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::rc::Rc;

use tracing::trace;

use super::node::{CellState, Node, NodeId, NodeKind, StateFlags};
use crate::error::ErrorPayload;

/// Dependency-recording scratch for the evaluation in progress.
///
/// While a computation runs, reads compare against the node's previous
/// source list: as long as they match in order, only `index` advances.
/// The first mismatch starts accumulating into `new_sources`, and the
/// retained prefix plus the accumulated tail replace the old list when
/// the evaluation commits.
#[derive(Debug, Default)]
pub struct Scratch {
    /// Sources read after the first divergence from the previous run.
    pub new_sources: Vec<NodeId>,
    /// Length of the retained prefix of the previous source list.
    pub index: usize,
    /// Whether any source read so far was loading.
    pub loading: bool,
}

/// The propagation engine: node store, tracking state, effect queue.
pub struct Engine {
    nodes: HashMap<NodeId, Node>,

    /// Owner for nodes created right now (lifetime scope).
    pub current_owner: Option<NodeId>,

    /// Observer for reads happening right now (dependency tracking).
    pub current_observer: Option<NodeId>,

    /// Scratch for the evaluation in progress.
    pub scratch: Scratch,

    /// Effects marked since the last flush, in notification order.
    pending_effects: Vec<NodeId>,

    /// Set while `flush_sync` drains the queue; re-entrant flushes no-op.
    pub flushing: bool,
}

impl Engine {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            current_owner: None,
            current_observer: None,
            scratch: Scratch::default(),
            pending_effects: Vec::new(),
            flushing: false,
        }
    }

    // ------------------------------------------------------------------
    // Node store
    // ------------------------------------------------------------------

    /// Create a node owned by the current owner.
    pub fn create_node(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId::new();
        let mut node = Node::new(kind);
        node.parent = self.current_owner;
        self.nodes.insert(id, node);
        if let Some(parent) = self.current_owner {
            if let Some(p) = self.nodes.get_mut(&parent) {
                p.children.push(id);
            }
        }
        id
    }

    /// Create a node outside the owner tree (detached roots, gates).
    pub fn create_detached(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId::new();
        self.nodes.insert(id, Node::new(kind));
        id
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    /// Remove a node record entirely. Lookups of the id afterwards read
    /// as disposed.
    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        self.nodes.remove(&id)
    }

    /// State of a node; absent nodes read as disposed.
    pub fn state(&self, id: NodeId) -> CellState {
        self.nodes.get(&id).map_or(CellState::Disposed, |n| n.state)
    }

    pub fn is_loading(&self, id: NodeId) -> bool {
        self.nodes.get(&id).is_some_and(Node::is_loading)
    }

    /// Total number of live nodes, gates included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // ------------------------------------------------------------------
    // Dependency recording
    // ------------------------------------------------------------------

    /// Record that the current observer read `id`.
    ///
    /// No-op outside a tracking context. Consecutive duplicate reads
    /// collapse to one entry; non-consecutive duplicates are kept, making
    /// back-edges a multi-set.
    pub fn track_read(&mut self, id: NodeId) {
        let Some(observer) = self.current_observer else {
            return;
        };
        if self.scratch.new_sources.is_empty() {
            let (prev, at) = match self.nodes.get(&observer) {
                Some(n) => (
                    self.scratch
                        .index
                        .checked_sub(1)
                        .and_then(|i| n.sources.get(i).copied()),
                    n.sources.get(self.scratch.index).copied(),
                ),
                None => (None, None),
            };
            if prev == Some(id) {
                return;
            }
            if at == Some(id) {
                self.scratch.index += 1;
            } else {
                self.scratch.new_sources.push(id);
            }
        } else if self.scratch.new_sources.last() != Some(&id) {
            self.scratch.new_sources.push(id);
        }
    }

    /// Replace the observer's source list with the retained prefix plus
    /// the accumulated tail, and fix up back-edges on both sides.
    pub fn commit_sources(&mut self, id: NodeId, scratch: Scratch) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let retained = scratch.index;
        let mut dropped = Vec::new();
        let mut added = Vec::new();
        if !scratch.new_sources.is_empty() {
            dropped = node.sources.split_off(retained.min(node.sources.len()));
            added = scratch.new_sources;
            node.sources.extend(added.iter().copied());
        } else if node.sources.len() > retained {
            dropped = node.sources.split_off(retained);
        }
        node.state = CellState::Clean;

        for s in dropped {
            if let Some(src) = self.nodes.get_mut(&s) {
                src.remove_observer(id);
            }
        }
        for s in added {
            if let Some(src) = self.nodes.get_mut(&s) {
                src.observers.push(id);
            }
        }
        self.update_waiting(id, scratch.loading);
    }

    // ------------------------------------------------------------------
    // Push-marking
    // ------------------------------------------------------------------

    /// Mark `id` at least `state`, propagating `Check` to its observers
    /// and side-channels. Marks are monotone; an equal or higher mark is
    /// a no-op. Evaluates nothing.
    pub fn notify(&mut self, id: NodeId, state: CellState) {
        debug_assert!(matches!(state, CellState::Check | CellState::Dirty));
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        if node.state >= state {
            return;
        }
        let was_clean = node.state == CellState::Clean;
        node.state = state;
        trace!(id = id.raw(), ?state, "notify");

        let enqueue = was_clean && node.kind == NodeKind::Effect;
        let observers = node.observers.clone();
        let loading_gate = node.loading_gate;
        let error_gate = node.error_gate;
        if enqueue {
            self.pending_effects.push(id);
        }
        for o in observers {
            self.notify(o, CellState::Check);
        }
        if let Some(g) = loading_gate {
            self.notify(g, CellState::Check);
        }
        if let Some(g) = error_gate {
            self.notify(g, CellState::Check);
        }
    }

    /// Mark every observer of a gate `Dirty`: the projected boolean
    /// changed, so gate subscribers must rerun.
    fn notify_gate_dirty(&mut self, gate: NodeId) {
        let observers = match self.nodes.get(&gate) {
            Some(g) => g.observers.clone(),
            None => return,
        };
        for o in observers {
            self.notify(o, CellState::Dirty);
        }
    }

    // ------------------------------------------------------------------
    // Loading channel
    // ------------------------------------------------------------------

    /// Maintain the `WAITING` bit, firing the loading transition when the
    /// node's overall loading state flips.
    pub fn update_waiting(&mut self, id: NodeId, waiting: bool) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        if node.flags.contains(StateFlags::WAITING) == waiting {
            return;
        }
        let was_loading = node.is_loading();
        node.flags.set(StateFlags::WAITING, waiting);
        let now_loading = node.is_loading();
        if was_loading != now_loading {
            self.loading_changed(id, now_loading);
        }
    }

    /// A node started or stopped loading.
    ///
    /// Rising edges mark observers' `WAITING` bits eagerly so downstream
    /// loading flips without any recomputation; falling edges only mark
    /// observers `Check` (their value may now need recomputation, and
    /// their `WAITING` bit clears during validation). Gate subscribers
    /// are marked `Dirty` either way.
    fn loading_changed(&mut self, id: NodeId, now: bool) {
        trace!(id = id.raw(), loading = now, "loading transition");
        let (gate, observers) = match self.nodes.get(&id) {
            Some(n) => (n.loading_gate, n.observers.clone()),
            None => return,
        };
        if let Some(g) = gate {
            self.notify_gate_dirty(g);
        }
        for o in observers {
            if now {
                self.update_waiting(o, true);
            } else {
                self.notify(o, CellState::Check);
            }
        }
    }

    /// Accept a pending future on `id`: supersede any in-flight future
    /// and raise the loading edge. Returns the epoch the resolution must
    /// present to be applied.
    pub fn begin_pending(&mut self, id: NodeId) -> Option<u64> {
        let node = self.nodes.get_mut(&id)?;
        node.future_epoch += 1;
        let epoch = node.future_epoch;
        let was_loading = node.is_loading();
        node.flags.insert(StateFlags::ASYNC);
        if !was_loading {
            self.loading_changed(id, true);
        }
        Some(epoch)
    }

    /// Whether a resolution carrying `epoch` is still the selected one.
    pub fn pending_is_current(&self, id: NodeId, epoch: u64) -> bool {
        self.nodes
            .get(&id)
            .is_some_and(|n| n.future_epoch == epoch && n.state != CellState::Disposed)
    }

    // ------------------------------------------------------------------
    // Commits
    // ------------------------------------------------------------------

    /// Commit a settled value. Returns whether observers were notified.
    ///
    /// Supersedes any in-flight future, settles the `ASYNC` bit, clears a
    /// latched error, and applies the early-cutoff equality check. The
    /// equality predicate runs under the engine borrow and must not read
    /// cells.
    pub fn commit_write(&mut self, id: NodeId, value: Rc<dyn Any>) -> bool {
        let Some(node) = self.nodes.get_mut(&id) else {
            return false;
        };
        node.future_epoch += 1;
        let had_error = node.flags.contains(StateFlags::ERROR);
        let was_loading = node.is_loading();
        node.flags.remove(StateFlags::ASYNC);

        let changed = had_error
            || match (&node.equals, &node.value) {
                (Some(eq), Some(old)) => !(**eq)(old.as_ref(), value.as_ref()),
                _ => true,
            };
        if changed {
            node.value = Some(value);
            node.error = None;
            node.flags.remove(StateFlags::ERROR);
        }
        let now_loading = node.is_loading();
        let error_gate = node.error_gate;
        let observers = if changed {
            node.observers.clone()
        } else {
            Vec::new()
        };
        trace!(id = id.raw(), changed, "write");

        if was_loading && !now_loading {
            self.loading_changed(id, false);
        }
        if had_error {
            if let Some(g) = error_gate {
                self.notify_gate_dirty(g);
            }
        }
        for o in observers {
            self.notify(o, CellState::Dirty);
        }
        changed
    }

    /// Latch a computation error: the value channel is replaced by the
    /// payload until the next successful write.
    pub fn set_error(&mut self, id: NodeId, payload: ErrorPayload) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        node.future_epoch += 1;
        let was_loading = node.is_loading();
        node.flags.remove(StateFlags::ASYNC);
        let transition = !node.flags.contains(StateFlags::ERROR);
        node.flags.insert(StateFlags::ERROR);
        node.error = Some(payload);
        node.value = None;
        let now_loading = node.is_loading();
        let error_gate = node.error_gate;
        let observers = node.observers.clone();
        trace!(id = id.raw(), "error latched");

        if was_loading && !now_loading {
            self.loading_changed(id, false);
        }
        if transition {
            if let Some(g) = error_gate {
                self.notify_gate_dirty(g);
            }
        }
        for o in observers {
            self.notify(o, CellState::Dirty);
        }
    }

    // ------------------------------------------------------------------
    // Side-channel gates
    // ------------------------------------------------------------------

    /// The loading gate of `origin`, allocated on first use.
    pub fn loading_gate_of(&mut self, origin: NodeId) -> Option<NodeId> {
        if let Some(gate) = self.nodes.get(&origin)?.loading_gate {
            return Some(gate);
        }
        let gate = self.create_detached(NodeKind::Gate { origin });
        self.nodes.get_mut(&origin)?.loading_gate = Some(gate);
        Some(gate)
    }

    /// The error gate of `origin`, allocated on first use.
    pub fn error_gate_of(&mut self, origin: NodeId) -> Option<NodeId> {
        if let Some(gate) = self.nodes.get(&origin)?.error_gate {
            return Some(gate);
        }
        let gate = self.create_detached(NodeKind::Gate { origin });
        self.nodes.get_mut(&origin)?.error_gate = Some(gate);
        Some(gate)
    }

    // ------------------------------------------------------------------
    // Effect queue
    // ------------------------------------------------------------------

    /// Swap out the queued effects, leaving a fresh queue so re-entrant
    /// notifications during a flush land in the same flush cycle.
    pub fn take_pending_effects(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.pending_effects)
    }

    pub fn has_pending_effects(&self) -> bool {
        !self.pending_effects.is_empty()
    }

    /// Owner-tree ancestors of `id` (inclusive) whose state is not clean,
    /// ordered oldest first. Flushing runs validation down this chain so
    /// a parent effect reruns before its children.
    pub fn ancestor_chain(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(c) = cursor {
            match self.nodes.get(&c) {
                Some(n) => {
                    if n.state != CellState::Clean && n.state != CellState::Disposed {
                        chain.push(c);
                    }
                    cursor = n.parent;
                }
                None => break,
            }
        }
        chain.reverse();
        chain
    }

    // ------------------------------------------------------------------
    // Owner tree
    // ------------------------------------------------------------------

    /// Register a disposal callback on `owner`.
    pub fn add_cleanup(&mut self, owner: NodeId, cb: Box<dyn FnOnce()>) {
        if let Some(node) = self.nodes.get_mut(&owner) {
            node.cleanups.push(cb);
        }
    }

    /// Install a context entry on `owner`.
    pub fn set_context(&mut self, owner: NodeId, key: TypeId, value: Rc<dyn Any>) {
        if let Some(node) = self.nodes.get_mut(&owner) {
            node.context.get_or_insert_with(HashMap::new).insert(key, value);
        }
    }

    /// Walk parent links from `start` (inclusive) returning the first
    /// node defining `key`, together with the entry.
    pub fn lookup_context(&self, start: NodeId, key: TypeId) -> Option<(NodeId, Rc<dyn Any>)> {
        let mut cursor = Some(start);
        while let Some(c) = cursor {
            let node = self.nodes.get(&c)?;
            if let Some(entry) = node.context.as_ref().and_then(|ctx| ctx.get(&key)) {
                return Some((c, entry.clone()));
            }
            cursor = node.parent;
        }
        None
    }

    /// Detach `id` from the graph: drop edges on both sides, tear down
    /// its gates, and unlink it from its parent's child list.
    pub fn unlink(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let sources = std::mem::take(&mut node.sources);
        let observers = std::mem::take(&mut node.observers);
        let loading_gate = node.loading_gate.take();
        let error_gate = node.error_gate.take();
        let parent = node.parent.take();

        for s in sources {
            if let Some(src) = self.nodes.get_mut(&s) {
                src.remove_observer(id);
            }
        }
        for o in observers {
            if let Some(obs) = self.nodes.get_mut(&o) {
                obs.remove_source(id);
            }
        }
        for gate in [loading_gate, error_gate].into_iter().flatten() {
            let gate_observers = self
                .nodes
                .get(&gate)
                .map(|g| g.observers.clone())
                .unwrap_or_default();
            for o in gate_observers {
                if let Some(obs) = self.nodes.get_mut(&o) {
                    obs.remove_source(gate);
                }
            }
            self.nodes.remove(&gate);
        }
        if let Some(p) = parent {
            if let Some(parent_node) = self.nodes.get_mut(&p) {
                parent_node.children.retain(|&c| c != id);
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
