//! Graph Nodes
//!
//! This module defines the uniform node record that lives in the
//! dependency graph. Every reactive entity is one of these: leaf values,
//! derived computations, effects, owner-only scopes, and the tiny
//! loading/error side-channel nodes.

use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::LocalBoxFuture;

use crate::error::ErrorPayload;

/// Unique identifier for a node in the dependency graph.
///
/// Ids come from a process-wide counter and are never reused, so a stale
/// id held after disposal simply misses the store lookup instead of
/// aliasing a new node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// An owner-only scope. Participates in the owner tree (lifetimes,
    /// error handlers, context) but never in the reactive graph.
    Scope,

    /// A leaf value (signal). Roots of the graph: no sources, only
    /// observers.
    Source,

    /// A derived value (memo). Has sources and may have observers; caches
    /// its computed value.
    Derived,

    /// An effect. Has sources but no observers; the only kind that is
    /// eagerly rerun, via the effect queue.
    Effect,

    /// A loading or error side-channel node. Owned by an origin cell and
    /// lazily allocated on first subscription; its "value" is a boolean
    /// projection of the origin, so it carries no storage of its own.
    Gate {
        /// The cell this gate projects.
        origin: NodeId,
    },
}

/// Update state of a node.
///
/// The ordering is load-bearing: push-marking is monotone, so a node is
/// only ever promoted (`Clean` → `Check` → `Dirty`), and `Disposed`
/// swallows every mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CellState {
    /// The node's value is known current.
    Clean,

    /// A transitive source may have changed; the node must validate its
    /// sources before its value can be trusted.
    Check,

    /// A direct source definitely changed. The node must recompute.
    Dirty,

    /// The node's owning scope was torn down. Reads raise.
    Disposed,
}

bitflags::bitflags! {
    /// Auxiliary per-node status bits, orthogonal to [`CellState`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFlags: u8 {
        /// The current "value" is a captured computation error.
        const ERROR   = 0b0000_0001;
        /// At least one source is loading.
        const WAITING = 0b0000_0010;
        /// The node's own last write was a pending future.
        const ASYNC   = 0b0000_0100;
    }
}

impl StateFlags {
    /// A node is loading when its own write is pending or any source is.
    pub fn is_loading(self) -> bool {
        self.intersects(StateFlags::WAITING | StateFlags::ASYNC)
    }
}

/// What a computation produced.
pub enum ComputeOutcome {
    /// A settled value.
    Ready(Rc<dyn Any>),

    /// A pending value; the runtime resolves it cooperatively and commits
    /// the result if it has not been superseded in the meantime.
    Pending(LocalBoxFuture<'static, std::result::Result<Rc<dyn Any>, ErrorPayload>>),

    /// The computation failed; the payload is latched on the cell.
    Failed(ErrorPayload),

    /// The computation read a loading source through `wait` and aborted.
    /// The cell keeps its previous value.
    NotReady,
}

impl std::fmt::Debug for ComputeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputeOutcome::Ready(_) => f.write_str("Ready"),
            ComputeOutcome::Pending(_) => f.write_str("Pending"),
            ComputeOutcome::Failed(e) => write!(f, "Failed({e})"),
            ComputeOutcome::NotReady => f.write_str("NotReady"),
        }
    }
}

/// Type-erased computation. Receives the node's previous value.
pub type ComputeFn = Rc<dyn Fn(Option<&dyn Any>) -> ComputeOutcome>;

/// Type-erased equality predicate for the early-cutoff check.
pub type EqualsFn = Rc<dyn Fn(&dyn Any, &dyn Any) -> bool>;

/// A node in the dependency graph.
///
/// One record serves every reactive entity; the unused fields of a given
/// kind stay empty (a `Source` has no compute, a `Scope` has no edges).
pub struct Node {
    /// What kind of node this is.
    pub kind: NodeKind,

    /// Current update state.
    pub state: CellState,

    /// Auxiliary status bits.
    pub flags: StateFlags,

    /// Last committed value, type-erased. `None` before the first commit
    /// and while an error is latched.
    pub value: Option<Rc<dyn Any>>,

    /// Latched computation error; present iff `flags` carries `ERROR`.
    pub error: Option<ErrorPayload>,

    /// The computation, absent for leaf cells and scopes.
    pub compute: Option<ComputeFn>,

    /// Equality predicate; `None` means "always notify".
    pub equals: Option<EqualsFn>,

    /// Ordered cells this node read during its last evaluation.
    pub sources: Vec<NodeId>,

    /// Cells that read this node during their last evaluation. Unordered;
    /// removal is by swap-pop.
    pub observers: Vec<NodeId>,

    /// Identity of the most recently accepted pending future. A stale
    /// resolution compares against this and is ignored.
    pub future_epoch: u64,

    /// Lazily allocated loading side-channel.
    pub loading_gate: Option<NodeId>,

    /// Lazily allocated error side-channel.
    pub error_gate: Option<NodeId>,

    // Owner-tree links. The owner tree is separate from the reactive
    // graph: it only governs lifetimes and error-context lookup.
    /// Owning scope, `None` for detached roots and gates.
    pub parent: Option<NodeId>,

    /// Child nodes in creation order; disposed in reverse (LIFO).
    pub children: Vec<NodeId>,

    /// Disposal callbacks in registration order; run in reverse.
    pub cleanups: Vec<Box<dyn FnOnce()>>,

    /// Context entries visible to this node and its descendants.
    pub context: Option<HashMap<std::any::TypeId, Rc<dyn Any>>>,
}

impl Node {
    /// Create a node of the given kind. Derived and effect nodes start
    /// `Dirty` so their first read triggers evaluation.
    pub fn new(kind: NodeKind) -> Self {
        let state = match kind {
            NodeKind::Derived | NodeKind::Effect => CellState::Dirty,
            NodeKind::Scope | NodeKind::Source | NodeKind::Gate { .. } => CellState::Clean,
        };
        Self {
            kind,
            state,
            flags: StateFlags::empty(),
            value: None,
            error: None,
            compute: None,
            equals: None,
            sources: Vec::new(),
            observers: Vec::new(),
            future_epoch: 0,
            loading_gate: None,
            error_gate: None,
            parent: None,
            children: Vec::new(),
            cleanups: Vec::new(),
            context: None,
        }
    }

    /// Whether the node's value depends on an unresolved future, either
    /// its own (`ASYNC`) or an ancestor's (`WAITING`).
    pub fn is_loading(&self) -> bool {
        self.flags.is_loading()
    }

    /// Whether a captured computation error is latched.
    pub fn is_errored(&self) -> bool {
        self.flags.contains(StateFlags::ERROR)
    }

    /// Remove an observer back-edge by swap-pop. Removes one instance per
    /// call; back-edges are a multi-set when a cell was read twice
    /// non-consecutively.
    pub fn remove_observer(&mut self, id: NodeId) {
        if let Some(pos) = self.observers.iter().position(|&o| o == id) {
            self.observers.swap_remove(pos);
        }
    }

    /// Remove every occurrence of `id` from the source list.
    pub fn remove_source(&mut self, id: NodeId) {
        self.sources.retain(|&s| s != id);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("sources", &self.sources.len())
            .field("observers", &self.observers.len())
            .field("children", &self.children.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn source_node_starts_clean() {
        let node = Node::new(NodeKind::Source);
        assert_eq!(node.state, CellState::Clean);
    }

    #[test]
    fn derived_node_starts_dirty() {
        let node = Node::new(NodeKind::Derived);
        assert_eq!(node.state, CellState::Dirty);
    }

    #[test]
    fn state_ordering_is_monotone() {
        assert!(CellState::Clean < CellState::Check);
        assert!(CellState::Check < CellState::Dirty);
        assert!(CellState::Dirty < CellState::Disposed);
    }

    #[test]
    fn loading_tracks_async_and_waiting() {
        let mut node = Node::new(NodeKind::Derived);
        assert!(!node.is_loading());

        node.flags.insert(StateFlags::ASYNC);
        assert!(node.is_loading());

        node.flags.remove(StateFlags::ASYNC);
        node.flags.insert(StateFlags::WAITING);
        assert!(node.is_loading());

        node.flags.remove(StateFlags::WAITING);
        assert!(!node.is_loading());
    }

    #[test]
    fn observer_removal_is_swap_pop() {
        let mut node = Node::new(NodeKind::Source);
        let a = NodeId::new();
        let b = NodeId::new();
        let c = NodeId::new();
        node.observers.extend([a, b, c]);

        node.remove_observer(a);
        // The last element moved into the freed slot.
        assert_eq!(node.observers, vec![c, b]);

        node.remove_observer(b);
        assert_eq!(node.observers, vec![c]);
    }

    #[test]
    fn duplicate_observers_are_removed_one_per_call() {
        let mut node = Node::new(NodeKind::Source);
        let a = NodeId::new();
        node.observers.extend([a, a]);

        node.remove_observer(a);
        assert_eq!(node.observers.len(), 1);

        node.remove_observer(a);
        assert!(node.observers.is_empty());
    }
}
