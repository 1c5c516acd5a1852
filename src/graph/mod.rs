//! Dependency Graph
//!
//! This module implements the computational dependency graph that tracks
//! relationships between reactive values and computations.
//!
//! # Overview
//!
//! The dependency graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes represent reactive values (signals), computations (memos,
//!   effects), owner-only scopes, and loading/error side-channels
//! - Edges represent dependencies: if A reads B during evaluation, B is a
//!   source of A and A is an observer of B
//!
//! When a value changes, the engine pushes marks down observer edges
//! without evaluating anything; reads pull validation back up source
//! edges, recomputing only the nodes whose inputs actually changed.
//!
//! # Design Decisions
//!
//! 1. We use a centralized store rather than distributed linked nodes
//!    because ids stay copyable, back-edges cannot dangle, and disposal
//!    is a removal.
//!
//! 2. We maintain both forward (sources) and reverse (observers) edges to
//!    enable traversal in both directions.
//!
//! 3. Loading and error are separate side-channel nodes so a consumer
//!    subscribed only to `loading()` is never invalidated by value
//!    changes, and vice versa.

mod engine;
mod node;

pub use engine::{Engine, Scratch};
pub use node::{CellState, ComputeFn, ComputeOutcome, EqualsFn, Node, NodeId, NodeKind, StateFlags};
