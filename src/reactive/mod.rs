//! Reactive Primitives
//!
//! This module implements the user-facing reactive system: signals,
//! memos, and effects, plus the ownership scopes that bound their
//! lifetimes.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A [`Signal`] is a container for mutable state. When a signal is read
//! within a tracking context (a memo or effect computation), the reader
//! is registered as an observer. When the signal's value changes, the
//! observers are marked; nothing recomputes until it is read or flushed.
//!
//! ## Memos
//!
//! A [`Memo`] is a derived value that caches its result. It re-evaluates
//! only when one of the cells it read last time actually changed, checked
//! lazily at read time.
//!
//! ## Effects
//!
//! An [`Effect`] is a side-effecting computation that reruns whenever its
//! dependencies change. Effects are the only eagerly scheduled cells:
//! they queue on notification and rerun during [`flush_sync`], parents
//! before children.
//!
//! ## Scopes
//!
//! Every cell is created under the current *owner*. Disposing an owner
//! ([`create_root`]'s handle) tears down every cell created inside it,
//! children before parents, cleanup callbacks in reverse registration
//! order. [`catch_error`] installs an error handler that receives
//! failures from effects in its subtree.
//!
//! ## Loading and errors
//!
//! Every cell carries two auxiliary channels besides its value: `loading`
//! (a future somewhere upstream has not settled) and `error` (the last
//! computation failed). Both are observable independently of the value,
//! so a consumer of `loading()` is never invalidated by value changes.
//!
//! # Implementation Notes
//!
//! Dependency tracking is implicit through a thread-local evaluation
//! context. When a cell is read, the runtime records the edge between
//! reader and read cell; computations whose dependency set is stable
//! between runs reuse their source list without allocating.

mod effect;
mod memo;
mod runtime;
mod scope;
mod signal;

pub use effect::Effect;
pub use memo::{Eval, Memo};
pub use runtime::{flush_sync, node_count};
pub use scope::{
    catch_error, create_root, current_owner, on_cleanup, provide_context, untrack, use_context,
    with_owner, Owner, RootHandle,
};
pub use signal::Signal;
