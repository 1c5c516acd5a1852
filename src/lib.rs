//! Trellis Core
//!
//! This crate provides the core of a fine-grained reactive runtime: an
//! acyclic graph of *cells* (leaf values, derived computations, effects)
//! maintained so that reading any cell always yields a value consistent
//! with every write that preceded the read, while recomputing only the
//! cells whose inputs actually changed.
//!
//! It implements:
//!
//! - Reactive primitives (signals, memos, effects)
//! - Lazy dependency tracking with push-marking and pull-validation
//! - Loading and error channels for in-flight futures and failed
//!   computations
//! - Owner-scoped lifetimes with LIFO teardown and error routing
//!
//! # Architecture
//!
//! The crate is organized into two layers:
//!
//! - `graph`: the dependency-graph substrate — node records, edge
//!   bookkeeping, push-marking, and commit primitives
//! - `reactive`: the user-facing primitives and the thread-local runtime
//!   that drives validation, recomputation, and the effect queue
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_core::reactive::{flush_sync, Effect, Memo, Signal};
//!
//! // Create a signal
//! let count = Signal::new(0);
//!
//! // Create a derived value
//! let doubled = Memo::new(move |_| count.get() * 2);
//!
//! // Create an effect
//! Effect::new(move || {
//!     println!("count: {}, doubled: {}", count.get(), doubled.get());
//! });
//!
//! // Update the signal and drain the effect queue
//! count.set(5);
//! flush_sync(); // prints: "count: 5, doubled: 10"
//! ```
//!
//! # Concurrency
//!
//! The runtime is single-threaded and cooperative: all engine state is
//! thread-local, handles are not `Send`, and the only suspension points
//! are user-supplied futures, resolved on a cooperative executor driven
//! by `flush_sync`.

pub mod error;
pub mod graph;
pub mod reactive;

pub use error::{CellError, ErrorPayload};
