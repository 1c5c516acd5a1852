//! Error types for the reactive runtime.
//!
//! Errors flow through the graph in two distinct ways:
//!
//! - [`CellError`] is the error surface of reads: a read can fail because
//!   the cell is still waiting on a pending future (`NotReady`), because
//!   the cell's owning scope was torn down (`Disposed`), or because the
//!   cell's last computation failed (`Computation`).
//!
//! - [`ErrorPayload`] is the stored form of a failed computation. It wraps
//!   the user's `anyhow::Error` in a shared handle so the same payload can
//!   be latched on a cell, re-raised on every read, and propagated through
//!   downstream computations without cloning the underlying error.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Shared handle to a captured computation error.
///
/// Cloning is cheap; all clones refer to the same underlying error.
#[derive(Clone)]
pub struct ErrorPayload(Arc<anyhow::Error>);

impl ErrorPayload {
    /// Wrap a user error for storage on a cell.
    pub fn new(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }

    /// Access the underlying error.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// True if both payloads refer to the same captured error.
    pub fn same(&self, other: &ErrorPayload) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl From<anyhow::Error> for ErrorPayload {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err)
    }
}

/// Errors surfaced by cell reads.
#[derive(Debug, Clone, Error)]
pub enum CellError {
    /// The cell's value depends on a future that has not resolved yet.
    ///
    /// Inside a computation this acts as a sentinel: propagating it with
    /// `?` aborts the current evaluation, and the runtime keeps the cell's
    /// previous value until the pending future settles.
    #[error("cell is not ready")]
    NotReady,

    /// The cell's owning scope has been disposed.
    #[error("read of disposed cell")]
    Disposed,

    /// The cell's last computation failed; the payload is re-raised on
    /// every read until a successful write clears it.
    #[error("cell computation failed: {0}")]
    Computation(ErrorPayload),
}

impl CellError {
    /// True for the internal `NotReady` sentinel.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, CellError::NotReady)
    }
}

/// Result type for cell reads.
pub type Result<T> = std::result::Result<T, CellError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_clones_share_error() {
        let payload = ErrorPayload::new(anyhow::anyhow!("boom"));
        let clone = payload.clone();
        assert!(payload.same(&clone));
        assert_eq!(payload.to_string(), "boom");
    }

    #[test]
    fn not_ready_round_trips_through_anyhow() {
        // A computation that propagates NotReady with `?` hands the
        // runtime an anyhow chain; the sentinel must stay recoverable.
        let err: anyhow::Error = CellError::NotReady.into();
        let recovered = err.downcast_ref::<CellError>();
        assert!(matches!(recovered, Some(CellError::NotReady)));
    }

    #[test]
    fn computation_error_displays_payload() {
        let err = CellError::Computation(ErrorPayload::new(anyhow::anyhow!("bad input")));
        assert!(err.to_string().contains("bad input"));
    }
}
