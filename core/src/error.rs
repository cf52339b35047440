//! The closed error taxonomy shared by every core operation.
//!
//! Every failure path in the ledger, the render cache and the booking
//! service maps to exactly one of the six kinds below. The set is closed on
//! purpose: callers exhaustively match on it to shape their own transport
//! responses, and transport-specific kinds (status codes, retry hints) do
//! not belong here.
//!
//! Outcomes are stored by the idempotency ledger and replayed verbatim to
//! duplicate requests, which is why the type is `Clone` and comparable.

use thiserror::Error;

/// Failure kinds returned by core operations.
///
/// # Mapping guidance for callers
///
/// The core never decides status codes, but the intended correspondence is
/// the conventional one: `Validation` → 400, `NotFound` → 404, `Conflict` →
/// 409, `Forbidden` → 403, `Gone` → 410, `Internal` → 500.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Malformed input: bad idempotency key, invalid request shape.
    #[error("validation: {0}")]
    Validation(String),

    /// Unknown booking id or unrecognized credential.
    #[error("not found: {0}")]
    NotFound(String),

    /// State or resource contention: slot already taken, illegal
    /// transition, idempotency key reused with a different request.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The authorization context does not permit acting on this resource.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The resource can no longer be transitioned: expired hold or a
    /// permanently terminal state.
    #[error("gone: {0}")]
    Gone(String),

    /// Unexpected failure in a collaborator (storage, renderer).
    ///
    /// Never retried automatically by the core: the underlying mutation may
    /// already have been applied.
    #[error("internal: {0}")]
    Internal(String),
}

impl CoreError {
    /// Short stable label for the kind, used in logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Forbidden(_) => "forbidden",
            Self::Gone(_) => "gone",
            Self::Internal(_) => "internal",
        }
    }
}
