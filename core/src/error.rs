//! Structured error taxonomy for the tree engine and
//! authorization layer. The sync session (crate root) wraps these into its
//! own `SyncError` and adds session-specific kinds.

use crate::ids::OpRef;
use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum TreeError {
    #[error("op with id {0:?} already applied")]
    DuplicateOp(crate::ids::OpId),
    #[error("op shape is invalid: {0}")]
    MalformedOp(String),
    #[error("no op found for opref {0:?}")]
    UnknownOpRef(OpRef),
}

/// Reasons `verify_ops` can reject or quarantine an op.
/// `PendingContext` is recoverable without operator action; every other
/// variant terminates verification for that op permanently.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum AuthError {
    #[error("no held token grants the required action")]
    InsufficientCapability,
    #[error("signature does not verify against the claimed replica")]
    InvalidSignature,
    #[error("proof_ref does not resolve to a known token")]
    UnknownProofRef,
    #[error("affected node lies outside the capability's scope")]
    ScopeViolation,
    #[error("token has expired")]
    TokenExpired,
    #[error("token issuer is not trusted")]
    TokenIssuerUnknown,
    #[error("token has been revoked")]
    Revoked,
    #[error("token's audience does not name this document")]
    AudienceMismatch,
    /// Scope could not yet be decided; the op belongs in the pending-context
    /// quarantine, not rejected outright.
    #[error("scope cannot yet be decided — ancestry is incomplete")]
    PendingContext,
}

impl AuthError {
    pub fn is_pending(&self) -> bool {
        matches!(self, AuthError::PendingContext)
    }
}
