//! Session-level error taxonomy.

use arbor_core::{AuthError, TreeError};
use thiserror::Error;

/// Everything that can terminate or reject a sync session.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("transport error: {0}")]
    TransportError(String),
    #[error("session cancelled")]
    Cancelled,
    #[error("backend error: {0}")]
    BackendError(String),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl SyncError {
    /// Whether this error is the locally-initiated cancellation kind, as
    /// opposed to a protocol or transport failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}
