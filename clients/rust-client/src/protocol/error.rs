use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::HandleId;

/// Driver protocol error, shared between server and client.
///
/// The taxonomy matters to callers: `UnknownHandle` means a supplied id no
/// longer resolves on the server (expired, released, or never valid) and the
/// connection must be discarded, while `EngineError` carries a backing-engine
/// failure (syntax error, constraint violation, lock wait) verbatim for the
/// caller to interpret.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
pub enum DriverError {
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("engine error: {0}")]
    EngineError(String),
    #[error("unknown handle {0}")]
    UnknownHandle(HandleId),
    #[error("transaction error: {0}")]
    TransactionError(String),
    #[error("message too large")]
    MessageTooLarge,
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl DriverError {
    /// True when the connection that produced this error can no longer be
    /// trusted and should be discarded and reopened by any pooling layer.
    ///
    /// Backing-engine errors are *not* in this category: a constraint
    /// violation or a lock-wait failure leaves the session perfectly usable.
    pub fn unusable(&self) -> bool {
        matches!(
            self,
            DriverError::ConnectionError(_)
                | DriverError::ProtocolError(_)
                | DriverError::UnknownHandle(_)
        )
    }
}
