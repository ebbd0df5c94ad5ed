use thiserror::Error;
use wiresql_client::protocol::{DriverError, HandleId};

#[derive(Error, Debug)]
pub enum DbError {
    /// The supplied id does not resolve to a live handle: already expired,
    /// already released, or never valid. Kept distinct from engine errors so
    /// the client can tell a stale handle from a SQL failure.
    #[error("unknown handle {0}")]
    UnknownHandle(HandleId),

    #[error("handle {0} is not a {1}")]
    WrongHandleKind(HandleId, &'static str),

    /// Backing-engine failure, propagated verbatim for the caller to
    /// interpret. Never retried at this layer.
    #[error("engine error: {0}")]
    Engine(#[from] rusqlite::Error),

    #[error("{0}")]
    Invalid(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DbResult<T> = Result<T, DbError>;

impl From<DbError> for DriverError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::UnknownHandle(id) => DriverError::UnknownHandle(id),
            DbError::WrongHandleKind(id, kind) => {
                DriverError::InvalidCommand(format!("handle {} is not a {}", id, kind))
            }
            DbError::Engine(e) => DriverError::EngineError(e.to_string()),
            DbError::Invalid(msg) => DriverError::EngineError(msg),
            DbError::Internal(msg) => DriverError::ProtocolError(msg),
            DbError::Io(e) => DriverError::ConnectionError(e.to_string()),
        }
    }
}
