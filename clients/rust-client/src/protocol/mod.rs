//! Wire protocol definitions for the wiresql driver.
//!
//! The protocol is a sequence of single request/response pairs over one TCP
//! connection:
//! - **Magic header**: `wiresql-drv-v1\0` (15 bytes, sent once on connect)
//! - **Request frame**: `[length: 4 bytes BE][MessagePack payload]`
//! - **Response frame**: `[length: 4 bytes BE][MessagePack payload]`
//!
//! Every server-side stateful object (open transaction, prepared statement,
//! open cursor) is referred to by an opaque [`HandleId`] issued by the server;
//! the client reconstructs connection/transaction/statement/cursor semantics
//! purely from round trips exchanging these ids.

mod error;
mod types;

pub use error::DriverError;
pub use types::{HandleId, SqlParam, SqlValue};

use serde::{Deserialize, Serialize};

/// Magic header sent at the start of a driver connection.
pub const DRIVER_MAGIC: &[u8] = b"wiresql-drv-v1\0";

/// Maximum message size (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Commands that can be sent to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Liveness check.
    Ping,

    /// Open a transaction; replies with its handle.
    Begin,

    /// Commit a transaction. The handle is spent whether or not the commit
    /// succeeds.
    Commit { tx: HandleId },

    /// Roll back a transaction. The handle is spent either way.
    Rollback { tx: HandleId },

    /// Prepare a statement, against the transaction `tx` when `in_tx` is set,
    /// otherwise against the shared connection.
    Prepare {
        query: String,
        tx: HandleId,
        in_tx: bool,
    },

    /// Execute a prepared statement as a query; replies with the column list
    /// and a cursor handle.
    Query {
        stmt: HandleId,
        #[serde(default)]
        params: Vec<SqlParam>,
    },

    /// Execute a prepared statement as a mutation.
    Exec {
        stmt: HandleId,
        #[serde(default)]
        params: Vec<SqlParam>,
    },

    /// Advance a cursor one row. `num_values` must match the cursor's column
    /// count; it is the number of value slots the caller will fill.
    CursorNext { cursor: HandleId, num_values: usize },

    /// Release a cursor. Silently tolerates a cursor that is already gone
    /// (exhausted, expired, or closed twice).
    CursorClose { cursor: HandleId },

    /// Release a prepared statement, tolerating "already gone" silently.
    CloseStatement { stmt: HandleId },
}

/// Replies sent by the server. Exactly one per command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// Empty success (commit, rollback, closes).
    Ok,
    Begun {
        tx: HandleId,
    },
    Prepared {
        stmt: HandleId,
    },
    Rows {
        columns: Vec<String>,
        cursor: HandleId,
    },
    /// Mutation outcome. The two result fields are independently fallible:
    /// an engine may be able to report one but not the other, and neither
    /// failure fails the call itself.
    ExecResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_insert_id: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_insert_id_error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows_affected: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows_affected_error: Option<String>,
    },
    /// One row of a cursor. `eof` is true, with `values` empty, when the
    /// cursor is exhausted; a scan failure is reported as an error instead.
    Row {
        values: Vec<SqlValue>,
        eof: bool,
    },
    Pong {
        timestamp: i64,
    },
    Error {
        error: DriverError,
    },
}

impl Response {
    pub fn error(err: DriverError) -> Self {
        Response::Error { error: err }
    }

    pub fn pong() -> Self {
        Response::Pong {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Encode a command with its length prefix. Named serialization is required
/// for the tagged enums.
pub fn encode_command(cmd: &Command) -> Result<Vec<u8>, DriverError> {
    frame(rmp_serde::to_vec_named(cmd))
}

/// Encode a response with its length prefix.
pub fn encode_response(resp: &Response) -> Result<Vec<u8>, DriverError> {
    frame(rmp_serde::to_vec_named(resp))
}

fn frame(payload: Result<Vec<u8>, rmp_serde::encode::Error>) -> Result<Vec<u8>, DriverError> {
    let payload =
        payload.map_err(|e| DriverError::ProtocolError(format!("serialization failed: {}", e)))?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(DriverError::MessageTooLarge);
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a message payload (without its length prefix).
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, DriverError> {
    rmp_serde::from_slice(data)
        .map_err(|e| DriverError::ProtocolError(format!("deserialization failed: {}", e)))
}
