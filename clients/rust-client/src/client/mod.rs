//! Client-side driver adapter.
//!
//! Implements the standard connection/transaction/statement/cursor contract
//! by holding only server-issued handle ids and delegating every operation to
//! the remote session service in one synchronous round trip. Opening a
//! connection creates no server-side state; handles only come into existence
//! through `begin`, `prepare` and `query`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::protocol::{
    decode_message, encode_command, Command, DriverError, HandleId, Response, SqlParam, SqlValue,
    DRIVER_MAGIC, MAX_MESSAGE_SIZE,
};

#[derive(Debug, Default, Clone, Copy)]
struct TxState {
    id: HandleId,
    in_tx: bool,
}

struct ConnInner {
    /// The socket. One call in flight at a time; the lock is the serializer.
    wire: Mutex<TcpStream>,
    /// At most one open transaction per connection.
    tx: std::sync::Mutex<TxState>,
    /// Set on transport failure or an unknown-handle reply. Once set, every
    /// call fails fast without touching the socket, so pooling layers discard
    /// the connection instead of retrying on a dead transport.
    broken: AtomicBool,
    addr: String,
}

/// A connection to a wiresql server.
///
/// Cloning is cheap and shares the underlying transport; the clone is the
/// mechanism by which statement and cursor proxies keep their connection
/// alive. Individual proxies are not meant for concurrent use from multiple
/// tasks: server-side cursor position is not protected against interleaved
/// calls on the same handle.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl Connection {
    /// Connect and perform the transport-level handshake.
    pub async fn connect(addr: &str) -> Result<Self, DriverError> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            DriverError::ConnectionError(format!("failed to connect to {}: {}", addr, e))
        })?;
        stream
            .set_nodelay(true)
            .map_err(|e| DriverError::ConnectionError(format!("failed to set nodelay: {}", e)))?;

        let conn = Self {
            inner: Arc::new(ConnInner {
                wire: Mutex::new(stream),
                tx: std::sync::Mutex::new(TxState::default()),
                broken: AtomicBool::new(false),
                addr: addr.to_owned(),
            }),
        };

        {
            let mut stream = conn.inner.wire.lock().await;
            stream
                .write_all(DRIVER_MAGIC)
                .await
                .map_err(|e| DriverError::ConnectionError(format!("handshake failed: {}", e)))?;
            stream
                .flush()
                .await
                .map_err(|e| DriverError::ConnectionError(format!("handshake failed: {}", e)))?;
        }
        tracing::debug!(addr, "driver connection established");
        Ok(conn)
    }

    /// Liveness check.
    pub async fn ping(&self) -> Result<(), DriverError> {
        match self.call(Command::Ping).await? {
            Response::Pong { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Open a transaction. At most one may be open per connection; statements
    /// prepared while it is open are prepared inside it.
    pub async fn begin(&self) -> Result<Transaction, DriverError> {
        {
            let tx = self.inner.tx.lock().unwrap();
            if tx.in_tx {
                return Err(DriverError::TransactionError(
                    "a transaction is already open on this connection".to_owned(),
                ));
            }
        }
        match self.call(Command::Begin).await? {
            Response::Begun { tx } => {
                *self.inner.tx.lock().unwrap() = TxState { id: tx, in_tx: true };
                Ok(Transaction {
                    conn: self.clone(),
                    id: tx,
                    done: false,
                })
            }
            other => Err(unexpected(other)),
        }
    }

    /// Prepare a statement. Runs inside the connection's open transaction when
    /// there is one, otherwise against the server's shared connection.
    pub async fn prepare(&self, sql: &str) -> Result<Statement, DriverError> {
        let TxState { id, in_tx } = *self.inner.tx.lock().unwrap();
        let cmd = Command::Prepare {
            query: sql.to_owned(),
            tx: id,
            in_tx,
        };
        match self.call(cmd).await? {
            Response::Prepared { stmt } => Ok(Statement {
                conn: self.clone(),
                id: stmt,
            }),
            other => Err(unexpected(other)),
        }
    }

    /// Prepare, execute and close in one go.
    pub async fn execute(&self, sql: &str, params: Vec<SqlParam>) -> Result<ExecResult, DriverError> {
        let stmt = self.prepare(sql).await?;
        let result = stmt.execute(params).await;
        let closed = stmt.close().await;
        let result = result?;
        closed?;
        Ok(result)
    }

    /// Prepare, query, drain the cursor and close, returning the column list
    /// and all rows.
    pub async fn query_collect(
        &self,
        sql: &str,
        params: Vec<SqlParam>,
    ) -> Result<(Vec<String>, Vec<Vec<SqlValue>>), DriverError> {
        let stmt = self.prepare(sql).await?;
        let result = async {
            let mut rows = stmt.query(params).await?;
            let columns = rows.columns().to_vec();
            let mut collected = Vec::new();
            while let Some(row) = rows.next().await? {
                collected.push(row);
            }
            rows.close().await?;
            Ok((columns, collected))
        }
        .await;
        let closed = stmt.close().await;
        let result = result?;
        closed?;
        Ok(result)
    }

    /// Server address this connection was opened against.
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// True once the connection has been marked unusable.
    pub fn is_broken(&self) -> bool {
        self.inner.broken.load(Ordering::Relaxed)
    }

    fn clear_tx(&self) {
        *self.inner.tx.lock().unwrap() = TxState::default();
    }

    fn mark_broken(&self) {
        if !self.inner.broken.swap(true, Ordering::Relaxed) {
            tracing::debug!(addr = %self.inner.addr, "marking driver connection unusable");
        }
    }

    async fn call(&self, cmd: Command) -> Result<Response, DriverError> {
        if self.is_broken() {
            return Err(DriverError::ConnectionError(
                "connection is marked unusable".to_owned(),
            ));
        }
        let frame = encode_command(&cmd)?;
        let result = {
            let mut stream = self.inner.wire.lock().await;
            round_trip(&mut stream, &frame).await
        };
        match result {
            Ok(Response::Error { error }) => {
                if error.unusable() {
                    self.mark_broken();
                }
                Err(error)
            }
            Ok(response) => Ok(response),
            Err(error) => {
                self.mark_broken();
                Err(error)
            }
        }
    }
}

async fn round_trip(stream: &mut TcpStream, frame: &[u8]) -> Result<Response, DriverError> {
    stream
        .write_all(frame)
        .await
        .map_err(|e| DriverError::ConnectionError(format!("write failed: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| DriverError::ConnectionError(format!("flush failed: {}", e)))?;

    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| DriverError::ConnectionError(format!("read length failed: {}", e)))?;
    let msg_len = u32::from_be_bytes(len_buf) as usize;
    if msg_len > MAX_MESSAGE_SIZE {
        return Err(DriverError::MessageTooLarge);
    }

    let mut payload = vec![0u8; msg_len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| DriverError::ConnectionError(format!("read payload failed: {}", e)))?;
    decode_message(&payload)
}

fn unexpected(resp: Response) -> DriverError {
    DriverError::ProtocolError(format!("unexpected response: {:?}", resp))
}

/// An open transaction. Must be consumed by [`commit`](Self::commit) or
/// [`rollback`](Self::rollback); a transaction dropped without either is
/// reclaimed by the server's idle-handle expiry.
pub struct Transaction {
    conn: Connection,
    id: HandleId,
    done: bool,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub async fn commit(mut self) -> Result<(), DriverError> {
        self.finish(Command::Commit { tx: self.id }).await
    }

    pub async fn rollback(mut self) -> Result<(), DriverError> {
        self.finish(Command::Rollback { tx: self.id }).await
    }

    async fn finish(&mut self, cmd: Command) -> Result<(), DriverError> {
        self.done = true;
        let result = self.conn.call(cmd).await;
        // The server has discarded the handle whether or not the call
        // succeeded, so the connection leaves transaction state either way.
        self.conn.clear_tx();
        match result? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.done {
            tracing::debug!(id = %self.id, "transaction dropped without commit or rollback");
            self.conn.clear_tx();
        }
    }
}

/// A prepared statement proxy. Holds nothing but the connection and the
/// remote handle.
pub struct Statement {
    conn: Connection,
    id: HandleId,
}

impl Statement {
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Execute as a query, returning a forward-only cursor.
    pub async fn query(&self, params: Vec<SqlParam>) -> Result<Rows, DriverError> {
        let cmd = Command::Query {
            stmt: self.id,
            params,
        };
        match self.conn.call(cmd).await? {
            Response::Rows { columns, cursor } => Ok(Rows {
                conn: self.conn.clone(),
                id: cursor,
                columns,
                done: false,
            }),
            other => Err(unexpected(other)),
        }
    }

    /// Execute as a mutation.
    pub async fn execute(&self, params: Vec<SqlParam>) -> Result<ExecResult, DriverError> {
        let cmd = Command::Exec {
            stmt: self.id,
            params,
        };
        match self.conn.call(cmd).await? {
            Response::ExecResult {
                last_insert_id,
                last_insert_id_error,
                rows_affected,
                rows_affected_error,
            } => Ok(ExecResult {
                last_insert_id,
                last_insert_id_error,
                rows_affected,
                rows_affected_error,
            }),
            other => Err(unexpected(other)),
        }
    }

    /// Release the statement. The local proxy is dead regardless of the
    /// outcome.
    pub async fn close(self) -> Result<(), DriverError> {
        match self.conn.call(Command::CloseStatement { stmt: self.id }).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

/// Forward-only cursor over a query result. All position state lives on the
/// server; this proxy only remembers the column list captured at creation.
pub struct Rows {
    conn: Connection,
    id: HandleId,
    columns: Vec<String>,
    done: bool,
}

impl Rows {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Advance one row. `Ok(None)` signals end of data; the server frees the
    /// cursor on exhaustion, so a following [`close`](Self::close) is a local
    /// no-op.
    pub async fn next(&mut self) -> Result<Option<Vec<SqlValue>>, DriverError> {
        if self.done {
            return Ok(None);
        }
        let cmd = Command::CursorNext {
            cursor: self.id,
            num_values: self.columns.len(),
        };
        match self.conn.call(cmd).await? {
            Response::Row { values, eof } => {
                if eof {
                    self.done = true;
                    Ok(None)
                } else {
                    Ok(Some(values))
                }
            }
            other => Err(unexpected(other)),
        }
    }

    /// Release the cursor. The proxy is dead regardless of the outcome.
    pub async fn close(&mut self) -> Result<(), DriverError> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        match self.conn.call(Command::CursorClose { cursor: self.id }).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

/// Outcome of a mutation. The insert-id and rows-affected fields carry their
/// own success/error pair, since some engines support only one of the two.
#[derive(Debug, Clone)]
pub struct ExecResult {
    last_insert_id: Option<i64>,
    last_insert_id_error: Option<String>,
    rows_affected: Option<i64>,
    rows_affected_error: Option<String>,
}

impl ExecResult {
    pub fn last_insert_id(&self) -> Result<i64, DriverError> {
        field(self.last_insert_id, &self.last_insert_id_error, "last insert id")
    }

    pub fn rows_affected(&self) -> Result<i64, DriverError> {
        field(self.rows_affected, &self.rows_affected_error, "rows affected")
    }
}

fn field(value: Option<i64>, error: &Option<String>, what: &str) -> Result<i64, DriverError> {
    if let Some(e) = error {
        return Err(DriverError::EngineError(e.clone()));
    }
    value.ok_or_else(|| DriverError::EngineError(format!("{} not reported by engine", what)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    // A server that accepts the handshake and then hangs up.
    async fn hangup_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut magic = vec![0u8; DRIVER_MAGIC.len()];
            let _ = stream.read_exact(&mut magic).await;
            // Connection dropped here.
        });
        addr
    }

    #[tokio::test]
    async fn broken_connection_fails_fast() {
        let addr = hangup_server().await;
        let conn = Connection::connect(&addr).await.unwrap();

        let err = conn.ping().await.unwrap_err();
        assert!(err.unusable(), "transport failure must be unusable: {}", err);
        assert!(conn.is_broken());

        // Later calls never touch the socket again.
        let err = conn.ping().await.unwrap_err();
        assert!(matches!(err, DriverError::ConnectionError(_)));
    }

    #[tokio::test]
    async fn second_begin_is_rejected_locally() {
        // No RPC is needed to reject a nested begin, so a hangup server that
        // answered the first begin is not required; poke the state directly.
        let addr = hangup_server().await;
        let conn = Connection::connect(&addr).await.unwrap();
        *conn.inner.tx.lock().unwrap() = TxState {
            id: HandleId(1),
            in_tx: true,
        };
        let err = conn.begin().await.unwrap_err();
        assert!(matches!(err, DriverError::TransactionError(_)));
    }
}
