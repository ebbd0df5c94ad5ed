//! Backing-engine wrapper around SQLite.
//!
//! The session service never talks to `rusqlite` directly; it goes through
//! these types, which express exactly the contract the protocol needs: begin
//! a transaction, prepare a statement (shared or inside a transaction),
//! execute it as a mutation or a query, and walk a cursor.
//!
//! Two engine-specific choices live here. Each transaction gets its own
//! connection to the database file, so serialization of concurrent writers is
//! delegated entirely to SQLite's own locking (with a busy timeout so the
//! second writer blocks instead of failing immediately). And a query's result
//! is decoded into the cursor up front; the cursor handle then serves rows
//! one at a time, which keeps the forward-only position on the server without
//! pinning a live statement across RPC calls.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::{Value as EngineValue, ValueRef};
use rusqlite::Connection;

use crate::error::{DbError, DbResult};
use wiresql_client::protocol::{SqlParam, SqlValue};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteEngine {
    path: PathBuf,
    shared: Arc<Mutex<Connection>>,
}

impl SqliteEngine {
    /// Open the shared autocommit connection. Statements prepared outside a
    /// transaction run on it.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();
        let shared = open_conn(&path)?;
        Ok(Self {
            path,
            shared: Arc::new(Mutex::new(shared)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a transaction on a connection of its own. The write lock is
    /// taken up front: a deferred transaction that upgrades to a write
    /// mid-flight cannot wait on the busy handler, so concurrent writers
    /// would deadlock instead of queueing.
    pub fn begin(&self) -> DbResult<TxHandle> {
        let conn = open_conn(&self.path)?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(TxHandle {
            conn: Mutex::new(conn),
            finished: AtomicBool::new(false),
        })
    }

    /// Prepare a statement against the shared connection.
    pub fn prepare(&self, sql: &str) -> DbResult<StmtHandle> {
        StmtHandle::prepare(ConnTarget::Shared(Arc::clone(&self.shared)), sql)
    }

    /// Prepare a statement inside a live transaction.
    pub fn prepare_in_tx(tx: Arc<TxHandle>, sql: &str) -> DbResult<StmtHandle> {
        StmtHandle::prepare(ConnTarget::Tx(tx), sql)
    }
}

fn open_conn(path: &Path) -> DbResult<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// An open backing transaction, owning its connection.
pub struct TxHandle {
    conn: Mutex<Connection>,
    finished: AtomicBool,
}

impl TxHandle {
    pub fn commit(&self) -> DbResult<()> {
        self.finished.store(true, Ordering::SeqCst);
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback(&self) -> DbResult<()> {
        self.finished.store(true, Ordering::SeqCst);
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Implicit rollback for a transaction being reclaimed. Idempotent: a
    /// transaction that already committed or rolled back is left alone.
    pub fn abandon(&self) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            if let Ok(conn) = self.conn.lock() {
                let _ = conn.execute_batch("ROLLBACK");
            }
        }
    }
}

/// Where a statement runs: the shared autocommit connection, or the
/// connection owned by a live transaction.
enum ConnTarget {
    Shared(Arc<Mutex<Connection>>),
    Tx(Arc<TxHandle>),
}

impl ConnTarget {
    fn lock(&self) -> DbResult<MutexGuard<'_, Connection>> {
        match self {
            ConnTarget::Shared(conn) => Ok(conn.lock().unwrap()),
            ConnTarget::Tx(tx) => {
                if tx.finished.load(Ordering::SeqCst) {
                    return Err(DbError::Invalid(
                        "transaction has already been committed or rolled back".to_owned(),
                    ));
                }
                Ok(tx.conn.lock().unwrap())
            }
        }
    }
}

/// A prepared statement. Stores the SQL and its target connection; execution
/// re-enters the connection's prepared-statement cache, which `prepare`
/// validated and warmed.
pub struct StmtHandle {
    sql: String,
    target: ConnTarget,
}

impl std::fmt::Debug for StmtHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StmtHandle")
            .field("sql", &self.sql)
            .finish_non_exhaustive()
    }
}

impl StmtHandle {
    fn prepare(target: ConnTarget, sql: &str) -> DbResult<Self> {
        {
            let conn = target.lock()?;
            conn.prepare_cached(sql)?;
        }
        Ok(Self {
            sql: sql.to_owned(),
            target,
        })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Execute as a mutation.
    pub fn exec(&self, params: &[SqlParam]) -> DbResult<ExecOutcome> {
        let conn = self.target.lock()?;
        let mut stmt = conn.prepare_cached(&self.sql)?;
        bind_params(&mut stmt, params)?;
        let rows_affected = stmt.raw_execute()? as i64;
        Ok(ExecOutcome {
            last_insert_id: conn.last_insert_rowid(),
            rows_affected,
        })
    }

    /// Execute as a query, decoding the full result into a cursor.
    pub fn query(&self, params: &[SqlParam]) -> DbResult<Cursor> {
        let conn = self.target.lock()?;
        let mut stmt = conn.prepare_cached(&self.sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let decls: Vec<Option<String>> = stmt
            .columns()
            .iter()
            .map(|c| c.decl_type().map(str::to_ascii_lowercase))
            .collect();
        bind_params(&mut stmt, params)?;

        let mut buf = VecDeque::new();
        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for (i, decl) in decls.iter().enumerate() {
                values.push(decode_column(row.get_ref(i)?, decl.as_deref()));
            }
            buf.push_back(values);
        }
        Ok(Cursor {
            columns,
            rows: Mutex::new(buf),
        })
    }
}

/// Mutation outcome. SQLite reports both fields unconditionally.
#[derive(Debug, Clone, Copy)]
pub struct ExecOutcome {
    pub last_insert_id: i64,
    pub rows_affected: i64,
}

/// A forward-only result cursor. The position is the only mutable state.
pub struct Cursor {
    columns: Vec<String>,
    rows: Mutex<VecDeque<Vec<SqlValue>>>,
}

impl Cursor {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// The next row, or `None` at exhaustion.
    pub fn next_row(&self) -> Option<Vec<SqlValue>> {
        self.rows.lock().unwrap().pop_front()
    }
}

fn bind_params(stmt: &mut rusqlite::Statement<'_>, params: &[SqlParam]) -> DbResult<()> {
    for (pos, param) in params.iter().enumerate() {
        let index = match &param.name {
            Some(name) => named_index(stmt, name)?,
            None => pos + 1,
        };
        stmt.raw_bind_parameter(index, to_engine_value(&param.value))?;
    }
    Ok(())
}

fn named_index(stmt: &rusqlite::Statement<'_>, name: &str) -> DbResult<usize> {
    for prefix in [":", "@", "$"] {
        if let Some(index) = stmt.parameter_index(&format!("{}{}", prefix, name))? {
            return Ok(index);
        }
    }
    Err(DbError::Invalid(format!(
        "statement has no parameter named {:?}",
        name
    )))
}

fn to_engine_value(value: &SqlValue) -> EngineValue {
    match value {
        SqlValue::Null => EngineValue::Null,
        SqlValue::Integer(v) => EngineValue::Integer(*v),
        SqlValue::Real(v) => EngineValue::Real(*v),
        SqlValue::Text(v) => EngineValue::Text(v.clone()),
        SqlValue::Blob(v) => EngineValue::Blob(v.clone()),
        SqlValue::Boolean(v) => EngineValue::Integer(*v as i64),
        SqlValue::Timestamp(v) => EngineValue::Text(v.to_rfc3339()),
    }
}

/// Decode one column value, using the column's declared type to recover
/// booleans and timestamps from SQLite's narrower storage classes.
fn decode_column(value: ValueRef<'_>, decl: Option<&str>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => match decl {
            Some(d) if d.contains("bool") => SqlValue::Boolean(v != 0),
            _ => SqlValue::Integer(v),
        },
        ValueRef::Real(v) => SqlValue::Real(v),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            if let Some(d) = decl {
                if d.contains("date") || d.contains("time") {
                    if let Ok(ts) = DateTime::parse_from_rfc3339(&text) {
                        return SqlValue::Timestamp(ts.with_timezone(&Utc));
                    }
                }
            }
            SqlValue::Text(text)
        }
        ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine() -> (SqliteEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let engine = SqliteEngine::open(dir.path().join("test.db")).unwrap();
        (engine, dir)
    }

    #[test]
    fn exec_reports_rows_affected_and_insert_id() {
        let (engine, _dir) = test_engine();
        engine
            .prepare("create table t(a integer primary key, b)")
            .unwrap()
            .exec(&[])
            .unwrap();
        let insert = engine.prepare("insert into t(b) values(?)").unwrap();
        let outcome = insert.exec(&[SqlParam::positional(42)]).unwrap();
        assert_eq!(outcome.rows_affected, 1);
        assert_eq!(outcome.last_insert_id, 1);
    }

    #[test]
    fn query_walks_rows_in_order() {
        let (engine, _dir) = test_engine();
        engine.prepare("create table t(b)").unwrap().exec(&[]).unwrap();
        let insert = engine.prepare("insert into t values(?)").unwrap();
        for i in 0..3 {
            insert.exec(&[SqlParam::positional(i as i64)]).unwrap();
        }
        let cursor = engine
            .prepare("select b from t order by b")
            .unwrap()
            .query(&[])
            .unwrap();
        assert_eq!(cursor.columns(), ["b"]);
        for i in 0..3 {
            assert_eq!(cursor.next_row().unwrap(), vec![SqlValue::Integer(i)]);
        }
        assert!(cursor.next_row().is_none());
    }

    #[test]
    fn named_params_bind() {
        let (engine, _dir) = test_engine();
        engine.prepare("create table t(b)").unwrap().exec(&[]).unwrap();
        let outcome = engine
            .prepare("insert into t values(:n)")
            .unwrap()
            .exec(&[SqlParam::named("n", 7)])
            .unwrap();
        assert_eq!(outcome.rows_affected, 1);
    }

    #[test]
    fn declared_types_recover_bool_and_timestamp() {
        let (engine, _dir) = test_engine();
        engine
            .prepare("create table t(flag boolean, at datetime)")
            .unwrap()
            .exec(&[])
            .unwrap();
        let now = Utc::now();
        engine
            .prepare("insert into t values(?, ?)")
            .unwrap()
            .exec(&[SqlParam::positional(true), SqlParam::positional(now)])
            .unwrap();
        let cursor = engine.prepare("select flag, at from t").unwrap().query(&[]).unwrap();
        let row = cursor.next_row().unwrap();
        assert_eq!(row[0], SqlValue::Boolean(true));
        assert_eq!(row[1], SqlValue::Timestamp(now));
    }

    #[test]
    fn finished_transaction_rejects_statements() {
        let (engine, _dir) = test_engine();
        let tx = Arc::new(engine.begin().unwrap());
        tx.rollback().unwrap();
        let err = SqliteEngine::prepare_in_tx(tx, "select 1").unwrap_err();
        assert!(matches!(err, DbError::Invalid(_)));
    }

    #[test]
    fn syntax_errors_surface_at_prepare() {
        let (engine, _dir) = test_engine();
        let err = engine.prepare("definitely not sql").unwrap_err();
        assert!(matches!(err, DbError::Engine(_)));
    }
}
