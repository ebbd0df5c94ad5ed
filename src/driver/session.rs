//! Remote session service: one method per protocol operation, executed
//! against the backing engine with every resulting stateful object parked in
//! the handle table.
//!
//! Engine work always runs on the blocking pool, never under the handle-table
//! lock, so a writer waiting on SQLite's lock cannot starve unrelated handle
//! operations or the async runtime.

use std::sync::Arc;
use std::time::Duration;

use tokio::task;

use crate::engine::{Cursor, ExecOutcome, SqliteEngine, StmtHandle, TxHandle};
use crate::error::{DbError, DbResult};
use crate::handles::{HandleTable, HandleValue};
use wiresql_client::protocol::{HandleId, SqlParam, SqlValue};

/// The closed set of objects a handle can refer to.
#[derive(Clone)]
pub enum SqlHandle {
    Tx(Arc<TxHandle>),
    Stmt(Arc<StmtHandle>),
    Cursor(Arc<Cursor>),
}

impl HandleValue for SqlHandle {
    fn release(&self) {
        match self {
            // A reclaimed transaction is rolled back.
            SqlHandle::Tx(tx) => tx.abandon(),
            // Statements and cursors hold no engine-side state beyond their
            // allocation; dropping the handle is the close.
            SqlHandle::Stmt(_) | SqlHandle::Cursor(_) => {}
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            SqlHandle::Tx(_) => "transaction",
            SqlHandle::Stmt(_) => "statement",
            SqlHandle::Cursor(_) => "cursor",
        }
    }
}

pub struct Session {
    engine: Arc<SqliteEngine>,
    handles: Arc<HandleTable<SqlHandle>>,
}

impl Session {
    pub fn new(engine: SqliteEngine, expiry: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            engine: Arc::new(engine),
            handles: Arc::new(HandleTable::new(expiry)),
        })
    }

    pub fn handles(&self) -> &Arc<HandleTable<SqlHandle>> {
        &self.handles
    }

    /// Start idle-handle expiry, when configured.
    pub fn spawn_expiry(&self) -> Option<task::JoinHandle<()>> {
        self.handles.spawn_expiry()
    }

    pub async fn begin(&self) -> DbResult<HandleId> {
        let engine = Arc::clone(&self.engine);
        let tx = run_blocking(move || engine.begin()).await?;
        Ok(self.handles.create(SqlHandle::Tx(Arc::new(tx))))
    }

    /// The handle is spent whether or not the commit succeeds; the backing
    /// transaction is no longer valid either way.
    pub async fn commit(&self, id: HandleId) -> DbResult<()> {
        let tx = self.take_tx(id)?;
        run_blocking(move || tx.commit()).await
    }

    pub async fn rollback(&self, id: HandleId) -> DbResult<()> {
        let tx = self.take_tx(id)?;
        run_blocking(move || tx.rollback()).await
    }

    pub async fn prepare(&self, query: String, tx: HandleId, in_tx: bool) -> DbResult<HandleId> {
        let stmt = if in_tx {
            let tx = self.get_tx(tx)?;
            run_blocking(move || SqliteEngine::prepare_in_tx(tx, &query)).await?
        } else {
            let engine = Arc::clone(&self.engine);
            run_blocking(move || engine.prepare(&query)).await?
        };
        Ok(self.handles.create(SqlHandle::Stmt(Arc::new(stmt))))
    }

    pub async fn query(
        &self,
        stmt: HandleId,
        params: Vec<SqlParam>,
    ) -> DbResult<(Vec<String>, HandleId)> {
        let stmt = self.get_stmt(stmt)?;
        let cursor = run_blocking(move || stmt.query(&params)).await?;
        let columns = cursor.columns().to_vec();
        let id = self.handles.create(SqlHandle::Cursor(Arc::new(cursor)));
        Ok((columns, id))
    }

    pub async fn exec(&self, stmt: HandleId, params: Vec<SqlParam>) -> DbResult<ExecOutcome> {
        let stmt = self.get_stmt(stmt)?;
        run_blocking(move || stmt.exec(&params)).await
    }

    /// Advance a cursor. Exhaustion frees the cursor handle, so a later close
    /// is a no-op.
    pub async fn cursor_next(
        &self,
        id: HandleId,
        num_values: usize,
    ) -> DbResult<(Vec<SqlValue>, bool)> {
        let cursor = self.get_cursor(id)?;
        let width = cursor.columns().len();
        if num_values != width {
            return Err(DbError::Invalid(format!(
                "cursor has {} columns, caller asked for {}",
                width, num_values
            )));
        }
        match cursor.next_row() {
            Some(values) => Ok((values, false)),
            None => {
                self.handles.release(id);
                Ok((Vec::new(), true))
            }
        }
    }

    /// Release a cursor, tolerating one that is already gone (exhausted,
    /// expired, or closed twice).
    pub fn cursor_close(&self, id: HandleId) -> DbResult<()> {
        match self.handles.get(id) {
            Some(SqlHandle::Cursor(_)) => {
                self.handles.release(id);
                Ok(())
            }
            Some(_) => Err(DbError::WrongHandleKind(id, "cursor")),
            None => Ok(()),
        }
    }

    /// Release a statement, tolerating "already gone" silently.
    pub fn close_statement(&self, id: HandleId) -> DbResult<()> {
        match self.handles.get(id) {
            Some(SqlHandle::Stmt(_)) => {
                self.handles.release(id);
                Ok(())
            }
            Some(_) => Err(DbError::WrongHandleKind(id, "statement")),
            None => Ok(()),
        }
    }

    fn take_tx(&self, id: HandleId) -> DbResult<Arc<TxHandle>> {
        match self.handles.get(id).ok_or(DbError::UnknownHandle(id))? {
            SqlHandle::Tx(_) => {}
            _ => return Err(DbError::WrongHandleKind(id, "transaction")),
        }
        match self.handles.take(id) {
            Some(SqlHandle::Tx(tx)) => Ok(tx),
            _ => Err(DbError::UnknownHandle(id)),
        }
    }

    fn get_tx(&self, id: HandleId) -> DbResult<Arc<TxHandle>> {
        match self.handles.get(id).ok_or(DbError::UnknownHandle(id))? {
            SqlHandle::Tx(tx) => Ok(tx),
            _ => Err(DbError::WrongHandleKind(id, "transaction")),
        }
    }

    fn get_stmt(&self, id: HandleId) -> DbResult<Arc<StmtHandle>> {
        match self.handles.get(id).ok_or(DbError::UnknownHandle(id))? {
            SqlHandle::Stmt(stmt) => Ok(stmt),
            _ => Err(DbError::WrongHandleKind(id, "statement")),
        }
    }

    fn get_cursor(&self, id: HandleId) -> DbResult<Arc<Cursor>> {
        match self.handles.get(id).ok_or(DbError::UnknownHandle(id))? {
            SqlHandle::Cursor(cursor) => Ok(cursor),
            _ => Err(DbError::WrongHandleKind(id, "cursor")),
        }
    }
}

async fn run_blocking<T, F>(f: F) -> DbResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> DbResult<T> + Send + 'static,
{
    match task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(DbError::Internal(format!("engine task failed: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiresql_client::params;

    async fn test_session() -> (Arc<Session>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let engine = SqliteEngine::open(dir.path().join("test.db")).unwrap();
        (Session::new(engine, None), dir)
    }

    #[tokio::test]
    async fn prepare_against_committed_tx_is_unknown_handle() {
        let (session, _dir) = test_session().await;
        let tx = session.begin().await.unwrap();
        session.commit(tx).await.unwrap();
        let err = session
            .prepare("select 1".into(), tx, true)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::UnknownHandle(id) if id == tx));
    }

    #[tokio::test]
    async fn commit_spends_the_handle_even_on_failure() {
        let (session, _dir) = test_session().await;
        let tx = session.begin().await.unwrap();
        session.commit(tx).await.unwrap();
        // Second commit: the handle no longer resolves.
        let err = session.commit(tx).await.unwrap_err();
        assert!(matches!(err, DbError::UnknownHandle(_)));
        assert_eq!(session.handles().len(), 0);
    }

    #[tokio::test]
    async fn cursor_exhaustion_frees_the_handle() {
        let (session, _dir) = test_session().await;
        let create = session.prepare("create table t(b)".into(), HandleId(0), false).await.unwrap();
        session.exec(create, params![]).await.unwrap();
        session.close_statement(create).unwrap();
        let insert = session.prepare("insert into t values(?)".into(), HandleId(0), false).await.unwrap();
        session.exec(insert, params![1]).await.unwrap();
        session.exec(insert, params![2]).await.unwrap();
        session.close_statement(insert).unwrap();

        let select = session.prepare("select b from t order by b".into(), HandleId(0), false).await.unwrap();
        let (columns, cursor) = session.query(select, params![]).await.unwrap();
        assert_eq!(columns, ["b"]);
        let (row, eof) = session.cursor_next(cursor, 1).await.unwrap();
        assert!(!eof);
        assert_eq!(row, vec![SqlValue::Integer(1)]);
        let (_, eof) = session.cursor_next(cursor, 1).await.unwrap();
        assert!(!eof);
        let (row, eof) = session.cursor_next(cursor, 1).await.unwrap();
        assert!(eof);
        assert!(row.is_empty());

        // The cursor is gone; closing again is a silent no-op.
        session.cursor_close(cursor).unwrap();
        session.close_statement(select).unwrap();
        assert_eq!(session.handles().len(), 0);
    }

    #[tokio::test]
    async fn cursor_width_mismatch_is_an_error_not_eof() {
        let (session, _dir) = test_session().await;
        let stmt = session.prepare("select 1, 2".into(), HandleId(0), false).await.unwrap();
        let (_, cursor) = session.query(stmt, params![]).await.unwrap();
        let err = session.cursor_next(cursor, 1).await.unwrap_err();
        assert!(matches!(err, DbError::Invalid(_)));
    }

    #[tokio::test]
    async fn wrong_handle_kind_is_rejected() {
        let (session, _dir) = test_session().await;
        let stmt = session.prepare("select 1".into(), HandleId(0), false).await.unwrap();
        let err = session.commit(stmt).await.unwrap_err();
        assert!(matches!(err, DbError::WrongHandleKind(_, "transaction")));
        // The statement survived the refused commit.
        assert_eq!(session.handles().len(), 1);
    }
}
