//! Read-only diagnostic HTTP surface.
//!
//! Lists live handles for operational inspection. Performs no mutation and is
//! entirely outside the driver protocol.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::driver::Session;

pub fn create_router(session: Arc<Session>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/handles", get(handles))
        .layer(TraceLayer::new_for_http())
        .with_state(session)
}

async fn health() -> &'static str {
    "ok"
}

/// Live handle ids and their kind tags, sorted by id.
async fn handles(State(session): State<Arc<Session>>) -> Json<Value> {
    let entries: Vec<Value> = session
        .handles()
        .snapshot()
        .into_iter()
        .map(|(id, kind)| json!({ "id": id.0, "kind": kind }))
        .collect();
    Json(Value::Array(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SqliteEngine;
    use wiresql_client::protocol::HandleId;

    #[tokio::test]
    async fn handles_listing_reports_live_ids_and_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SqliteEngine::open(dir.path().join("test.db")).unwrap();
        let session = Session::new(engine, None);

        let tx = session.begin().await.unwrap();
        let stmt = session
            .prepare("select 1".into(), HandleId(0), false)
            .await
            .unwrap();

        let Json(body) = handles(State(Arc::clone(&session))).await;
        assert_eq!(
            body,
            json!([
                { "id": tx.0, "kind": "transaction" },
                { "id": stmt.0, "kind": "statement" },
            ])
        );

        session.rollback(tx).await.unwrap();
        session.close_statement(stmt).unwrap();
        let Json(body) = handles(State(Arc::clone(&session))).await;
        assert_eq!(body, json!([]));
    }
}
