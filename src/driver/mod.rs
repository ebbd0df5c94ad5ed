//! Driver protocol server.
//!
//! The protocol is a stateless request/response exchange: every stateful
//! abstraction a SQL client expects (transactions, prepared statements,
//! cursors) is reconstructed from opaque handle ids issued by the session
//! service and parked in the handle table between calls.
//!
//! Framing, shared with the client crate:
//! - **Magic header**: `wiresql-drv-v1\0` (15 bytes, sent once on connection)
//! - **Request frame**: `[length: 4 bytes BE][MessagePack payload]`
//! - **Response frame**: `[length: 4 bytes BE][MessagePack payload]`

pub mod handler;
pub mod session;

pub use handler::DriverHandler;
pub use session::{Session, SqlHandle};

use std::sync::Arc;

use tokio::net::TcpListener;

/// Accept driver connections forever, spawning one handler task per peer.
pub async fn serve(listener: TcpListener, session: Arc<Session>) -> std::io::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%addr, "failed to set nodelay: {}", e);
        }
        let handler = DriverHandler::new(Arc::clone(&session));
        tokio::spawn(async move { handler.handle_connection(stream, addr).await });
    }
}
