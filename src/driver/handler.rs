//! Connection handler for the driver protocol.
//!
//! Reads framed commands off one TCP connection, executes them through the
//! session service, and writes framed responses back. Commands from different
//! connections run concurrently; the handle table is the only shared
//! synchronization point between them.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::session::Session;
use wiresql_client::protocol::{
    decode_message, encode_response, Command, DriverError, Response, DRIVER_MAGIC,
    MAX_MESSAGE_SIZE,
};

pub struct DriverHandler {
    session: Arc<Session>,
}

impl DriverHandler {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Handle one driver connection until the peer hangs up. Server-side
    /// handles the peer leaves behind are reclaimed by idle expiry, not here:
    /// they are addressable by id and another connection may still use them.
    pub async fn handle_connection(&self, mut stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = read_magic(&mut stream).await {
            tracing::warn!(%addr, "driver handshake failed: {}", e);
            return;
        }
        tracing::info!(%addr, "driver connection established");

        loop {
            let mut len_buf = [0u8; 4];
            match stream.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::debug!(%addr, "driver connection closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(%addr, "driver read error: {}", e);
                    break;
                }
            }

            let msg_len = u32::from_be_bytes(len_buf) as usize;
            if msg_len > MAX_MESSAGE_SIZE {
                let resp = Response::error(DriverError::MessageTooLarge);
                let _ = send_response(&mut stream, &resp).await;
                break;
            }

            let mut payload = vec![0u8; msg_len];
            if let Err(e) = stream.read_exact(&mut payload).await {
                tracing::warn!(%addr, "driver read payload error: {}", e);
                break;
            }

            let response = match decode_message::<Command>(&payload) {
                Ok(command) => self.execute(command).await,
                Err(e) => Response::error(e),
            };

            if let Err(e) = send_response(&mut stream, &response).await {
                tracing::warn!(%addr, "failed to send response: {}", e);
                break;
            }
        }
    }

    async fn execute(&self, command: Command) -> Response {
        match command {
            Command::Ping => Response::pong(),

            Command::Begin => match self.session.begin().await {
                Ok(tx) => Response::Begun { tx },
                Err(e) => Response::error(e.into()),
            },

            Command::Commit { tx } => match self.session.commit(tx).await {
                Ok(()) => Response::Ok,
                Err(e) => Response::error(e.into()),
            },

            Command::Rollback { tx } => match self.session.rollback(tx).await {
                Ok(()) => Response::Ok,
                Err(e) => Response::error(e.into()),
            },

            Command::Prepare { query, tx, in_tx } => {
                match self.session.prepare(query, tx, in_tx).await {
                    Ok(stmt) => Response::Prepared { stmt },
                    Err(e) => Response::error(e.into()),
                }
            }

            Command::Query { stmt, params } => match self.session.query(stmt, params).await {
                Ok((columns, cursor)) => Response::Rows { columns, cursor },
                Err(e) => Response::error(e.into()),
            },

            Command::Exec { stmt, params } => match self.session.exec(stmt, params).await {
                Ok(outcome) => Response::ExecResult {
                    last_insert_id: Some(outcome.last_insert_id),
                    last_insert_id_error: None,
                    rows_affected: Some(outcome.rows_affected),
                    rows_affected_error: None,
                },
                Err(e) => Response::error(e.into()),
            },

            Command::CursorNext { cursor, num_values } => {
                match self.session.cursor_next(cursor, num_values).await {
                    Ok((values, eof)) => Response::Row { values, eof },
                    Err(e) => Response::error(e.into()),
                }
            }

            Command::CursorClose { cursor } => match self.session.cursor_close(cursor) {
                Ok(()) => Response::Ok,
                Err(e) => Response::error(e.into()),
            },

            Command::CloseStatement { stmt } => match self.session.close_statement(stmt) {
                Ok(()) => Response::Ok,
                Err(e) => Response::error(e.into()),
            },
        }
    }
}

async fn read_magic(stream: &mut TcpStream) -> std::io::Result<()> {
    let mut magic = [0u8; DRIVER_MAGIC.len()];
    stream.read_exact(&mut magic).await?;
    if &magic[..] != DRIVER_MAGIC {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad magic header",
        ));
    }
    Ok(())
}

async fn send_response(stream: &mut TcpStream, response: &Response) -> Result<(), DriverError> {
    let data = encode_response(response)?;
    stream
        .write_all(&data)
        .await
        .map_err(|e| DriverError::ConnectionError(e.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|e| DriverError::ConnectionError(e.to_string()))?;
    Ok(())
}
