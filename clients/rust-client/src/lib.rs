//! wiresql Rust client.
//!
//! A driver for the wiresql remote-SQL protocol: connections, transactions,
//! prepared statements and forward-only cursors, reconstructed from round
//! trips over a framed MessagePack TCP protocol.
//!
//! # Example
//!
//! ```rust,no_run
//! use wiresql_client::{params, Connection};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), wiresql_client::DriverError> {
//!     let conn = Connection::connect("localhost:6750").await?;
//!
//!     conn.execute("create table if not exists t(universe)", params![]).await?;
//!     let result = conn.execute("insert into t values(?)", params![42]).await?;
//!     assert_eq!(result.rows_affected()?, 1);
//!
//!     let stmt = conn.prepare("select * from t").await?;
//!     let mut rows = stmt.query(params![]).await?;
//!     while let Some(row) = rows.next().await? {
//!         println!("{:?}", row);
//!     }
//!     rows.close().await?;
//!     stmt.close().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod protocol;

pub use client::{Connection, ExecResult, Rows, Statement, Transaction};
pub use protocol::{DriverError, HandleId, SqlParam, SqlValue};
