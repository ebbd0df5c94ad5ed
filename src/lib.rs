pub mod driver;
pub mod engine;
pub mod error;
pub mod handles;
pub mod server;

pub use driver::{serve, DriverHandler, Session, SqlHandle};
pub use engine::SqliteEngine;
pub use error::{DbError, DbResult};
pub use handles::{HandleTable, HandleValue};
pub use server::create_router;
