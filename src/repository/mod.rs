//! Persistence layer: a single SQLite connection, its schema, and the
//! [`TaskRepository`] that owns every transaction against it (spec.md
//! §4.B).

pub mod db;
pub mod pool;
pub mod schema;
pub mod schema_init;
pub mod tasks;

pub use db::Db;
pub use pool::{connect, SqliteConn};
pub use schema_init::init_schema;
pub use tasks::TaskRepository;
