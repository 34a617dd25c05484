//! A single async SQLite connection behind a mutex.
//!
//! This core only ever talks to one SQLite database (spec.md §6 names one
//! transactional store), so there is exactly one `diesel-async`
//! sync-wrapper connection rather than a multi-connection pool. Keeping
//! exactly one connection is what lets the non-reentrant transaction guard
//! in [`super::db`] mean something: there is only ever one writer to
//! serialize.

use diesel::sqlite::SqliteConnection;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_async::AsyncConnection;
use std::path::Path;

pub type DieselError = diesel::result::Error;
pub type SqliteConn = SyncConnectionWrapper<SqliteConnection>;

/// Open a single async SQLite connection and apply the pragmas a
/// single-writer SQLite setup needs for reasonable concurrency, via
/// `diesel::sql_query` run through the async wrapper.
pub async fn connect(db_path: &Path) -> Result<SqliteConn, DieselError> {
    let url = db_path.display().to_string();
    let mut conn = SqliteConn::establish(&url).await?;

    use diesel_async::RunQueryDsl;
    for pragma in [
        "PRAGMA journal_mode = WAL",
        "PRAGMA synchronous = NORMAL",
        "PRAGMA foreign_keys = ON",
        "PRAGMA busy_timeout = 30000",
    ] {
        diesel::sql_query(pragma).execute(&mut conn).await?;
    }

    Ok(conn)
}
