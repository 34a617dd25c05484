//! The shared transaction guard over the single SQLite connection.
//!
//! Both [`super::tasks::TaskRepository`] and the Event Store
//! (`crate::events::store::EventStore`) are thin wrappers around one of
//! these, so a task's state transition and the event recording it can
//! share a connection without either module reaching into the other's
//! internals.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::AsyncConnection;
use tokio::sync::Mutex;

use crate::error::{CoreError, Result};

use super::pool::SqliteConn;

tokio::task_local! {
    static IN_TXN: Cell<bool>;
}

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<SqliteConn>>,
}

impl Db {
    pub fn new(conn: SqliteConn) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Sole path onto the connection (spec.md §4.B, §8 invariant #8). A
    /// re-entrant call from the same task is rejected before the mutex is
    /// touched, so nesting fails fast instead of deadlocking.
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(
                &'c mut SqliteConn,
            )
                -> Pin<Box<dyn Future<Output = std::result::Result<T, CoreError>> + Send + 'c>>
            + Send
            + 'static,
        T: Send + 'static,
    {
        let already_in_txn = IN_TXN.try_with(|c| c.get()).unwrap_or(false);
        if already_in_txn {
            return Err(CoreError::TransactionMisuse(
                "repository method called re-entrantly from an active transaction".to_string(),
            ));
        }

        let conn = self.conn.clone();
        IN_TXN
            .scope(Cell::new(true), async move {
                let mut guard = conn.lock().await;
                guard
                    .transaction::<T, CoreError, _>(|c| f(c).scope_boxed())
                    .await
            })
            .await
    }
}
