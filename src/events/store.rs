//! The durable, append-only Event Store (spec.md §4.C).
//!
//! Shares the task repository's connection via [`Db`] so a stage's state
//! update and the event that announces it commit in the same write path,
//! even though they run as separate short transactions (SQLite serializes
//! writers on one connection regardless).

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::BigInt;
use diesel_async::RunQueryDsl;
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::models::task::StoredEvent;
use crate::repository::db::Db;
use crate::repository::schema::task_events;

#[derive(QueryableByName)]
struct LastRowId {
    #[diesel(sql_type = BigInt)]
    id: i64,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = task_events)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct EventRow {
    id: i64,
    task_id: String,
    event_type: String,
    payload_json: String,
    created_at: String,
}

impl EventRow {
    fn into_event(self) -> Result<StoredEvent> {
        Ok(StoredEvent {
            id: self.id,
            task_id: self.task_id,
            event_type: self.event_type,
            payload: serde_json::from_str(&self.payload_json)?,
            created_at: DateTime::parse_from_rfc3339(&self.created_at)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| CoreError::fatal(format!("corrupt event timestamp: {e}")))?,
        })
    }
}

#[derive(Clone)]
pub struct EventStore {
    db: Db,
}

impl EventStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn append(&self, task_id: &str, event_type: &str, payload: Value) -> Result<StoredEvent> {
        let task_id = task_id.to_string();
        let event_type = event_type.to_string();
        let created_at = Utc::now();
        let created_at_str = created_at.to_rfc3339();
        let payload_json = serde_json::to_string(&payload)?;

        self.db
            .run(move |conn| {
                Box::pin(async move {
                    diesel::insert_into(task_events::table)
                        .values((
                            task_events::task_id.eq(&task_id),
                            task_events::event_type.eq(&event_type),
                            task_events::payload_json.eq(&payload_json),
                            task_events::created_at.eq(&created_at_str),
                        ))
                        .execute(conn)
                        .await?;

                    let row: LastRowId =
                        diesel::sql_query("SELECT last_insert_rowid() AS id")
                            .get_result(conn)
                            .await?;

                    Ok(StoredEvent {
                        id: row.id,
                        task_id,
                        event_type,
                        payload,
                        created_at,
                    })
                })
            })
            .await
    }

    pub async fn list_since(&self, task_id: &str, after_id: i64, limit: i64) -> Result<Vec<StoredEvent>> {
        let task_id = task_id.to_string();
        self.db
            .run(move |conn| {
                Box::pin(async move {
                    let rows = task_events::table
                        .filter(task_events::task_id.eq(&task_id))
                        .filter(task_events::id.gt(after_id))
                        .order(task_events::id.asc())
                        .limit(limit)
                        .select(EventRow::as_select())
                        .load::<EventRow>(conn)
                        .await?;
                    rows.into_iter().map(EventRow::into_event).collect()
                })
            })
            .await
    }

    pub async fn get_latest_id(&self, task_id: &str) -> Result<i64> {
        let task_id = task_id.to_string();
        self.db
            .run(move |conn| {
                Box::pin(async move {
                    let max_id: Option<i64> = task_events::table
                        .filter(task_events::task_id.eq(&task_id))
                        .select(diesel::dsl::max(task_events::id))
                        .first(conn)
                        .await?;
                    Ok(max_id.unwrap_or(0))
                })
            })
            .await
    }

    pub async fn delete_for_task(&self, task_id: &str) -> Result<usize> {
        let task_id = task_id.to_string();
        self.db
            .run(move |conn| {
                Box::pin(async move {
                    let n = diesel::delete(task_events::table.filter(task_events::task_id.eq(&task_id)))
                        .execute(conn)
                        .await?;
                    Ok(n)
                })
            })
            .await
    }
}
