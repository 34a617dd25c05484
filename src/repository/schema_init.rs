//! Idempotent schema bring-up: plain `CREATE TABLE IF NOT EXISTS`
//! statements run through `sql_query` rather than versioned migrations,
//! matching spec.md §4.B's "additive migrations only" requirement — there
//! is nothing to roll forward, so there is nothing to roll back.

use diesel_async::RunQueryDsl;

use super::pool::SqliteConn;

const STATEMENTS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS tasks (
        task_id TEXT PRIMARY KEY,
        mode TEXT NOT NULL,
        pdf_name TEXT NOT NULL,
        file_hash TEXT,
        exam_dir_name TEXT,
        status TEXT NOT NULL,
        current_step INTEGER NOT NULL,
        error_message TEXT,
        expected_pages INTEGER,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        finished_at TEXT,
        deleted_at TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS task_steps (
        task_id TEXT NOT NULL REFERENCES tasks(task_id),
        step_index INTEGER NOT NULL,
        name TEXT NOT NULL,
        title TEXT NOT NULL,
        status TEXT NOT NULL,
        error TEXT,
        started_at TEXT,
        ended_at TEXT,
        artifact_json TEXT,
        PRIMARY KEY (task_id, step_index)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS task_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL REFERENCES tasks(task_id),
        created_at TEXT NOT NULL,
        level TEXT NOT NULL,
        message TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS task_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        created_at TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_task_logs_task_id ON task_logs(task_id, id)",
    "CREATE INDEX IF NOT EXISTS idx_task_events_task_id ON task_events(task_id, id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_file_hash ON tasks(file_hash)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status_created_at ON tasks(status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at)",
];

pub async fn init_schema(conn: &mut SqliteConn) -> diesel::QueryResult<()> {
    for stmt in STATEMENTS {
        diesel::sql_query(*stmt).execute(conn).await?;
    }
    Ok(())
}
