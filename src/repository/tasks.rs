//! The Task Repository (spec.md §4.B) — all reads and writes against the
//! `tasks` / `task_steps` / `task_logs` tables go through here.
//!
//! Owns exactly one connection behind a mutex and refuses re-entrant
//! transactions from the same task (spec.md §8 invariant #8): nesting
//! would otherwise either deadlock against itself or silently interleave
//! with an in-flight transaction.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::Serialize;

use crate::error::{CoreError, Result};
use crate::models::task::{LogEntry, LogLevel, PipelineMode, Stage, StageName, StageStatus, Task, TaskStatus};

use super::db::Db;
use super::pool::SqliteConn;
use super::schema::{task_logs, task_steps, tasks};

fn fmt_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| CoreError::fatal(format!("corrupt timestamp {s:?}: {e}")))
}

fn parse_time_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_time(&s)).transpose()
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = tasks)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct TaskRow {
    task_id: String,
    mode: String,
    pdf_name: String,
    file_hash: Option<String>,
    exam_dir_name: Option<String>,
    status: String,
    current_step: i32,
    error_message: Option<String>,
    expected_pages: Option<i32>,
    created_at: String,
    updated_at: String,
    finished_at: Option<String>,
    deleted_at: Option<String>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        Ok(Task {
            task_id: self.task_id,
            mode: PipelineMode::from_str(&self.mode)
                .ok_or_else(|| CoreError::fatal(format!("corrupt mode {:?}", self.mode)))?,
            pdf_name: self.pdf_name,
            file_hash: self.file_hash,
            exam_dir_name: self.exam_dir_name,
            status: TaskStatus::from_str(&self.status)
                .ok_or_else(|| CoreError::fatal(format!("corrupt status {:?}", self.status)))?,
            current_step: self.current_step,
            error_message: self.error_message,
            expected_pages: self.expected_pages.map(|v| v as u32),
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            finished_at: parse_time_opt(self.finished_at)?,
            deleted_at: parse_time_opt(self.deleted_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = tasks)]
struct NewTaskRow<'a> {
    task_id: &'a str,
    mode: &'a str,
    pdf_name: &'a str,
    file_hash: Option<&'a str>,
    exam_dir_name: Option<&'a str>,
    status: &'a str,
    current_step: i32,
    error_message: Option<&'a str>,
    expected_pages: Option<i32>,
    created_at: String,
    updated_at: String,
    finished_at: Option<String>,
    deleted_at: Option<String>,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = task_steps)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct StageRow {
    task_id: String,
    step_index: i32,
    name: String,
    title: String,
    status: String,
    error: Option<String>,
    started_at: Option<String>,
    ended_at: Option<String>,
    artifact_json: Option<String>,
}

impl StageRow {
    fn into_stage(self) -> Result<Stage> {
        Ok(Stage {
            task_id: self.task_id,
            step_index: self.step_index,
            name: StageName::from_str(&self.name)
                .ok_or_else(|| CoreError::fatal(format!("corrupt stage name {:?}", self.name)))?,
            title: self.title,
            status: StageStatus::from_str(&self.status)
                .ok_or_else(|| CoreError::fatal(format!("corrupt stage status {:?}", self.status)))?,
            started_at: parse_time_opt(self.started_at)?,
            ended_at: parse_time_opt(self.ended_at)?,
            error: self.error,
            artifact_refs: match self.artifact_json {
                Some(json) => serde_json::from_str(&json)
                    .map_err(|e| CoreError::fatal(format!("corrupt artifact_json: {e}")))?,
                None => Vec::new(),
            },
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = task_steps)]
struct NewStageRow<'a> {
    task_id: &'a str,
    step_index: i32,
    name: &'a str,
    title: &'a str,
    status: &'a str,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = task_logs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct LogRow {
    id: i64,
    task_id: String,
    created_at: String,
    level: String,
    message: String,
}

impl LogRow {
    fn into_entry(self) -> Result<LogEntry> {
        Ok(LogEntry {
            id: self.id,
            task_id: self.task_id,
            created_at: parse_time(&self.created_at)?,
            level: LogLevel::from_str(&self.level)
                .ok_or_else(|| CoreError::fatal(format!("corrupt log level {:?}", self.level)))?,
            message: self.message,
        })
    }
}

/// The bundle returned by [`TaskRepository::get_task`] (spec.md §4.B).
#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    pub task: Task,
    pub stages: Vec<Stage>,
    pub recent_logs: Vec<LogEntry>,
}

const MAX_RECENT_LOGS: i64 = 100;

/// Handle onto the single mutex-guarded SQLite connection (spec.md §4.B).
#[derive(Clone)]
pub struct TaskRepository {
    db: Db,
}

impl TaskRepository {
    pub fn new(conn: SqliteConn) -> Self {
        Self { db: Db::new(conn) }
    }

    pub fn from_db(db: Db) -> Self {
        Self { db }
    }

    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(
                &'c mut SqliteConn,
            )
                -> std::pin::Pin<Box<dyn std::future::Future<Output = std::result::Result<T, CoreError>> + Send + 'c>>
            + Send
            + 'static,
        T: Send + 'static,
    {
        self.db.run(f).await
    }

    pub async fn create_task(&self, task: &Task, stages: &[StageName]) -> Result<()> {
        let row = NewTaskRow {
            task_id: &task.task_id,
            mode: task.mode.as_str(),
            pdf_name: &task.pdf_name,
            file_hash: task.file_hash.as_deref(),
            exam_dir_name: task.exam_dir_name.as_deref(),
            status: task.status.as_str(),
            current_step: task.current_step,
            error_message: task.error_message.as_deref(),
            expected_pages: task.expected_pages.map(|v| v as i32),
            created_at: fmt_time(task.created_at),
            updated_at: fmt_time(task.updated_at),
            finished_at: task.finished_at.map(fmt_time),
            deleted_at: task.deleted_at.map(fmt_time),
        };
        let task_id = task.task_id.clone();
        let stage_rows: Vec<(i32, String, String)> = stages
            .iter()
            .map(|s| (s.index() as i32, s.as_str().to_string(), s.title().to_string()))
            .collect();

        self.run(move |conn| {
            Box::pin(async move {
                diesel::insert_into(tasks::table)
                    .values(&row)
                    .execute(conn)
                    .await?;
                for (step_index, name, title) in &stage_rows {
                    let new_stage = NewStageRow {
                        task_id: &task_id,
                        step_index: *step_index,
                        name,
                        title,
                        status: StageStatus::Pending.as_str(),
                    };
                    diesel::insert_into(task_steps::table)
                        .values(&new_stage)
                        .execute(conn)
                        .await?;
                }
                Ok(())
            })
        })
        .await
    }

    /// Bare task row, excluding soft-deleted. Internal callers that only
    /// need the task itself (the runner resuming a task it already holds
    /// stages for, `recover()` re-deriving its own stage list) use this
    /// instead of paying for the full bundle.
    pub async fn get_task_row(&self, task_id: &str) -> Result<Option<Task>> {
        let task_id = task_id.to_string();
        self.run(move |conn| {
            Box::pin(async move {
                let row = tasks::table
                    .filter(tasks::task_id.eq(&task_id))
                    .filter(tasks::deleted_at.is_null())
                    .select(TaskRow::as_select())
                    .first::<TaskRow>(conn)
                    .await
                    .optional()?;
                row.map(TaskRow::into_task).transpose()
            })
        })
        .await
    }

    /// `{ task, stages[0..4], recent_logs(≤100) }`, excluding soft-deleted.
    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskDetail>> {
        let Some(task) = self.get_task_row(task_id).await? else {
            return Ok(None);
        };
        let stages = self.get_stages(task_id).await?;
        let recent_logs = self.get_logs(task_id, None, MAX_RECENT_LOGS).await?;
        Ok(Some(TaskDetail {
            task,
            stages,
            recent_logs,
        }))
    }

    pub async fn get_stages(&self, task_id: &str) -> Result<Vec<Stage>> {
        let task_id = task_id.to_string();
        self.run(move |conn| {
            Box::pin(async move {
                let rows = task_steps::table
                    .filter(task_steps::task_id.eq(&task_id))
                    .order(task_steps::step_index.asc())
                    .select(StageRow::as_select())
                    .load::<StageRow>(conn)
                    .await?;
                rows.into_iter().map(StageRow::into_stage).collect()
            })
        })
        .await
    }

    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Task>> {
        self.run(move |conn| {
            Box::pin(async move {
                let mut query = tasks::table
                    .filter(tasks::deleted_at.is_null())
                    .into_boxed();
                if let Some(status) = status {
                    query = query.filter(tasks::status.eq(status.as_str()));
                }
                let rows = query
                    .order(tasks::created_at.desc())
                    .limit(limit)
                    .offset(offset)
                    .select(TaskRow::as_select())
                    .load::<TaskRow>(conn)
                    .await?;
                rows.into_iter().map(TaskRow::into_task).collect()
            })
        })
        .await
    }

    pub async fn find_task_by_hash(&self, file_hash: &str) -> Result<Option<Task>> {
        let file_hash = file_hash.to_string();
        self.run(move |conn| {
            Box::pin(async move {
                let row = tasks::table
                    .filter(tasks::file_hash.eq(&file_hash))
                    .filter(tasks::deleted_at.is_null())
                    .order(tasks::created_at.desc())
                    .select(TaskRow::as_select())
                    .first::<TaskRow>(conn)
                    .await
                    .optional()?;
                row.map(TaskRow::into_task).transpose()
            })
        })
        .await
    }

    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        current_step: i32,
        error_message: Option<&str>,
    ) -> Result<()> {
        let task_id = task_id.to_string();
        let error_message = error_message.map(|s| s.to_string());
        let now = fmt_time(Utc::now());
        let finished_at = status.is_terminal().then(|| now.clone());

        self.run(move |conn| {
            Box::pin(async move {
                diesel::update(tasks::table.filter(tasks::task_id.eq(&task_id)))
                    .set((
                        tasks::status.eq(status.as_str()),
                        tasks::current_step.eq(current_step),
                        tasks::error_message.eq(error_message),
                        tasks::updated_at.eq(&now),
                        tasks::finished_at.eq(finished_at),
                    ))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .await
    }

    pub async fn update_step_status(
        &self,
        task_id: &str,
        step_index: i32,
        status: StageStatus,
        error: Option<&str>,
        artifact_refs: Option<&[String]>,
    ) -> Result<()> {
        let task_id = task_id.to_string();
        let error = error.map(|s| s.to_string());
        let now = fmt_time(Utc::now());
        let artifact_json = artifact_refs
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| CoreError::fatal(format!("could not serialize artifact refs: {e}")))?;

        self.run(move |conn| {
            Box::pin(async move {
                let target = task_steps::table
                    .filter(task_steps::task_id.eq(&task_id))
                    .filter(task_steps::step_index.eq(step_index));

                match status {
                    StageStatus::Running => {
                        diesel::update(target)
                            .set((
                                task_steps::status.eq(status.as_str()),
                                task_steps::started_at.eq(&now),
                                task_steps::error.eq::<Option<String>>(None),
                            ))
                            .execute(conn)
                            .await?;
                    }
                    StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped => {
                        diesel::update(target)
                            .set((
                                task_steps::status.eq(status.as_str()),
                                task_steps::ended_at.eq(&now),
                                task_steps::error.eq(&error),
                                task_steps::artifact_json.eq(&artifact_json),
                            ))
                            .execute(conn)
                            .await?;
                    }
                    StageStatus::Pending => {
                        diesel::update(target)
                            .set((
                                task_steps::status.eq(status.as_str()),
                                task_steps::started_at.eq::<Option<String>>(None),
                                task_steps::ended_at.eq::<Option<String>>(None),
                                task_steps::error.eq::<Option<String>>(None),
                            ))
                            .execute(conn)
                            .await?;
                    }
                }
                Ok(())
            })
        })
        .await
    }

    pub async fn add_log(&self, task_id: &str, level: LogLevel, message: &str) -> Result<()> {
        let task_id = task_id.to_string();
        let message = message.to_string();
        let created_at = fmt_time(Utc::now());
        self.run(move |conn| {
            Box::pin(async move {
                diesel::insert_into(task_logs::table)
                    .values((
                        task_logs::task_id.eq(&task_id),
                        task_logs::created_at.eq(&created_at),
                        task_logs::level.eq(level.as_str()),
                        task_logs::message.eq(&message),
                    ))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .await
    }

    pub async fn get_logs(
        &self,
        task_id: &str,
        since_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<LogEntry>> {
        let task_id = task_id.to_string();
        self.run(move |conn| {
            Box::pin(async move {
                let mut query = task_logs::table
                    .filter(task_logs::task_id.eq(&task_id))
                    .into_boxed();
                if let Some(since_id) = since_id {
                    query = query.filter(task_logs::id.gt(since_id));
                }
                let rows = query
                    .order(task_logs::id.asc())
                    .limit(limit)
                    .select(LogRow::as_select())
                    .load::<LogRow>(conn)
                    .await?;
                rows.into_iter().map(LogRow::into_entry).collect()
            })
        })
        .await
    }

    /// Soft-delete: sets `deleted_at` rather than removing the row, so
    /// event/log history referencing the task id stays intact.
    pub async fn delete_task(&self, task_id: &str) -> Result<bool> {
        let task_id = task_id.to_string();
        let now = fmt_time(Utc::now());
        self.run(move |conn| {
            Box::pin(async move {
                let affected = diesel::update(
                    tasks::table
                        .filter(tasks::task_id.eq(&task_id))
                        .filter(tasks::deleted_at.is_null()),
                )
                .set(tasks::deleted_at.eq(&now))
                .execute(conn)
                .await?;
                Ok(affected > 0)
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::schema_init::init_schema;

    async fn repo() -> TaskRepository {
        let mut conn = super::super::pool::connect(std::path::Path::new(":memory:"))
            .await
            .unwrap();
        init_schema(&mut conn).await.unwrap();
        TaskRepository::new(conn)
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let repo = repo().await;
        let task = Task::new("t1", PipelineMode::Auto, "exam.pdf");
        repo.create_task(&task, &StageName::ALL).await.unwrap();

        let fetched = repo.get_task("t1").await.unwrap().expect("task exists");
        assert_eq!(fetched.task.pdf_name, "exam.pdf");
        assert_eq!(fetched.task.status, TaskStatus::Pending);
        assert_eq!(fetched.stages.len(), 5);
        assert!(fetched.recent_logs.is_empty());

        let stages = repo.get_stages("t1").await.unwrap();
        assert_eq!(stages.len(), 5);
        assert_eq!(stages[0].name, StageName::PdfToImages);
    }

    #[tokio::test]
    async fn nested_transaction_is_rejected() {
        let repo = repo().await;
        let task = Task::new("t1", PipelineMode::Auto, "exam.pdf");
        repo.create_task(&task, &StageName::ALL).await.unwrap();

        let repo_clone = repo.clone();
        let result: Result<()> = repo
            .run(move |_conn| {
                Box::pin(async move {
                    // Re-entering through the public API from inside an
                    // active transaction must be rejected, not deadlock.
                    match repo_clone.get_task("t1").await {
                        Err(CoreError::TransactionMisuse(_)) => Ok(()),
                        other => panic!("expected TransactionMisuse, got {other:?}"),
                    }
                })
            })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn update_status_sets_finished_at_on_terminal() {
        let repo = repo().await;
        let task = Task::new("t1", PipelineMode::Auto, "exam.pdf");
        repo.create_task(&task, &StageName::ALL).await.unwrap();
        repo.update_task_status("t1", TaskStatus::Completed, 4, None)
            .await
            .unwrap();
        let fetched = repo.get_task("t1").await.unwrap().unwrap();
        assert_eq!(fetched.task.status, TaskStatus::Completed);
        assert!(fetched.task.finished_at.is_some());
    }

    #[tokio::test]
    async fn list_tasks_filters_by_status_and_paginates() {
        let repo = repo().await;
        for (id, status) in [("t1", TaskStatus::Completed), ("t2", TaskStatus::Pending), ("t3", TaskStatus::Completed)] {
            let task = Task::new(id, PipelineMode::Auto, "exam.pdf");
            repo.create_task(&task, &StageName::ALL).await.unwrap();
            repo.update_task_status(id, status, 0, None).await.unwrap();
        }

        let completed = repo.list_tasks(Some(TaskStatus::Completed), 10, 0).await.unwrap();
        assert_eq!(completed.len(), 2);
        assert!(completed.iter().all(|t| t.status == TaskStatus::Completed));

        let page = repo.list_tasks(None, 1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn get_logs_respects_since_id_and_limit() {
        let repo = repo().await;
        let task = Task::new("t1", PipelineMode::Auto, "exam.pdf");
        repo.create_task(&task, &StageName::ALL).await.unwrap();
        for i in 0..5 {
            repo.add_log("t1", LogLevel::Info, &format!("line {i}")).await.unwrap();
        }

        let all = repo.get_logs("t1", None, 100).await.unwrap();
        assert_eq!(all.len(), 5);

        let since = repo.get_logs("t1", Some(all[1].id), 100).await.unwrap();
        assert_eq!(since.len(), 3);

        let limited = repo.get_logs("t1", None, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }
}
