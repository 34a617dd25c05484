//! Integration tests for the six concrete scenarios in spec.md §8, driven
//! against the real `PipelineRunner`/`TaskRepository`/`EventStore` over an
//! in-memory SQLite connection, with fake `StepExecutor`s standing in for
//! the real stage bodies (pdf rasterization, OCR, etc. are out of scope
//! here — only runner/event/recovery orchestration is under test).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use examcore::artifact::ArtifactStore;
use examcore::error::{CoreError, Result};
use examcore::events::{CompositeSink, EventStore, LiveBus};
use examcore::models::{PipelineMode, StageName, StageStatus, Task, TaskStatus};
use examcore::recovery::RecoveryService;
use examcore::repository::{db::Db, pool, schema_init::init_schema, TaskRepository};
use examcore::runner::PipelineRunner;
use examcore::stages::{StepContext, StepExecutor, StepSuccess};

/// A `StepExecutor` whose behavior per invocation is scripted by a closure,
/// so each scenario can make exactly one stage misbehave.
struct ScriptedStep {
    name: StageName,
    attempts: AtomicU32,
    delay: std::time::Duration,
    behavior: Box<dyn Fn(u32) -> Result<StepSuccess> + Send + Sync>,
}

impl ScriptedStep {
    fn succeeding(name: StageName) -> Arc<Self> {
        Arc::new(Self {
            name,
            attempts: AtomicU32::new(0),
            delay: std::time::Duration::ZERO,
            behavior: Box::new(|_attempt| Ok(StepSuccess::default())),
        })
    }

    /// Like `succeeding`, but takes `delay` to execute — long enough for a
    /// concurrently-issued `cancel()` to land while this stage is in flight.
    fn slow_succeeding(name: StageName, delay: std::time::Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            attempts: AtomicU32::new(0),
            delay,
            behavior: Box::new(|_attempt| Ok(StepSuccess::default())),
        })
    }

    fn always_fatal(name: StageName) -> Arc<Self> {
        Arc::new(Self {
            name,
            attempts: AtomicU32::new(0),
            delay: std::time::Duration::ZERO,
            behavior: Box::new(|_attempt| Err(CoreError::fatal("simulated non-retryable failure"))),
        })
    }

    fn always_retryable(name: StageName) -> Arc<Self> {
        Arc::new(Self {
            name,
            attempts: AtomicU32::new(0),
            delay: std::time::Duration::ZERO,
            behavior: Box::new(|_attempt| Err(CoreError::retryable("simulated transient failure"))),
        })
    }
}

#[async_trait]
impl StepExecutor for ScriptedStep {
    fn name(&self) -> StageName {
        self.name
    }

    async fn prepare(&self, _ctx: &StepContext) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, _ctx: &StepContext) -> Result<StepSuccess> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        (self.behavior)(attempt)
    }

    async fn rollback(&self, _ctx: &StepContext) -> Result<()> {
        Ok(())
    }
}

async fn harness() -> (TaskRepository, CompositeSink, Arc<ArtifactStore>, tempfile::TempDir) {
    let mut conn = pool::connect(std::path::Path::new(":memory:")).await.unwrap();
    init_schema(&mut conn).await.unwrap();
    let db = Db::new(conn);
    let repo = TaskRepository::from_db(db.clone());
    let store = EventStore::new(db);
    let bus = LiveBus::new();
    let sink = CompositeSink::new(store, bus);
    let dir = tempfile::tempdir().unwrap();
    let artifacts = Arc::new(ArtifactStore::new(dir.path().join("artifacts")));
    (repo, sink, artifacts, dir)
}

fn ctx(task: &Task, workdir: PathBuf, artifacts: Arc<ArtifactStore>) -> StepContext {
    StepContext {
        task_id: task.task_id.clone(),
        pdf_path: workdir.join("input.pdf"),
        workdir,
        file_hash: None,
        expected_pages: None,
        mode: task.mode,
        metadata: HashMap::new(),
        artifacts,
    }
}

async fn event_types(sink: &CompositeSink, task_id: &str) -> Vec<String> {
    sink.store()
        .list_since(task_id, 0, 1000)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

/// Scenario 1: happy path, all five stages succeed.
#[tokio::test]
async fn happy_path_all_stages_succeed() {
    let (repo, sink, artifacts, dir) = harness().await;
    let task = Task::new("t1", PipelineMode::Auto, "a.pdf");
    repo.create_task(&task, &StageName::ALL).await.unwrap();

    let steps: Vec<Arc<dyn StepExecutor>> = StageName::ALL
        .iter()
        .map(|n| ScriptedStep::succeeding(*n) as Arc<dyn StepExecutor>)
        .collect();
    let runner = PipelineRunner::new(steps, repo.clone(), sink.clone());

    let step_ctx = ctx(&task, dir.path().join("workdir"), artifacts);
    let finished = runner.run(&step_ctx, None).await.unwrap();

    assert_eq!(finished.status, TaskStatus::Completed);

    let types = event_types(&sink, "t1").await;
    assert_eq!(
        types,
        vec![
            "pipeline_started",
            "step_started",
            "step_completed",
            "step_started",
            "step_completed",
            "step_started",
            "step_completed",
            "step_started",
            "step_completed",
            "step_started",
            "step_completed",
            "pipeline_completed",
        ]
    );
}

/// Scenario 2: stage 2 (`analyze_data`, non-critical) fails every attempt.
/// The run should still reach stage 4; since stage 2 never completes, the
/// task is not all-clean and ends `pending`, not `failed`.
#[tokio::test]
async fn noncritical_stage_failure_does_not_abort_run() {
    let (repo, sink, artifacts, dir) = harness().await;
    let task = Task::new("t2", PipelineMode::Auto, "a.pdf");
    repo.create_task(&task, &StageName::ALL).await.unwrap();

    let steps: Vec<Arc<dyn StepExecutor>> = vec![
        ScriptedStep::succeeding(StageName::PdfToImages),
        ScriptedStep::succeeding(StageName::ExtractQuestions),
        ScriptedStep::always_fatal(StageName::AnalyzeData),
        ScriptedStep::succeeding(StageName::ComposeLongImage),
        ScriptedStep::succeeding(StageName::CollectResults),
    ];
    let runner = PipelineRunner::new(steps, repo.clone(), sink.clone())
        .with_retry_policy(0, std::time::Duration::from_millis(1));

    let step_ctx = ctx(&task, dir.path().join("workdir"), artifacts);
    let finished = runner.run(&step_ctx, None).await.unwrap();

    assert_eq!(finished.status, TaskStatus::Pending);

    let stages = repo.get_stages("t2").await.unwrap();
    assert_eq!(stages[2].status, StageStatus::Failed);
    assert_eq!(stages[3].status, StageStatus::Completed);
    assert_eq!(stages[4].status, StageStatus::Completed);

    let types = event_types(&sink, "t2").await;
    assert!(types.contains(&"step_failed".to_string()));
    assert!(!types.contains(&"pipeline_failed".to_string()));
}

/// Scenario 3: stage 1 (`extract_questions`, critical) exhausts all
/// retries. Expect a short-circuit to `pipeline_failed` and task `failed`.
#[tokio::test]
async fn critical_stage_failure_after_retries_fails_task() {
    let (repo, sink, artifacts, dir) = harness().await;
    let task = Task::new("t3", PipelineMode::Auto, "a.pdf");
    repo.create_task(&task, &StageName::ALL).await.unwrap();

    let steps: Vec<Arc<dyn StepExecutor>> = vec![
        ScriptedStep::succeeding(StageName::PdfToImages),
        ScriptedStep::always_retryable(StageName::ExtractQuestions),
        ScriptedStep::succeeding(StageName::AnalyzeData),
        ScriptedStep::succeeding(StageName::ComposeLongImage),
        ScriptedStep::succeeding(StageName::CollectResults),
    ];
    let runner = PipelineRunner::new(steps, repo.clone(), sink.clone())
        .with_retry_policy(3, std::time::Duration::from_millis(1));

    let step_ctx = ctx(&task, dir.path().join("workdir"), artifacts);
    let finished = runner.run(&step_ctx, None).await.unwrap();

    assert_eq!(finished.status, TaskStatus::Failed);
    assert!(finished.error_message.is_some());

    let types = event_types(&sink, "t3").await;
    let retrying_count = types.iter().filter(|t| *t == "step_retrying").count();
    assert_eq!(retrying_count, 3);
    assert_eq!(types.last().map(String::as_str), Some("pipeline_failed"));

    let stages = repo.get_stages("t3").await.unwrap();
    assert_eq!(stages[2].status, StageStatus::Pending, "stage 2 never started");
}

/// Scenario 4 (SSE reconnection replay), exercised directly against the
/// Event Store: `list_since` returns only events with id > after_id,
/// ascending, with no duplicates and nothing at or below the cursor.
#[tokio::test]
async fn list_since_replays_only_events_after_cursor() {
    let (repo, sink, _artifacts, _dir) = harness().await;
    let task = Task::new("t4", PipelineMode::Auto, "a.pdf");
    repo.create_task(&task, &StageName::ALL).await.unwrap();

    for i in 0..12 {
        sink.emit("t4", "progress", serde_json::json!({ "n": i })).await.unwrap();
    }

    let replayed = sink.store().list_since("t4", 5, 1000).await.unwrap();
    assert_eq!(replayed.len(), 7);
    assert!(replayed.iter().all(|e| e.id > 5));
    let ids: Vec<i64> = replayed.iter().map(|e| e.id).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted, "must be ascending");

    // Two more "live" events arriving during replay.
    sink.emit("t4", "progress", serde_json::json!({ "n": 12 })).await.unwrap();
    sink.emit("t4", "progress", serde_json::json!({ "n": 13 })).await.unwrap();

    let all_after_five = sink.store().list_since("t4", 5, 1000).await.unwrap();
    assert_eq!(all_after_five.len(), 9);
    let unique: std::collections::HashSet<i64> = all_after_five.iter().map(|e| e.id).collect();
    assert_eq!(unique.len(), all_after_five.len(), "no duplicates");
}

/// Scenario 5: cancelling mid-pipeline lets the in-flight stage finish,
/// then stops before the next `step_started` and leaves the task `pending`.
#[tokio::test]
async fn cancel_mid_pipeline_stops_before_next_stage() {
    let (repo, sink, artifacts, dir) = harness().await;
    let task = Task::new("t5", PipelineMode::Auto, "a.pdf");
    repo.create_task(&task, &StageName::ALL).await.unwrap();

    let steps: Vec<Arc<dyn StepExecutor>> = vec![
        ScriptedStep::slow_succeeding(StageName::PdfToImages, std::time::Duration::from_millis(100)),
        ScriptedStep::succeeding(StageName::ExtractQuestions),
        ScriptedStep::succeeding(StageName::AnalyzeData),
        ScriptedStep::succeeding(StageName::ComposeLongImage),
        ScriptedStep::succeeding(StageName::CollectResults),
    ];
    let runner = Arc::new(PipelineRunner::new(steps, repo.clone(), sink.clone()));

    let step_ctx = ctx(&task, dir.path().join("workdir"), artifacts);

    let runner_for_run = runner.clone();
    let handle = tokio::spawn(async move { runner_for_run.run(&step_ctx, None).await });

    // Give stage 0 time to start (but not finish its 100ms delay), then
    // cancel while it's still in flight.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    runner.cancel("t5");

    let finished = handle.await.unwrap().unwrap();
    assert_eq!(finished.status, TaskStatus::Pending);

    let types = event_types(&sink, "t5").await;
    assert!(types.contains(&"pipeline_cancelled".to_string()));
    // Cancellation is cooperative and only checked between stages: the
    // in-flight stage (0) always runs to completion, but no later stage
    // ever gets a `step_started`.
    let started_count = types.iter().filter(|t| *t == "step_started").count();
    let completed_count = types.iter().filter(|t| *t == "step_completed").count();
    assert_eq!(started_count, 1);
    assert_eq!(completed_count, 1);
}

/// Scenario 6: recovery after a crash mid-stage-3. Stages 0-2 completed
/// with valid artifacts; stage 3 was `running` at crash time. Recovery
/// resets stage 3 (and leaves stage 4 `pending`); a fresh run with
/// `start_from_step=None` then short-circuits stages 0-2 as already
/// completed and executes stages 3-4.
#[tokio::test]
async fn recovery_resets_crashed_stage_then_resumes() {
    let (repo, sink, artifacts, dir) = harness().await;
    let task = Task::new("t6", PipelineMode::Auto, "a.pdf");
    repo.create_task(&task, &StageName::ALL).await.unwrap();

    // RecoveryService derives the workdir from `exam_dir_name` (unset here)
    // falling back to the task id, joined to its configured root.
    let workdir = dir.path().join("t6");
    tokio::fs::create_dir_all(&workdir).await.unwrap();

    for idx in 0..3 {
        let r#ref = artifacts
            .save("t6", StageName::from_index(idx).unwrap().as_str(), "out", b"ok")
            .await
            .unwrap();
        repo.update_step_status("t6", idx as i32, StageStatus::Completed, None, Some(&[r#ref]))
            .await
            .unwrap();
    }
    repo.update_step_status("t6", 3, StageStatus::Running, None, None).await.unwrap();
    repo.update_task_status("t6", TaskStatus::Processing, 3, None).await.unwrap();

    let recovery = RecoveryService::new(repo.clone(), artifacts.clone(), dir.path().to_path_buf());
    let snapshots = recovery.recover().await.unwrap();
    let snapshot = snapshots.iter().find(|s| s.task.task_id == "t6").expect("t6 recovered");
    assert_eq!(snapshot.stages[3].status, StageStatus::Pending);
    assert_eq!(snapshot.stages[4].status, StageStatus::Pending);
    assert_eq!(snapshot.stages[0].status, StageStatus::Completed);

    let steps: Vec<Arc<dyn StepExecutor>> = StageName::ALL
        .iter()
        .map(|n| ScriptedStep::succeeding(*n) as Arc<dyn StepExecutor>)
        .collect();
    let runner = PipelineRunner::new(steps, repo.clone(), sink.clone());
    let step_ctx = ctx(&task, workdir, artifacts);
    let finished = runner.run(&step_ctx, None).await.unwrap();

    assert_eq!(finished.status, TaskStatus::Completed);
    let types = event_types(&sink, "t6").await;
    let skipped = types.iter().filter(|t| *t == "step_skipped").count();
    assert_eq!(skipped, 3, "stages 0-2 short-circuit as already completed");
}
