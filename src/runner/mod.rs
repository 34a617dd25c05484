//! The Pipeline Runner (spec.md §4.J): drives the five Step Executors in
//! order, owns the retry/backoff policy, and emits the event sequence
//! observers rely on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::Rng;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, Result};
use crate::events::CompositeSink;
use crate::models::task::{StageStatus, Task, TaskStatus};
use crate::repository::TaskRepository;
use crate::stages::{StepContext, StepExecutor, StepSuccess};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// RAII handle removing the task's cancellation token on drop, so every
/// `run` exit path (early return, panic-unwind, fall-through) unregisters
/// it without needing to repeat the cleanup at each `return`.
struct RunGuard<'a> {
    runner: &'a PipelineRunner,
    task_id: String,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.runner.tokens.lock().expect("tokens mutex poisoned").remove(&self.task_id);
    }
}

pub struct PipelineRunner {
    steps: Vec<Arc<dyn StepExecutor>>,
    repo: TaskRepository,
    sink: CompositeSink,
    max_retries: u32,
    retry_delay: Duration,
    tokens: StdMutex<HashMap<String, CancellationToken>>,
}

impl PipelineRunner {
    pub fn new(steps: Vec<Arc<dyn StepExecutor>>, repo: TaskRepository, sink: CompositeSink) -> Self {
        Self {
            steps,
            repo,
            sink,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            tokens: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_retry_policy(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Sets the token and invokes `cancel()` on it; returns `false` if the
    /// task has no run in flight.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.tokens.lock().expect("tokens mutex poisoned").get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.tokens.lock().expect("tokens mutex poisoned").contains_key(task_id)
    }

    fn register(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .expect("tokens mutex poisoned")
            .insert(task_id.to_string(), token.clone());
        token
    }

    pub async fn run(&self, ctx: &StepContext, start_from_step: Option<usize>) -> Result<Task> {
        let token = self.register(&ctx.task_id);
        let _guard = RunGuard { runner: self, task_id: ctx.task_id.clone() };

        self.repo
            .update_task_status(&ctx.task_id, TaskStatus::Processing, -1, None)
            .await?;
        self.sink.emit(&ctx.task_id, "pipeline_started", json!({})).await?;

        let mut stages = self.repo.get_stages(&ctx.task_id).await?;

        for step in &self.steps {
            let idx = step.name().index();

            if token.is_cancelled() {
                self.sink.emit(&ctx.task_id, "pipeline_cancelled", json!({})).await?;
                self.repo
                    .update_task_status(&ctx.task_id, TaskStatus::Pending, idx as i32, None)
                    .await?;
                return self.load_task(&ctx.task_id).await;
            }

            if let Some(start) = start_from_step {
                if idx < start {
                    if stages[idx].status != StageStatus::Completed {
                        self.repo
                            .update_step_status(&ctx.task_id, idx as i32, StageStatus::Skipped, None, None)
                            .await?;
                        stages[idx].status = StageStatus::Skipped;
                    }
                    self.sink
                        .emit(&ctx.task_id, "step_skipped", json!({ "step": step.name(), "reason": "before_start_from_step" }))
                        .await?;
                    continue;
                }
            }

            if stages[idx].status == StageStatus::Completed {
                self.sink
                    .emit(&ctx.task_id, "step_skipped", json!({ "step": step.name(), "reason": "already_completed" }))
                    .await?;
                continue;
            }

            self.repo
                .update_task_status(&ctx.task_id, TaskStatus::Processing, idx as i32, None)
                .await?;

            match self.execute_with_retry(step.as_ref(), ctx).await {
                Ok(success) => {
                    self.repo
                        .update_step_status(
                            &ctx.task_id,
                            idx as i32,
                            StageStatus::Completed,
                            None,
                            Some(&success.artifact_refs),
                        )
                        .await?;
                    stages[idx].status = StageStatus::Completed;
                    self.sink
                        .emit(
                            &ctx.task_id,
                            "step_completed",
                            json!({ "step": step.name(), "artifact_count": success.artifact_refs.len() }),
                        )
                        .await?;
                }
                Err(e) => {
                    let message = e.to_string();
                    self.repo
                        .update_step_status(&ctx.task_id, idx as i32, StageStatus::Failed, Some(&message), None)
                        .await?;
                    stages[idx].status = StageStatus::Failed;

                    if step.name().is_critical() {
                        self.sink
                            .emit(&ctx.task_id, "pipeline_failed", json!({ "step": step.name(), "error": message }))
                            .await?;
                        self.repo
                            .update_task_status(&ctx.task_id, TaskStatus::Failed, idx as i32, Some(&message))
                            .await?;
                        return self.load_task(&ctx.task_id).await;
                    }
                    // Non-critical: record the failure and keep going so
                    // later stages can still attempt recovery/validation.
                }
            }
        }

        let all_clean = stages
            .iter()
            .all(|s| matches!(s.status, StageStatus::Completed | StageStatus::Skipped));

        if all_clean {
            self.sink.emit(&ctx.task_id, "pipeline_completed", json!({})).await?;
            self.repo
                .update_task_status(&ctx.task_id, TaskStatus::Completed, 4, None)
                .await?;
        } else {
            self.repo
                .update_task_status(&ctx.task_id, TaskStatus::Pending, -1, None)
                .await?;
        }
        self.load_task(&ctx.task_id).await
    }

    /// Executes exactly one stage and applies the critical-failure policy to
    /// the task's terminal state (spec.md §4.J `run_single_step`).
    pub async fn run_single_step(&self, ctx: &StepContext, step_index: usize) -> Result<Task> {
        let step = self
            .steps
            .get(step_index)
            .ok_or_else(|| CoreError::fatal(format!("no such step index {step_index}")))?;

        self.repo
            .update_task_status(&ctx.task_id, TaskStatus::Processing, step_index as i32, None)
            .await?;

        match self.execute_with_retry(step.as_ref(), ctx).await {
            Ok(success) => {
                self.repo
                    .update_step_status(
                        &ctx.task_id,
                        step_index as i32,
                        StageStatus::Completed,
                        None,
                        Some(&success.artifact_refs),
                    )
                    .await?;
                self.sink
                    .emit(
                        &ctx.task_id,
                        "step_completed",
                        json!({ "step": step.name(), "artifact_count": success.artifact_refs.len() }),
                    )
                    .await?;
                self.repo
                    .update_task_status(&ctx.task_id, TaskStatus::Pending, step_index as i32, None)
                    .await?;
            }
            Err(e) => {
                let message = e.to_string();
                self.repo
                    .update_step_status(&ctx.task_id, step_index as i32, StageStatus::Failed, Some(&message), None)
                    .await?;
                if step.name().is_critical() {
                    self.sink
                        .emit(&ctx.task_id, "pipeline_failed", json!({ "step": step.name(), "error": message.clone() }))
                        .await?;
                    self.repo
                        .update_task_status(&ctx.task_id, TaskStatus::Failed, step_index as i32, Some(&message))
                        .await?;
                } else {
                    self.repo
                        .update_task_status(&ctx.task_id, TaskStatus::Pending, step_index as i32, Some(&message))
                        .await?;
                }
            }
        }
        self.load_task(&ctx.task_id).await
    }

    /// Runs `step` until it succeeds, becomes non-retryable, or exhausts
    /// `max_retries` retries (spec.md §8 scenario 2/3: `max_retries=3` yields
    /// backoffs `~1s, 2s, 4s` across a 4th and final attempt).
    async fn execute_with_retry(&self, step: &dyn StepExecutor, ctx: &StepContext) -> Result<StepSuccess> {
        let total_attempts = self.max_retries + 1;
        let mut attempt = 1;
        loop {
            self.sink
                .emit(
                    &ctx.task_id,
                    "step_started",
                    json!({ "step": step.name(), "step_index": step.name().index(), "attempt": attempt }),
                )
                .await?;

            let outcome = match step.prepare(ctx).await {
                Ok(()) => step.execute(ctx).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(success) => return Ok(success),
                Err(e) => {
                    let can_retry = e.is_retryable();
                    if !can_retry || attempt >= total_attempts {
                        self.sink
                            .emit(
                                &ctx.task_id,
                                "step_failed",
                                json!({ "step": step.name(), "error": e.to_string(), "can_retry": can_retry }),
                            )
                            .await?;
                        step.rollback(ctx).await?;
                        return Err(e);
                    }
                    let delay = self.backoff_delay(attempt);
                    self.sink
                        .emit(
                            &ctx.task_id,
                            "step_retrying",
                            json!({ "step": step.name(), "attempt": attempt, "delay_ms": delay.as_millis() }),
                        )
                        .await?;
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// `retry_delay * 2^(attempt-1) + U(0, retry_delay*0.5)`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.retry_delay.as_millis() as u64 * 2u64.pow(attempt.saturating_sub(1));
        let jitter_bound = (self.retry_delay.as_millis() as u64) / 2;
        let jitter = if jitter_bound == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_bound)
        };
        Duration::from_millis(base + jitter)
    }

    async fn load_task(&self, task_id: &str) -> Result<Task> {
        self.repo
            .get_task_row(task_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("task {task_id} vanished mid-run")))
    }
}
