//! The Recovery Service (spec.md §4.K): rebuilds in-flight task state after
//! a process restart and validates it against the filesystem.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::artifact::ArtifactStore;
use crate::error::Result;
use crate::models::task::{Stage, StageStatus, Task, TaskStatus};
use crate::repository::TaskRepository;

/// A task joined with its stages, as handed to an operator policy after
/// startup validation (spec.md §4.K step 2).
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub task: Task,
    pub stages: Vec<Stage>,
}

pub struct RecoveryService {
    repo: TaskRepository,
    artifacts: Arc<ArtifactStore>,
    workdir_root: PathBuf,
}

impl RecoveryService {
    pub fn new(repo: TaskRepository, artifacts: Arc<ArtifactStore>, workdir_root: impl Into<PathBuf>) -> Self {
        Self {
            repo,
            artifacts,
            workdir_root: workdir_root.into(),
        }
    }

    fn workdir_for(&self, task: &Task) -> PathBuf {
        let leaf = task.exam_dir_name.clone().unwrap_or_else(|| task.task_id.clone());
        self.workdir_root.join(leaf)
    }

    /// Runs the full startup sequence and returns the cleaned snapshots.
    /// Does not itself decide whether to resume — that's an operator policy
    /// applied by the caller (default: resume everything returned).
    pub async fn recover(&self) -> Result<Vec<TaskSnapshot>> {
        // Pending and Processing are both in-flight states `list_tasks`'
        // single-status filter can't express in one call, so pull
        // everything non-deleted and filter client-side.
        let tasks = self
            .repo
            .list_tasks(None, i64::MAX, 0)
            .await?
            .into_iter()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Processing))
            .collect::<Vec<_>>();

        let mut snapshots = Vec::with_capacity(tasks.len());
        for task in tasks {
            let stages = self.repo.get_stages(&task.task_id).await?;
            let workdir = self.workdir_for(&task);
            let reset_from = self.validate_against_filesystem(&task, &workdir, &stages).await?;

            let stages = if let Some(from) = reset_from {
                self.reset_stages_from(&task.task_id, &stages, from).await?
            } else {
                stages
            };

            snapshots.push(TaskSnapshot { task, stages });
        }
        Ok(snapshots)
    }

    /// Returns the lowest stage index (if any) that needs resetting to
    /// `pending`, along with every later stage.
    async fn validate_against_filesystem(
        &self,
        task: &Task,
        workdir: &Path,
        stages: &[Stage],
    ) -> Result<Option<usize>> {
        if tokio::fs::metadata(workdir).await.is_err() {
            warn!(task_id = %task.task_id, workdir = %workdir.display(), "workdir missing on recovery, resetting all stages");
            return Ok(Some(0));
        }

        for stage in stages {
            if stage.status == StageStatus::Running {
                info!(task_id = %task.task_id, step = %stage.name, "stage was running at crash, resetting to pending");
                return Ok(Some(stage.step_index as usize));
            }
            if stage.status == StageStatus::Completed {
                for artifact_ref in &stage.artifact_refs {
                    if !self.artifacts.exists(artifact_ref).await {
                        warn!(
                            task_id = %task.task_id,
                            step = %stage.name,
                            artifact_ref,
                            "completed stage missing an artifact, resetting it and everything after"
                        );
                        return Ok(Some(stage.step_index as usize));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn reset_stages_from(&self, task_id: &str, stages: &[Stage], from: usize) -> Result<Vec<Stage>> {
        let mut updated = stages.to_vec();
        for stage in &mut updated {
            if stage.step_index as usize >= from {
                self.repo
                    .update_step_status(task_id, stage.step_index, StageStatus::Pending, None, None)
                    .await?;
                stage.status = StageStatus::Pending;
                stage.started_at = None;
                stage.ended_at = None;
                stage.error = None;
                stage.artifact_refs.clear();
            }
        }
        self.repo
            .update_task_status(task_id, TaskStatus::Pending, from as i32 - 1, None)
            .await?;
        Ok(updated)
    }
}
