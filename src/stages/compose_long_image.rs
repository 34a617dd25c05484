//! Stage 3 — `compose_long_image` (non-critical). Renders every question and
//! big-question crop into `all_questions/` from `structure.json`
//! (spec.md §4.I, §4.H).

use async_trait::async_trait;
use serde_json::json;

use crate::crop::{is_crop_complete, render_all};
use crate::error::{CoreError, Result};
use crate::models::structure::StructureDoc;
use crate::models::task::{PipelineMode, StageName};

use super::{StepContext, StepExecutor, StepSuccess};

const STRUCTURE_FILE: &str = "structure.json";
const OUT_DIR: &str = "all_questions";

pub struct ComposeLongImageStep;

impl ComposeLongImageStep {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ComposeLongImageStep {
    fn default() -> Self {
        Self::new()
    }
}

async fn load_structure(workdir: &std::path::Path) -> Result<StructureDoc> {
    let path = workdir.join(STRUCTURE_FILE);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| CoreError::retryable(format!("structure.json missing or unreadable: {e}")))?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl StepExecutor for ComposeLongImageStep {
    fn name(&self) -> StageName {
        StageName::ComposeLongImage
    }

    async fn prepare(&self, ctx: &StepContext) -> Result<()> {
        if tokio::fs::metadata(ctx.workdir.join(STRUCTURE_FILE)).await.is_err() {
            return Err(CoreError::retryable("structure.json has not been produced yet"));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepSuccess> {
        let doc = load_structure(&ctx.workdir).await?;
        let out_dir = ctx.workdir.join(OUT_DIR);

        if matches!(ctx.mode, PipelineMode::Auto) && is_crop_complete(&doc, &out_dir).await {
            return Ok(StepSuccess {
                artifact_refs: Vec::new(),
                counts: json!({
                    "normal_questions": doc.questions.iter().filter(|q| q.parent_id.is_none()).count(),
                    "big_questions": doc.big_questions.len(),
                    "skipped": true,
                }),
            });
        }

        if matches!(ctx.mode, PipelineMode::Manual) && tokio::fs::metadata(&out_dir).await.is_ok() {
            tokio::fs::remove_dir_all(&out_dir).await?;
        }

        let summary = render_all(&doc, &ctx.workdir, &out_dir).await?;

        let mut artifact_refs = Vec::new();
        let mut entries = tokio::fs::read_dir(&out_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("png") {
                continue;
            }
            let name = entry.file_name();
            let bytes = tokio::fs::read(&path).await?;
            let r = ctx
                .artifacts
                .save(&ctx.task_id, "compose_long_image", &name.to_string_lossy(), &bytes)
                .await
                .map_err(|e| CoreError::retryable(e.to_string()))?;
            artifact_refs.push(r);
        }

        Ok(StepSuccess {
            artifact_refs,
            counts: json!({
                "normal_questions": summary.normal_questions,
                "big_questions": summary.big_questions,
                "skipped": false,
            }),
        })
    }

    async fn rollback(&self, ctx: &StepContext) -> Result<()> {
        let out_dir = ctx.workdir.join(OUT_DIR);
        if tokio::fs::metadata(&out_dir).await.is_ok() {
            tokio::fs::remove_dir_all(&out_dir).await?;
        }
        Ok(())
    }
}
