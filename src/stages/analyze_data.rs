//! Stage 2 — `analyze_data` (non-critical). Builds `structure.json` from
//! every cached OCR layout in the workdir (spec.md §4.I).

use async_trait::async_trait;
use serde_json::json;

use crate::cache::{is_ocr_complete, page_sort_key, PageLayout};
use crate::error::{CoreError, Result};
use crate::models::task::{PipelineMode, StageName};
use crate::structure::detect;

use super::{StepContext, StepExecutor, StepSuccess};

const STRUCTURE_FILE: &str = "structure.json";

pub struct AnalyzeDataStep;

impl AnalyzeDataStep {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AnalyzeDataStep {
    fn default() -> Self {
        Self::new()
    }
}

async fn load_cached_pages(workdir: &std::path::Path) -> Result<Vec<PageLayout>> {
    let ocr_dir = workdir.join("ocr");
    let mut pages = Vec::new();
    let mut entries = match tokio::fs::read_dir(&ocr_dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(pages),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let bytes = tokio::fs::read(&path).await?;
        pages.push(serde_json::from_slice::<PageLayout>(&bytes)?);
    }
    pages.sort_by_key(|p| page_sort_key(&p.page_id));
    Ok(pages)
}

#[async_trait]
impl StepExecutor for AnalyzeDataStep {
    fn name(&self) -> StageName {
        StageName::AnalyzeData
    }

    async fn prepare(&self, ctx: &StepContext) -> Result<()> {
        if !is_ocr_complete(&ctx.workdir).await? {
            return Err(CoreError::retryable("ocr cache is not yet complete for this workdir"));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepSuccess> {
        let structure_path = ctx.workdir.join(STRUCTURE_FILE);
        let exists = tokio::fs::metadata(&structure_path).await.is_ok();

        if exists {
            match ctx.mode {
                PipelineMode::Auto => {
                    let bytes = tokio::fs::read(&structure_path).await?;
                    let doc: crate::models::structure::StructureDoc = serde_json::from_slice(&bytes)?;
                    return Ok(StepSuccess {
                        artifact_refs: Vec::new(),
                        counts: json!({
                            "questions": doc.questions.len(),
                            "big_questions": doc.big_questions.len(),
                            "skipped": true,
                        }),
                    });
                }
                PipelineMode::Manual => {
                    tokio::fs::remove_file(&structure_path).await?;
                }
            }
        }

        let pages = load_cached_pages(&ctx.workdir).await?;
        let doc = detect(&pages)?;
        let bytes = serde_json::to_vec_pretty(&doc)?;

        let tmp = ctx.workdir.join(format!(".tmp-{}-{}", STRUCTURE_FILE, uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &structure_path).await?;

        let r = ctx
            .artifacts
            .save(&ctx.task_id, "analyze_data", "structure", &bytes)
            .await
            .map_err(|e| CoreError::retryable(e.to_string()))?;

        Ok(StepSuccess {
            artifact_refs: vec![r],
            counts: json!({
                "questions": doc.questions.len(),
                "big_questions": doc.big_questions.len(),
                "skipped": false,
            }),
        })
    }

    async fn rollback(&self, _ctx: &StepContext) -> Result<()> {
        // Keep structure.json on failure: non-critical, later stages may
        // still observe a partial/absent file and decide for themselves.
        Ok(())
    }
}
