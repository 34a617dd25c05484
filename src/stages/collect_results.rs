//! Stage 4 — `collect_results` (critical). Validates `all_questions/` and
//! writes `summary.json` (spec.md §4.I, §6).

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

use crate::error::{CoreError, Result};
use crate::models::structure::StructureDoc;
use crate::models::task::StageName;

use super::{StepContext, StepExecutor, StepSuccess};

const STRUCTURE_FILE: &str = "structure.json";
const ALL_QUESTIONS_DIR: &str = "all_questions";
const SUMMARY_FILE: &str = "summary.json";

#[derive(Serialize)]
struct Summary {
    total_questions: usize,
    normal_questions: usize,
    big_questions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    normal_qno_range: Option<(u32, u32)>,
    big_question_ids: Vec<String>,
}

pub struct CollectResultsStep;

impl CollectResultsStep {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CollectResultsStep {
    fn default() -> Self {
        Self::new()
    }
}

async fn load_structure(workdir: &std::path::Path) -> Result<StructureDoc> {
    let path = workdir.join(STRUCTURE_FILE);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| CoreError::fatal(format!("structure.json missing or unreadable: {e}")))?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl StepExecutor for CollectResultsStep {
    fn name(&self) -> StageName {
        StageName::CollectResults
    }

    async fn prepare(&self, ctx: &StepContext) -> Result<()> {
        if tokio::fs::metadata(ctx.workdir.join(STRUCTURE_FILE)).await.is_err() {
            return Err(CoreError::fatal("structure.json has not been produced"));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepSuccess> {
        let doc = load_structure(&ctx.workdir).await?;
        let out_dir = ctx.workdir.join(ALL_QUESTIONS_DIR);

        let normal: Vec<&_> = doc.questions.iter().filter(|q| q.parent_id.is_none()).collect();
        let expected_total = normal.len() + doc.big_questions.len();

        if expected_total > 0 {
            let has_any = tokio::fs::metadata(&out_dir).await.is_ok()
                && tokio::fs::read_dir(&out_dir)
                    .await
                    .map(|_| true)
                    .unwrap_or(false);
            if !has_any {
                return Err(CoreError::fatal("all_questions/ is empty but the structure document expects output"));
            }
            let mut missing = Vec::new();
            for q in &normal {
                let name = format!("q{}.png", q.qno.unwrap_or(0));
                if tokio::fs::metadata(out_dir.join(&name)).await.is_err() {
                    missing.push(name);
                }
            }
            for big in &doc.big_questions {
                let name = format!("{}.png", big.id);
                if tokio::fs::metadata(out_dir.join(&name)).await.is_err() {
                    missing.push(name);
                }
            }
            if !missing.is_empty() {
                return Err(CoreError::fatal(format!(
                    "all_questions/ is missing expected crops: {}",
                    missing.join(", ")
                )));
            }
        } else {
            tokio::fs::create_dir_all(&out_dir).await?;
        }

        let normal_qnos: Vec<u32> = normal.iter().filter_map(|q| q.qno).collect();
        let normal_qno_range = match (normal_qnos.iter().min(), normal_qnos.iter().max()) {
            (Some(&lo), Some(&hi)) => Some((lo, hi)),
            _ => None,
        };

        let summary = Summary {
            total_questions: expected_total,
            normal_questions: normal.len(),
            big_questions: doc.big_questions.len(),
            normal_qno_range,
            big_question_ids: doc.big_questions.iter().map(|b| b.id.clone()).collect(),
        };

        let bytes = serde_json::to_vec_pretty(&summary)?;
        let summary_path = out_dir.join(SUMMARY_FILE);
        let tmp = out_dir.join(format!(".tmp-{}-{}", SUMMARY_FILE, uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &summary_path).await?;

        let r = ctx
            .artifacts
            .save(&ctx.task_id, "collect_results", "summary", &bytes)
            .await
            .map_err(|e| CoreError::retryable(e.to_string()))?;

        Ok(StepSuccess {
            artifact_refs: vec![r],
            counts: json!({
                "total_questions": summary.total_questions,
                "normal_questions": summary.normal_questions,
                "big_questions": summary.big_questions,
            }),
        })
    }

    async fn rollback(&self, _ctx: &StepContext) -> Result<()> {
        Ok(())
    }
}
