//! Step Executors (spec.md §4.I): the five stage-specific workers the
//! Pipeline Runner drives in order.

pub mod analyze_data;
pub mod collect_results;
pub mod compose_long_image;
pub mod extract_questions;
pub mod pdf_to_images;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::artifact::ArtifactStore;
use crate::error::Result;
use crate::models::task::{PipelineMode, StageName};

/// Per-stage execution context (spec.md §4.I).
pub struct StepContext {
    pub task_id: String,
    pub pdf_path: PathBuf,
    pub workdir: PathBuf,
    pub file_hash: Option<String>,
    pub expected_pages: Option<u32>,
    pub mode: PipelineMode,
    pub metadata: HashMap<String, Value>,
    pub artifacts: Arc<ArtifactStore>,
}

impl StepContext {
    pub fn skip_existing(&self) -> bool {
        matches!(self.mode, PipelineMode::Auto)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StepSuccess {
    pub artifact_refs: Vec<String>,
    pub counts: Value,
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    fn name(&self) -> StageName;

    /// Validate preconditions and set up anything `execute` assumes exists
    /// (e.g. the workdir). Cheap and idempotent.
    async fn prepare(&self, ctx: &StepContext) -> Result<()>;

    async fn execute(&self, ctx: &StepContext) -> Result<StepSuccess>;

    /// Undo partial output on failure, per the per-stage policy documented
    /// in spec.md §4.I ("stage 3 removes `all_questions/`; others keep
    /// partial output to allow a cheap retry").
    async fn rollback(&self, ctx: &StepContext) -> Result<()>;
}

/// Ordered registry of the five executors (spec.md §9 "Polymorphism").
pub fn default_registry(
    rasterizer: Arc<dyn pdf_to_images::PageRasterizer>,
    gateway: Arc<crate::gateway::ModelGateway>,
    cache: Arc<crate::cache::OcrCache>,
) -> Vec<Arc<dyn StepExecutor>> {
    let processor = Arc::new(crate::processor::PageProcessor::new(
        gateway,
        cache,
        crate::processor::default_worker_count(),
        8,
    ));
    vec![
        Arc::new(pdf_to_images::PdfToImagesStep::new(rasterizer)),
        Arc::new(extract_questions::ExtractQuestionsStep::new(processor)),
        Arc::new(analyze_data::AnalyzeDataStep::new()),
        Arc::new(compose_long_image::ComposeLongImageStep::new()),
        Arc::new(collect_results::CollectResultsStep::new()),
    ]
}
