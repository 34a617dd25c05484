//! Stage 0 — `pdf_to_images` (critical). Delegates to an external
//! rasterizer (spec.md §4.I, §6 "PDF→image rasterization ... called as a
//! black-box rendering function").

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use crate::error::{CoreError, Result};
use crate::models::task::StageName;

use super::{StepContext, StepExecutor, StepSuccess};

/// The black-box PDF rasterizer this crate treats as an external
/// collaborator (spec.md §1 Out of scope).
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    async fn page_count(&self, pdf_path: &Path) -> Result<u32>;

    /// Render one page (0-indexed) at `dpi`, returning the path it wrote.
    async fn render_page(&self, pdf_path: &Path, page_idx: u32, dpi: u32, out_path: &Path) -> Result<()>;
}

const DEFAULT_DPI: u32 = 200;

pub struct PdfToImagesStep {
    rasterizer: Arc<dyn PageRasterizer>,
}

impl PdfToImagesStep {
    pub fn new(rasterizer: Arc<dyn PageRasterizer>) -> Self {
        Self { rasterizer }
    }
}

#[async_trait]
impl StepExecutor for PdfToImagesStep {
    fn name(&self) -> StageName {
        StageName::PdfToImages
    }

    async fn prepare(&self, ctx: &StepContext) -> Result<()> {
        tokio::fs::create_dir_all(&ctx.workdir).await?;
        Ok(())
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepSuccess> {
        let total_pages = match ctx.expected_pages {
            Some(n) => n,
            None => self.rasterizer.page_count(&ctx.pdf_path).await?,
        };

        if total_pages == 0 {
            return Ok(StepSuccess {
                artifact_refs: Vec::new(),
                counts: json!({ "pages": 0 }),
            });
        }

        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(total_pages as usize);
        let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));

        let mut handles = Vec::with_capacity(total_pages as usize);
        let mut produced = Vec::with_capacity(total_pages as usize);
        for page_idx in 0..total_pages {
            let out_path: PathBuf = ctx.workdir.join(format!("page_{}.png", page_idx + 1));
            produced.push(out_path.clone());

            if ctx.skip_existing() && tokio::fs::metadata(&out_path).await.is_ok() {
                continue;
            }

            let rasterizer = self.rasterizer.clone();
            let pdf_path = ctx.pdf_path.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                rasterizer.render_page(&pdf_path, page_idx, DEFAULT_DPI, &out_path).await
            }));
        }

        for handle in handles {
            handle
                .await
                .map_err(|e| CoreError::retryable(format!("rasterize task panicked: {e}")))??;
        }

        let mut artifact_refs = Vec::with_capacity(produced.len());
        for (idx, path) in produced.iter().enumerate() {
            let bytes = tokio::fs::read(path).await?;
            let r = ctx
                .artifacts
                .save(&ctx.task_id, "pdf_to_images", &format!("page_{}", idx + 1), &bytes)
                .await
                .map_err(|e| CoreError::retryable(e.to_string()))?;
            artifact_refs.push(r);
        }

        Ok(StepSuccess {
            artifact_refs,
            counts: json!({ "pages": produced.len() }),
        })
    }

    async fn rollback(&self, _ctx: &StepContext) -> Result<()> {
        // Keep partial rasters on failure: a retry's skip_existing check
        // reuses whatever already rendered successfully.
        Ok(())
    }
}
