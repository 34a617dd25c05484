//! Stage 1 — `extract_questions` (critical). Runs the Page Processor over
//! every rasterized page and writes per-page question crops + `meta.json`
//! (spec.md §4.I, §6 filesystem layout).

use std::path::Path;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use image::RgbaImage;
use regex::Regex;
use serde::Serialize;
use serde_json::json;

use crate::artifact::ArtifactStore;
use crate::cache::{page_sort_key, LayoutBlock, PageLayout};
use crate::error::{CoreError, Result};
use crate::models::task::StageName;
use crate::processor::{PagePostProcessor, PagePostResult, PageProcessor};

use super::{StepContext, StepExecutor, StepSuccess};

fn qno_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\d{1,3})[.．、]").expect("valid regex"))
}

#[derive(Serialize)]
struct TextBlockSummary {
    bbox: [f32; 4],
    text: String,
}

#[derive(Serialize)]
struct TableBlockSummary {
    bbox: [f32; 4],
    html: String,
}

#[derive(Serialize)]
struct OtherBlockSummary {
    label: String,
    bbox: [f32; 4],
    content: String,
    region_label: Option<String>,
}

#[derive(Serialize)]
struct Segment {
    page: String,
    image: String,
    #[serde(rename = "box")]
    bbox: [f32; 4],
    #[serde(skip_serializing_if = "Option::is_none")]
    confidence: Option<f32>,
}

#[derive(Serialize)]
struct QuestionSummary {
    qno: u32,
    image: String,
    crop_box_image: [f32; 4],
    crop_box_blocks: [f32; 4],
    text_blocks: Vec<TextBlockSummary>,
    table_blocks: Vec<TableBlockSummary>,
    other_blocks: Vec<OtherBlockSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    segments: Option<Vec<Segment>>,
}

#[derive(Serialize)]
struct PageMeta {
    page_name: String,
    image_path: String,
    questions: Vec<QuestionSummary>,
}

pub struct ExtractQuestionsStep {
    processor: Arc<PageProcessor>,
}

impl ExtractQuestionsStep {
    pub fn new(processor: Arc<PageProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl StepExecutor for ExtractQuestionsStep {
    fn name(&self) -> StageName {
        StageName::ExtractQuestions
    }

    async fn prepare(&self, ctx: &StepContext) -> Result<()> {
        if tokio::fs::metadata(&ctx.workdir).await.is_err() {
            return Err(CoreError::fatal(format!("workdir missing: {:?}", ctx.workdir)));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepSuccess> {
        let mut pages = Vec::new();
        let mut entries = tokio::fs::read_dir(&ctx.workdir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("page_") && name.ends_with(".png") {
                pages.push(ctx.workdir.join(name.to_string()));
            }
        }
        pages.sort_by_key(|p| {
            p.file_stem()
                .and_then(|s| s.to_str())
                .map(page_sort_key)
                .unwrap_or(0)
        });

        if pages.is_empty() {
            return Ok(StepSuccess {
                artifact_refs: Vec::new(),
                counts: json!({ "questions": 0, "pages": 0 }),
            });
        }

        let skip_existing = ctx.skip_existing();
        let workdir = ctx.workdir.clone();
        let skip_check = move |path: &Path| -> bool {
            if !skip_existing {
                return false;
            }
            let page_id = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            workdir.join(format!("questions_{page_id}")).join("meta.json").exists()
        };

        let post_processor: Arc<dyn PagePostProcessor> = Arc::new(MetaWriter {
            artifacts: ctx.artifacts.clone(),
            task_id: ctx.task_id.clone(),
        });

        let results = self
            .processor
            .process_pages_with(&ctx.workdir, pages, skip_check, |_progress| {}, Some(post_processor))
            .await?;

        let mut artifact_refs = Vec::new();
        let mut total_questions = 0usize;
        for result in &results {
            artifact_refs.extend(result.post.artifact_refs.iter().cloned());
            total_questions += result.post.question_count;
        }

        Ok(StepSuccess {
            artifact_refs,
            counts: json!({ "questions": total_questions, "pages": results.len() }),
        })
    }

    async fn rollback(&self, _ctx: &StepContext) -> Result<()> {
        Ok(())
    }
}

/// Runs inside a Page Processor worker, right after that worker's OCR call
/// returns: finds question spans, crops each one, saves the crops as
/// artifacts, and writes the page's `meta.json` (spec.md §4.F step 4, §6).
struct MetaWriter {
    artifacts: Arc<ArtifactStore>,
    task_id: String,
}

#[async_trait]
impl PagePostProcessor for MetaWriter {
    async fn process(&self, workdir: &Path, page_path: &Path, layout: &PageLayout) -> Result<PagePostResult> {
        let page_num = page_sort_key(&layout.page_id);
        let out_dir = workdir.join(format!("questions_{}", layout.page_id));
        tokio::fs::create_dir_all(&out_dir).await?;

        let spans = find_question_spans(&layout.blocks);
        let page_img = load_page_bitmap(page_path).await?;
        let mut summaries = Vec::new();
        let mut artifact_refs = Vec::new();

        for (i, &(qno, start, end)) in spans.iter().enumerate() {
            let q_blocks = &layout.blocks[start..end];
            let y1 = q_blocks[0].bbox[1];
            let y2 = spans
                .get(i + 1)
                .map(|&(_, next_start, _)| layout.blocks[next_start].bbox[1])
                .unwrap_or(page_img.height() as f32);
            let crop = crop_band(&page_img, y1, y2);
            let file_name = format!("q{qno}.png");
            let out_path = out_dir.join(&file_name);
            save_png(&crop, &out_path).await?;

            let bytes = tokio::fs::read(&out_path).await?;
            let r = self
                .artifacts
                .save(&self.task_id, "extract_questions", &format!("{}_{file_name}", layout.page_id), &bytes)
                .await
                .map_err(|e| CoreError::retryable(e.to_string()))?;
            artifact_refs.push(r);

            let crop_box_blocks = compute_crop_box_blocks(q_blocks);
            let (text_blocks, table_blocks, other_blocks) = classify_blocks(q_blocks);

            summaries.push(QuestionSummary {
                qno,
                image: file_name,
                crop_box_image: [0.0, y1, page_img.width() as f32, y2],
                crop_box_blocks,
                text_blocks,
                table_blocks,
                other_blocks,
                segments: None,
            });
        }

        let question_count = summaries.len();
        let meta = PageMeta {
            page_name: layout.page_id.clone(),
            image_path: format!("page_{page_num}.png"),
            questions: summaries,
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta)?;
        tokio::fs::write(out_dir.join("meta.json"), meta_bytes).await?;

        Ok(PagePostResult {
            artifact_refs,
            question_count,
        })
    }
}

/// Locates question heads and turns them into `(qno, start, end)` spans over
/// `blocks` (end exclusive). Only `text` blocks are checked for a heading
/// number — a table cell or figure caption that happens to start with
/// digits-and-a-dot must never be mistaken for a new question.
fn find_question_spans(blocks: &[LayoutBlock]) -> Vec<(u32, usize, usize)> {
    let heads: Vec<(u32, usize)> = blocks
        .iter()
        .enumerate()
        .filter(|(_, b)| b.label == "text")
        .filter_map(|(idx, b)| {
            qno_regex()
                .captures(&b.content)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .map(|qno| (qno, idx))
        })
        .collect();

    heads
        .iter()
        .enumerate()
        .map(|(i, &(qno, start))| {
            let end = heads.get(i + 1).map(|&(_, s)| s).unwrap_or(blocks.len());
            (qno, start, end)
        })
        .collect()
}

/// Tight bbox around a question's blocks, excluding footer/number/header
/// chrome that shouldn't pull the box outward. Falls back to every block's
/// bbox if that leaves nothing, so a page with no footer labels still gets a
/// sane box instead of an empty one.
fn compute_crop_box_blocks(blocks: &[LayoutBlock]) -> [f32; 4] {
    fn union(blocks: impl Iterator<Item = [f32; 4]>) -> Option<[f32; 4]> {
        blocks.fold(None, |acc, bbox| {
            Some(match acc {
                None => bbox,
                Some(a) => [
                    a[0].min(bbox[0]),
                    a[1].min(bbox[1]),
                    a[2].max(bbox[2]),
                    a[3].max(bbox[3]),
                ],
            })
        })
    }

    let chrome_free = blocks
        .iter()
        .filter(|b| !matches!(b.label.as_str(), "footer" | "number" | "header"))
        .map(|b| b.bbox);

    union(chrome_free)
        .or_else(|| union(blocks.iter().map(|b| b.bbox)))
        .unwrap_or([0.0, 0.0, 0.0, 0.0])
}

/// Splits a question's blocks into the three meta.json buckets (spec.md §6).
fn classify_blocks(
    blocks: &[LayoutBlock],
) -> (Vec<TextBlockSummary>, Vec<TableBlockSummary>, Vec<OtherBlockSummary>) {
    let mut text_blocks = Vec::new();
    let mut table_blocks = Vec::new();
    let mut other_blocks = Vec::new();
    for b in blocks {
        match b.label.as_str() {
            "text" => text_blocks.push(TextBlockSummary {
                bbox: b.bbox,
                text: b.content.clone(),
            }),
            "table" => table_blocks.push(TableBlockSummary {
                bbox: b.bbox,
                html: b.content.clone(),
            }),
            _ => other_blocks.push(OtherBlockSummary {
                label: b.label.clone(),
                bbox: b.bbox,
                content: b.content.clone(),
                region_label: b.region_label.clone(),
            }),
        }
    }
    (text_blocks, table_blocks, other_blocks)
}

fn crop_band(img: &RgbaImage, y1: f32, y2: f32) -> RgbaImage {
    let (w, h) = (img.width(), img.height());
    let top = (y1.max(0.0) as u32).min(h.saturating_sub(1));
    let bottom = (y2.max(0.0) as u32).min(h).max(top + 1).min(h);
    image::imageops::crop_imm(img, 0, top, w, bottom - top).to_image()
}

async fn save_png(img: &RgbaImage, path: &std::path::Path) -> Result<()> {
    let tmp = path.with_extension(format!("tmp-{}.png", uuid::Uuid::new_v4()));
    let img = img.clone();
    let tmp_for_blocking = tmp.clone();
    tokio::task::spawn_blocking(move || img.save(&tmp_for_blocking))
        .await
        .map_err(|e| CoreError::fatal(format!("png encode task panicked: {e}")))??;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn load_page_bitmap(path: &Path) -> Result<RgbaImage> {
    let bytes = tokio::fs::read(path).await?;
    image::load_from_memory(&bytes)
        .map(|img| img.into_rgba8())
        .map_err(|e| CoreError::fatal(format!("cannot decode page bitmap: {e}")))
}
