//! Crop & Stitch (spec.md §4.H, stage 3): renders one PNG per question and
//! per big-question from page bitmaps plus the structure document.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};
use tokio::sync::{Mutex, Semaphore};

use crate::cache::lru::Lru;
use crate::error::{CoreError, Result};
use crate::models::structure::{BigQuestion, PageBBox, PageId, Question, StructureDoc};

const BITMAP_CACHE_SIZE: usize = 5;
const PARALLEL_THRESHOLD: usize = 10;
const FALLBACK_TOP: u32 = 100;
const FALLBACK_BOTTOM_MARGIN: u32 = 150;

/// Small page-bitmap LRU so adjacent questions on the same page don't each
/// pay for a fresh decode.
pub struct PageBitmapCache {
    workdir: PathBuf,
    lru: Mutex<Lru<PageId, Arc<RgbaImage>>>,
}

impl PageBitmapCache {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            lru: Mutex::new(Lru::new(BITMAP_CACHE_SIZE)),
        }
    }

    async fn get(&self, page: PageId) -> Result<Arc<RgbaImage>> {
        {
            let mut lru = self.lru.lock().await;
            if let Some(img) = lru.get(&page) {
                return Ok(img.clone());
            }
        }
        let path = self.workdir.join(format!("page_{page}.png"));
        let img = tokio::task::spawn_blocking(move || image::open(&path).map(DynamicImage::into_rgba8))
            .await
            .map_err(|e| CoreError::fatal(format!("bitmap decode task panicked: {e}")))?
            .map_err(|e| CoreError::fatal(format!("cannot decode page bitmap: {e}")))?;
        let img = Arc::new(img);
        self.lru.lock().await.put(page, img.clone());
        Ok(img)
    }
}

fn union_height_band(bboxes: &[PageBBox]) -> Option<(f32, f32)> {
    let y1 = bboxes.iter().map(|b| b.y1).fold(f32::INFINITY, f32::min);
    let y2 = bboxes.iter().map(|b| b.y2).fold(f32::NEG_INFINITY, f32::max);
    if y1.is_finite() && y2.is_finite() && y2 > y1 {
        Some((y1, y2))
    } else {
        None
    }
}

fn crop_band(img: &RgbaImage, y1: f32, y2: f32) -> RgbaImage {
    let (w, h) = img.dimensions();
    let top = (y1.max(0.0) as u32).min(h.saturating_sub(1));
    let bottom = (y2.max(0.0) as u32).min(h);
    let bottom = bottom.max(top + 1).min(h);
    image::imageops::crop_imm(img, 0, top, w, bottom - top).to_image()
}

/// Stack bands vertically: max width, sum of heights, white background.
fn compose_vertical(bands: Vec<RgbaImage>) -> RgbaImage {
    if bands.len() == 1 {
        return bands.into_iter().next().expect("checked len == 1");
    }
    let width = bands.iter().map(|b| b.width()).max().unwrap_or(1);
    let height: u32 = bands.iter().map(|b| b.height()).sum();
    let mut out = RgbaImage::from_pixel(width, height.max(1), Rgba([255, 255, 255, 255]));
    let mut y_offset = 0;
    for band in &bands {
        image::imageops::overlay(&mut out, band, 0, y_offset as i64);
        y_offset += band.height();
    }
    out
}

async fn bands_for_bboxes(
    bitmaps: &PageBitmapCache,
    bboxes: &[PageBBox],
) -> Result<Vec<RgbaImage>> {
    let mut by_page: Vec<(PageId, Vec<PageBBox>)> = Vec::new();
    for bbox in bboxes {
        match by_page.iter_mut().find(|(p, _)| *p == bbox.page) {
            Some((_, v)) => v.push(*bbox),
            None => by_page.push((bbox.page, vec![*bbox])),
        }
    }
    by_page.sort_by_key(|(p, _)| *p);

    let mut bands = Vec::with_capacity(by_page.len());
    for (page, page_bboxes) in by_page {
        let Some((y1, y2)) = union_height_band(&page_bboxes) else { continue };
        let img = bitmaps.get(page).await?;
        bands.push(crop_band(&img, y1, y2));
    }
    Ok(bands)
}

pub async fn crop_question(bitmaps: &PageBitmapCache, question: &Question) -> Result<RgbaImage> {
    let bands = bands_for_bboxes(bitmaps, &question.bboxes).await?;
    if bands.is_empty() {
        return Err(CoreError::fatal(format!("question {} has no crop bands", question.id)));
    }
    Ok(compose_vertical(bands))
}

pub async fn crop_big_question(
    bitmaps: &PageBitmapCache,
    doc: &StructureDoc,
    big: &BigQuestion,
) -> Result<RgbaImage> {
    let mut all_bboxes: Vec<PageBBox> = big.material_bboxes.clone();
    for sub_id in &big.sub_question_ids {
        if let Some(q) = doc.question(sub_id) {
            all_bboxes.extend(q.bboxes.iter().copied());
        }
    }

    if all_bboxes.is_empty() {
        // Fallback: crop [100, H-150] on every page of the span.
        let mut bands = Vec::with_capacity(big.page_span.len());
        for &page in &big.page_span {
            let img = bitmaps.get(page).await?;
            let h = img.height();
            let bottom = h.saturating_sub(FALLBACK_BOTTOM_MARGIN).max(FALLBACK_TOP + 1);
            bands.push(crop_band(&img, FALLBACK_TOP as f32, bottom as f32));
        }
        if bands.is_empty() {
            return Err(CoreError::fatal(format!("big question {} has no pages to fall back to", big.id)));
        }
        return Ok(compose_vertical(bands));
    }

    let bands = bands_for_bboxes(bitmaps, &all_bboxes).await?;
    Ok(compose_vertical(bands))
}

#[derive(Debug, Default)]
pub struct CropSummary {
    pub normal_questions: usize,
    pub big_questions: usize,
}

/// Renders every normal question and every big question to `out_dir`,
/// parallelizing with a bounded semaphore when there's more than
/// [`PARALLEL_THRESHOLD`] items (spec.md §4.H).
pub async fn render_all(doc: &StructureDoc, workdir: &Path, out_dir: &Path) -> Result<CropSummary> {
    tokio::fs::create_dir_all(out_dir).await?;
    let bitmaps = Arc::new(PageBitmapCache::new(workdir));

    let normal_questions: Vec<&Question> = doc.questions.iter().filter(|q| q.parent_id.is_none()).collect();
    let total_items = normal_questions.len() + doc.big_questions.len();
    let parallelism = if total_items > PARALLEL_THRESHOLD {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4).min(6)
    } else {
        1
    };
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));

    let mut handles = Vec::with_capacity(total_items);
    for q in normal_questions {
        let bitmaps = bitmaps.clone();
        let semaphore = semaphore.clone();
        let out_path = out_dir.join(format!("q{}.png", q.qno.unwrap_or(0)));
        let question = q.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore never closed");
            let img = crop_question(&bitmaps, &question).await?;
            save_png(&img, &out_path).await
        }));
    }
    for big in &doc.big_questions {
        let bitmaps = bitmaps.clone();
        let semaphore = semaphore.clone();
        let out_path = out_dir.join(format!("{}.png", big.id));
        let big = big.clone();
        let doc_clone_sub_ids = big.sub_question_ids.clone();
        let questions: Vec<Question> = doc_clone_sub_ids
            .iter()
            .filter_map(|id| doc.question(id).cloned())
            .collect();
        handles.push(tokio::spawn(async move {
            let mut local_doc = StructureDoc::new();
            for q in questions {
                local_doc.push_question(q).ok();
            }
            local_doc.reindex();
            let _permit = semaphore.acquire().await.expect("semaphore never closed");
            let img = crop_big_question(&bitmaps, &local_doc, &big).await?;
            save_png(&img, &out_path).await
        }));
    }

    let mut summary = CropSummary::default();
    for handle in handles {
        handle
            .await
            .map_err(|e| CoreError::fatal(format!("crop task panicked: {e}")))??;
    }
    summary.normal_questions = doc.questions.iter().filter(|q| q.parent_id.is_none()).count();
    summary.big_questions = doc.big_questions.len();
    Ok(summary)
}

async fn save_png(img: &RgbaImage, path: &Path) -> Result<()> {
    let tmp = path.with_extension(format!("tmp-{}.png", uuid::Uuid::new_v4()));
    let img = img.clone();
    let tmp_for_blocking = tmp.clone();
    tokio::task::spawn_blocking(move || img.save(&tmp_for_blocking))
        .await
        .map_err(|e| CoreError::fatal(format!("png encode task panicked: {e}")))??;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// spec.md §4.H completeness check: every un-grouped normal question has a
/// `q{qno}.png`; every big question has a `{big_id}.png`.
pub async fn is_crop_complete(doc: &StructureDoc, out_dir: &Path) -> bool {
    for q in doc.questions.iter().filter(|q| q.parent_id.is_none()) {
        let path = out_dir.join(format!("q{}.png", q.qno.unwrap_or(0)));
        if tokio::fs::metadata(&path).await.is_err() {
            return false;
        }
    }
    for big in &doc.big_questions {
        let path = out_dir.join(format!("{}.png", big.id));
        if tokio::fs::metadata(&path).await.is_err() {
            return false;
        }
    }
    true
}
