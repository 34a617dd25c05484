//! The structure-detection algorithm (spec.md §4.G, stage 2): walks cached
//! layout blocks page by page and builds the question/big-question graph
//! defined in [`crate::models::structure`].

use std::sync::OnceLock;

use regex::Regex;

use crate::cache::{page_sort_key, LayoutBlock, PageLayout};
use crate::error::{CoreError, Result};
use crate::models::structure::{BigQuestion, PageBBox, PageId, Question, QuestionKind, StructureDoc, StructureError};

const DATA_ANALYSIS_KEYWORDS: &[&str] = &["资料分析"];
const NOISE_LABELS: &[&str] = &["footer", "header", "number"];
const NOISE_KEYWORDS: &[&str] = &["第", "页码"];
const END_KEYWORDS: &[&str] = &["全卷结束", "试卷到此结束", "本卷结束"];
const SECTION_BOUNDARY_KEYWORDS: &[&str] = &["一、", "二、", "三、", "四、", "五、"];
const SECTION_HEAD_KEYWORDS: &[&str] = &["第一部分", "第二部分", "第三部分", "部分"];
const SECTION_INTRO_KEYWORDS: &[&str] = &["下列", "根据", "请回答"];
const VISUAL_LABELS: &[&str] = &["image", "figure", "table"];
const DATA_ANALYSIS_SUB_RANGE: (u32, u32) = (111, 130);
const BIG_QUESTION_SIZE: usize = 5;

fn qno_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\d{1,3})[.．、]").expect("valid regex"))
}

fn to_core_err(e: StructureError) -> CoreError {
    CoreError::fatal(e.to_string())
}

fn is_noise(block: &LayoutBlock) -> bool {
    let label = block.label.to_ascii_lowercase();
    if NOISE_LABELS.iter().any(|n| label == *n) {
        return true;
    }
    NOISE_KEYWORDS.iter().any(|k| block.content.contains(k))
}

/// End markers are short strings containing a known end keyword near the
/// start of the content.
fn is_end_marker(block: &LayoutBlock) -> bool {
    if block.content.chars().count() > 40 {
        return false;
    }
    END_KEYWORDS.iter().any(|kw| {
        block
            .content
            .find(kw)
            .map(|idx| idx <= 4)
            .unwrap_or(false)
    })
}

fn parse_qno(content: &str) -> Option<u32> {
    qno_regex()
        .captures(content)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn is_section_boundary(block: &LayoutBlock) -> bool {
    if SECTION_BOUNDARY_KEYWORDS.iter().any(|k| block.content.starts_with(k)) {
        return true;
    }
    let has_head = SECTION_HEAD_KEYWORDS.iter().any(|k| block.content.contains(k));
    let has_intro = SECTION_INTRO_KEYWORDS.iter().any(|k| block.content.contains(k));
    has_head && has_intro
}

fn has_visual_element(block: &LayoutBlock) -> bool {
    let label = block.label.to_ascii_lowercase();
    VISUAL_LABELS.iter().any(|v| label.contains(v))
        || block
            .region_label
            .as_deref()
            .map(|r| VISUAL_LABELS.iter().any(|v| r.to_ascii_lowercase().contains(v)))
            .unwrap_or(false)
}

fn bbox_of(page: PageId, block: &LayoutBlock) -> PageBBox {
    let [x1, y1, x2, y2] = block.bbox;
    PageBBox { page, x1, y1, x2, y2 }
}

fn preview(content: &str) -> String {
    content.chars().take(40).collect()
}

fn is_data_analysis_title(block: &LayoutBlock) -> bool {
    let is_title_label = block.label.eq_ignore_ascii_case("title");
    let has_keyword = DATA_ANALYSIS_KEYWORDS.iter().any(|k| block.content.contains(k));
    has_keyword && (is_title_label || block.content.contains("部分"))
}

/// Step 1: first page containing a labeled data-analysis title block.
fn find_data_analysis_start(pages: &[PageLayout]) -> Option<PageId> {
    for page in pages {
        if page.blocks.iter().any(is_data_analysis_title) {
            return Some(page_sort_key(&page.page_id));
        }
    }
    None
}

/// Builds the [`StructureDoc`] for a workdir's cached pages (already in
/// ascending page order).
pub fn detect(pages: &[PageLayout]) -> Result<StructureDoc> {
    let mut doc = StructureDoc::new();
    let mut data_analysis_start = find_data_analysis_start(pages);
    doc.total_pages = pages.last().map(|p| page_sort_key(&p.page_id));

    let mut cursor: Option<String> = None;

    'page_loop: for page in pages {
        let page_num = page_sort_key(&page.page_id);
        for block in &page.blocks {
            if is_noise(block) {
                continue;
            }
            if is_end_marker(block) {
                break 'page_loop;
            }

            if let Some(qno) = parse_qno(&block.content) {
                let in_reserved_range =
                    qno >= DATA_ANALYSIS_SUB_RANGE.0 && qno <= DATA_ANALYSIS_SUB_RANGE.1;
                let past_explicit_start = data_analysis_start.map(|start| page_num >= start).unwrap_or(false);
                let in_data_region = past_explicit_start || in_reserved_range;

                if in_data_region && data_analysis_start.is_none() {
                    data_analysis_start = Some(page_num);
                }

                let kind = if in_data_region {
                    QuestionKind::DataAnalysisSub
                } else {
                    QuestionKind::Normal
                };
                let id = format!("q{qno}_{page_num}");
                let mut q = Question::new(id.clone(), kind);
                q.qno = Some(qno);
                q.extend_page(page_num);
                q.bboxes.push(bbox_of(page_num, block));
                q.text_preview = preview(&block.content);
                doc.push_question(q).map_err(to_core_err)?;
                cursor = Some(id);
                continue;
            }

            if is_section_boundary(block) {
                cursor = None;
                continue;
            }

            if let Some(cur_id) = cursor.clone() {
                extend_cursor(&mut doc, &cur_id, page_num, page.image_height, block);
            }
        }
    }
    doc.data_analysis_start_page = data_analysis_start;

    group_big_questions(&mut doc);
    infer_material_regions(&mut doc, pages);

    doc.reindex();
    doc.validate().map_err(to_core_err)?;
    Ok(doc)
}

/// Extend the current question's page span/bboxes with a continuation
/// block, enforcing the 35%/25% cross-page height cap (spec.md §8).
fn extend_cursor(doc: &mut StructureDoc, cur_id: &str, page_num: PageId, page_height: u32, block: &LayoutBlock) {
    let candidate = bbox_of(page_num, block);
    let Some(q) = doc.question_mut(cur_id) else { return };
    let last_page = q.page_span.last().copied();
    if let Some(last) = last_page {
        if page_num != last {
            if page_num != last + 1 {
                // Only a direct p -> p+1 continuation is permitted.
                return;
            }
            let projected = q.total_bbox_height() + candidate.height();
            let cap_fraction = if has_visual_element(block) { 0.25 } else { 0.35 };
            let cap = cap_fraction * page_height as f32;
            if page_height > 0 && projected > cap {
                return;
            }
        }
    }
    q.extend_page(page_num);
    q.bboxes.push(candidate);
}

/// Step 3: group sub-questions into fixed-size big questions in discovery
/// order (which tracks ascending qno since the page walk is ascending).
fn group_big_questions(doc: &mut StructureDoc) {
    let sub_ids: Vec<String> = doc
        .questions
        .iter()
        .filter(|q| q.kind == QuestionKind::DataAnalysisSub)
        .map(|q| q.id.clone())
        .collect();

    for (i, chunk) in sub_ids.chunks(BIG_QUESTION_SIZE).enumerate() {
        let big_id = format!("big_{}", i + 1);
        let mut big = BigQuestion::new(big_id.clone(), i as u32 + 1);
        let mut qnos = Vec::new();
        for sub_id in chunk {
            if let Some(q) = doc.question_mut(sub_id) {
                q.parent_id = Some(big_id.clone());
                if let Some(qno) = q.qno {
                    qnos.push(qno);
                }
                for p in q.page_span.clone() {
                    if !big.page_span.contains(&p) {
                        big.page_span.push(p);
                    }
                }
            }
            big.sub_question_ids.push(sub_id.clone());
        }
        if let (Some(min), Some(max)) = (qnos.iter().min(), qnos.iter().max()) {
            big.qno_range = (*min, *max);
        }
        doc.big_questions.push(big);
    }
}

/// Step 4: material regions are the non-noise blocks between the previous
/// big question's end page and the first sub-question's top-y, excluding
/// anything on the sub-question's own page below that top-y.
fn infer_material_regions(doc: &mut StructureDoc, pages: &[PageLayout]) {
    let mut prior_end_page = doc.data_analysis_start_page.unwrap_or(0);
    let big_ids: Vec<String> = doc.big_questions.iter().map(|b| b.id.clone()).collect();

    for big_id in big_ids {
        let first_sub = doc
            .big_questions
            .iter()
            .find(|b| b.id == big_id)
            .and_then(|b| b.sub_question_ids.first().cloned())
            .and_then(|id| doc.question(&id).cloned());

        let (first_sub_page, first_sub_top_y) = match &first_sub {
            Some(q) => {
                let page = q.page_span.first().copied().unwrap_or(prior_end_page);
                let top_y = q
                    .bboxes
                    .iter()
                    .filter(|b| b.page == page)
                    .map(|b| b.y1)
                    .fold(f32::INFINITY, f32::min);
                (page, if top_y.is_finite() { top_y } else { 0.0 })
            }
            None => (prior_end_page, 0.0),
        };

        let mut material = Vec::new();
        for page in pages.iter().filter(|p| {
            let n = page_sort_key(&p.page_id);
            n >= prior_end_page && n <= first_sub_page
        }) {
            let page_num = page_sort_key(&page.page_id);
            for block in &page.blocks {
                if is_noise(block) {
                    continue;
                }
                if page_num == first_sub_page && block.bbox[1] >= first_sub_top_y {
                    continue;
                }
                material.push(bbox_of(page_num, block));
            }
        }

        if let Some(big) = doc.big_questions.iter_mut().find(|b| b.id == big_id) {
            big.material_bboxes = material;
        }
        prior_end_page = first_sub_page;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(content: &str, label: &str, bbox: [f32; 4]) -> LayoutBlock {
        LayoutBlock {
            index: 0,
            label: label.to_string(),
            region_label: None,
            bbox,
            content: content.to_string(),
            content_truncated: false,
            content_len: None,
        }
    }

    #[test]
    fn simple_normal_question_is_detected() {
        let pages = vec![PageLayout {
            page_id: "page_1".to_string(),
            image_width: 1000,
            image_height: 1400,
            blocks: vec![
                block("1.What is the capital of France?", "text", [10.0, 10.0, 500.0, 60.0]),
                block("Options A/B/C/D follow.", "text", [10.0, 65.0, 500.0, 120.0]),
            ],
        }];
        let doc = detect(&pages).unwrap();
        assert_eq!(doc.questions.len(), 1);
        assert_eq!(doc.questions[0].kind, QuestionKind::Normal);
        assert_eq!(doc.questions[0].qno, Some(1));
        assert_eq!(doc.questions[0].bboxes.len(), 2);
    }

    #[test]
    fn reserved_range_accepted_without_explicit_title() {
        let pages = vec![PageLayout {
            page_id: "page_5".to_string(),
            image_width: 1000,
            image_height: 1400,
            blocks: vec![block("111.Refer to the table below.", "text", [10.0, 10.0, 500.0, 60.0])],
        }];
        let doc = detect(&pages).unwrap();
        assert_eq!(doc.questions[0].kind, QuestionKind::DataAnalysisSub);
        assert_eq!(doc.data_analysis_start_page, Some(5));
    }

    #[test]
    fn cross_page_continuation_rejected_over_height_cap() {
        let mut doc = StructureDoc::new();
        let mut q = Question::new("q1_1", QuestionKind::Normal);
        q.qno = Some(1);
        q.extend_page(1);
        q.bboxes.push(PageBBox { page: 1, x1: 0.0, y1: 0.0, x2: 100.0, y2: 400.0 });
        doc.push_question(q).unwrap();
        doc.reindex();

        let huge_block = block("continuation text", "text", [0.0, 0.0, 100.0, 600.0]);
        extend_cursor(&mut doc, "q1_1", 2, 1000, &huge_block);
        assert_eq!(doc.question("q1_1").unwrap().page_span, vec![1]);
    }

    #[test]
    fn big_questions_group_in_fives() {
        let mut pages_blocks = Vec::new();
        for qno in 111..=116 {
            pages_blocks.push(block(&format!("{qno}.Question text"), "text", [0.0, (qno as f32) * 10.0, 100.0, (qno as f32) * 10.0 + 5.0]));
        }
        let pages = vec![PageLayout {
            page_id: "page_10".to_string(),
            image_width: 1000,
            image_height: 1400,
            blocks: pages_blocks,
        }];
        let doc = detect(&pages).unwrap();
        assert_eq!(doc.big_questions.len(), 2);
        assert_eq!(doc.big_questions[0].sub_question_ids.len(), 5);
        assert_eq!(doc.big_questions[1].sub_question_ids.len(), 1);
    }
}
