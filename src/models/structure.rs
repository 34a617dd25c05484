//! The question/big-question graph produced by structure detection
//! (spec.md §3 "Structure document", §9 "Cyclic/pointer-heavy question
//! graph").
//!
//! An arena-with-back-refs representation for the parent/child question
//! shape: two maps keyed by id, serialized with only the forward
//! (`parent_id`) reference and rebuilt on load.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type PageId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    Normal,
    DataAnalysisSub,
    DataAnalysisMaterial,
}

/// An axis-aligned crop region on a single page, in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageBBox {
    pub page: PageId,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl PageBBox {
    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub qno: Option<u32>,
    pub kind: QuestionKind,
    pub page_span: Vec<PageId>,
    pub bboxes: Vec<PageBBox>,
    pub text_preview: String,
    pub parent_id: Option<String>,
}

impl Question {
    pub fn new(id: impl Into<String>, kind: QuestionKind) -> Self {
        Self {
            id: id.into(),
            qno: None,
            kind,
            page_span: Vec::new(),
            bboxes: Vec::new(),
            text_preview: String::new(),
            parent_id: None,
        }
    }

    pub fn extend_page(&mut self, page: PageId) {
        if self.page_span.last() != Some(&page) {
            self.page_span.push(page);
        }
    }

    /// Total crop-band height across all member bboxes, used by the 35%/25%
    /// continuation-detection caps in spec.md §8.
    pub fn total_bbox_height(&self) -> f32 {
        self.bboxes.iter().map(PageBBox::height).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BigQuestion {
    pub id: String,
    pub order: u32,
    pub page_span: Vec<PageId>,
    pub material_bboxes: Vec<PageBBox>,
    pub sub_question_ids: Vec<String>,
    pub qno_range: (u32, u32),
}

impl BigQuestion {
    pub fn new(id: impl Into<String>, order: u32) -> Self {
        Self {
            id: id.into(),
            order,
            page_span: Vec::new(),
            material_bboxes: Vec::new(),
            sub_question_ids: Vec::new(),
            qno_range: (0, 0),
        }
    }
}

/// The persisted question graph (`structure.json`, spec.md §6).
///
/// `questions`/`big_questions` are the arena storage; `children_by_parent`
/// is rebuilt on [`StructureDoc::reindex`] rather than serialized, avoiding
/// a cyclic on-disk representation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructureDoc {
    pub questions: Vec<Question>,
    pub big_questions: Vec<BigQuestion>,
    pub data_analysis_start_page: Option<PageId>,
    pub total_pages: Option<u32>,

    #[serde(skip)]
    question_by_id: HashMap<String, usize>,
    #[serde(skip)]
    children_by_parent: HashMap<String, Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum StructureError {
    #[error("question id {0:?} referenced but not defined")]
    DanglingParent(String),
    #[error("big question {big} sub-questions are not contiguous/ascending within {range:?}")]
    NonContiguousSubQuestions { big: String, range: (u32, u32) },
    #[error("sub-question {0:?} referenced by a big question has kind != data_analysis_sub")]
    WrongSubQuestionKind(String),
    #[error("duplicate question id {0:?}")]
    DuplicateQuestionId(String),
}

impl StructureDoc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the `question_by_id` / `children_by_parent` indices. Must be
    /// called after deserializing from JSON and after any bulk mutation.
    pub fn reindex(&mut self) {
        self.question_by_id.clear();
        self.children_by_parent.clear();
        for (idx, q) in self.questions.iter().enumerate() {
            self.question_by_id.insert(q.id.clone(), idx);
            if let Some(parent) = &q.parent_id {
                self.children_by_parent
                    .entry(parent.clone())
                    .or_default()
                    .push(q.id.clone());
            }
        }
    }

    pub fn question(&self, id: &str) -> Option<&Question> {
        self.question_by_id.get(id).map(|&idx| &self.questions[idx])
    }

    pub fn question_mut(&mut self, id: &str) -> Option<&mut Question> {
        self.question_by_id.get(id).copied().map(move |idx| &mut self.questions[idx])
    }

    pub fn children_of(&self, big_id: &str) -> &[String] {
        self.children_by_parent
            .get(big_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn push_question(&mut self, question: Question) -> Result<(), StructureError> {
        if self.question_by_id.contains_key(&question.id) {
            return Err(StructureError::DuplicateQuestionId(question.id));
        }
        self.question_by_id
            .insert(question.id.clone(), self.questions.len());
        if let Some(parent) = &question.parent_id {
            self.children_by_parent
                .entry(parent.clone())
                .or_default()
                .push(question.id.clone());
        }
        self.questions.push(question);
        Ok(())
    }

    /// Validate the invariants from spec.md §3:
    /// - question ids unique, `parent_id` resolves to a real BigQuestion
    /// - each BigQuestion's sub_question_ids are ascending-by-qno,
    ///   contiguous within its qno_range, and of kind `data_analysis_sub`
    pub fn validate(&self) -> Result<(), StructureError> {
        let mut seen = std::collections::HashSet::new();
        for q in &self.questions {
            if !seen.insert(&q.id) {
                return Err(StructureError::DuplicateQuestionId(q.id.clone()));
            }
        }
        let big_ids: std::collections::HashSet<&str> =
            self.big_questions.iter().map(|b| b.id.as_str()).collect();
        for q in &self.questions {
            if let Some(parent) = &q.parent_id {
                if !big_ids.contains(parent.as_str()) {
                    return Err(StructureError::DanglingParent(parent.clone()));
                }
            }
        }
        for big in &self.big_questions {
            let mut last_qno: Option<u32> = None;
            for sub_id in &big.sub_question_ids {
                let sub = self
                    .question(sub_id)
                    .ok_or_else(|| StructureError::DanglingParent(sub_id.clone()))?;
                if sub.kind != QuestionKind::DataAnalysisSub {
                    return Err(StructureError::WrongSubQuestionKind(sub_id.clone()));
                }
                let qno = sub.qno.unwrap_or(0);
                if qno < big.qno_range.0 || qno > big.qno_range.1 {
                    return Err(StructureError::NonContiguousSubQuestions {
                        big: big.id.clone(),
                        range: big.qno_range,
                    });
                }
                if let Some(last) = last_qno {
                    if qno <= last {
                        return Err(StructureError::NonContiguousSubQuestions {
                            big: big.id.clone(),
                            range: big.qno_range,
                        });
                    }
                }
                last_qno = Some(qno);
            }
        }
        Ok(())
    }
}
