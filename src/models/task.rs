//! Task, stage, log, and event models (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The five ordered pipeline stages. Stages 0, 1, 4 are critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    PdfToImages,
    ExtractQuestions,
    AnalyzeData,
    ComposeLongImage,
    CollectResults,
}

impl StageName {
    /// Ordered list of all stages, index-aligned with `step_index`.
    pub const ALL: [StageName; 5] = [
        StageName::PdfToImages,
        StageName::ExtractQuestions,
        StageName::AnalyzeData,
        StageName::ComposeLongImage,
        StageName::CollectResults,
    ];

    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|s| s == self).expect("exhaustive ALL")
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Stages 0, 1, 4 fail the task outright; 2, 3 are recoverable.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            StageName::PdfToImages | StageName::ExtractQuestions | StageName::CollectResults
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::PdfToImages => "pdf_to_images",
            StageName::ExtractQuestions => "extract_questions",
            StageName::AnalyzeData => "analyze_data",
            StageName::ComposeLongImage => "compose_long_image",
            StageName::CollectResults => "collect_results",
        }
    }

    /// Human-facing display title for this stage.
    pub fn title(&self) -> &'static str {
        match self {
            StageName::PdfToImages => "Rasterize pages",
            StageName::ExtractQuestions => "Extract questions",
            StageName::AnalyzeData => "Analyze data section",
            StageName::ComposeLongImage => "Compose long images",
            StageName::CollectResults => "Collect results",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|n| n.as_str() == s)
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a task was created for unattended (`auto`) or operator-driven
/// (`manual`) processing. Controls stage 2/3 re-run policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    Auto,
    Manual,
}

impl PipelineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineMode::Auto => "auto",
            PipelineMode::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(PipelineMode::Auto),
            "manual" => Some(PipelineMode::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StageStatus::Pending),
            "running" => Some(StageStatus::Running),
            "completed" => Some(StageStatus::Completed),
            "failed" => Some(StageStatus::Failed),
            "skipped" => Some(StageStatus::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Default,
    Info,
    Success,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Default => "default",
            LogLevel::Info => "info",
            LogLevel::Success => "success",
            LogLevel::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "default" => Some(LogLevel::Default),
            "info" => Some(LogLevel::Info),
            "success" => Some(LogLevel::Success),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// A single exam-processing task (spec.md §3 `Task`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub mode: PipelineMode,
    pub pdf_name: String,
    pub file_hash: Option<String>,
    pub exam_dir_name: Option<String>,
    pub status: TaskStatus,
    /// -1 when idle, else the index of the stage currently running.
    pub current_step: i32,
    pub error_message: Option<String>,
    pub expected_pages: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(task_id: impl Into<String>, mode: PipelineMode, pdf_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            mode,
            pdf_name: pdf_name.into(),
            file_hash: None,
            exam_dir_name: None,
            status: TaskStatus::Pending,
            current_step: -1,
            error_message: None,
            expected_pages: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
            deleted_at: None,
        }
    }
}

/// One of the five stage records attached to a task (spec.md §3 `Stage`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub task_id: String,
    pub step_index: i32,
    pub name: StageName,
    pub title: String,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Ordered list of opaque Artifact Store references.
    pub artifact_refs: Vec<String>,
}

impl Stage {
    pub fn pending(task_id: impl Into<String>, name: StageName) -> Self {
        Self {
            task_id: task_id.into(),
            step_index: name.index() as i32,
            title: name.title().to_string(),
            name,
            status: StageStatus::Pending,
            started_at: None,
            ended_at: None,
            error: None,
            artifact_refs: Vec::new(),
        }
    }
}

/// Append-only per-task log line (spec.md §3 `LogEntry`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub task_id: String,
    pub created_at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// A durable event as returned to callers of the Event Store / Composite
/// Sink (spec.md §3 `Event`, §4.C).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: i64,
    pub task_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
