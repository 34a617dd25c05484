//! Domain types shared by the repository, runner, and stage executors.

pub mod structure;
pub mod task;

pub use structure::{BigQuestion, Question, QuestionKind, StructureDoc};
pub use task::{
    LogEntry, LogLevel, PipelineMode, Stage, StageName, StageStatus, StoredEvent, Task,
    TaskStatus,
};
