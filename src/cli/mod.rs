//! CLI commands: `run`/`resume`/`cancel`/`status` over a task, plus the
//! dependency wiring that assembles the repository, event fabric, and
//! pipeline runner from configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::artifact::ArtifactStore;
use crate::cache::OcrCache;
use crate::config::Settings;
use crate::events::{CompositeSink, EventStore, LiveBus};
use crate::gateway::{self, NullBackend};
use crate::models::task::{PipelineMode, StageName, Task, TaskStatus};
use crate::recovery::RecoveryService;
use crate::repository::{db::Db, pool, schema_init::init_schema, TaskRepository};
use crate::runner::PipelineRunner;
use crate::stages::pdf_to_images::PageRasterizer;
use crate::stages::{default_registry, StepContext};

/// A [`PageRasterizer`] placeholder: PDF rasterization is an external
/// collaborator (spec.md §1) this crate never implements directly. Wire a
/// real one in before running against actual PDFs.
struct UnimplementedRasterizer;

#[async_trait::async_trait]
impl PageRasterizer for UnimplementedRasterizer {
    async fn page_count(&self, _pdf_path: &std::path::Path) -> crate::error::Result<u32> {
        Err(crate::error::CoreError::fatal(
            "no PageRasterizer configured: PDF rasterization is an external collaborator",
        ))
    }

    async fn render_page(
        &self,
        _pdf_path: &std::path::Path,
        _page_idx: u32,
        _dpi: u32,
        _out_path: &std::path::Path,
    ) -> crate::error::Result<()> {
        Err(crate::error::CoreError::fatal(
            "no PageRasterizer configured: PDF rasterization is an external collaborator",
        ))
    }
}

fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

pub fn default_filter() -> &'static str {
    if is_verbose() {
        "examcore=debug"
    } else {
        "examcore=info"
    }
}

#[derive(Parser)]
#[command(name = "examcore")]
#[command(about = "Resumable OCR/layout pipeline core for exam-paper ingestion")]
#[command(version)]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline for a PDF, creating a new task.
    Run {
        pdf_path: PathBuf,
        #[arg(long, default_value = "auto")]
        mode: String,
    },
    /// Resume an existing task from its first non-completed stage.
    Resume { task_id: String },
    /// Request cooperative cancellation of a task.
    Cancel { task_id: String },
    /// Print a task's status and per-stage state as JSON.
    Status { task_id: String },
}

struct Wiring {
    settings: Settings,
    repo: TaskRepository,
    artifacts: Arc<ArtifactStore>,
    sink: CompositeSink,
    runner: PipelineRunner,
}

async fn wire(config_path: Option<&std::path::Path>) -> anyhow::Result<Wiring> {
    let settings = Settings::load(config_path)?;
    tokio::fs::create_dir_all(&settings.workdir_root).await?;
    tokio::fs::create_dir_all(&settings.artifact_root).await?;
    if let Some(parent) = settings.database_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut conn = pool::connect(&settings.database_path).await?;
    init_schema(&mut conn).await?;
    let db = Db::new(conn);
    let repo = TaskRepository::from_db(db.clone());
    let store = EventStore::new(db);
    let bus = LiveBus::new();
    let sink = CompositeSink::new(store, bus);

    let artifacts = Arc::new(ArtifactStore::new(&settings.artifact_root));
    let gw = gateway::global(|| Arc::new(NullBackend));
    let cache = Arc::new(OcrCache::new(
        settings.memory_cache_enabled.then_some(settings.memory_cache_size),
        None,
    ));
    let steps = default_registry(Arc::new(UnimplementedRasterizer), gw, cache);
    let runner = PipelineRunner::new(steps, repo.clone(), sink.clone());

    Ok(Wiring { settings, repo, artifacts, sink, runner })
}

fn step_context(task: &Task, workdir: PathBuf, pdf_path: PathBuf, artifacts: Arc<ArtifactStore>) -> StepContext {
    StepContext {
        task_id: task.task_id.clone(),
        pdf_path,
        workdir,
        file_hash: task.file_hash.clone(),
        expected_pages: task.expected_pages,
        mode: task.mode,
        metadata: HashMap::new(),
        artifacts,
    }
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let wiring = wire(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Run { pdf_path, mode } => {
            let mode = PipelineMode::from_str(&mode)
                .ok_or_else(|| anyhow::anyhow!("invalid --mode {mode:?}, expected auto|manual"))?;
            let task_id = uuid::Uuid::new_v4().to_string();
            let pdf_name = pdf_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| task_id.clone());
            let task = Task::new(task_id.as_str(), mode, pdf_name);
            wiring.repo.create_task(&task, &StageName::ALL).await?;

            let workdir = wiring.settings.workdir_root.join(&task_id);
            tokio::fs::create_dir_all(&workdir).await?;
            let ctx = step_context(&task, workdir, pdf_path, wiring.artifacts.clone());

            let finished = wiring.runner.run(&ctx, None).await?;
            println!("{}", serde_json::to_string_pretty(&finished)?);
        }
        Commands::Resume { task_id } => {
            let task = wiring
                .repo
                .get_task_row(&task_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("task {task_id} not found"))?;
            let stages = wiring.repo.get_stages(&task_id).await?;
            let start_from = stages
                .iter()
                .find(|s| !matches!(s.status, crate::models::task::StageStatus::Completed))
                .map(|s| s.step_index as usize);

            let workdir = wiring.settings.workdir_root.join(
                task.exam_dir_name.clone().unwrap_or_else(|| task_id.clone()),
            );
            let pdf_path = wiring.settings.workdir_root.join(&task.pdf_name);
            let ctx = step_context(&task, workdir, pdf_path, wiring.artifacts.clone());

            let finished = wiring.runner.run(&ctx, start_from).await?;
            println!("{}", serde_json::to_string_pretty(&finished)?);
        }
        Commands::Cancel { task_id } => {
            // A bare CLI invocation has no runner instance to cooperate with
            // across process boundaries; fall back to the repository so an
            // operator can at least stop a task from being auto-resumed.
            let cancelled = wiring.runner.cancel(&task_id);
            if !cancelled {
                wiring
                    .repo
                    .update_task_status(&task_id, TaskStatus::Pending, -1, None)
                    .await?;
            }
            wiring
                .sink
                .emit_best_effort(&task_id, "pipeline_cancelled", serde_json::json!({}))
                .await;
            println!("cancel requested for {task_id}");
        }
        Commands::Status { task_id } => {
            let detail = wiring
                .repo
                .get_task(&task_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("task {task_id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&detail)?);
        }
    }
    Ok(())
}

/// Startup recovery entry point: loads in-flight tasks, validates them
/// against the filesystem, and returns the cleaned snapshots (spec.md
/// §4.K). Separate from [`run`] so the binary can call it once before
/// dispatching to the CLI.
pub async fn recover(config_path: Option<&std::path::Path>) -> anyhow::Result<Vec<crate::recovery::TaskSnapshot>> {
    let wiring = wire(config_path).await?;
    let recovery = RecoveryService::new(wiring.repo, wiring.artifacts, wiring.settings.workdir_root);
    Ok(recovery.recover().await?)
}
