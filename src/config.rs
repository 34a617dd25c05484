//! Runtime configuration (SPEC_FULL.md §A.3): an optional TOML file, then
//! `EXAMCORE_*` environment overrides, then CLI flags — in that precedence
//! order, file-weakest to CLI-strongest.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

fn default_workdir_root() -> PathBuf {
    PathBuf::from("./data/workdirs")
}

fn default_artifact_root() -> PathBuf {
    PathBuf::from("./data/artifacts")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/examcore.sqlite3")
}

fn default_true() -> bool {
    true
}

fn default_memory_cache_size() -> usize {
    512
}

fn default_worker_count() -> usize {
    crate::processor::default_worker_count()
}

fn default_prefetch_queue_size() -> usize {
    8
}

fn default_png_compression() -> u8 {
    6
}

/// The full config surface named in `spec.md` §6, plus the base paths
/// needed to run standalone (SPEC_FULL.md §A.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub workdir_root: PathBuf,
    pub artifact_root: PathBuf,
    pub database_path: PathBuf,

    /// Overrides the Model Gateway's inference device (e.g. "cpu", "cuda").
    pub model_device: Option<String>,
    pub gpu_id: Option<u32>,
    /// Enables the "light table" review affordance in downstream UIs; this
    /// core only threads the flag through, it has no behavior of its own.
    pub light_table_enabled: bool,
    pub ocr_batch_size: Option<usize>,

    pub parallel_extract_enabled: bool,
    pub parallel_extract_workers: usize,
    pub prefetch_queue_size: usize,

    pub ocr_cache_pretty_print: bool,
    pub memory_cache_enabled: bool,
    pub memory_cache_size: usize,

    /// JSONL path for the Performance Tracer; `None` keeps it a no-op.
    pub perf_trace_path: Option<PathBuf>,

    pub png_compression_level: u8,
    pub meta_json_pretty_print: bool,
    /// Serialize block lists as plain arrays rather than objects keyed by
    /// index, matching whichever wire shape a given downstream consumer
    /// expects.
    pub image_pass_by_array: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workdir_root: default_workdir_root(),
            artifact_root: default_artifact_root(),
            database_path: default_database_path(),
            model_device: None,
            gpu_id: None,
            light_table_enabled: false,
            ocr_batch_size: None,
            parallel_extract_enabled: true,
            parallel_extract_workers: default_worker_count(),
            prefetch_queue_size: default_prefetch_queue_size(),
            ocr_cache_pretty_print: false,
            memory_cache_enabled: default_true(),
            memory_cache_size: default_memory_cache_size(),
            perf_trace_path: None,
            png_compression_level: default_png_compression(),
            meta_json_pretty_print: true,
            image_pass_by_array: false,
        }
    }
}

impl Settings {
    /// Loads a TOML file if present, otherwise starts from defaults, then
    /// layers `EXAMCORE_*` environment variable overrides on top.
    pub fn load(toml_path: Option<&Path>) -> anyhow::Result<Self> {
        let mut settings = match toml_path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw)?
            }
            _ => Settings::default(),
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("EXAMCORE_WORKDIR_ROOT") {
            self.workdir_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("EXAMCORE_ARTIFACT_ROOT") {
            self.artifact_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("EXAMCORE_DATABASE_PATH") {
            self.database_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("EXAMCORE_MODEL_DEVICE") {
            self.model_device = Some(v);
        }
        if let Ok(v) = std::env::var("EXAMCORE_GPU_ID") {
            if let Ok(n) = v.parse() {
                self.gpu_id = Some(n);
            }
        }
        if let Ok(v) = std::env::var("EXAMCORE_LIGHT_TABLE_ENABLED") {
            if let Ok(b) = v.parse() {
                self.light_table_enabled = b;
            }
        }
        if let Ok(v) = std::env::var("EXAMCORE_PARALLEL_EXTRACT_WORKERS") {
            if let Ok(n) = v.parse() {
                self.parallel_extract_workers = n;
            }
        }
        if let Ok(v) = std::env::var("EXAMCORE_PREFETCH_QUEUE_SIZE") {
            if let Ok(n) = v.parse() {
                self.prefetch_queue_size = n;
            }
        }
        if let Ok(v) = std::env::var("EXAMCORE_MEMORY_CACHE_ENABLED") {
            if let Ok(b) = v.parse() {
                self.memory_cache_enabled = b;
            }
        }
        if let Ok(v) = std::env::var("EXAMCORE_MEMORY_CACHE_SIZE") {
            if let Ok(n) = v.parse() {
                self.memory_cache_size = n;
            }
        }
        if let Ok(v) = std::env::var("EXAMCORE_PERF_TRACE_PATH") {
            self.perf_trace_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("EXAMCORE_PNG_COMPRESSION_LEVEL") {
            if let Ok(n) = v.parse() {
                self.png_compression_level = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert!(s.parallel_extract_enabled);
        assert!(s.memory_cache_enabled);
        assert!(s.perf_trace_path.is_none());
    }

    #[test]
    fn missing_toml_path_falls_back_to_defaults() {
        let s = Settings::load(Some(Path::new("/nonexistent/examcore.toml"))).unwrap();
        assert_eq!(s.memory_cache_size, default_memory_cache_size());
    }
}
