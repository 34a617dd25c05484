//! Performance tracing sink (SPEC_FULL.md §C.6): appends one JSON object per
//! line to a configured path. A no-op when unconfigured, so call sites don't
//! need to branch on whether tracing is enabled.

use std::path::Path;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub struct PerfTracer {
    file: Option<Mutex<File>>,
}

impl PerfTracer {
    pub fn noop() -> Self {
        Self { file: None }
    }

    pub async fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Self { file: Some(Mutex::new(file)) })
    }

    /// Records one `{ts, op, task_id, millis, extra}` line. Logs and
    /// swallows write errors rather than propagating: a tracing sink must
    /// never fail the operation it's instrumenting.
    pub async fn record(&self, op: &str, task_id: &str, millis: u64, extra: Value) {
        let Some(file) = &self.file else { return };
        let line = json!({
            "ts": Utc::now(),
            "op": op,
            "task_id": task_id,
            "millis": millis,
            "extra": extra,
        });
        let mut guard = file.lock().await;
        if let Err(e) = async {
            guard.write_all(line.to_string().as_bytes()).await?;
            guard.write_all(b"\n").await
        }
        .await
        {
            tracing::warn!(error = %e, "perf trace write failed");
        }
    }
}

impl Default for PerfTracer {
    fn default() -> Self {
        Self::noop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn noop_never_writes() {
        let tracer = PerfTracer::noop();
        tracer.record("predict", "t1", 12, json!({})).await;
    }

    #[tokio::test]
    async fn open_appends_one_line_per_call() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("perf.jsonl");
        let tracer = PerfTracer::open(&path).await.unwrap();
        tracer.record("predict", "t1", 12, json!({"page": 1})).await;
        tracer.record("stage", "t1", 34, json!({"step": 0})).await;

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["op"], "predict");
        assert_eq!(parsed["millis"], 12);
    }
}
