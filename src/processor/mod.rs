//! The Page Processor: a bounded prefetcher feeding a worker pool, with
//! serialized inference and parallel CPU post-processing (spec.md §4.F).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::cache::{OcrCache, PageLayout};
use crate::error::{CoreError, Result};
use crate::gateway::ModelGateway;

const PREFETCH_BYTES: usize = 4096;

/// CPU work a caller wants run against a page's freshly-decoded OCR layout
/// (spec.md §4.F step 4: crop-span finding, crop materialization, summary
/// JSON). Implementations run *inside* the worker that produced the layout,
/// so their CPU-bound work overlaps with the other workers' Model Gateway
/// `predict` calls rather than waiting for every page's OCR to finish first.
#[async_trait]
pub trait PagePostProcessor: Send + Sync {
    async fn process(&self, workdir: &Path, page_path: &Path, layout: &PageLayout) -> Result<PagePostResult>;
}

/// What a [`PagePostProcessor`] produced for one page.
#[derive(Debug, Clone, Default)]
pub struct PagePostResult {
    pub artifact_refs: Vec<String>,
    pub question_count: usize,
}

/// Per-page outcome, written into an index-aligned slot so the final
/// sequence matches input order regardless of which worker finished first.
#[derive(Debug, Clone)]
pub struct PageResult {
    pub index: usize,
    pub path: PathBuf,
    pub skipped: bool,
    pub layout: Option<PageLayout>,
    pub post: PagePostResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub done: usize,
    pub total: usize,
}

pub fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    (cpus / 2).clamp(2, 6)
}

pub struct PageProcessor {
    gateway: Arc<ModelGateway>,
    cache: Arc<OcrCache>,
    workers: usize,
    queue_capacity: usize,
}

impl PageProcessor {
    pub fn new(gateway: Arc<ModelGateway>, cache: Arc<OcrCache>, workers: usize, queue_capacity: usize) -> Self {
        Self {
            gateway,
            cache,
            workers: workers.max(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Returns results in input order. `skip_existing_check` is called per
    /// page to decide whether a valid summary already exists (stage 1's
    /// `meta.json` presence check lives in the caller, not here, so this
    /// module stays independent of the on-disk summary format).
    pub async fn process_pages<F, P>(
        &self,
        workdir: &Path,
        pages: Vec<PathBuf>,
        skip_existing_check: F,
        on_progress: P,
    ) -> Result<Vec<PageResult>>
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
        P: Fn(Progress) + Send + 'static,
    {
        self.process_pages_with(workdir, pages, skip_existing_check, on_progress, None)
            .await
    }

    /// Same as [`Self::process_pages`], but additionally runs `post_process`
    /// (if given) inside each worker right after that page's OCR succeeds.
    pub async fn process_pages_with<F, P>(
        &self,
        workdir: &Path,
        pages: Vec<PathBuf>,
        skip_existing_check: F,
        on_progress: P,
        post_process: Option<Arc<dyn PagePostProcessor>>,
    ) -> Result<Vec<PageResult>>
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
        P: Fn(Progress) + Send + 'static,
    {
        let total = pages.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let (tx, rx) = mpsc::channel::<Option<(usize, PathBuf)>>(self.queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let prefetch_pages = pages.clone();
        let workers_for_sentinel = self.workers;
        let prefetcher = tokio::spawn(async move {
            for (index, path) in prefetch_pages.into_iter().enumerate() {
                let _ = prefetch_prefix(&path).await;
                if tx.send(Some((index, path))).await.is_err() {
                    return;
                }
            }
            for _ in 0..workers_for_sentinel {
                let _ = tx.send(None).await;
            }
        });

        let slots: Arc<Mutex<Vec<Option<PageResult>>>> = Arc::new(Mutex::new(vec![None; total]));
        let done = Arc::new(AtomicUsize::new(0));
        let first_error: Arc<Mutex<Option<CoreError>>> = Arc::new(Mutex::new(None));
        let skip_existing_check = Arc::new(skip_existing_check);

        let (progress_tx, mut progress_rx) = watch::channel(Progress { done: 0, total });
        let progress_task = tokio::spawn(async move {
            loop {
                if progress_rx.changed().await.is_err() {
                    return;
                }
                on_progress(progress_rx.borrow().clone());
            }
        });

        let mut worker_handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let rx = rx.clone();
            let gateway = self.gateway.clone();
            let cache = self.cache.clone();
            let slots = slots.clone();
            let done = done.clone();
            let first_error = first_error.clone();
            let skip_existing_check = skip_existing_check.clone();
            let workdir = workdir.to_path_buf();
            let progress_tx = progress_tx.clone();
            let post_process = post_process.clone();

            worker_handles.push(tokio::spawn(async move {
                loop {
                    let item = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(Some((index, path))) = item else { break };

                    if first_error.lock().expect("poisoned").is_some() {
                        continue;
                    }

                    let result = if skip_existing_check(&path) {
                        Ok(PageResult {
                            index,
                            path: path.clone(),
                            skipped: true,
                            layout: None,
                            post: PagePostResult::default(),
                        })
                    } else {
                        process_one(&gateway, &cache, &workdir, &path, index, post_process.as_deref()).await
                    };

                    match result {
                        Ok(page_result) => {
                            slots.lock().expect("poisoned")[index] = Some(page_result);
                        }
                        Err(e) => {
                            let mut guard = first_error.lock().expect("poisoned");
                            if guard.is_none() {
                                *guard = Some(e);
                            }
                        }
                    }

                    let d = done.fetch_add(1, Ordering::SeqCst) + 1;
                    let _ = progress_tx.send(Progress { done: d, total });
                }
            }));
        }

        // Drop the local sender clone used only to keep the channel open
        // for the progress watch; real completion happens when workers
        // finish.
        drop(progress_tx);

        for handle in worker_handles {
            let _ = handle.await;
        }
        let _ = tokio::time::timeout(std::time::Duration::from_secs(30), prefetcher).await;
        progress_task.abort();

        if let Some(e) = first_error.lock().expect("poisoned").take() {
            return Err(e);
        }

        let slots = std::mem::take(&mut *slots.lock().expect("poisoned"));
        slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| slot.ok_or_else(|| CoreError::fatal(format!("page {i} never completed"))))
            .collect()
    }
}

async fn prefetch_prefix(path: &Path) -> std::io::Result<()> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; PREFETCH_BYTES];
    let _ = file.read(&mut buf).await?;
    Ok(())
}

async fn process_one(
    gateway: &Arc<ModelGateway>,
    cache: &Arc<OcrCache>,
    workdir: &Path,
    path: &Path,
    index: usize,
    post_process: Option<&dyn PagePostProcessor>,
) -> Result<PageResult> {
    let lease = gateway
        .lease()
        .await
        .map_err(|e| CoreError::retryable(format!("gateway lease failed: {e}")))?;
    let layout = cache
        .run_ocr_with_cache(&lease, path, workdir, false)
        .await?;
    // The lease is only needed for the gateway call above; post-processing
    // is pure CPU/filesystem work and runs after it's released, so the next
    // queued page can pick it up immediately.
    drop(lease);

    let post = match &post_process {
        Some(p) => p.process(workdir, path, &layout).await?,
        None => PagePostResult::default(),
    };

    Ok(PageResult {
        index,
        path: path.to_path_buf(),
        skipped: false,
        layout: Some(layout),
        post,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::NullBackend;

    #[tokio::test]
    async fn empty_input_yields_empty_output() {
        let gateway = Arc::new(crate::gateway::ModelGateway::new_for_test(Arc::new(NullBackend)));
        let cache = Arc::new(OcrCache::new(Some(8), None));
        let processor = PageProcessor::new(gateway, cache, 2, 4);
        let dir = tempfile::tempdir().unwrap();
        let results = processor
            .process_pages(dir.path(), Vec::new(), |_| false, |_| {})
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
