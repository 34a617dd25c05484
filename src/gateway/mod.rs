//! The Model Gateway: a singleton over the shared OCR backend (spec.md
//! §4.D).
//!
//! Grounded in `crates/foia-analysis/src/ocr/ocrs_backend.rs`'s
//! `static OCR_ENGINE: OnceLock<...>` singleton, generalized to a
//! `RwLock`-guarded slot so tests can call [`reset_instance`] — a bare
//! `OnceLock` can only ever be set once per process.

pub mod backend;

use std::cell::Cell;
use std::sync::{Arc, OnceLock, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Semaphore};

pub use backend::{GatewayError, GatewayResult, NullBackend, OcrBackend, OcrInput, RawBlock};

#[derive(Debug, Clone)]
enum GatewayState {
    Uninitialized,
    Warming,
    Ready { since: DateTime<Utc> },
    Failed { error: String, at: DateTime<Utc> },
}

tokio::task_local! {
    static LEASE_DEPTH: Cell<u32>;
}

pub struct ModelGateway {
    backend: Arc<dyn OcrBackend>,
    state: Mutex<GatewayState>,
    /// The reentrant "accelerator mutex" (spec.md §5): held only for the
    /// duration of a single `predict` call, reentrant within the same task
    /// via [`LEASE_DEPTH`] so nested leases in CPU post-processing don't
    /// deadlock against themselves.
    hard_mutex: Semaphore,
}

impl ModelGateway {
    fn new(backend: Arc<dyn OcrBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(GatewayState::Uninitialized),
            hard_mutex: Semaphore::new(1),
        }
    }

    /// Build a standalone gateway outside the process-wide singleton slot,
    /// for callers (tests, other crates embedding this one) that want their
    /// own instance rather than [`global`].
    pub fn new_for_test(backend: Arc<dyn OcrBackend>) -> Self {
        Self::new(backend)
    }

    /// Idempotent, coalescing warmup. Concurrent callers serialize on
    /// `state` and each observes the same outcome; only the first actually
    /// loads the backend.
    pub async fn warmup(&self, force: bool) -> GatewayResult<bool> {
        let mut state = self.state.lock().await;
        if !force {
            if let GatewayState::Ready { .. } = *state {
                return Ok(false);
            }
        }
        *state = GatewayState::Warming;
        match self.backend.load().await {
            Ok(()) => {
                // Synthetic inference to JIT lazy branches (spec.md §4.D).
                let _ = self.backend.predict(OcrInput::Pixels {
                    width: 1,
                    height: 1,
                    rgb8: &[0, 0, 0],
                }).await;
                *state = GatewayState::Ready { since: Utc::now() };
                Ok(true)
            }
            Err(e) => {
                *state = GatewayState::Failed {
                    error: e.to_string(),
                    at: Utc::now(),
                };
                Err(e)
            }
        }
    }

    /// Await the current warmup, or trigger one. Raises the last failure
    /// unless `force` clears it.
    pub async fn ensure_ready(&self, force: bool) -> GatewayResult<()> {
        let needs_warmup = {
            let state = self.state.lock().await;
            match &*state {
                GatewayState::Ready { .. } => false,
                GatewayState::Failed { error, .. } if !force => {
                    return Err(GatewayError::NotReady(error.clone()));
                }
                _ => true,
            }
        };
        if needs_warmup {
            self.warmup(force).await?;
        }
        Ok(())
    }

    /// Acquire a logical, process-wide inference lease. Cheap: it does not
    /// itself hold the hard mutex — only `Lease::predict` does, and only
    /// for the call's duration (spec.md §4.D).
    pub async fn lease(self: &Arc<Self>) -> GatewayResult<Lease> {
        self.ensure_ready(false).await?;
        Ok(Lease {
            gateway: self.clone(),
        })
    }

    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        *state = GatewayState::Uninitialized;
    }

    pub async fn is_ready(&self) -> bool {
        matches!(*self.state.lock().await, GatewayState::Ready { .. })
    }
}

/// A scoped handle yielded by [`ModelGateway::lease`]. Held for the
/// lifetime of one page's processing; CPU-side work may run freely, only
/// [`Lease::predict`] serializes against other leases.
pub struct Lease {
    gateway: Arc<ModelGateway>,
}

impl Lease {
    pub async fn predict(&self, input: OcrInput<'_>) -> GatewayResult<Vec<RawBlock>> {
        let depth = LEASE_DEPTH.try_with(|c| c.get()).unwrap_or(0);
        let gateway = self.gateway.clone();
        LEASE_DEPTH
            .scope(Cell::new(depth + 1), async move {
                let _permit = if depth == 0 {
                    Some(
                        gateway
                            .hard_mutex
                            .acquire()
                            .await
                            .expect("hard mutex semaphore is never closed"),
                    )
                } else {
                    None
                };
                gateway.backend.predict(input).await
            })
            .await
    }
}

static INSTANCE: OnceLock<RwLock<Option<Arc<ModelGateway>>>> = OnceLock::new();

fn cell() -> &'static RwLock<Option<Arc<ModelGateway>>> {
    INSTANCE.get_or_init(|| RwLock::new(None))
}

/// The process-wide gateway instance, created on first access with the
/// given backend. Subsequent calls ignore `backend` and return the
/// existing instance — use [`reset_instance`] between tests that need a
/// fresh one.
pub fn global(backend: impl FnOnce() -> Arc<dyn OcrBackend>) -> Arc<ModelGateway> {
    if let Some(g) = cell().read().expect("gateway lock poisoned").as_ref() {
        return g.clone();
    }
    let mut guard = cell().write().expect("gateway lock poisoned");
    if let Some(g) = guard.as_ref() {
        return g.clone();
    }
    let g = Arc::new(ModelGateway::new(backend()));
    *guard = Some(g.clone());
    g
}

pub fn reset_instance() {
    *cell().write().expect("gateway lock poisoned") = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingBackend {
        loads: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl OcrBackend for CountingBackend {
        async fn load(&self) -> GatewayResult<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn predict(&self, _input: OcrInput<'_>) -> GatewayResult<Vec<RawBlock>> {
            Ok(Vec::new())
        }
        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[tokio::test]
    async fn warmup_is_idempotent_across_concurrent_callers() {
        let loads = Arc::new(AtomicU32::new(0));
        let gateway = Arc::new(ModelGateway::new(Arc::new(CountingBackend {
            loads: loads.clone(),
        })));
        let a = gateway.clone();
        let b = gateway.clone();
        let (r1, r2) = tokio::join!(a.warmup(false), b.warmup(false));
        r1.unwrap();
        r2.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn nested_lease_predict_does_not_deadlock() {
        let gateway = Arc::new(ModelGateway::new(Arc::new(NullBackend)));
        gateway.ensure_ready(false).await.unwrap();
        let lease = gateway.lease().await.unwrap();
        let _ = lease
            .predict(OcrInput::Pixels {
                width: 1,
                height: 1,
                rgb8: &[0],
            })
            .await
            .unwrap();
    }
}
