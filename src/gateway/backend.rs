//! The OCR backend trait boundary: `OcrError`, `OcrBackendType`, and the
//! `OcrBackend` trait an embedder implements to supply a real inference
//! engine, recut to this core's `RawBlock` wire format (spec.md §4.E).

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("model load failed: {0}")]
    LoadFailed(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("gateway not ready: {0}")]
    NotReady(String),
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// A single detected layout block, before the normalization/truncation the
/// cache applies (spec.md §4.E).
#[derive(Debug, Clone)]
pub struct RawBlock {
    pub index: u32,
    pub label: Option<String>,
    pub region_label: Option<String>,
    pub bbox: Option<[f32; 4]>,
    pub content: String,
}

/// What a single `predict` call is given. Most backends accept either; a
/// backend that only accepts paths should return `InferenceFailed` for
/// `Pixels` so the cache fetcher's one-shot path retry (spec.md §4.E step 4)
/// can kick in.
pub enum OcrInput<'a> {
    Path(&'a std::path::Path),
    Pixels { width: u32, height: u32, rgb8: &'a [u8] },
}

#[async_trait]
pub trait OcrBackend: Send + Sync {
    /// Load model weights. Called once by the gateway's warmup, off the
    /// event loop (backends are typically blocking, CPU- or GPU-bound).
    async fn load(&self) -> GatewayResult<()>;

    /// Run one inference. The gateway guarantees this is never called
    /// concurrently with another `predict` on the same backend instance
    /// (spec.md §4.D "accelerator mutex").
    async fn predict(&self, input: OcrInput<'_>) -> GatewayResult<Vec<RawBlock>>;

    fn name(&self) -> &'static str;
}

/// A minimal backend used by tests and as a development fallback: it
/// returns one synthetic block per call without touching any model, which
/// is all `warmup`'s synthetic inference needs.
pub struct NullBackend;

#[async_trait]
impl OcrBackend for NullBackend {
    async fn load(&self) -> GatewayResult<()> {
        Ok(())
    }

    async fn predict(&self, _input: OcrInput<'_>) -> GatewayResult<Vec<RawBlock>> {
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "null"
    }
}
