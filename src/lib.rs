//! examcore: a resumable OCR/layout-analysis pipeline core for exam-paper
//! ingestion. See `spec.md`/`SPEC_FULL.md` for the full module contract;
//! this crate implements everything except HTTP/SSE transport, PDF
//! rasterization internals, and the frontend, which remain external
//! collaborators reached through narrow trait boundaries (e.g.
//! [`stages::pdf_to_images::PageRasterizer`]).

pub mod artifact;
pub mod cache;
pub mod config;
pub mod crop;
pub mod error;
pub mod events;
pub mod gateway;
pub mod models;
pub mod perf;
pub mod processor;
pub mod queue;
pub mod recovery;
pub mod repository;
pub mod runner;
pub mod stages;
pub mod structure;

pub use error::{CoreError, Result};
