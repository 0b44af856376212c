//! The Engine capability (§4.8) — the narrow, external contract the
//! dispatcher depends on. Model loading, tokenization, and sampling are out
//! of scope for this crate (§1); this module defines the trait and ships
//! one reference implementation, [`stub::StubEngine`], used by tests and
//! as the default when no real engine is wired in.

pub mod stub;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use mlx_protocol::messages::{DownloadResult, DownloadSource, GenerateRequest, ModelListResult};
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error("{0}")]
    Other(String),
}

/// Cooperatively observed at token boundaries by a running stream; set by
/// the dispatcher on `inference.cancel` (§5).
pub type CancelFlag = Arc<AtomicBool>;

/// A chunk of streamed output, or a terminal engine-side failure.
pub type StreamItem = Result<String, EngineError>;

#[async_trait]
pub trait Engine: Send + Sync {
    async fn download(&self, source: DownloadSource, models_dir: Option<String>) -> Result<DownloadResult, EngineError>;

    async fn load(&self, model: &str) -> Result<(), EngineError>;

    async fn unload(&self, model: &str) -> Result<(), EngineError>;

    async fn delete(&self, model: &str) -> Result<(), EngineError>;

    async fn list(&self) -> Result<ModelListResult, EngineError>;

    /// Stream textual chunks for `request_id`. The returned channel is
    /// closed by the engine when generation ends; `cancel` must be polled
    /// at chunk boundaries and the channel closed promptly once it's set.
    async fn stream(
        &self,
        request_id: String,
        request: GenerateRequest,
        cancel: CancelFlag,
    ) -> Result<mpsc::Receiver<StreamItem>, EngineError>;

    /// Idempotent: signal the in-flight stream for `request_id`, if any.
    async fn cancel(&self, request_id: &str);

    async fn reset(&self, unload_all: bool, clear_cache: bool) -> Result<(), EngineError>;
}
