//! Reference [`Engine`] implementation: performs no real inference.
//!
//! Chunks the active prompt back as "generated" text, the same way spec
//! scenario 4 describes "engine stub emits three chunks". This is the only
//! concrete `Engine` in this workspace — model loading and sampling are out
//! of scope (§1) — but it's wired up in `main.rs` so the host binary runs
//! end to end without an external engine.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use mlx_protocol::messages::{DownloadResult, DownloadSource, GenerateRequest, ModelListResult};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{CancelFlag, Engine, EngineError, StreamItem};

const CHUNK_SIZE: usize = 3;
const CHANNEL_CAPACITY: usize = 16;

pub struct StubEngine {
    cached: Mutex<BTreeSet<String>>,
    loaded: Mutex<BTreeSet<String>>,
}

impl StubEngine {
    pub fn new() -> Self {
        Self { cached: Mutex::new(BTreeSet::new()), loaded: Mutex::new(BTreeSet::new()) }
    }
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn download_source_key(source: &DownloadSource) -> String {
    match source {
        DownloadSource::Huggingface { repo, .. } => repo.clone(),
        DownloadSource::LocalPath { path } => path.clone(),
    }
}

/// Split `text` into `CHUNK_SIZE`-byte pieces — a stand-in for real token
/// boundaries. Splits on bytes, not chars; fine for the stub, not for
/// anything that must be UTF-8-safe on arbitrary input, which is exactly
/// why this engine is a reference/test fixture, not production-usable.
fn chunk_text(text: &str) -> Vec<String> {
    if text.is_empty() {
        return vec!["(empty prompt)".to_string()];
    }
    text.chars()
        .collect::<Vec<char>>()
        .chunks(CHUNK_SIZE)
        .map(|c| c.iter().collect())
        .collect()
}

#[async_trait]
impl Engine for StubEngine {
    async fn download(&self, source: DownloadSource, models_dir: Option<String>) -> Result<DownloadResult, EngineError> {
        let model = download_source_key(&source);
        let dir = models_dir.unwrap_or_else(|| std::env::temp_dir().join("mlx-models").display().to_string());
        let local_path = format!("{}/{}", dir.trim_end_matches('/'), model.replace('/', "_"));
        self.cached.lock().insert(model.clone());
        Ok(DownloadResult { model, local_path })
    }

    async fn load(&self, model: &str) -> Result<(), EngineError> {
        if model.is_empty() {
            return Err(EngineError::ModelNotFound(model.to_string()));
        }
        self.cached.lock().insert(model.to_string());
        self.loaded.lock().insert(model.to_string());
        Ok(())
    }

    async fn unload(&self, model: &str) -> Result<(), EngineError> {
        self.loaded.lock().remove(model);
        Ok(())
    }

    async fn delete(&self, model: &str) -> Result<(), EngineError> {
        self.loaded.lock().remove(model);
        self.cached.lock().remove(model);
        Ok(())
    }

    async fn list(&self) -> Result<ModelListResult, EngineError> {
        Ok(ModelListResult {
            cached: self.cached.lock().iter().cloned().collect(),
            loaded: self.loaded.lock().iter().cloned().collect(),
        })
    }

    async fn stream(
        &self,
        _request_id: String,
        request: GenerateRequest,
        cancel: CancelFlag,
    ) -> Result<mpsc::Receiver<StreamItem>, EngineError> {
        let (prompt, _history) = request.split_prompt_and_history();
        let chunks = chunk_text(&prompt);
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            for chunk in chunks {
                if cancel.load(Ordering::SeqCst) {
                    break;
                }
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        Ok(rx)
    }

    async fn cancel(&self, _request_id: &str) {
        // The shared CancelFlag passed into `stream` is the authoritative
        // signal; this stub has no side channel (blocking FFI call, GPU
        // kernel, etc.) that needs a separate nudge.
    }

    async fn reset(&self, unload_all: bool, clear_cache: bool) -> Result<(), EngineError> {
        if unload_all {
            self.loaded.lock().clear();
        }
        if clear_cache {
            self.cached.lock().clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_protocol::messages::{ChatMessage, Role};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn req(prompt: &str) -> GenerateRequest {
        GenerateRequest {
            model: "m".into(),
            messages: vec![ChatMessage { role: Role::User, content: prompt.into() }],
            max_tokens: Some(16),
            stop: None,
            sampling: None,
        }
    }

    #[tokio::test]
    async fn streams_prompt_back_in_chunks() {
        let engine = StubEngine::new();
        let cancel = Arc::new(AtomicBool::new(false));
        let mut rx = engine.stream("r1".into(), req("hello"), cancel).await.unwrap();

        let mut out = String::new();
        while let Some(item) = rx.recv().await {
            out.push_str(&item.unwrap());
        }
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn cancellation_stops_further_chunks() {
        let engine = StubEngine::new();
        let cancel = Arc::new(AtomicBool::new(false));
        let mut rx = engine.stream("r1".into(), req("a fairly long prompt to chunk"), cancel.clone()).await.unwrap();

        let first = rx.recv().await.unwrap().unwrap();
        assert!(!first.is_empty());
        cancel.store(true, Ordering::SeqCst);

        // Draining after cancel should terminate quickly without yielding
        // every remaining chunk.
        let mut remaining = 0;
        while rx.recv().await.is_some() {
            remaining += 1;
            if remaining > 1000 {
                panic!("cancellation did not stop the stream");
            }
        }
    }

    #[tokio::test]
    async fn load_list_unload_roundtrip() {
        let engine = StubEngine::new();
        engine.load("m").await.unwrap();
        let listing = engine.list().await.unwrap();
        assert_eq!(listing.loaded, vec!["m".to_string()]);
        assert_eq!(listing.cached, vec!["m".to_string()]);

        engine.unload("m").await.unwrap();
        let listing = engine.list().await.unwrap();
        assert!(listing.loaded.is_empty());
        assert_eq!(listing.cached, vec!["m".to_string()]);
    }
}
