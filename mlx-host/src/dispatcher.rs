//! Stateless router over envelope `type` (§4.4). Holds the Engine capability
//! and the connection's reply handle; owns per-request stream state for the
//! lifetime of a single connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use mlx_protocol::messages::{DownloadRequest, GenerateRequest, ResetRequest};
use mlx_protocol::{error_codes, types, Envelope};
use serde::Deserialize;
use serde_json::json;

use crate::connection::ConnectionHandle;
use crate::engine::{CancelFlag, Engine, EngineError};

const SERVER_VERSION: &str = "0.1.0";

/// Per-request stream state (§3): just the cancellation flag. Removed when
/// the stream reaches an absorbing state (`Ended`, `Errored`, `Cancelled`).
struct StreamState {
    cancel: CancelFlag,
}

pub struct Dispatcher<E: Engine + 'static> {
    engine: Arc<E>,
    handle: ConnectionHandle,
    auth_token: Option<String>,
    authenticated: AtomicBool,
    streams: DashMap<String, StreamState>,
}

/// The result of driving a request through to the engine's terminal event,
/// independent of whether the caller wants a single reply (`inference.generate`)
/// or per-chunk events (`inference.stream`).
struct StreamRun {
    text: String,
    chunk_count: u32,
    cancelled: bool,
    engine_error: Option<EngineError>,
    ttft_ms: u64,
    total_ms: u64,
    tokens_per_second: f64,
}

#[derive(Deserialize)]
struct HandshakePayload {
    #[serde(rename = "authToken")]
    auth_token: Option<String>,
}

#[derive(Deserialize)]
struct ModelRef {
    model: String,
}

#[derive(Deserialize)]
struct CancelPayload {
    #[serde(rename = "requestId")]
    request_id: String,
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

impl<E: Engine + 'static> Dispatcher<E> {
    pub fn new(engine: Arc<E>, handle: ConnectionHandle, auth_token: Option<String>) -> Arc<Self> {
        let authenticated = AtomicBool::new(auth_token.is_none());
        Arc::new(Self { engine, handle, auth_token, authenticated, streams: DashMap::new() })
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    fn req_id(env: &Envelope) -> String {
        env.id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    /// Route one decoded envelope. Fast operations run inline; anything that
    /// touches the engine is spawned so a slow request never blocks the
    /// connection's read loop while another request is in flight (§5).
    pub fn dispatch(self: &Arc<Self>, env: Envelope) {
        if !self.is_authenticated() {
            if env.kind == types::HANDSHAKE {
                self.clone().handle_handshake(env);
            } else {
                self.handle.send(Envelope::error(env.id, error_codes::UNAUTHORIZED, "Not authenticated")).ok();
                self.handle.close();
            }
            return;
        }

        match env.kind.as_str() {
            types::HANDSHAKE => self.clone().handle_handshake(env),
            types::MODEL_DOWNLOAD => spawn_on(self.clone(), env, Self::handle_download),
            types::MODEL_LOAD => spawn_on(self.clone(), env, Self::handle_load),
            types::MODEL_UNLOAD => spawn_on(self.clone(), env, Self::handle_unload),
            types::MODEL_DELETE => spawn_on(self.clone(), env, Self::handle_delete),
            types::MODEL_LIST => spawn_on(self.clone(), env, Self::handle_list),
            types::INFERENCE_GENERATE => spawn_on(self.clone(), env, Self::handle_generate),
            types::INFERENCE_STREAM => spawn_on(self.clone(), env, Self::handle_stream),
            types::INFERENCE_CANCEL => spawn_on(self.clone(), env, Self::handle_cancel),
            types::RESET => spawn_on(self.clone(), env, Self::handle_reset),
            other => {
                self.handle
                    .send(Envelope::error(env.id, error_codes::UNKNOWN_TYPE, format!("Unknown message type: {other}")))
                    .ok();
            }
        }
    }

    /// Cancel and forget every stream still open on this connection. Called
    /// once the connection's inbound channel closes (§4.4 connection-loss
    /// failure semantics): no envelope can be delivered any more, so the
    /// engine is told directly rather than through a reply.
    pub async fn shutdown(self: &Arc<Self>) {
        let ids: Vec<String> = self.streams.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, state)) = self.streams.remove(&id) {
                state.cancel.store(true, Ordering::SeqCst);
            }
            self.engine.cancel(&id).await;
        }
    }

    fn handle_handshake(self: Arc<Self>, env: Envelope) {
        let id = env.id.clone();
        let payload: HandshakePayload = env.payload_as().unwrap_or(HandshakePayload { auth_token: None });

        let ok = match &self.auth_token {
            None => true,
            Some(expected) => payload.auth_token.as_deref().map(|t| constant_time_eq(t.as_bytes(), expected.as_bytes())).unwrap_or(false),
        };

        if ok {
            self.authenticated.store(true, Ordering::SeqCst);
            let payload = json!({
                "serverVersion": SERVER_VERSION,
                "capabilities": {"chatCompletions": true, "stream": true, "download": true},
            });
            match id {
                Some(id) => { self.handle.send(Envelope::with_id(id, types::HANDSHAKE_OK, Some(payload))).ok(); }
                None => { self.handle.send(Envelope::new(types::HANDSHAKE_OK, Some(payload))).ok(); }
            }
        } else {
            self.handle.send(Envelope::error(id, error_codes::UNAUTHORIZED, "Invalid auth token")).ok();
            self.handle.close();
        }
    }

    async fn handle_download(self: Arc<Self>, env: Envelope) {
        let id = Self::req_id(&env);
        let req: DownloadRequest = match env.payload_as() {
            Ok(r) => r,
            Err(e) => {
                self.handle.send(Envelope::error(Some(id), error_codes::BAD_REQUEST, e.to_string())).ok();
                return;
            }
        };

        match self.engine.download(req.source, req.models_dir).await {
            Ok(result) => {
                let payload = json!({"model": result.model, "localPath": result.local_path});
                self.handle.send(Envelope::with_id(id, types::MODEL_DOWNLOAD_OK, Some(payload))).ok();
            }
            Err(e) => {
                self.handle.send(Envelope::error(Some(id), error_codes::INTERNAL, e.to_string())).ok();
            }
        }
    }

    async fn handle_load(self: Arc<Self>, env: Envelope) {
        let Some((id, model)) = self.parse_model_ref(&env) else { return };
        match self.engine.load(&model).await {
            Ok(()) => {
                self.handle.send(Envelope::with_id(id, types::MODEL_LOAD_OK, Some(json!({"model": model, "loaded": true})))).ok();
            }
            Err(e) => {
                self.handle.send(Envelope::error(Some(id), error_codes::INTERNAL, e.to_string())).ok();
            }
        }
    }

    async fn handle_unload(self: Arc<Self>, env: Envelope) {
        let Some((id, model)) = self.parse_model_ref(&env) else { return };
        match self.engine.unload(&model).await {
            Ok(()) => {
                self.handle.send(Envelope::with_id(id, types::MODEL_UNLOAD_OK, Some(json!({"model": model, "loaded": false})))).ok();
            }
            Err(e) => {
                self.handle.send(Envelope::error(Some(id), error_codes::INTERNAL, e.to_string())).ok();
            }
        }
    }

    async fn handle_delete(self: Arc<Self>, env: Envelope) {
        let Some((id, model)) = self.parse_model_ref(&env) else { return };
        match self.engine.delete(&model).await {
            Ok(()) => {
                self.handle.send(Envelope::with_id(id, types::MODEL_DELETE_OK, Some(json!({"model": model, "deleted": true})))).ok();
            }
            Err(e) => {
                self.handle.send(Envelope::error(Some(id), error_codes::INTERNAL, e.to_string())).ok();
            }
        }
    }

    /// Shared validation for `model.load` / `model.unload` / `model.delete`:
    /// all three require a non-empty `model` string. Replies with `bad_request`
    /// and returns `None` on any parse failure.
    fn parse_model_ref(self: &Arc<Self>, env: &Envelope) -> Option<(String, String)> {
        let id = Self::req_id(env);
        let req: ModelRef = match env.payload_as() {
            Ok(r) => r,
            Err(e) => {
                self.handle.send(Envelope::error(Some(id), error_codes::BAD_REQUEST, e.to_string())).ok();
                return None;
            }
        };

        if req.model.is_empty() {
            self.handle.send(Envelope::error(Some(id), error_codes::BAD_REQUEST, "model must not be empty")).ok();
            return None;
        }

        Some((id, req.model))
    }

    async fn handle_list(self: Arc<Self>, env: Envelope) {
        let id = Self::req_id(&env);
        match self.engine.list().await {
            Ok(mut result) => {
                result.cached.sort();
                result.loaded.sort();
                let payload = json!({"cached": result.cached, "loaded": result.loaded});
                self.handle.send(Envelope::with_id(id, types::MODEL_LIST_OK, Some(payload))).ok();
            }
            Err(e) => {
                self.handle.send(Envelope::error(Some(id), error_codes::INTERNAL, e.to_string())).ok();
            }
        }
    }

    /// Drives `request_id` through the engine's stream to completion,
    /// invoking `on_chunk` for each yielded piece. Shared by `inference.generate`
    /// (which discards `on_chunk`) and `inference.stream` (which emits a
    /// `token` event per chunk) — both go through the same engine call and
    /// the same cancel-flag bookkeeping (§4.4).
    async fn drive_stream(self: &Arc<Self>, request_id: String, req: GenerateRequest, mut on_chunk: impl FnMut(&str)) -> StreamRun {
        let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
        self.streams.insert(request_id.clone(), StreamState { cancel: cancel.clone() });

        let start = Instant::now();
        let mut rx = match self.engine.stream(request_id.clone(), req, cancel.clone()).await {
            Ok(rx) => rx,
            Err(e) => {
                self.streams.remove(&request_id);
                return StreamRun { text: String::new(), chunk_count: 0, cancelled: false, engine_error: Some(e), ttft_ms: 0, total_ms: 0, tokens_per_second: 0.0 };
            }
        };

        let mut text = String::new();
        let mut chunk_count = 0u32;
        let mut ttft_ms: Option<u64> = None;
        let mut engine_error = None;

        while let Some(item) = rx.recv().await {
            match item {
                Ok(chunk) => {
                    if ttft_ms.is_none() {
                        ttft_ms = Some(start.elapsed().as_millis() as u64);
                    }
                    on_chunk(&chunk);
                    text.push_str(&chunk);
                    chunk_count += 1;
                }
                Err(e) => {
                    engine_error = Some(e);
                    break;
                }
            }
        }

        let cancelled = cancel.load(Ordering::SeqCst);
        self.streams.remove(&request_id);

        let total_ms = start.elapsed().as_millis() as u64;
        let total_seconds = total_ms as f64 / 1000.0;
        let tokens_per_second = if total_seconds > 0.0 { chunk_count as f64 / total_seconds } else { 0.0 };

        StreamRun { text, chunk_count, cancelled, engine_error, ttft_ms: ttft_ms.unwrap_or(total_ms), total_ms, tokens_per_second }
    }

    async fn handle_generate(self: Arc<Self>, env: Envelope) {
        let id = Self::req_id(&env);
        let req: GenerateRequest = match env.payload_as() {
            Ok(r) => r,
            Err(e) => {
                self.handle.send(Envelope::error(Some(id), error_codes::BAD_REQUEST, e.to_string())).ok();
                return;
            }
        };

        let run = self.drive_stream(id.clone(), req, |_| {}).await;

        if let Some(e) = run.engine_error {
            self.handle.send(Envelope::error(Some(id), error_codes::INTERNAL, e.to_string())).ok();
            return;
        }

        let payload = json!({
            "requestId": id,
            "text": run.text,
            "usage": {"completionTokens": run.chunk_count},
            "timings": {"ttftMs": run.ttft_ms, "totalMs": run.total_ms, "tokensPerSecond": run.tokens_per_second},
        });
        self.handle.send(Envelope::with_id(id, types::INFERENCE_GENERATE_OK, Some(payload))).ok();
    }

    async fn handle_stream(self: Arc<Self>, env: Envelope) {
        let id = Self::req_id(&env);
        let req: GenerateRequest = match env.payload_as() {
            Ok(r) => r,
            Err(e) => {
                self.handle.send(Envelope::error(Some(id), error_codes::BAD_REQUEST, e.to_string())).ok();
                return;
            }
        };

        self.handle.send(Envelope::with_id(id.clone(), types::INFERENCE_STREAM_START, Some(json!({"requestId": id})))).ok();

        let handle = self.handle.clone();
        let token_id = id.clone();
        let run = self
            .drive_stream(id.clone(), req, move |chunk| {
                handle
                    .send(Envelope::with_id(token_id.clone(), types::INFERENCE_STREAM_TOKEN, Some(json!({"requestId": token_id, "text": chunk}))))
                    .ok();
            })
            .await;

        if run.cancelled {
            let payload = json!({"requestId": id, "code": error_codes::CANCELLED, "message": "Cancelled"});
            self.handle.send(Envelope::with_id(id, types::INFERENCE_STREAM_ERROR, Some(payload))).ok();
            return;
        }

        if let Some(e) = run.engine_error {
            let payload = json!({"requestId": id, "code": error_codes::STREAM_ERROR, "message": e.to_string()});
            self.handle.send(Envelope::with_id(id, types::INFERENCE_STREAM_ERROR, Some(payload))).ok();
            return;
        }

        let payload = json!({
            "requestId": id,
            "final": {
                "requestId": id,
                "text": run.text,
                "usage": {"completionTokens": run.chunk_count},
                "timings": {"ttftMs": run.ttft_ms, "totalMs": run.total_ms, "tokensPerSecond": run.tokens_per_second},
            },
        });
        self.handle.send(Envelope::with_id(id, types::INFERENCE_STREAM_END, Some(payload))).ok();
    }

    async fn handle_cancel(self: Arc<Self>, env: Envelope) {
        let id = Self::req_id(&env);
        let req: CancelPayload = match env.payload_as() {
            Ok(r) => r,
            Err(e) => {
                self.handle.send(Envelope::error(Some(id), error_codes::BAD_REQUEST, e.to_string())).ok();
                return;
            }
        };

        if let Some(state) = self.streams.get(&req.request_id) {
            state.cancel.store(true, Ordering::SeqCst);
        }
        // Signalled unconditionally even for an id with no live stream entry
        // (§9: `inference.cancel.ok` is intentionally permissive about unknown ids).
        self.engine.cancel(&req.request_id).await;

        let payload = json!({"requestId": req.request_id, "cancelled": true});
        self.handle.send(Envelope::with_id(id, types::INFERENCE_CANCEL_OK, Some(payload))).ok();
    }

    async fn handle_reset(self: Arc<Self>, env: Envelope) {
        let id = Self::req_id(&env);
        let req: ResetRequest = match env.payload_as() {
            Ok(r) => r,
            Err(e) => {
                self.handle.send(Envelope::error(Some(id), error_codes::BAD_REQUEST, e.to_string())).ok();
                return;
            }
        };

        match self.engine.reset(req.unload_all, req.clear_cache).await {
            Ok(()) => {
                self.handle.send(Envelope::with_id(id, types::RESET_OK, Some(json!({"ok": true})))).ok();
            }
            Err(e) => {
                self.handle.send(Envelope::error(Some(id), error_codes::INTERNAL, e.to_string())).ok();
            }
        }
    }
}

/// Spawn `method` bound to `(dispatcher, env)` as its own task. A free
/// function rather than a closure at each call site because async methods
/// taking `self: Arc<Self>` don't coerce to a uniform closure type inline.
fn spawn_on<E, F, Fut>(dispatcher: Arc<Dispatcher<E>>, env: Envelope, method: F)
where
    E: Engine + 'static,
    F: FnOnce(Arc<Dispatcher<E>>, Envelope) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(method(dispatcher, env));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection;
    use crate::engine::stub::StubEngine;
    use tokio::net::UnixStream;

    async fn harness(auth_token: Option<String>) -> (Arc<Dispatcher<StubEngine>>, tokio::sync::mpsc::UnboundedReceiver<Envelope>) {
        let (a, b) = UnixStream::pair().unwrap();
        let accepted_a = connection::spawn(a, 1, mlx_protocol::DEFAULT_MAX_FRAME_BYTES, 1024 * 1024);
        let accepted_b = connection::spawn(b, 2, mlx_protocol::DEFAULT_MAX_FRAME_BYTES, 1024 * 1024);
        drop(accepted_b.handle);

        let engine = Arc::new(StubEngine::new());
        let dispatcher = Dispatcher::new(engine, accepted_a.handle, auth_token);

        // Relay raw bytes from b's side back as envelopes the test can assert on.
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut inbound_b = accepted_b.inbound;
        tokio::spawn(async move {
            while let Some(env) = inbound_b.recv().await {
                let _ = tx.send(env);
            }
        });

        (dispatcher, rx)
    }

    #[tokio::test]
    async fn unknown_type_gets_error_and_connection_stays_open() {
        let (dispatcher, mut rx) = harness(None).await;
        dispatcher.dispatch(Envelope::with_id("u1", "nope", None));

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.kind, "error");
        let payload = reply.payload.unwrap();
        assert_eq!(payload["code"], "unknown_type");
        assert!(!dispatcher.handle.is_closed());
    }

    #[tokio::test]
    async fn handshake_with_wrong_token_closes_connection() {
        let (dispatcher, mut rx) = harness(Some("abc".into())).await;
        dispatcher.dispatch(Envelope::with_id("1", "handshake", Some(json!({"authToken": "xyz"}))));

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.kind, "error");
        assert_eq!(reply.payload.unwrap()["code"], "unauthorized");
        assert!(dispatcher.handle.is_closed());
    }

    #[tokio::test]
    async fn handshake_with_correct_token_authenticates() {
        let (dispatcher, mut rx) = harness(Some("abc".into())).await;
        dispatcher.dispatch(Envelope::with_id("1", "handshake", Some(json!({"authToken": "abc"}))));

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.kind, "handshake.ok");
        assert!(dispatcher.is_authenticated());
    }

    #[tokio::test]
    async fn model_list_before_any_load_is_empty() {
        let (dispatcher, mut rx) = harness(None).await;
        dispatcher.dispatch(Envelope::with_id("2", "model.list", None));

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.kind, "model.list.ok");
        let payload = reply.payload.unwrap();
        assert_eq!(payload["cached"], json!([]));
        assert_eq!(payload["loaded"], json!([]));
    }

    #[tokio::test]
    async fn stream_emits_start_tokens_then_end() {
        let (dispatcher, mut rx) = harness(None).await;
        let req = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}], "maxTokens": 16});
        dispatcher.dispatch(Envelope::with_id("s1", "inference.stream", Some(req)));

        let start = rx.recv().await.unwrap();
        assert_eq!(start.kind, "inference.stream.start");

        let mut text = String::new();
        loop {
            let env = rx.recv().await.unwrap();
            match env.kind.as_str() {
                "inference.stream.token" => text.push_str(env.payload.unwrap()["text"].as_str().unwrap()),
                "inference.stream.end" => {
                    assert_eq!(env.payload.unwrap()["final"]["text"], text);
                    break;
                }
                other => panic!("unexpected stream event: {other}"),
            }
        }
        assert_eq!(text, "hi");
    }

    #[tokio::test]
    async fn unauthenticated_non_handshake_is_rejected_and_closes() {
        let (dispatcher, mut rx) = harness(Some("abc".into())).await;
        dispatcher.dispatch(Envelope::with_id("2", "model.list", None));

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.payload.unwrap()["code"], "unauthorized");
        assert!(dispatcher.handle.is_closed());
    }

    #[test]
    fn constant_time_eq_matches_equal_only() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
