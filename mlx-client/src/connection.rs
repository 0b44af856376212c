//! Client connection manager (§4.6): supervises an optional spawned host
//! child, opens the socket with bounded retry, performs the handshake, and
//! demultiplexes replies into the pending-request and stream-subscription
//! tables.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use mlx_protocol::messages::StreamEvent;
use mlx_protocol::{encode_envelope, error_codes, types, Envelope, FrameDecoder, DEFAULT_MAX_FRAME_BYTES};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::{ClientConfig, Device};
use crate::error::Error;
use crate::request::{StreamHandle, DEFAULT_STREAM_QUEUE_CAPACITY};

const READ_CHUNK_BYTES: usize = 64 * 1024;

struct Inner {
    write_tx: mpsc::UnboundedSender<Envelope>,
    pending: DashMap<String, oneshot::Sender<Result<Value, Error>>>,
    streams: DashMap<String, mpsc::Sender<StreamEvent>>,
    closed: Arc<AtomicBool>,
    child: parking_lot::Mutex<Option<Child>>,
    /// Fired once by `close()` to cancel `read_loop`/`write_loop` even while
    /// they're blocked inside a socket `.await` (§4.6 `close` tears down the
    /// socket, not just the tables) — same shutdown-signal shape as
    /// `call_server.rs`'s `shutdown_tx`/`shutdown_rx` pair, generalized to
    /// `broadcast` since two independent tasks must both observe it.
    shutdown_tx: broadcast::Sender<()>,
}

/// A cheaply cloneable handle onto one client connection (§3 Ownership
/// summary: the connection owns both tables and the child-process handle;
/// clones just share that ownership).
#[derive(Clone)]
pub struct ClientConnection {
    inner: Arc<Inner>,
}

impl ClientConnection {
    /// Drive the full lifecycle: `new -> connecting -> ready` (§4.6).
    pub async fn connect(mut config: ClientConfig) -> Result<Self, Error> {
        let socket_path = config.resolved_socket_path();
        let spawned_child = config.host_binary.is_some();

        let child = match &config.host_binary {
            Some(host_binary) => {
                if config.auth_token.is_none() {
                    config.auth_token = Some(generate_auth_token());
                }

                let mut cmd = Command::new(host_binary);
                cmd.arg("--socket").arg(&socket_path);
                cmd.env("SOCKET_PATH", &socket_path);
                if let Some(token) = &config.auth_token {
                    cmd.env("AUTH_TOKEN", token);
                }
                if let Some(device) = config.device {
                    cmd.env("DEVICE", match device { Device::Cpu => "cpu", Device::Gpu => "gpu" });
                }

                Some(cmd.spawn().map_err(Error::ChildSpawn)?)
            }
            None => None,
        };

        let stream = match Self::connect_socket(&socket_path, spawned_child, config.connect_timeout(), config.retry_interval()).await {
            Ok(stream) => stream,
            Err(e) => {
                if let Some(mut child) = child {
                    let _ = child.start_kill();
                }
                return Err(e);
            }
        };

        let conn = Self::from_stream(stream, child);

        if config.auth_token.is_some() {
            let payload = serde_json::json!({"authToken": config.auth_token});
            if let Err(e) = conn.request(types::HANDSHAKE, Some(payload)).await {
                conn.close();
                return Err(match e {
                    Error::Protocol { code, message } => Error::Handshake { code, message },
                    other => other,
                });
            }
        }

        Ok(conn)
    }

    async fn connect_socket(
        path: &std::path::Path,
        retry_on_not_ready: bool,
        timeout: std::time::Duration,
        interval: std::time::Duration,
    ) -> Result<UnixStream, Error> {
        if !retry_on_not_ready {
            return UnixStream::connect(path).await.map_err(Error::Connect);
        }

        let deadline = Instant::now() + timeout;
        loop {
            match UnixStream::connect(path).await {
                Ok(stream) => return Ok(stream),
                Err(e) if matches!(e.kind(), std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    tokio::time::sleep(interval).await;
                }
                Err(e) => return Err(Error::Connect(e)),
            }
        }
    }

    fn from_stream(stream: UnixStream, child: Option<Child>) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel::<Envelope>();
        let closed = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let inner = Arc::new(Inner {
            write_tx,
            pending: DashMap::new(),
            streams: DashMap::new(),
            closed: closed.clone(),
            child: parking_lot::Mutex::new(child),
            shutdown_tx: shutdown_tx.clone(),
        });

        tokio::spawn(write_loop(write_half, write_rx, shutdown_tx.subscribe()));
        tokio::spawn(read_loop(read_half, inner.clone(), closed, shutdown_tx.subscribe()));

        Self { inner }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Idempotent: tears down the socket and, if we spawned it, the host
    /// child (§4.6 `close`). The shutdown broadcast wakes `read_loop` and
    /// `write_loop` out of a blocked socket `.await` so both halves are
    /// actually dropped instead of leaking the fd for the rest of the
    /// process.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        reject_all_pending(&self.inner);
        terminate_all_streams(&self.inner);
        let _ = self.inner.shutdown_tx.send(());
        if let Some(child) = self.inner.child.lock().as_mut() {
            let _ = child.start_kill();
        }
    }

    /// One-shot request/response over the pending table (§4.7 `request`).
    pub async fn request(&self, kind: &str, payload: Option<Value>) -> Result<Value, Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id.clone(), tx);

        let env = Envelope::with_id(id.clone(), kind, payload);
        if self.inner.write_tx.send(env).is_err() {
            self.inner.pending.remove(&id);
            return Err(Error::TransportClosed);
        }

        rx.await.unwrap_or(Err(Error::TransportClosed))
    }

    /// Register a stream subscription and send the `inference.stream`
    /// request (§4.7 `stream`).
    pub async fn stream(&self, payload: Value, request_id: Option<String>) -> Result<StreamHandle, Error> {
        let id = request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (tx, rx) = mpsc::channel(DEFAULT_STREAM_QUEUE_CAPACITY);
        self.inner.streams.insert(id.clone(), tx);

        let env = Envelope::with_id(id.clone(), types::INFERENCE_STREAM, Some(payload));
        if self.inner.write_tx.send(env).is_err() {
            self.inner.streams.remove(&id);
            return Err(Error::TransportClosed);
        }

        Ok(StreamHandle::new(id, rx, self.clone()))
    }

    /// `inference.cancel` (§4.7 `cancel`): resolves once the host
    /// acknowledges, not once the stream's terminal event arrives.
    pub async fn cancel(&self, request_id: &str) -> Result<(), Error> {
        self.request(types::INFERENCE_CANCEL, Some(serde_json::json!({"requestId": request_id}))).await?;
        Ok(())
    }
}

fn generate_auth_token() -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(32).map(char::from).collect()
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Envelope>, mut shutdown_rx: broadcast::Receiver<()>) {
    loop {
        let env = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            maybe_env = rx.recv() => match maybe_env {
                Some(env) => env,
                None => break,
            },
        };

        let frame = match encode_envelope(&env) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode outgoing envelope");
                continue;
            }
        };
        if let Err(e) = write_half.write_all(&frame).await {
            tracing::debug!(error = %e, "client write failed, closing");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

async fn read_loop(mut read_half: OwnedReadHalf, inner: Arc<Inner>, closed: Arc<AtomicBool>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_BYTES);
    let mut buf = [0u8; READ_CHUNK_BYTES];

    'outer: loop {
        let n = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break 'outer,
            result = read_half.read(&mut buf) => match result {
                Ok(0) => break 'outer,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(error = %e, "client read failed, closing");
                    break 'outer;
                }
            },
        };
        decoder.feed(&buf[..n]);

        loop {
            match decoder.decode_next() {
                Ok(Some(env)) => demux(&inner, env).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "fatal frame error on client connection");
                    closed.store(true, Ordering::SeqCst);
                    reject_all_pending(&inner);
                    terminate_all_streams(&inner);
                    return;
                }
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    reject_all_pending(&inner);
    terminate_all_streams(&inner);
}

/// Route one decoded envelope to the stream table or the pending table
/// (§4.6 incoming-message demultiplexing).
async fn demux(inner: &Arc<Inner>, env: Envelope) {
    if env.kind.starts_with(types::INFERENCE_STREAM_PREFIX) {
        demux_stream_event(inner, env).await;
        return;
    }

    let Some(id) = env.id.clone() else { return };
    let Some((_, tx)) = inner.pending.remove(&id) else { return };

    if env.kind == types::ERROR {
        let payload = env.payload.unwrap_or_default();
        let code = payload.get("code").and_then(Value::as_str).unwrap_or(error_codes::INTERNAL).to_string();
        let message = payload.get("message").and_then(Value::as_str).unwrap_or_default().to_string();
        let _ = tx.send(Err(Error::Protocol { code, message }));
    } else {
        let _ = tx.send(Ok(env.payload.unwrap_or_default()));
    }
}

async fn demux_stream_event(inner: &Arc<Inner>, env: Envelope) {
    let payload = env.payload.clone().unwrap_or_default();
    let request_id = env.id.clone().or_else(|| payload.get("requestId").and_then(Value::as_str).map(str::to_string));
    let Some(request_id) = request_id else { return };

    let event = match env.kind.as_str() {
        k if k == types::INFERENCE_STREAM_START => StreamEvent::Start { request_id: request_id.clone() },
        k if k == types::INFERENCE_STREAM_TOKEN => {
            let text = payload.get("text").and_then(Value::as_str).unwrap_or_default().to_string();
            StreamEvent::Token { request_id: request_id.clone(), text }
        }
        k if k == types::INFERENCE_STREAM_END => {
            let final_response = match serde_json::from_value(payload.get("final").cloned().unwrap_or_default()) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "malformed final response in stream.end, dropping event");
                    return;
                }
            };
            StreamEvent::End { request_id: request_id.clone(), final_response }
        }
        k if k == types::INFERENCE_STREAM_ERROR => {
            let code = payload.get("code").and_then(Value::as_str).unwrap_or(error_codes::STREAM_ERROR).to_string();
            let message = payload.get("message").and_then(Value::as_str).unwrap_or_default().to_string();
            StreamEvent::Error { request_id: request_id.clone(), code, message }
        }
        other => {
            tracing::warn!(kind = other, "unrecognized stream event type");
            return;
        }
    };

    let terminal = event.is_terminal();
    let sender = if terminal { inner.streams.remove(&request_id).map(|(_, tx)| tx) } else { inner.streams.get(&request_id).map(|e| e.value().clone()) };

    // Blocking send applies real back-pressure to the socket read (§4.7):
    // a slow consumer stalls this connection's read_loop rather than
    // silently dropping tokens or the terminal End/Error event.
    if let Some(tx) = sender {
        let _ = tx.send(event).await;
    }
}

fn reject_all_pending(inner: &Arc<Inner>) {
    let ids: Vec<String> = inner.pending.iter().map(|e| e.key().clone()).collect();
    for id in ids {
        if let Some((_, tx)) = inner.pending.remove(&id) {
            let _ = tx.send(Err(Error::TransportClosed));
        }
    }
}

fn terminate_all_streams(inner: &Arc<Inner>) {
    let ids: Vec<String> = inner.streams.iter().map(|e| e.key().clone()).collect();
    for id in ids {
        if let Some((_, tx)) = inner.streams.remove(&id) {
            let _ = tx.try_send(StreamEvent::Error {
                request_id: id,
                code: error_codes::TRANSPORT_CLOSED.to_string(),
                message: "Connection closed".to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_protocol::decode_envelope;

    async fn fake_pair() -> (ClientConnection, UnixStream) {
        let (client_side, host_side) = UnixStream::pair().unwrap();
        let conn = ClientConnection::from_stream(client_side, None);
        (conn, host_side)
    }

    #[tokio::test]
    async fn request_round_trips_with_a_simulated_host_reply() {
        let (conn, mut host) = fake_pair().await;

        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; 256];
            let n = host.read(&mut buf).await.unwrap();
            let req = decode_envelope(&buf[..n]).unwrap();
            let reply = Envelope::with_id(req.id.unwrap(), "model.list.ok", Some(serde_json::json!({"cached": [], "loaded": []})));
            host.write_all(&encode_envelope(&reply).unwrap()).await.unwrap();
        });

        let payload = conn.request("model.list", None).await.unwrap();
        assert_eq!(payload["cached"], serde_json::json!([]));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn error_reply_is_surfaced_as_protocol_error() {
        let (conn, mut host) = fake_pair().await;

        tokio::spawn(async move {
            let mut buf = vec![0u8; 256];
            let n = host.read(&mut buf).await.unwrap();
            let req = decode_envelope(&buf[..n]).unwrap();
            let reply = Envelope::error(req.id, "unknown_type", "Unknown message type: nope");
            host.write_all(&encode_envelope(&reply).unwrap()).await.unwrap();
        });

        let err = conn.request("nope", None).await.unwrap_err();
        assert!(matches!(err, Error::Protocol { code, .. } if code == "unknown_type"));
    }

    #[tokio::test]
    async fn dropped_host_socket_rejects_pending_requests() {
        let (conn, host) = fake_pair().await;
        drop(host);

        let err = conn.request("model.list", None).await.unwrap_err();
        assert!(matches!(err, Error::TransportClosed));
    }
}
