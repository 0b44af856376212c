//! Per-connection I/O (§4.3): a read loop feeding the frame decoder, and a
//! dedicated writer task draining a single queue so concurrent `send` calls
//! can never interleave bytes of distinct frames.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use mlx_protocol::{encode_envelope, Envelope, FrameDecoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc};

const READ_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug)]
pub enum SendError {
    Backpressure,
    Closed,
}

/// Cheaply cloneable reference to a connection's write side and lifecycle
/// flag — this is what the dispatcher holds to reply and to close on auth
/// failure or backpressure.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    tx: mpsc::UnboundedSender<Envelope>,
    queued_bytes: Arc<AtomicU64>,
    max_queued_bytes: u64,
    closed: Arc<AtomicBool>,
    /// Fired once by `close()` to cancel `read_loop`/`write_loop` even while
    /// one is blocked inside a socket `.await`, matching the shutdown-signal
    /// shape `call_server.rs` races via `tokio::select!` (generalized to
    /// `broadcast` since both tasks must observe the same signal).
    shutdown_tx: broadcast::Sender<()>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Non-blocking enqueue (§4.3 `send`). Closes the connection and
    /// returns `Backpressure` once the queued-bytes cap is exceeded, rather
    /// than letting the write queue grow without bound.
    pub fn send(&self, env: Envelope) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }

        let body_len = serde_json::to_vec(&env).map(|b| b.len() as u64).unwrap_or(0);
        let queued = self.queued_bytes.fetch_add(body_len, Ordering::SeqCst) + body_len;
        if queued > self.max_queued_bytes {
            tracing::warn!(conn = self.id, queued, cap = self.max_queued_bytes, "write queue cap exceeded");
            self.close();
            return Err(SendError::Backpressure);
        }

        self.tx.send(env).map_err(|_| SendError::Closed)
    }

    /// Idempotent (§4.3 `close`). Broadcasting the shutdown signal wakes
    /// `read_loop` out of a blocked `read_half.read().await` so the fd is
    /// actually released instead of surviving until the peer happens to
    /// send more bytes.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
    }
}

pub struct AcceptedConnection {
    pub handle: ConnectionHandle,
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
}

/// Split `stream` into a read loop and a writer task; return a handle for
/// sending plus a channel of envelopes decoded off the wire.
pub fn spawn(stream: UnixStream, id: u64, max_frame_bytes: u32, max_queued_bytes: u64) -> AcceptedConnection {
    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Envelope>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Envelope>();

    let queued_bytes = Arc::new(AtomicU64::new(0));
    let closed = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let handle = ConnectionHandle {
        id,
        tx: out_tx,
        queued_bytes: queued_bytes.clone(),
        max_queued_bytes,
        closed: closed.clone(),
        shutdown_tx: shutdown_tx.clone(),
    };

    tokio::spawn(write_loop(write_half, out_rx, queued_bytes, closed.clone(), shutdown_tx.subscribe()));
    tokio::spawn(read_loop(read_half, in_tx, max_frame_bytes, closed, shutdown_tx.subscribe()));

    AcceptedConnection { handle, inbound: in_rx }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    queued_bytes: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
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
                tracing::warn!(error = %e, "failed to encode outgoing envelope, dropping it");
                continue;
            }
        };

        let body_len = frame.len().saturating_sub(4) as u64;
        let prev = queued_bytes.load(Ordering::SeqCst);
        queued_bytes.store(prev.saturating_sub(body_len), Ordering::SeqCst);

        if let Err(e) = write_half.write_all(&frame).await {
            tracing::debug!(error = %e, "write failed, closing connection");
            break;
        }
    }

    closed.store(true, Ordering::SeqCst);
    let _ = write_half.shutdown().await;
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    tx: mpsc::UnboundedSender<Envelope>,
    max_frame_bytes: u32,
    closed: Arc<AtomicBool>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut decoder = FrameDecoder::new(max_frame_bytes);
    let mut buf = [0u8; READ_CHUNK_BYTES];

    'outer: loop {
        let n = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break 'outer,
            result = read_half.read(&mut buf) => match result {
                Ok(0) => break 'outer,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(error = %e, "read failed, closing connection");
                    break 'outer;
                }
            },
        };

        decoder.feed(&buf[..n]);

        loop {
            match decoder.decode_next() {
                Ok(Some(env)) => {
                    if tx.send(env).is_err() {
                        closed.store(true, Ordering::SeqCst);
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "fatal frame error, closing connection");
                    closed.store(true, Ordering::SeqCst);
                    return;
                }
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
}
