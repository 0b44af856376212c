//! The consumer-facing streaming handle (§4.7 `stream`).

use mlx_protocol::messages::StreamEvent;
use tokio::sync::mpsc;

use crate::connection::ClientConnection;
use crate::error::Error;

/// Bound on buffered-but-undelivered stream events before the client
/// applies back-pressure to its own socket read (§5). A real client would
/// size this from `ClientConfig`; fixed here since no config knob for it is
/// in scope (§4.7 describes a per-stream cap but leaves sizing open).
pub const DEFAULT_STREAM_QUEUE_CAPACITY: usize = 256;

/// A consumable sequence of [`StreamEvent`]s for one `inference.stream`
/// request. Yields events in arrival order (Start, then zero or more
/// Token, then exactly one End or Error).
pub struct StreamHandle {
    request_id: String,
    rx: mpsc::Receiver<StreamEvent>,
    conn: ClientConnection,
}

impl StreamHandle {
    pub(crate) fn new(request_id: String, rx: mpsc::Receiver<StreamEvent>, conn: ClientConnection) -> Self {
        Self { request_id, rx, conn }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Await the next event. Returns `None` once the terminal event has
    /// already been delivered and the subscription removed — callers
    /// should stop polling after that, not treat it as a transport error.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Issue `inference.cancel` for this stream's request id (§4.7
    /// `cancel`). Resolves once the host acknowledges; the terminal event
    /// still has to be drained from this handle separately.
    pub async fn cancel(&self) -> Result<(), Error> {
        self.conn.cancel(&self.request_id).await
    }
}
