//! Client-side error type (§3 supplement).

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to connect to host socket: {0}")]
    Connect(std::io::Error),

    #[error("handshake failed: {code}: {message}")]
    Handshake { code: String, message: String },

    #[error("timed out waiting for the host to become reachable")]
    Timeout,

    #[error("connection closed")]
    TransportClosed,

    #[error("{code}: {message}")]
    Protocol { code: String, message: String },

    #[error("failed to spawn host child process: {0}")]
    ChildSpawn(std::io::Error),
}
