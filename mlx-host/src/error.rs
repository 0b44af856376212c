//! Host-side error type.
//!
//! Most failures never reach here — the dispatcher converts them into an
//! `error`/`inference.stream.error` envelope and keeps the connection open
//! (§7). This type only covers failures with no peer left to report to:
//! listener setup, and I/O on a connection that has already gone away.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to bind socket at {path}: {source}")]
    Bind { path: String, #[source] source: std::io::Error },

    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}
