//! Client half of the mlx RPC substrate: supervises an optional host child,
//! opens the local socket with bounded retry, and demultiplexes replies
//! into one-shot requests and streaming subscriptions.

pub mod config;
pub mod connection;
pub mod error;
pub mod request;

pub use config::ClientConfig;
pub use connection::ClientConnection;
pub use error::Error;
pub use mlx_protocol::messages::StreamEvent;
pub use request::StreamHandle;
