//! Wire protocol for the mlx host/client RPC substrate.
//!
//! A message is a frame: `uint32 big-endian length || JSON body`. The body
//! is always a single JSON object `{id?, type, payload?}` — an [`Envelope`].
//! This crate is pure: encode/decode over byte buffers, no I/O, no async.

pub mod envelope;
pub mod error_codes;
pub mod frame;
pub mod messages;
pub mod types;

pub use envelope::Envelope;
pub use frame::{decode_envelope, encode_envelope, FrameDecoder, DEFAULT_MAX_FRAME_BYTES};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("json encode/decode failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: u64, max: u32 },
}
