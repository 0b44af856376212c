//! Wire `type` strings for the message catalogue (§6). Centralized so the
//! host dispatcher and the client demultiplexer never drift apart on a typo.

pub const HANDSHAKE: &str = "handshake";
pub const HANDSHAKE_OK: &str = "handshake.ok";

pub const MODEL_DOWNLOAD: &str = "model.download";
pub const MODEL_DOWNLOAD_OK: &str = "model.download.ok";
pub const MODEL_LOAD: &str = "model.load";
pub const MODEL_LOAD_OK: &str = "model.load.ok";
pub const MODEL_UNLOAD: &str = "model.unload";
pub const MODEL_UNLOAD_OK: &str = "model.unload.ok";
pub const MODEL_DELETE: &str = "model.delete";
pub const MODEL_DELETE_OK: &str = "model.delete.ok";
pub const MODEL_LIST: &str = "model.list";
pub const MODEL_LIST_OK: &str = "model.list.ok";

pub const INFERENCE_GENERATE: &str = "inference.generate";
pub const INFERENCE_GENERATE_OK: &str = "inference.generate.ok";

pub const INFERENCE_STREAM: &str = "inference.stream";
pub const INFERENCE_STREAM_START: &str = "inference.stream.start";
pub const INFERENCE_STREAM_TOKEN: &str = "inference.stream.token";
pub const INFERENCE_STREAM_END: &str = "inference.stream.end";
pub const INFERENCE_STREAM_ERROR: &str = "inference.stream.error";
/// Prefix shared by every stream event `type` — the client demultiplexer
/// routes on this prefix per §4.6.
pub const INFERENCE_STREAM_PREFIX: &str = "inference.stream.";

pub const INFERENCE_CANCEL: &str = "inference.cancel";
pub const INFERENCE_CANCEL_OK: &str = "inference.cancel.ok";

pub const RESET: &str = "reset";
pub const RESET_OK: &str = "reset.ok";

pub const ERROR: &str = "error";
