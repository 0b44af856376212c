//! Open-ended error code strings (§6, §7). New codes may be added by either
//! side without a protocol version bump — clients match on the string, not
//! an exhaustive enum.

pub const UNAUTHORIZED: &str = "unauthorized";
pub const UNKNOWN_TYPE: &str = "unknown_type";
pub const BAD_REQUEST: &str = "bad_request";
pub const INTERNAL: &str = "internal";
pub const CANCELLED: &str = "cancelled";
pub const BACKPRESSURE: &str = "backpressure";
pub const TRANSPORT_CLOSED: &str = "transport_closed";
pub const STREAM_ERROR: &str = "stream_error";
