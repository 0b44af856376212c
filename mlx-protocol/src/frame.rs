//! Length-prefixed JSON framing: `uint32 big-endian length || UTF-8 JSON body`.
//!
//! The length prefix is authoritative — frame alignment is never lost even
//! when a malformed body is dropped, because the decoder always knows
//! exactly how many bytes the current frame consumes.

use serde::de::Error as _;

use crate::{Envelope, Error};

/// Recommended oversize-frame cutoff (§4.1). A connection that sends a
/// frame larger than this is fatally misbehaving — either a bug or an
/// attempt to exhaust host memory — and the connection is closed.
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

const LENGTH_PREFIX_BYTES: usize = 4;

/// Encode a single envelope as a complete frame ready to write to the wire.
pub fn encode_envelope(env: &Envelope) -> Result<Vec<u8>, Error> {
    let body = serde_json::to_vec(env)?;
    let len: u32 = body.len().try_into().map_err(|_| Error::FrameTooLarge {
        len: body.len() as u64,
        max: u32::MAX,
    })?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode exactly one frame's worth of envelope from `buf`, assuming `buf`
/// holds precisely one complete frame (no trailing bytes). Mostly useful in
/// tests and for one-shot protocols; streaming readers should use
/// [`FrameDecoder`] instead.
pub fn decode_envelope(buf: &[u8]) -> Result<Envelope, Error> {
    let mut dec = FrameDecoder::new(u32::MAX);
    dec.feed(buf);
    match dec.decode_next()? {
        Some(env) => Ok(env),
        None => Err(Error::Json(serde_json::Error::custom("incomplete frame"))),
    }
}

/// Incremental frame decoder over a growing byte buffer.
///
/// Feed it bytes as they arrive (in any chunking — one byte at a time or
/// the whole socket buffer at once; the result is identical) and drain
/// fully-decoded envelopes with [`FrameDecoder::decode_next`].
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_bytes: u32,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: u32) -> Self {
        Self { buf: Vec::new(), max_frame_bytes }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes currently buffered but not yet decoded into an
    /// envelope — used by callers that want to cap unread-but-buffered
    /// data independently of the per-frame size limit.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Try to decode the next envelope out of the buffer.
    ///
    /// Returns `Ok(None)` when fewer bytes are buffered than the current
    /// frame needs (wait for more to arrive). Skips and logs malformed
    /// JSON bodies without losing frame alignment, since the length prefix
    /// tells us exactly how many bytes to discard. Returns `Err` — fatal to
    /// the connection — only when a length prefix exceeds the configured
    /// maximum.
    pub fn decode_next(&mut self) -> Result<Option<Envelope>, Error> {
        loop {
            if self.buf.len() < LENGTH_PREFIX_BYTES {
                return Ok(None);
            }
            let len = u32::from_be_bytes(self.buf[..LENGTH_PREFIX_BYTES].try_into().unwrap());
            if len > self.max_frame_bytes {
                return Err(Error::FrameTooLarge { len: len as u64, max: self.max_frame_bytes });
            }

            let total = LENGTH_PREFIX_BYTES + len as usize;
            if self.buf.len() < total {
                return Ok(None);
            }

            let body = self.buf.drain(..total).skip(LENGTH_PREFIX_BYTES).collect::<Vec<u8>>();
            match serde_json::from_slice::<Envelope>(&body) {
                Ok(env) => return Ok(Some(env)),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed frame body, staying frame-aligned");
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Envelope {
        Envelope::with_id("abc", "model.list", Some(json!({"cached": []})))
    }

    #[test]
    fn round_trip() {
        let env = sample();
        let frame = encode_envelope(&env).unwrap();
        let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME_BYTES);
        dec.feed(&frame);
        let decoded = dec.decode_next().unwrap().unwrap();
        assert_eq!(env, decoded);
        assert_eq!(dec.decode_next().unwrap(), None);
    }

    #[test]
    fn incomplete_buffer_yields_nothing() {
        let env = sample();
        let frame = encode_envelope(&env).unwrap();
        let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME_BYTES);
        dec.feed(&frame[..frame.len() - 1]);
        assert_eq!(dec.decode_next().unwrap(), None);
        dec.feed(&frame[frame.len() - 1..]);
        assert_eq!(dec.decode_next().unwrap(), Some(env));
    }

    #[test]
    fn split_byte_by_byte_matches_single_feed() {
        let envs = vec![
            Envelope::new("a", None),
            Envelope::with_id("2", "b", Some(json!({"x": 1}))),
            Envelope::new("c", Some(json!([1, 2, 3]))),
        ];
        let mut all_bytes = Vec::new();
        for e in &envs {
            all_bytes.extend(encode_envelope(e).unwrap());
        }

        // Whole buffer at once.
        let mut dec_whole = FrameDecoder::new(DEFAULT_MAX_FRAME_BYTES);
        dec_whole.feed(&all_bytes);
        let mut whole_out = Vec::new();
        while let Some(e) = dec_whole.decode_next().unwrap() {
            whole_out.push(e);
        }

        // One byte at a time.
        let mut dec_split = FrameDecoder::new(DEFAULT_MAX_FRAME_BYTES);
        let mut split_out = Vec::new();
        for b in &all_bytes {
            dec_split.feed(std::slice::from_ref(b));
            while let Some(e) = dec_split.decode_next().unwrap() {
                split_out.push(e);
            }
        }

        assert_eq!(whole_out, envs);
        assert_eq!(split_out, envs);
    }

    #[test]
    fn oversize_frame_is_fatal() {
        let mut dec = FrameDecoder::new(16);
        dec.feed(&100u32.to_be_bytes());
        let err = dec.decode_next().unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { len: 100, max: 16 }));
    }

    #[test]
    fn malformed_json_is_skipped_and_stays_aligned() {
        let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME_BYTES);
        let bad_body = b"not json";
        dec.feed(&(bad_body.len() as u32).to_be_bytes());
        dec.feed(bad_body);

        let good = sample();
        dec.feed(&encode_envelope(&good).unwrap());

        // The malformed frame is silently skipped; the next valid frame
        // still decodes correctly and buffer alignment was preserved.
        assert_eq!(dec.decode_next().unwrap(), Some(good));
    }
}
