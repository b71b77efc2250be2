//! Length-prefixed record framing for the operator event stream.
//!
//! The stream is a sequence of `<decimal length>\n<payload>` frames where
//! the payload is a JSON object of exactly that many bytes. The decoder is
//! incremental: feed it arbitrary byte chunks and drain complete frames.

use bytes::{Buf, BytesMut};
use serde_json::Value;

use crate::error::SyncError;

/// Longest size prefix we accept before the terminating newline. A decimal
/// length wider than this is not a plausible frame.
const MAX_PREFIX_LEN: usize = 12;

/// Incremental decoder for the framed JSON record stream.
///
/// Fatal errors leave the decoder in an unspecified state; the caller is
/// expected to drop it and reset the connection.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    expected: Option<usize>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of stream bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Decode the next complete frame, if one is fully buffered.
    pub fn next(&mut self) -> Result<Option<Value>, SyncError> {
        if self.expected.is_none() {
            match self.buf.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    let size = parse_size(&self.buf[..pos])?;
                    self.buf.advance(pos + 1);
                    self.expected = Some(size);
                }
                None if self.buf.len() > MAX_PREFIX_LEN => {
                    return Err(SyncError::BadFrame(format!(
                        "no size prefix in first {} bytes",
                        self.buf.len()
                    )));
                }
                None => return Ok(None),
            }
        }

        let Some(size) = self.expected else {
            return Ok(None);
        };
        if self.buf.len() < size {
            return Ok(None);
        }

        let payload = self.buf.split_to(size);
        self.expected = None;
        let value: Value = serde_json::from_slice(&payload)?;
        if !value.is_object() {
            return Err(SyncError::BadFrame("payload is not a JSON object".into()));
        }
        Ok(Some(value))
    }
}

fn parse_size(prefix: &[u8]) -> Result<usize, SyncError> {
    let text = std::str::from_utf8(prefix)
        .map_err(|_| SyncError::BadFrame("size prefix is not ASCII".into()))?;
    text.parse::<usize>()
        .map_err(|_| SyncError::BadFrame(format!("size prefix {text:?} is not a decimal length")))
}

/// Encode a value as a single frame. Used by tests and tooling.
pub fn encode_frame(value: &Value) -> Vec<u8> {
    let payload = serde_json::to_vec(value).expect("JSON value serializes");
    let mut out = format!("{}\n", payload.len()).into_bytes();
    out.extend_from_slice(&payload);
    out
}
