//! Length-prefixed message framing and status trailers.
//!
//! Every message on the wire is a 1-byte compression flag, a 4-byte
//! big-endian length and the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderValue};
use tonic::Status;

/// Size of the per-message prefix.
pub const HEADER_LEN: usize = 5;

/// Default limit for a single decoded message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

pub const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// Prefix `message` with an uncompressed frame header.
///
/// Messages larger than `max_message_size`, or too large for the 4-byte
/// length prefix, fail with `RESOURCE_EXHAUSTED`.
pub fn encode(message: &[u8], max_message_size: usize) -> Result<Bytes, Status> {
    let len = u32::try_from(message.len())
        .ok()
        .filter(|_| message.len() <= max_message_size)
        .ok_or_else(|| {
            Status::resource_exhausted(format!(
                "reply of {} bytes exceeds limit of {max_message_size} bytes",
                message.len()
            ))
        })?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + message.len());
    buf.put_u8(0);
    buf.put_u32(len);
    buf.put_slice(message);
    Ok(buf.freeze())
}

/// Frame a test message under the default limit.
#[cfg(test)]
pub(crate) fn frame(message: &[u8]) -> Bytes {
    encode(message, DEFAULT_MAX_MESSAGE_SIZE).unwrap()
}

/// Incremental decoder for a request body.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_message_size: usize,
}

impl FrameDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_message_size,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete message, if one is buffered.
    pub fn decode(&mut self) -> Result<Option<Bytes>, Status> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let compressed = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;

        if compressed != 0 {
            return Err(Status::unimplemented("compressed messages are not supported"));
        }
        if len > self.max_message_size {
            return Err(Status::resource_exhausted(format!(
                "message of {len} bytes exceeds limit of {} bytes",
                self.max_message_size
            )));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Whether a partial message is left over.
    pub fn has_remaining(&self) -> bool {
        !self.buf.is_empty()
    }
}

/// `grpc-status` / `grpc-message` trailers for `status`.
pub fn trailers(status: &Status) -> HeaderMap {
    let mut map = HeaderMap::new();
    if status.add_header(&mut map).is_err() {
        map.clear();
        map.insert("grpc-status", HeaderValue::from(tonic::Code::Internal as i32));
    }
    map
}

/// Whether `value` is a gRPC content type (`application/grpc`, `application/grpc+proto`, ...).
pub fn is_grpc_content_type(value: Option<&HeaderValue>) -> bool {
    let Some(value) = value.and_then(|v| v.to_str().ok()) else {
        return false;
    };
    match value.strip_prefix(GRPC_CONTENT_TYPE) {
        Some(rest) => rest.is_empty() || rest.starts_with('+') || rest.starts_with(';'),
        None => false,
    }
}
