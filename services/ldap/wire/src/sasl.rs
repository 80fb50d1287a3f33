//! SASL security-layer buffer framing.
//!
//! Once a SASL mechanism negotiates integrity or confidentiality, every
//! chunk of wrapped bytes travels as a 4-byte big-endian length followed by
//! the wrapped data, in both directions.

use crate::error::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Default maximum size of one wrapped SASL buffer (16 MiB)
pub const DEFAULT_MAX_SASL_BUFFER: usize = 16 * 1024 * 1024;

/// Prefix wrapped bytes with their length
pub fn encode_sasl_buffer(wrapped: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + wrapped.len());
    buf.put_u32(wrapped.len() as u32);
    buf.put_slice(wrapped);
    buf.freeze()
}

/// Decoder for length-prefixed SASL buffers
#[derive(Debug)]
pub struct SaslBufferDecoder {
    max_buffer_size: usize,
}

impl SaslBufferDecoder {
    /// Create a decoder with the default size limit
    pub fn new() -> Self {
        Self {
            max_buffer_size: DEFAULT_MAX_SASL_BUFFER,
        }
    }

    /// Decode one wrapped buffer, without its length prefix
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        // Need at least 4 bytes for the length
        if buf.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > self.max_buffer_size {
            return Err(WireError::Size(len));
        }

        if buf.len() < 4 + len {
            return Ok(None);
        }

        buf.advance(4);
        Ok(Some(buf.split_to(len).freeze()))
    }
}

impl Default for SaslBufferDecoder {
    fn default() -> Self {
        Self::new()
    }
}
