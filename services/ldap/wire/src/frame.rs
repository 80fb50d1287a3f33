//! Frame decoder for the LDAP byte stream.
//!
//! Every LDAPMessage is a BER SEQUENCE with a definite length, so frame
//! boundaries are found from the tag and length header alone, without
//! looking at the message body.

use crate::ber::{peek_length, tag};
use crate::error::WireError;
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

/// Maximum frame size (16 MiB default)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
/// Hard maximum frame size limit (64 MiB)
pub const HARD_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Slices complete LDAPMessage frames off an appendable buffer
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a decoder with a custom frame size limit, capped at
    /// [`HARD_MAX_FRAME_SIZE`]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(HARD_MAX_FRAME_SIZE),
        }
    }

    /// Decode one frame from a buffer.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when the frame is not
    /// complete yet, including when its length field cannot be decoded. A
    /// leading tag other than SEQUENCE is fatal.
    ///
    /// A length field that never decodes keeps returning `Ok(None)`; the
    /// reader bounds that with its own read timeout.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        // Need at least the tag and the first length octet
        if buf.len() < 2 {
            return Ok(None);
        }

        if buf[0] != tag::SEQUENCE {
            return Err(WireError::IllegalFrame(buf[0]));
        }

        let (len_octets, content_len) = match peek_length(&buf[1..]) {
            Ok(Some(header)) => header,
            Ok(None) => return Ok(None),
            Err(e) => {
                debug!("Undecodable frame length, waiting for more data: {}", e);
                return Ok(None);
            }
        };

        if content_len > self.max_frame_size {
            return Err(WireError::Size(content_len));
        }

        let total = 1 + len_octets + content_len;
        if buf.len() < total {
            trace!(
                "Partial frame: have {} of {} bytes",
                buf.len(),
                total
            );
            return Ok(None);
        }

        Ok(Some(buf.split_to(total).freeze()))
    }

    /// Decode every complete frame currently buffered
    pub fn decode_all(&mut self, buf: &mut BytesMut) -> Result<Vec<Bytes>, WireError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.decode(buf)? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
