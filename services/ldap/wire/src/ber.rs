//! Minimal BER primitives used by the LDAP message codec.
//!
//! Only what LDAP needs: single-octet tags, definite lengths up to four
//! length octets, INTEGER/ENUMERATED, BOOLEAN, OCTET STRING and NULL.

use crate::error::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Universal and LDAP-specific tags
pub mod tag {
    /// BOOLEAN
    pub const BOOLEAN: u8 = 0x01;
    /// INTEGER
    pub const INTEGER: u8 = 0x02;
    /// OCTET STRING
    pub const OCTET_STRING: u8 = 0x04;
    /// NULL
    pub const NULL: u8 = 0x05;
    /// ENUMERATED
    pub const ENUMERATED: u8 = 0x0A;
    /// SEQUENCE (constructed)
    pub const SEQUENCE: u8 = 0x30;
    /// SET (constructed)
    pub const SET: u8 = 0x31;

    /// LDAPMessage controls `[0]`
    pub const CONTROLS: u8 = 0xA0;

    /// BindRequest `[APPLICATION 0]`
    pub const BIND_REQUEST: u8 = 0x60;
    /// BindResponse `[APPLICATION 1]`
    pub const BIND_RESPONSE: u8 = 0x61;
    /// UnbindRequest `[APPLICATION 2]`
    pub const UNBIND_REQUEST: u8 = 0x42;
    /// SearchRequest `[APPLICATION 3]`
    pub const SEARCH_REQUEST: u8 = 0x63;
    /// SearchResultEntry `[APPLICATION 4]`
    pub const SEARCH_RESULT_ENTRY: u8 = 0x64;
    /// SearchResultDone `[APPLICATION 5]`
    pub const SEARCH_RESULT_DONE: u8 = 0x65;
    /// ModifyRequest `[APPLICATION 6]`
    pub const MODIFY_REQUEST: u8 = 0x66;
    /// ModifyResponse `[APPLICATION 7]`
    pub const MODIFY_RESPONSE: u8 = 0x67;
    /// AddRequest `[APPLICATION 8]`
    pub const ADD_REQUEST: u8 = 0x68;
    /// AddResponse `[APPLICATION 9]`
    pub const ADD_RESPONSE: u8 = 0x69;
    /// DelRequest `[APPLICATION 10]` (primitive)
    pub const DEL_REQUEST: u8 = 0x4A;
    /// DelResponse `[APPLICATION 11]`
    pub const DEL_RESPONSE: u8 = 0x6B;
    /// ModifyDNRequest `[APPLICATION 12]`
    pub const MODDN_REQUEST: u8 = 0x6C;
    /// ModifyDNResponse `[APPLICATION 13]`
    pub const MODDN_RESPONSE: u8 = 0x6D;
    /// CompareRequest `[APPLICATION 14]`
    pub const COMPARE_REQUEST: u8 = 0x6E;
    /// CompareResponse `[APPLICATION 15]`
    pub const COMPARE_RESPONSE: u8 = 0x6F;
    /// AbandonRequest `[APPLICATION 16]` (primitive)
    pub const ABANDON_REQUEST: u8 = 0x50;
    /// SearchResultReference `[APPLICATION 19]`
    pub const SEARCH_RESULT_REFERENCE: u8 = 0x73;
    /// ExtendedRequest `[APPLICATION 23]`
    pub const EXTENDED_REQUEST: u8 = 0x77;
    /// ExtendedResponse `[APPLICATION 24]`
    pub const EXTENDED_RESPONSE: u8 = 0x78;
    /// IntermediateResponse `[APPLICATION 25]`
    pub const INTERMEDIATE_RESPONSE: u8 = 0x79;
}

/// Decode a definite length starting at `buf[0]`.
///
/// Returns `(length_octets, content_length)`, or `None` when the length
/// field itself is not fully buffered yet.
pub fn peek_length(buf: &[u8]) -> Result<Option<(usize, usize)>, WireError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };

    if first < 0x80 {
        return Ok(Some((1, first as usize)));
    }

    let n = (first & 0x7F) as usize;
    if n == 0 {
        return Err(WireError::IndefiniteLength);
    }
    if n > 4 {
        return Err(WireError::LengthOverflow(n));
    }
    if buf.len() < 1 + n {
        return Ok(None);
    }

    let len = buf[1..=n]
        .iter()
        .fold(0usize, |acc, b| (acc << 8) | *b as usize);
    Ok(Some((1 + n, len)))
}

fn put_length(buf: &mut BytesMut, len: usize) {
    if len < 0x80 {
        buf.put_u8(len as u8);
        return;
    }
    let bytes = (len as u32).to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    buf.put_u8(0x80 | (4 - skip) as u8);
    buf.put_slice(&bytes[skip..]);
}

/// Two's complement, minimal-length big-endian encoding.
pub fn encode_integer(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let (b, next) = (bytes[start], bytes[start + 1]);
        if (b == 0x00 && next & 0x80 == 0) || (b == 0xFF && next & 0x80 != 0) {
            start += 1;
        } else {
            break;
        }
    }
    bytes[start..].to_vec()
}

/// Inverse of [`encode_integer`].
pub fn decode_integer(content: &[u8]) -> Result<i64, WireError> {
    if content.is_empty() || content.len() > 8 {
        return Err(WireError::Integer);
    }
    let init: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    Ok(content.iter().fold(init, |acc, b| (acc << 8) | *b as i64))
}

/// Append-only BER writer
#[derive(Debug, Default)]
pub struct BerWriter {
    buf: BytesMut,
}

impl BerWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Write a complete tag-length-value element
    pub fn write_tlv(&mut self, tag: u8, value: &[u8]) {
        self.buf.reserve(value.len() + 6);
        self.buf.put_u8(tag);
        put_length(&mut self.buf, value.len());
        self.buf.put_slice(value);
    }

    /// Write an INTEGER (or ENUMERATED, depending on `tag`)
    pub fn write_integer(&mut self, tag: u8, value: i64) {
        self.write_tlv(tag, &encode_integer(value));
    }

    /// Write an OCTET STRING under `tag`
    pub fn write_octets(&mut self, tag: u8, value: &[u8]) {
        self.write_tlv(tag, value);
    }

    /// Write a BOOLEAN
    pub fn write_bool(&mut self, tag: u8, value: bool) {
        self.write_tlv(tag, &[if value { 0xFF } else { 0x00 }]);
    }

    /// Write a constructed element whose contents are produced by `f`
    pub fn constructed<F>(&mut self, tag: u8, f: F)
    where
        F: FnOnce(&mut BerWriter),
    {
        let mut inner = BerWriter::new();
        f(&mut inner);
        self.write_tlv(tag, &inner.buf);
    }

    /// Number of bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing was written yet
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Freeze into an immutable buffer
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor over the contents of a constructed BER element
#[derive(Debug, Clone)]
pub struct BerReader {
    buf: Bytes,
}

impl BerReader {
    /// Read over `buf`
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Whether all elements were consumed
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Tag of the next element, if any
    pub fn peek_tag(&self) -> Option<u8> {
        self.buf.first().copied()
    }

    /// Read the next element as `(tag, contents)`
    pub fn read_tlv(&mut self) -> Result<(u8, Bytes), WireError> {
        let tag = self.peek_tag().ok_or(WireError::Truncated)?;
        if tag & 0x1F == 0x1F {
            return Err(WireError::UnsupportedTag(tag));
        }
        let (len_octets, len) = peek_length(&self.buf[1..])?.ok_or(WireError::Truncated)?;
        let header = 1 + len_octets;
        if self.buf.len() < header + len {
            return Err(WireError::Truncated);
        }
        self.buf.advance(header);
        Ok((tag, self.buf.split_to(len)))
    }

    /// Read the next element, which must carry `tag`
    pub fn expect(&mut self, tag: u8) -> Result<Bytes, WireError> {
        let (found, content) = self.read_tlv()?;
        if found != tag {
            return Err(WireError::UnexpectedTag {
                expected: tag,
                found,
            });
        }
        Ok(content)
    }

    /// Read the next element only if it carries `tag`
    pub fn optional(&mut self, tag: u8) -> Result<Option<Bytes>, WireError> {
        if self.peek_tag() == Some(tag) {
            self.expect(tag).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Enter a constructed element
    pub fn sequence(&mut self, tag: u8) -> Result<BerReader, WireError> {
        self.expect(tag).map(BerReader::new)
    }

    /// Read an INTEGER/ENUMERATED under `tag`
    pub fn read_integer(&mut self, tag: u8) -> Result<i64, WireError> {
        decode_integer(&self.expect(tag)?)
    }

    /// Read an OCTET STRING under `tag`
    pub fn read_octets(&mut self, tag: u8) -> Result<Bytes, WireError> {
        self.expect(tag)
    }

    /// Read a UTF-8 OCTET STRING under `tag`
    pub fn read_string(&mut self, tag: u8) -> Result<String, WireError> {
        bytes_to_string(self.expect(tag)?)
    }

    /// Read a BOOLEAN under `tag`
    pub fn read_bool(&mut self, tag: u8) -> Result<bool, WireError> {
        match self.expect(tag)?.as_ref() {
            [b] => Ok(*b != 0),
            _ => Err(WireError::Boolean),
        }
    }
}

/// Convert LDAP string contents to an owned `String`
pub fn bytes_to_string(bytes: Bytes) -> Result<String, WireError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| WireError::Utf8)
}
