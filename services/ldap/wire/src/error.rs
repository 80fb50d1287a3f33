//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer ended before the element did
    #[error("truncated element")]
    Truncated,

    /// Leading tag of a frame is not a SEQUENCE
    #[error("illegal frame tag 0x{0:02x}")]
    IllegalFrame(u8),

    /// Indefinite length form (not allowed in LDAP)
    #[error("indefinite length not allowed")]
    IndefiniteLength,

    /// Length field wider than 4 octets
    #[error("length field too wide: {0} octets")]
    LengthOverflow(usize),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Tag did not match what the grammar expects
    #[error("unexpected tag: expected 0x{expected:02x}, found 0x{found:02x}")]
    UnexpectedTag {
        /// Expected tag
        expected: u8,
        /// Tag actually found
        found: u8,
    },

    /// High tag number form (never used by LDAP)
    #[error("unsupported tag 0x{0:02x}")]
    UnsupportedTag(u8),

    /// INTEGER or ENUMERATED content is empty or too wide
    #[error("invalid integer")]
    Integer,

    /// OCTET STRING that must be UTF-8 is not
    #[error("invalid utf-8 string")]
    Utf8,

    /// BOOLEAN with a content length other than one
    #[error("invalid boolean")]
    Boolean,

    /// Unknown protocol operation tag
    #[error("unknown protocol op 0x{0:02x}")]
    UnknownOperation(u8),

    /// Message ID out of range
    #[error("message id out of range: {0}")]
    MessageId(i64),

    /// Malformed message structure
    #[error("malformed message: {0}")]
    Malformed(&'static str),
}
