//! Wire protocol framing and message encoding/decoding for the LDAP client.
//!
//! This crate provides the low-level pieces the connection engine builds on:
//! slicing complete LDAPMessages off a byte stream, encoding requests with
//! their assigned message ID, parsing responses, and the length-prefixed
//! buffers used by SASL security layers.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | 0x30                 | SEQUENCE tag               |
//! +----------------------+----------------------------+
//! | length (1..5 bytes)  | BER definite length        |
//! +----------------------+----------------------------+
//! | messageID            | INTEGER                    |
//! +----------------------+----------------------------+
//! | protocolOp           | [APPLICATION n]            |
//! +----------------------+----------------------------+
//! | controls (opt)       | [0] SEQUENCE OF Control    |
//! +----------------------+----------------------------+
//! ```
//!
//! With a SASL security layer installed, each chunk of wrapped bytes is
//! additionally prefixed with a `u32` big-endian length.

#![warn(clippy::all)]

pub mod ber;
pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod sasl;

pub use codec::{encode_with_id, peek_message_id, ProtocolOp};
pub use error::WireError;
pub use frame::{FrameDecoder, DEFAULT_MAX_FRAME_SIZE, HARD_MAX_FRAME_SIZE};
pub use message::{
    AddRequest, Attribute, BindAuthentication, BindRequest, BindResponse, CompareRequest, Control,
    DerefAliases, ExtendedRequest, ExtendedResponse, Filter, IntermediateResponse, LdapResult,
    Message, MessageId, ModifyDnRequest, ModifyOperation, ModifyRequest, Modification, Request,
    RequestMessage, Response, ResponseMessage, ResultCode, SearchEntry, SearchRequest,
    SearchScope, LDAP_VERSION, NOTICE_OF_DISCONNECTION_OID, STARTTLS_OID, WHOAMI_OID,
};
pub use sasl::{encode_sasl_buffer, SaslBufferDecoder, DEFAULT_MAX_SASL_BUFFER};
