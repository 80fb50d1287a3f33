//! Encoding and decoding of LDAP messages.
//!
//! The connection engine only relies on two capabilities from this module:
//! [`Message::encode`] for an outgoing request carrying its assigned ID and
//! [`Message::parse`] for a complete inbound frame. Both directions are
//! implemented for requests and responses so that a test peer can reuse
//! the same codec.

use crate::ber::{bytes_to_string, decode_integer, encode_integer, tag, BerReader, BerWriter};
use crate::error::WireError;
use crate::message::*;
use bytes::Bytes;

// Context-specific tags inside protocol operations
const AUTH_SIMPLE: u8 = 0x80;
const AUTH_SASL: u8 = 0xA3;
const REFERRAL: u8 = 0xA3;
const SERVER_SASL_CREDS: u8 = 0x87;
const EXT_REQUEST_NAME: u8 = 0x80;
const EXT_REQUEST_VALUE: u8 = 0x81;
const EXT_RESPONSE_NAME: u8 = 0x8A;
const EXT_RESPONSE_VALUE: u8 = 0x8B;
const INTERMEDIATE_NAME: u8 = 0x80;
const INTERMEDIATE_VALUE: u8 = 0x81;
const NEW_SUPERIOR: u8 = 0x80;

// Filter choices
const FILTER_AND: u8 = 0xA0;
const FILTER_OR: u8 = 0xA1;
const FILTER_NOT: u8 = 0xA2;
const FILTER_EQUALITY: u8 = 0xA3;
const FILTER_GREATER_OR_EQUAL: u8 = 0xA5;
const FILTER_LESS_OR_EQUAL: u8 = 0xA6;
const FILTER_PRESENT: u8 = 0x87;
const FILTER_APPROX: u8 = 0xA8;

/// A protocol operation that can be carried inside an LDAPMessage
pub trait ProtocolOp: Sized {
    /// Append the operation's BER element
    fn encode_op(&self, w: &mut BerWriter);

    /// Decode the operation from its tag and contents
    fn decode_op(tag: u8, content: Bytes) -> Result<Self, WireError>;
}

/// Encode `op` as a complete LDAPMessage frame carrying `message_id`
pub fn encode_with_id<T: ProtocolOp>(message_id: MessageId, op: &T, controls: &[Control]) -> Bytes {
    let mut w = BerWriter::new();
    w.constructed(tag::SEQUENCE, |w| {
        w.write_integer(tag::INTEGER, message_id as i64);
        op.encode_op(w);
        if !controls.is_empty() {
            w.constructed(tag::CONTROLS, |w| {
                for control in controls {
                    encode_control(w, control);
                }
            });
        }
    });
    w.finish()
}

/// Read only the message ID of a frame whose body may not parse
pub fn peek_message_id(frame: &Bytes) -> Option<MessageId> {
    let mut outer = BerReader::new(frame.clone());
    let mut body = outer.sequence(tag::SEQUENCE).ok()?;
    let raw = body.read_integer(tag::INTEGER).ok()?;
    MessageId::try_from(raw).ok()
}

impl<T: ProtocolOp> Message<T> {
    /// Encode into one complete frame
    pub fn encode(&self) -> Bytes {
        encode_with_id(self.message_id, &self.op, &self.controls)
    }

    /// Parse one complete frame as produced by the frame decoder
    pub fn parse(frame: Bytes) -> Result<Self, WireError> {
        let mut outer = BerReader::new(frame);
        let mut body = outer.sequence(tag::SEQUENCE)?;

        let raw_id = body.read_integer(tag::INTEGER)?;
        let message_id =
            MessageId::try_from(raw_id).map_err(|_| WireError::MessageId(raw_id))?;
        if message_id < 0 {
            return Err(WireError::MessageId(raw_id));
        }

        let (op_tag, op_content) = body.read_tlv()?;
        let op = T::decode_op(op_tag, op_content)?;

        let controls = match body.optional(tag::CONTROLS)? {
            Some(content) => decode_controls(content)?,
            None => Vec::new(),
        };

        Ok(Self {
            message_id,
            op,
            controls,
        })
    }
}

fn encode_control(w: &mut BerWriter, control: &Control) {
    w.constructed(tag::SEQUENCE, |w| {
        w.write_octets(tag::OCTET_STRING, control.oid.as_bytes());
        if control.critical {
            w.write_bool(tag::BOOLEAN, true);
        }
        if let Some(value) = &control.value {
            w.write_octets(tag::OCTET_STRING, value);
        }
    });
}

fn decode_controls(content: Bytes) -> Result<Vec<Control>, WireError> {
    let mut r = BerReader::new(content);
    let mut controls = Vec::new();
    while !r.is_empty() {
        let mut c = r.sequence(tag::SEQUENCE)?;
        let oid = c.read_string(tag::OCTET_STRING)?;
        let critical = if c.peek_tag() == Some(tag::BOOLEAN) {
            c.read_bool(tag::BOOLEAN)?
        } else {
            false
        };
        let value = c.optional(tag::OCTET_STRING)?;
        controls.push(Control {
            oid,
            critical,
            value,
        });
    }
    Ok(controls)
}

fn encode_result(w: &mut BerWriter, result: &LdapResult) {
    w.write_integer(tag::ENUMERATED, result.code.code());
    w.write_octets(tag::OCTET_STRING, result.matched_dn.as_bytes());
    w.write_octets(tag::OCTET_STRING, result.diagnostic_message.as_bytes());
    if !result.referrals.is_empty() {
        w.constructed(REFERRAL, |w| {
            for url in &result.referrals {
                w.write_octets(tag::OCTET_STRING, url.as_bytes());
            }
        });
    }
}

fn decode_result(r: &mut BerReader) -> Result<LdapResult, WireError> {
    let code = ResultCode::from(r.read_integer(tag::ENUMERATED)?);
    let matched_dn = r.read_string(tag::OCTET_STRING)?;
    let diagnostic_message = r.read_string(tag::OCTET_STRING)?;
    let referrals = match r.optional(REFERRAL)? {
        Some(content) => decode_strings(content)?,
        None => Vec::new(),
    };
    Ok(LdapResult {
        code,
        matched_dn,
        diagnostic_message,
        referrals,
    })
}

fn decode_strings(content: Bytes) -> Result<Vec<String>, WireError> {
    let mut r = BerReader::new(content);
    let mut out = Vec::new();
    while !r.is_empty() {
        out.push(r.read_string(tag::OCTET_STRING)?);
    }
    Ok(out)
}

fn encode_attribute(w: &mut BerWriter, attribute: &Attribute) {
    w.constructed(tag::SEQUENCE, |w| {
        w.write_octets(tag::OCTET_STRING, attribute.name.as_bytes());
        w.constructed(tag::SET, |w| {
            for value in &attribute.values {
                w.write_octets(tag::OCTET_STRING, value);
            }
        });
    });
}

fn decode_attribute(r: &mut BerReader) -> Result<Attribute, WireError> {
    let mut a = r.sequence(tag::SEQUENCE)?;
    let name = a.read_string(tag::OCTET_STRING)?;
    let mut set = a.sequence(tag::SET)?;
    let mut values = Vec::new();
    while !set.is_empty() {
        values.push(set.read_octets(tag::OCTET_STRING)?);
    }
    Ok(Attribute { name, values })
}

fn decode_attributes(content: Bytes) -> Result<Vec<Attribute>, WireError> {
    let mut r = BerReader::new(content);
    let mut out = Vec::new();
    while !r.is_empty() {
        out.push(decode_attribute(&mut r)?);
    }
    Ok(out)
}

fn encode_assertion(w: &mut BerWriter, tag: u8, attr: &str, value: &[u8]) {
    w.constructed(tag, |w| {
        w.write_octets(tag::OCTET_STRING, attr.as_bytes());
        w.write_octets(tag::OCTET_STRING, value);
    });
}

fn encode_filter(w: &mut BerWriter, filter: &Filter) {
    match filter {
        Filter::And(items) | Filter::Or(items) => {
            let t = if matches!(filter, Filter::And(_)) {
                FILTER_AND
            } else {
                FILTER_OR
            };
            w.constructed(t, |w| {
                for item in items {
                    encode_filter(w, item);
                }
            });
        }
        Filter::Not(inner) => w.constructed(FILTER_NOT, |w| encode_filter(w, inner)),
        Filter::Equality(attr, value) => encode_assertion(w, FILTER_EQUALITY, attr, value),
        Filter::GreaterOrEqual(attr, value) => {
            encode_assertion(w, FILTER_GREATER_OR_EQUAL, attr, value)
        }
        Filter::LessOrEqual(attr, value) => encode_assertion(w, FILTER_LESS_OR_EQUAL, attr, value),
        Filter::Approx(attr, value) => encode_assertion(w, FILTER_APPROX, attr, value),
        Filter::Present(attr) => w.write_octets(FILTER_PRESENT, attr.as_bytes()),
        Filter::Raw { tag, value } => w.write_tlv(*tag, value),
    }
}

fn decode_filter(tag: u8, content: Bytes) -> Result<Filter, WireError> {
    let assertion = |content: Bytes| -> Result<(String, Bytes), WireError> {
        let mut r = BerReader::new(content);
        Ok((
            r.read_string(tag::OCTET_STRING)?,
            r.read_octets(tag::OCTET_STRING)?,
        ))
    };

    Ok(match tag {
        FILTER_AND | FILTER_OR => {
            let mut r = BerReader::new(content);
            let mut items = Vec::new();
            while !r.is_empty() {
                let (t, c) = r.read_tlv()?;
                items.push(decode_filter(t, c)?);
            }
            if tag == FILTER_AND {
                Filter::And(items)
            } else {
                Filter::Or(items)
            }
        }
        FILTER_NOT => {
            let mut r = BerReader::new(content);
            let (t, c) = r.read_tlv()?;
            Filter::Not(Box::new(decode_filter(t, c)?))
        }
        FILTER_EQUALITY => {
            let (a, v) = assertion(content)?;
            Filter::Equality(a, v)
        }
        FILTER_GREATER_OR_EQUAL => {
            let (a, v) = assertion(content)?;
            Filter::GreaterOrEqual(a, v)
        }
        FILTER_LESS_OR_EQUAL => {
            let (a, v) = assertion(content)?;
            Filter::LessOrEqual(a, v)
        }
        FILTER_APPROX => {
            let (a, v) = assertion(content)?;
            Filter::Approx(a, v)
        }
        FILTER_PRESENT => Filter::Present(bytes_to_string(content)?),
        other => Filter::Raw {
            tag: other,
            value: content,
        },
    })
}

fn scope_from(value: i64) -> Result<SearchScope, WireError> {
    match value {
        0 => Ok(SearchScope::Base),
        1 => Ok(SearchScope::OneLevel),
        2 => Ok(SearchScope::Subtree),
        _ => Err(WireError::Malformed("search scope")),
    }
}

fn deref_from(value: i64) -> Result<DerefAliases, WireError> {
    match value {
        0 => Ok(DerefAliases::Never),
        1 => Ok(DerefAliases::InSearching),
        2 => Ok(DerefAliases::FindingBase),
        3 => Ok(DerefAliases::Always),
        _ => Err(WireError::Malformed("deref aliases")),
    }
}

fn modify_operation_from(value: i64) -> Result<ModifyOperation, WireError> {
    match value {
        0 => Ok(ModifyOperation::Add),
        1 => Ok(ModifyOperation::Delete),
        2 => Ok(ModifyOperation::Replace),
        _ => Err(WireError::Malformed("modify operation")),
    }
}

impl ProtocolOp for Request {
    fn encode_op(&self, w: &mut BerWriter) {
        match self {
            Request::Bind(bind) => w.constructed(tag::BIND_REQUEST, |w| {
                w.write_integer(tag::INTEGER, bind.version);
                w.write_octets(tag::OCTET_STRING, bind.name.as_bytes());
                match &bind.authentication {
                    BindAuthentication::Simple(password) => w.write_octets(AUTH_SIMPLE, password),
                    BindAuthentication::Sasl {
                        mechanism,
                        credentials,
                    } => w.constructed(AUTH_SASL, |w| {
                        w.write_octets(tag::OCTET_STRING, mechanism.as_bytes());
                        if let Some(creds) = credentials {
                            w.write_octets(tag::OCTET_STRING, creds);
                        }
                    }),
                }
            }),
            Request::Unbind => w.write_tlv(tag::UNBIND_REQUEST, &[]),
            Request::Search(search) => w.constructed(tag::SEARCH_REQUEST, |w| {
                w.write_octets(tag::OCTET_STRING, search.base.as_bytes());
                w.write_integer(tag::ENUMERATED, search.scope as i64);
                w.write_integer(tag::ENUMERATED, search.deref_aliases as i64);
                w.write_integer(tag::INTEGER, search.size_limit);
                w.write_integer(tag::INTEGER, search.time_limit);
                w.write_bool(tag::BOOLEAN, search.types_only);
                encode_filter(w, &search.filter);
                w.constructed(tag::SEQUENCE, |w| {
                    for attr in &search.attributes {
                        w.write_octets(tag::OCTET_STRING, attr.as_bytes());
                    }
                });
            }),
            Request::Modify(modify) => w.constructed(tag::MODIFY_REQUEST, |w| {
                w.write_octets(tag::OCTET_STRING, modify.dn.as_bytes());
                w.constructed(tag::SEQUENCE, |w| {
                    for change in &modify.changes {
                        w.constructed(tag::SEQUENCE, |w| {
                            w.write_integer(tag::ENUMERATED, change.operation as i64);
                            encode_attribute(w, &change.attribute);
                        });
                    }
                });
            }),
            Request::Add(add) => w.constructed(tag::ADD_REQUEST, |w| {
                w.write_octets(tag::OCTET_STRING, add.dn.as_bytes());
                w.constructed(tag::SEQUENCE, |w| {
                    for attr in &add.attributes {
                        encode_attribute(w, attr);
                    }
                });
            }),
            Request::Delete(dn) => w.write_octets(tag::DEL_REQUEST, dn.as_bytes()),
            Request::ModifyDn(moddn) => w.constructed(tag::MODDN_REQUEST, |w| {
                w.write_octets(tag::OCTET_STRING, moddn.dn.as_bytes());
                w.write_octets(tag::OCTET_STRING, moddn.new_rdn.as_bytes());
                w.write_bool(tag::BOOLEAN, moddn.delete_old_rdn);
                if let Some(sup) = &moddn.new_superior {
                    w.write_octets(NEW_SUPERIOR, sup.as_bytes());
                }
            }),
            Request::Compare(compare) => w.constructed(tag::COMPARE_REQUEST, |w| {
                w.write_octets(tag::OCTET_STRING, compare.dn.as_bytes());
                encode_assertion(w, tag::SEQUENCE, &compare.attribute, &compare.value);
            }),
            Request::Abandon(id) => w.write_tlv(tag::ABANDON_REQUEST, &encode_integer(*id as i64)),
            Request::Extended(ext) => w.constructed(tag::EXTENDED_REQUEST, |w| {
                w.write_octets(EXT_REQUEST_NAME, ext.oid.as_bytes());
                if let Some(value) = &ext.value {
                    w.write_octets(EXT_REQUEST_VALUE, value);
                }
            }),
        }
    }

    fn decode_op(op_tag: u8, content: Bytes) -> Result<Self, WireError> {
        let mut r = BerReader::new(content.clone());
        Ok(match op_tag {
            tag::BIND_REQUEST => {
                let version = r.read_integer(tag::INTEGER)?;
                let name = r.read_string(tag::OCTET_STRING)?;
                let (auth_tag, auth) = r.read_tlv()?;
                let authentication = match auth_tag {
                    AUTH_SIMPLE => BindAuthentication::Simple(auth),
                    AUTH_SASL => {
                        let mut s = BerReader::new(auth);
                        BindAuthentication::Sasl {
                            mechanism: s.read_string(tag::OCTET_STRING)?,
                            credentials: s.optional(tag::OCTET_STRING)?,
                        }
                    }
                    _ => return Err(WireError::Malformed("bind authentication")),
                };
                Request::Bind(BindRequest {
                    version,
                    name,
                    authentication,
                })
            }
            tag::UNBIND_REQUEST => Request::Unbind,
            tag::SEARCH_REQUEST => {
                let base = r.read_string(tag::OCTET_STRING)?;
                let scope = scope_from(r.read_integer(tag::ENUMERATED)?)?;
                let deref_aliases = deref_from(r.read_integer(tag::ENUMERATED)?)?;
                let size_limit = r.read_integer(tag::INTEGER)?;
                let time_limit = r.read_integer(tag::INTEGER)?;
                let types_only = r.read_bool(tag::BOOLEAN)?;
                let (filter_tag, filter_content) = r.read_tlv()?;
                let filter = decode_filter(filter_tag, filter_content)?;
                let attributes = decode_strings(r.read_octets(tag::SEQUENCE)?)?;
                Request::Search(SearchRequest {
                    base,
                    scope,
                    deref_aliases,
                    size_limit,
                    time_limit,
                    types_only,
                    filter,
                    attributes,
                })
            }
            tag::MODIFY_REQUEST => {
                let dn = r.read_string(tag::OCTET_STRING)?;
                let mut seq = r.sequence(tag::SEQUENCE)?;
                let mut changes = Vec::new();
                while !seq.is_empty() {
                    let mut change = seq.sequence(tag::SEQUENCE)?;
                    let operation = modify_operation_from(change.read_integer(tag::ENUMERATED)?)?;
                    let attribute = decode_attribute(&mut change)?;
                    changes.push(Modification {
                        operation,
                        attribute,
                    });
                }
                Request::Modify(ModifyRequest { dn, changes })
            }
            tag::ADD_REQUEST => {
                let dn = r.read_string(tag::OCTET_STRING)?;
                let attributes = decode_attributes(r.read_octets(tag::SEQUENCE)?)?;
                Request::Add(AddRequest { dn, attributes })
            }
            tag::DEL_REQUEST => Request::Delete(bytes_to_string(content)?),
            tag::MODDN_REQUEST => Request::ModifyDn(ModifyDnRequest {
                dn: r.read_string(tag::OCTET_STRING)?,
                new_rdn: r.read_string(tag::OCTET_STRING)?,
                delete_old_rdn: r.read_bool(tag::BOOLEAN)?,
                new_superior: r
                    .optional(NEW_SUPERIOR)?
                    .map(bytes_to_string)
                    .transpose()?,
            }),
            tag::COMPARE_REQUEST => {
                let dn = r.read_string(tag::OCTET_STRING)?;
                let mut ava = r.sequence(tag::SEQUENCE)?;
                Request::Compare(CompareRequest {
                    dn,
                    attribute: ava.read_string(tag::OCTET_STRING)?,
                    value: ava.read_octets(tag::OCTET_STRING)?,
                })
            }
            tag::ABANDON_REQUEST => {
                let raw = decode_integer(&content)?;
                Request::Abandon(MessageId::try_from(raw).map_err(|_| WireError::MessageId(raw))?)
            }
            tag::EXTENDED_REQUEST => Request::Extended(ExtendedRequest {
                oid: r.read_string(EXT_REQUEST_NAME)?,
                value: r.optional(EXT_REQUEST_VALUE)?,
            }),
            other => return Err(WireError::UnknownOperation(other)),
        })
    }
}

impl ProtocolOp for Response {
    fn encode_op(&self, w: &mut BerWriter) {
        match self {
            Response::Bind(bind) => w.constructed(tag::BIND_RESPONSE, |w| {
                encode_result(w, &bind.result);
                if let Some(creds) = &bind.server_sasl_creds {
                    w.write_octets(SERVER_SASL_CREDS, creds);
                }
            }),
            Response::SearchEntry(entry) => w.constructed(tag::SEARCH_RESULT_ENTRY, |w| {
                w.write_octets(tag::OCTET_STRING, entry.dn.as_bytes());
                w.constructed(tag::SEQUENCE, |w| {
                    for attr in &entry.attributes {
                        encode_attribute(w, attr);
                    }
                });
            }),
            Response::SearchReference(urls) => {
                w.constructed(tag::SEARCH_RESULT_REFERENCE, |w| {
                    for url in urls {
                        w.write_octets(tag::OCTET_STRING, url.as_bytes());
                    }
                })
            }
            Response::SearchDone(result) => {
                w.constructed(tag::SEARCH_RESULT_DONE, |w| encode_result(w, result))
            }
            Response::Modify(result) => {
                w.constructed(tag::MODIFY_RESPONSE, |w| encode_result(w, result))
            }
            Response::Add(result) => w.constructed(tag::ADD_RESPONSE, |w| encode_result(w, result)),
            Response::Delete(result) => {
                w.constructed(tag::DEL_RESPONSE, |w| encode_result(w, result))
            }
            Response::ModifyDn(result) => {
                w.constructed(tag::MODDN_RESPONSE, |w| encode_result(w, result))
            }
            Response::Compare(result) => {
                w.constructed(tag::COMPARE_RESPONSE, |w| encode_result(w, result))
            }
            Response::Extended(ext) => w.constructed(tag::EXTENDED_RESPONSE, |w| {
                encode_result(w, &ext.result);
                if let Some(name) = &ext.name {
                    w.write_octets(EXT_RESPONSE_NAME, name.as_bytes());
                }
                if let Some(value) = &ext.value {
                    w.write_octets(EXT_RESPONSE_VALUE, value);
                }
            }),
            Response::Intermediate(im) => w.constructed(tag::INTERMEDIATE_RESPONSE, |w| {
                if let Some(name) = &im.name {
                    w.write_octets(INTERMEDIATE_NAME, name.as_bytes());
                }
                if let Some(value) = &im.value {
                    w.write_octets(INTERMEDIATE_VALUE, value);
                }
            }),
        }
    }

    fn decode_op(op_tag: u8, content: Bytes) -> Result<Self, WireError> {
        let mut r = BerReader::new(content);
        Ok(match op_tag {
            tag::BIND_RESPONSE => Response::Bind(BindResponse {
                result: decode_result(&mut r)?,
                server_sasl_creds: r.optional(SERVER_SASL_CREDS)?,
            }),
            tag::SEARCH_RESULT_ENTRY => Response::SearchEntry(SearchEntry {
                dn: r.read_string(tag::OCTET_STRING)?,
                attributes: decode_attributes(r.read_octets(tag::SEQUENCE)?)?,
            }),
            tag::SEARCH_RESULT_REFERENCE => {
                let mut urls = Vec::new();
                while !r.is_empty() {
                    urls.push(r.read_string(tag::OCTET_STRING)?);
                }
                Response::SearchReference(urls)
            }
            tag::SEARCH_RESULT_DONE => Response::SearchDone(decode_result(&mut r)?),
            tag::MODIFY_RESPONSE => Response::Modify(decode_result(&mut r)?),
            tag::ADD_RESPONSE => Response::Add(decode_result(&mut r)?),
            tag::DEL_RESPONSE => Response::Delete(decode_result(&mut r)?),
            tag::MODDN_RESPONSE => Response::ModifyDn(decode_result(&mut r)?),
            tag::COMPARE_RESPONSE => Response::Compare(decode_result(&mut r)?),
            tag::EXTENDED_RESPONSE => Response::Extended(ExtendedResponse {
                result: decode_result(&mut r)?,
                name: r
                    .optional(EXT_RESPONSE_NAME)?
                    .map(bytes_to_string)
                    .transpose()?,
                value: r.optional(EXT_RESPONSE_VALUE)?,
            }),
            tag::INTERMEDIATE_RESPONSE => Response::Intermediate(IntermediateResponse {
                name: r
                    .optional(INTERMEDIATE_NAME)?
                    .map(bytes_to_string)
                    .transpose()?,
                value: r.optional(INTERMEDIATE_VALUE)?,
            }),
            other => return Err(WireError::UnknownOperation(other)),
        })
    }
}
