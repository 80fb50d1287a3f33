//! LDAP message model.
//!
//! Requests and responses are kept as two separate enums so that the client
//! side can only ever send requests and only ever dispatch responses.

use bytes::Bytes;

/// Per-connection message identifier (0 is reserved for unsolicited
/// notifications)
pub type MessageId = i32;

/// StartTLS extended operation
pub const STARTTLS_OID: &str = "1.3.6.1.4.1.1466.20037";
/// "Who am I?" extended operation
pub const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";
/// Notice of Disconnection unsolicited notification
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

/// LDAP protocol version sent in bind requests
pub const LDAP_VERSION: i64 = 3;

/// LDAP result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success,
    OperationsError,
    ProtocolError,
    TimeLimitExceeded,
    SizeLimitExceeded,
    CompareFalse,
    CompareTrue,
    AuthMethodNotSupported,
    StrongerAuthRequired,
    Referral,
    AdminLimitExceeded,
    UnavailableCriticalExtension,
    ConfidentialityRequired,
    SaslBindInProgress,
    NoSuchAttribute,
    NoSuchObject,
    InvalidDnSyntax,
    InappropriateAuthentication,
    InvalidCredentials,
    InsufficientAccessRights,
    Busy,
    Unavailable,
    UnwillingToPerform,
    EntryAlreadyExists,
    Other,
    /// Any code not listed above
    Unknown(i64),
}

impl ResultCode {
    /// Numeric value on the wire
    pub fn code(&self) -> i64 {
        match self {
            ResultCode::Success => 0,
            ResultCode::OperationsError => 1,
            ResultCode::ProtocolError => 2,
            ResultCode::TimeLimitExceeded => 3,
            ResultCode::SizeLimitExceeded => 4,
            ResultCode::CompareFalse => 5,
            ResultCode::CompareTrue => 6,
            ResultCode::AuthMethodNotSupported => 7,
            ResultCode::StrongerAuthRequired => 8,
            ResultCode::Referral => 10,
            ResultCode::AdminLimitExceeded => 11,
            ResultCode::UnavailableCriticalExtension => 12,
            ResultCode::ConfidentialityRequired => 13,
            ResultCode::SaslBindInProgress => 14,
            ResultCode::NoSuchAttribute => 16,
            ResultCode::NoSuchObject => 32,
            ResultCode::InvalidDnSyntax => 34,
            ResultCode::InappropriateAuthentication => 48,
            ResultCode::InvalidCredentials => 49,
            ResultCode::InsufficientAccessRights => 50,
            ResultCode::Busy => 51,
            ResultCode::Unavailable => 52,
            ResultCode::UnwillingToPerform => 53,
            ResultCode::EntryAlreadyExists => 68,
            ResultCode::Other => 80,
            ResultCode::Unknown(code) => *code,
        }
    }
}

impl From<i64> for ResultCode {
    fn from(value: i64) -> Self {
        match value {
            0 => ResultCode::Success,
            1 => ResultCode::OperationsError,
            2 => ResultCode::ProtocolError,
            3 => ResultCode::TimeLimitExceeded,
            4 => ResultCode::SizeLimitExceeded,
            5 => ResultCode::CompareFalse,
            6 => ResultCode::CompareTrue,
            7 => ResultCode::AuthMethodNotSupported,
            8 => ResultCode::StrongerAuthRequired,
            10 => ResultCode::Referral,
            11 => ResultCode::AdminLimitExceeded,
            12 => ResultCode::UnavailableCriticalExtension,
            13 => ResultCode::ConfidentialityRequired,
            14 => ResultCode::SaslBindInProgress,
            16 => ResultCode::NoSuchAttribute,
            32 => ResultCode::NoSuchObject,
            34 => ResultCode::InvalidDnSyntax,
            48 => ResultCode::InappropriateAuthentication,
            49 => ResultCode::InvalidCredentials,
            50 => ResultCode::InsufficientAccessRights,
            51 => ResultCode::Busy,
            52 => ResultCode::Unavailable,
            53 => ResultCode::UnwillingToPerform,
            68 => ResultCode::EntryAlreadyExists,
            80 => ResultCode::Other,
            other => ResultCode::Unknown(other),
        }
    }
}

/// Request or response control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    /// Control type OID
    pub oid: String,
    /// Criticality flag
    pub critical: bool,
    /// Encoded control value
    pub value: Option<Bytes>,
}

impl Control {
    /// Non-critical control without a value
    pub fn new(oid: impl Into<String>) -> Self {
        Self {
            oid: oid.into(),
            critical: false,
            value: None,
        }
    }

    /// Mark the control critical
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Attach an encoded value
    pub fn with_value(mut self, value: Bytes) -> Self {
        self.value = Some(value);
        self
    }
}

/// Common result component of terminal responses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub code: ResultCode,
    pub matched_dn: String,
    pub diagnostic_message: String,
    /// Referral URLs, present when `code` is [`ResultCode::Referral`]
    pub referrals: Vec<String>,
}

impl LdapResult {
    /// Result carrying only a code
    pub fn new(code: ResultCode) -> Self {
        Self {
            code,
            matched_dn: String::new(),
            diagnostic_message: String::new(),
            referrals: Vec::new(),
        }
    }

    /// Plain success
    pub fn success() -> Self {
        Self::new(ResultCode::Success)
    }

    /// Attach a diagnostic message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.diagnostic_message = message.into();
        self
    }

    /// Whether the code is `success`
    pub fn is_success(&self) -> bool {
        self.code == ResultCode::Success
    }
}

/// Bind authentication choice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuthentication {
    /// Simple password bind
    Simple(Bytes),
    /// SASL bind round
    Sasl {
        mechanism: String,
        credentials: Option<Bytes>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: i64,
    pub name: String,
    pub authentication: BindAuthentication,
}

impl BindRequest {
    /// Simple bind with a DN and password
    pub fn simple(name: impl Into<String>, password: impl Into<Bytes>) -> Self {
        Self {
            version: LDAP_VERSION,
            name: name.into(),
            authentication: BindAuthentication::Simple(password.into()),
        }
    }

    /// Anonymous simple bind
    pub fn anonymous() -> Self {
        Self::simple("", Bytes::new())
    }

    /// One SASL bind round
    pub fn sasl(mechanism: impl Into<String>, credentials: Option<Bytes>) -> Self {
        Self {
            version: LDAP_VERSION,
            name: String::new(),
            authentication: BindAuthentication::Sasl {
                mechanism: mechanism.into(),
                credentials,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    pub result: LdapResult,
    pub server_sasl_creds: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Base = 0,
    OneLevel = 1,
    Subtree = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerefAliases {
    Never = 0,
    InSearching = 1,
    FindingBase = 2,
    Always = 3,
}

/// Structured search filter. There is deliberately no string parser here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality(String, Bytes),
    GreaterOrEqual(String, Bytes),
    LessOrEqual(String, Bytes),
    Present(String),
    Approx(String, Bytes),
    /// Any other filter choice, kept as its tag and encoded contents
    Raw { tag: u8, value: Bytes },
}

impl Filter {
    /// `(attr=value)`
    pub fn eq(attr: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Filter::Equality(attr.into(), value.into())
    }

    /// `(attr=*)`
    pub fn present(attr: impl Into<String>) -> Self {
        Filter::Present(attr.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base: String,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: i64,
    pub time_limit: i64,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    /// Unlimited search returning all user attributes
    pub fn new(base: impl Into<String>, scope: SearchScope, filter: Filter) -> Self {
        Self {
            base: base.into(),
            scope,
            deref_aliases: DerefAliases::Never,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter,
            attributes: Vec::new(),
        }
    }

    /// Restrict returned attributes
    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }
}

/// Attribute description and its values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<Bytes>,
}

impl Attribute {
    pub fn new<I, V>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Bytes>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchEntry {
    pub dn: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    pub operation: ModifyOperation,
    pub attribute: Attribute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub dn: String,
    pub changes: Vec<Modification>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub dn: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDnRequest {
    pub dn: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    pub dn: String,
    pub attribute: String,
    pub value: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub oid: String,
    pub value: Option<Bytes>,
}

impl ExtendedRequest {
    pub fn new(oid: impl Into<String>, value: Option<Bytes>) -> Self {
        Self {
            oid: oid.into(),
            value,
        }
    }

    /// StartTLS request
    pub fn start_tls() -> Self {
        Self::new(STARTTLS_OID, None)
    }

    /// "Who am I?" request
    pub fn who_am_i() -> Self {
        Self::new(WHOAMI_OID, None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub name: Option<String>,
    pub value: Option<Bytes>,
}

impl ExtendedResponse {
    /// Whether this response is a Notice of Disconnection
    pub fn is_notice_of_disconnection(&self) -> bool {
        self.name.as_deref() == Some(NOTICE_OF_DISCONNECTION_OID)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntermediateResponse {
    pub name: Option<String>,
    pub value: Option<Bytes>,
}

/// Client-to-server protocol operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Bind(BindRequest),
    Unbind,
    Search(SearchRequest),
    Modify(ModifyRequest),
    Add(AddRequest),
    Delete(String),
    ModifyDn(ModifyDnRequest),
    Compare(CompareRequest),
    Abandon(MessageId),
    Extended(ExtendedRequest),
}

impl Request {
    /// Short operation name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Request::Bind(_) => "bind",
            Request::Unbind => "unbind",
            Request::Search(_) => "search",
            Request::Modify(_) => "modify",
            Request::Add(_) => "add",
            Request::Delete(_) => "delete",
            Request::ModifyDn(_) => "modify-dn",
            Request::Compare(_) => "compare",
            Request::Abandon(_) => "abandon",
            Request::Extended(_) => "extended",
        }
    }

    /// Whether this is a bind request
    pub fn is_bind(&self) -> bool {
        matches!(self, Request::Bind(_))
    }

    /// Unbind and Abandon never get a response
    pub fn expects_response(&self) -> bool {
        !matches!(self, Request::Unbind | Request::Abandon(_))
    }
}

/// Server-to-client protocol operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Bind(BindResponse),
    SearchEntry(SearchEntry),
    SearchReference(Vec<String>),
    SearchDone(LdapResult),
    Modify(LdapResult),
    Add(LdapResult),
    Delete(LdapResult),
    ModifyDn(LdapResult),
    Compare(LdapResult),
    Extended(ExtendedResponse),
    Intermediate(IntermediateResponse),
}

impl Response {
    /// Whether this response ends its operation
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Response::SearchEntry(_) | Response::SearchReference(_) | Response::Intermediate(_)
        )
    }

    /// The LDAPResult component of a terminal response
    pub fn result(&self) -> Option<&LdapResult> {
        match self {
            Response::Bind(bind) => Some(&bind.result),
            Response::SearchDone(result)
            | Response::Modify(result)
            | Response::Add(result)
            | Response::Delete(result)
            | Response::ModifyDn(result)
            | Response::Compare(result) => Some(result),
            Response::Extended(ext) => Some(&ext.result),
            Response::SearchEntry(_) | Response::SearchReference(_) | Response::Intermediate(_) => {
                None
            }
        }
    }

    /// Short operation name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Response::Bind(_) => "bind-response",
            Response::SearchEntry(_) => "search-entry",
            Response::SearchReference(_) => "search-reference",
            Response::SearchDone(_) => "search-done",
            Response::Modify(_) => "modify-response",
            Response::Add(_) => "add-response",
            Response::Delete(_) => "delete-response",
            Response::ModifyDn(_) => "modify-dn-response",
            Response::Compare(_) => "compare-response",
            Response::Extended(_) => "extended-response",
            Response::Intermediate(_) => "intermediate-response",
        }
    }
}

/// LDAPMessage envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<T> {
    pub message_id: MessageId,
    pub op: T,
    pub controls: Vec<Control>,
}

impl<T> Message<T> {
    pub fn new(message_id: MessageId, op: T) -> Self {
        Self {
            message_id,
            op,
            controls: Vec::new(),
        }
    }

    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.controls = controls;
        self
    }
}

/// Message sent by a client
pub type RequestMessage = Message<Request>;
/// Message sent by a server
pub type ResponseMessage = Message<Response>;
