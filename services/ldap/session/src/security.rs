//! SASL mechanisms and security layers.
//!
//! A [`SaslMechanism`] drives the challenge/response exchange of a SASL bind.
//! When it negotiates integrity or confidentiality it hands back a
//! [`SecurityLayer`], which the I/O task then applies to every byte on the
//! socket: outbound frames are wrapped and sent as length-prefixed buffers,
//! inbound buffers are unwrapped before frame decoding.

use crate::error::{LdapError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Quality of protection negotiated by a SASL mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QualityOfProtection {
    /// Authentication only
    #[default]
    Auth,
    /// Authentication with integrity protection
    AuthInt,
    /// Authentication with integrity and confidentiality protection
    AuthConf,
}

impl QualityOfProtection {
    /// Whether this QOP requires a security layer on the socket
    pub fn needs_layer(&self) -> bool {
        !matches!(self, QualityOfProtection::Auth)
    }

    /// Token used in SASL QOP negotiation
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityOfProtection::Auth => "auth",
            QualityOfProtection::AuthInt => "auth-int",
            QualityOfProtection::AuthConf => "auth-conf",
        }
    }
}

/// Wraps and unwraps socket bytes after a SASL bind
pub trait SecurityLayer: Send {
    /// Protect outbound bytes
    fn wrap(&mut self, plain: &[u8]) -> Result<Vec<u8>>;

    /// Verify and recover inbound bytes
    fn unwrap(&mut self, wrapped: &[u8]) -> Result<Vec<u8>>;
}

/// Client side of a SASL mechanism
pub trait SaslMechanism: Send {
    /// Registered mechanism name, e.g. `PLAIN`
    fn name(&self) -> &str;

    /// Credentials for the first bind request
    fn initial_response(&mut self) -> Result<Option<Bytes>>;

    /// Answer a server challenge carried by a `saslBindInProgress` response
    fn evaluate_challenge(&mut self, challenge: Option<&[u8]>) -> Result<Option<Bytes>> {
        let _ = challenge;
        Err(LdapError::Sasl(format!(
            "{} does not expect server challenges",
            self.name()
        )))
    }

    /// Process final server credentials sent with a successful result
    fn complete(&mut self, server_creds: Option<&[u8]>) -> Result<()> {
        let _ = server_creds;
        Ok(())
    }

    /// Negotiated quality of protection
    fn qop(&self) -> QualityOfProtection {
        QualityOfProtection::Auth
    }

    /// Security layer to install once the bind succeeds.
    ///
    /// Called only when [`SaslMechanism::qop`] requires one.
    fn security_layer(&mut self) -> Option<Box<dyn SecurityLayer>> {
        None
    }
}

/// SASL PLAIN (RFC 4616)
#[derive(Clone)]
pub struct Plain {
    authzid: Option<String>,
    authcid: String,
    password: String,
}

impl Plain {
    /// Authenticate as `authcid`
    pub fn new(authcid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            authzid: None,
            authcid: authcid.into(),
            password: password.into(),
        }
    }

    /// Request authorization as another identity
    pub fn with_authzid(mut self, authzid: impl Into<String>) -> Self {
        self.authzid = Some(authzid.into());
        self
    }
}

impl std::fmt::Debug for Plain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plain")
            .field("authzid", &self.authzid)
            .field("authcid", &self.authcid)
            .finish_non_exhaustive()
    }
}

impl SaslMechanism for Plain {
    fn name(&self) -> &str {
        "PLAIN"
    }

    fn initial_response(&mut self) -> Result<Option<Bytes>> {
        let authzid = self.authzid.as_deref().unwrap_or("");
        let mut buf =
            BytesMut::with_capacity(authzid.len() + self.authcid.len() + self.password.len() + 2);
        buf.put_slice(authzid.as_bytes());
        buf.put_u8(0);
        buf.put_slice(self.authcid.as_bytes());
        buf.put_u8(0);
        buf.put_slice(self.password.as_bytes());
        Ok(Some(buf.freeze()))
    }
}

/// SASL EXTERNAL (RFC 4422 appendix A), typically over TLS client auth
#[derive(Debug, Clone, Default)]
pub struct External {
    authzid: Option<String>,
}

impl External {
    /// Use the identity established by the transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Request authorization as another identity
    pub fn with_authzid(authzid: impl Into<String>) -> Self {
        Self {
            authzid: Some(authzid.into()),
        }
    }
}

impl SaslMechanism for External {
    fn name(&self) -> &str {
        "EXTERNAL"
    }

    fn initial_response(&mut self) -> Result<Option<Bytes>> {
        Ok(Some(Bytes::from(
            self.authzid.clone().unwrap_or_default().into_bytes(),
        )))
    }
}
