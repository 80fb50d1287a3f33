//! Error types for LDAP connections and operations

use ldap_wire::WireError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by connections and operation handles.
///
/// Cloneable so one failure can resolve every pending handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LdapError {
    /// Could not establish or keep the transport
    #[error("Connect error: {0}")]
    Connect(String),

    /// Inbound bytes violate LDAP message framing; fatal to the socket
    #[error("Illegal frame: {0}")]
    IllegalFrame(String),

    /// The connection is closed or closing
    #[error("Connection closed: {0}")]
    Closed(String),

    /// A bind holds the connection exclusively
    #[error("Bind in progress")]
    BindInProgress,

    /// A reconnect did not finish within the configured wait
    #[error("Reconnect in progress")]
    ReconnectInProgress,

    /// No response arrived within the response timeout
    #[error("No response within {0:?}")]
    Timeout(Duration),

    /// A response could not be decoded or did not match its request
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// SASL negotiation or security layer failure
    #[error("SASL error: {0}")]
    Sasl(String),

    /// TLS configuration or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// The operation was abandoned before a result arrived
    #[error("Operation abandoned")]
    Abandoned,

    /// The call is not valid in the current state
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Internal consistency failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LdapError {
    /// Whether reopening the socket could cure this error.
    ///
    /// TLS failures (bad certificates, hostname mismatch) are permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LdapError::Connect(_) | LdapError::Closed(_) | LdapError::Timeout(_)
        )
    }

    pub(crate) fn io(context: &str, err: std::io::Error) -> Self {
        LdapError::Connect(format!("{}: {}", context, err))
    }
}

impl From<WireError> for LdapError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::IllegalFrame(_)
            | WireError::IndefiniteLength
            | WireError::LengthOverflow(_)
            | WireError::Size(_) => LdapError::IllegalFrame(err.to_string()),
            other => LdapError::Protocol(other.to_string()),
        }
    }
}

/// Result alias for this crate
pub type Result<T> = std::result::Result<T, LdapError>;
