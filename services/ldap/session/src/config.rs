//! Connection configuration and server addresses

use crate::error::{LdapError, Result};
use ldap_wire::DEFAULT_MAX_FRAME_SIZE;
use rustls::ClientConfig;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Default port for `ldap://`
pub const DEFAULT_LDAP_PORT: u16 = 389;
/// Default port for `ldaps://`
pub const DEFAULT_LDAPS_PORT: u16 = 636;

/// URL scheme of a directory server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain TCP, optionally upgraded with StartTLS
    Ldap,
    /// TLS from the first byte
    Ldaps,
}

/// Where to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    /// Scheme
    pub scheme: Scheme,
    /// Host name or IP literal (without brackets)
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl ServerAddress {
    /// Parse an `ldap://` or `ldaps://` URL
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input)
            .map_err(|e| LdapError::Connect(format!("Invalid LDAP URL {}: {}", input, e)))?;

        let scheme = match url.scheme() {
            "ldap" => Scheme::Ldap,
            "ldaps" => Scheme::Ldaps,
            other => {
                return Err(LdapError::Connect(format!(
                    "Unsupported URL scheme: {}",
                    other
                )))
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| LdapError::Connect(format!("LDAP URL has no host: {}", input)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let port = url.port().unwrap_or(match scheme {
            Scheme::Ldap => DEFAULT_LDAP_PORT,
            Scheme::Ldaps => DEFAULT_LDAPS_PORT,
        });

        Ok(Self { scheme, host, port })
    }

    /// Plain `ldap://host:port`
    pub fn ldap(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: Scheme::Ldap,
            host: host.into(),
            port,
        }
    }

    /// `ldaps://host:port`
    pub fn ldaps(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: Scheme::Ldaps,
            host: host.into(),
            port,
        }
    }

    /// Whether TLS starts with the socket
    pub fn is_ldaps(&self) -> bool {
        self.scheme == Scheme::Ldaps
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Ldap => "ldap",
            Scheme::Ldaps => "ldaps",
        };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

/// TLS client settings for `ldaps://` and StartTLS
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// rustls client configuration
    pub client_config: Arc<ClientConfig>,
    /// Name to verify the server certificate against; defaults to the host
    pub server_name: Option<String>,
}

impl TlsSettings {
    /// Wrap a rustls client configuration
    pub fn new(client_config: ClientConfig) -> Self {
        Self {
            client_config: Arc::new(client_config),
            server_name: None,
        }
    }

    /// Verify the server certificate against `name` instead of the host
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server to connect to
    pub address: ServerAddress,
    /// Limit on establishing the socket
    pub connect_timeout: Duration,
    /// Default response timeout for operations; `None` waits forever
    pub response_timeout: Option<Duration>,
    /// How long a write waits for a running reconnect; `None` waits forever
    pub reconnect_timeout: Option<Duration>,
    /// Reopen automatically when the transport closes unexpectedly
    pub auto_reconnect: bool,
    /// Re-send pending requests after a successful reconnect
    pub auto_replay: bool,
    /// Times one request may be replayed before failing
    pub max_replays: u32,
    /// Open attempts per reconnect before giving up
    pub reconnect_attempts: u32,
    /// First delay between open attempts
    pub reconnect_backoff: Duration,
    /// Cap on the delay between open attempts
    pub max_reconnect_backoff: Duration,
    /// Upgrade with StartTLS as the first operation after connecting
    pub use_start_tls: bool,
    /// TLS settings for `ldaps://` or StartTLS
    pub tls: Option<TlsSettings>,
    /// Largest inbound message accepted
    pub max_frame_size: usize,
    /// How long a partially received message may stay incomplete before the
    /// socket is dropped; `None` waits forever
    pub read_timeout: Option<Duration>,
    /// Bound on waiting for the I/O task to finish during close
    pub close_timeout: Duration,
}

impl ConnectionConfig {
    /// Configuration for `address` with defaults everywhere else
    pub fn new(address: ServerAddress) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    /// Validate option combinations
    pub fn validate(&self) -> Result<()> {
        if (self.address.is_ldaps() || self.use_start_tls) && self.tls.is_none() {
            return Err(LdapError::Tls(format!(
                "TLS settings required for {}",
                if self.use_start_tls {
                    "StartTLS"
                } else {
                    "ldaps://"
                }
            )));
        }
        if self.address.is_ldaps() && self.use_start_tls {
            return Err(LdapError::IllegalState(
                "StartTLS cannot be used with ldaps://".into(),
            ));
        }
        Ok(())
    }

    /// Server name used for certificate verification
    pub(crate) fn tls_server_name(&self) -> String {
        self.tls
            .as_ref()
            .and_then(|t| t.server_name.clone())
            .unwrap_or_else(|| self.address.host.clone())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: ServerAddress::ldap("localhost", DEFAULT_LDAP_PORT),
            connect_timeout: Duration::from_secs(5),
            response_timeout: None,
            reconnect_timeout: None,
            auto_reconnect: true,
            auto_replay: true,
            max_replays: 1,
            reconnect_attempts: 5,
            reconnect_backoff: Duration::from_secs(1),
            max_reconnect_backoff: Duration::from_secs(30),
            use_start_tls: false,
            tls: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_timeout: Some(Duration::from_secs(60)),
            close_timeout: Duration::from_secs(5),
        }
    }
}
