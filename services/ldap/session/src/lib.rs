//! Connection engine for LDAP clients.
//!
//! This crate multiplexes LDAP operations over one socket: it assigns
//! message IDs, tracks pending requests, routes responses back to their
//! handles, and keeps the socket usable across binds, StartTLS, SASL
//! security layers and reconnects.
//!
//! ## Features
//!
//! - **Transport**: TCP or `ldaps://` through a pluggable [`Transport`]
//! - **Operation handles**: send/wait/execute/abandon with response timeouts
//! - **Bind exclusivity**: other writes fail fast while a bind holds the connection
//! - **StartTLS**: in-place TLS upgrade of a plain socket
//! - **SASL**: challenge/response binds and integrity/confidentiality layers
//! - **Auto-reconnect**: reopen with exponential backoff and replay pending requests
//!
//! ## Example
//!
//! ```rust,no_run
//! use ldap_session::{BindInitializer, Connection, ConnectionConfig, ServerAddress};
//! use ldap_wire::{Filter, Request, SearchRequest, SearchScope};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), ldap_session::LdapError> {
//! let mut config = ConnectionConfig::new(ServerAddress::parse("ldap://localhost:389")?);
//! config.response_timeout = Some(Duration::from_secs(10));
//!
//! let conn = Connection::builder(config)
//!     .initializer(BindInitializer::simple("cn=admin,dc=example,dc=com", "secret"))
//!     .build();
//! conn.open().await?;
//!
//! let search = SearchRequest::new("dc=example,dc=com", SearchScope::Subtree, Filter::eq("uid", "jdoe"));
//! let result = conn.operation(Request::Search(search)).execute().await?;
//! for entry in &result.entries {
//!     println!("{}", entry.dn);
//! }
//!
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
mod driver;
pub mod error;
pub mod handle;
pub mod initializer;
mod registry;
pub mod security;
pub mod transport;

// Re-export main types
pub use config::{ConnectionConfig, Scheme, ServerAddress, TlsSettings};
pub use connection::{Connection, ConnectionBuilder, ConnectionState, ConnectionStats};
pub use error::{LdapError, Result};
pub use handle::{Intermediate, OperationHandle, OperationResult, Outcome};
pub use initializer::{BindInitializer, ConnectionInitializer, SaslInitializer};
pub use security::{External, Plain, QualityOfProtection, SaslMechanism, SecurityLayer};
pub use transport::tls::{connect_tls, make_client_config, make_client_config_with_cert};
pub use transport::{AsyncStream, BoxedStream, IoStream, TcpTransport, Transport};
