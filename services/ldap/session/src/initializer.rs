//! Hooks run on every freshly opened socket.
//!
//! Initializers run after StartTLS and before the connection reports open,
//! on the first open and again after each reconnect, so a reconnected socket
//! is authenticated before replayed requests reach it.

use crate::connection::Connection;
use crate::error::{LdapError, Result};
use crate::security::SaslMechanism;
use async_trait::async_trait;
use ldap_wire::{BindAuthentication, BindRequest};
use std::fmt;
use tracing::{debug, info};

/// Runs against a connection while it opens
#[async_trait]
pub trait ConnectionInitializer: Send + Sync {
    /// Prepare the connection; an error aborts the open
    async fn initialize(&self, connection: &Connection) -> Result<()>;
}

/// Binds with a fixed request on every open
#[derive(Clone)]
pub struct BindInitializer {
    request: BindRequest,
}

impl BindInitializer {
    /// Bind with `request`
    pub fn new(request: BindRequest) -> Self {
        Self { request }
    }

    /// Simple bind as `dn`
    pub fn simple(dn: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(BindRequest::simple(dn, password.into()))
    }
}

impl fmt::Debug for BindInitializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let method = match &self.request.authentication {
            BindAuthentication::Simple(_) => "simple",
            BindAuthentication::Sasl { .. } => "sasl",
        };
        f.debug_struct("BindInitializer")
            .field("name", &self.request.name)
            .field("method", &method)
            .finish()
    }
}

#[async_trait]
impl ConnectionInitializer for BindInitializer {
    async fn initialize(&self, connection: &Connection) -> Result<()> {
        debug!("Binding as {:?} on open", self.request.name);
        let result = connection.bind(self.request.clone()).await?;
        if result.is_success() {
            info!("Bound to {} as {:?}", connection.address(), self.request.name);
            return Ok(());
        }
        let (code, message) = result
            .result()
            .map(|r| (format!("{:?}", r.code), r.diagnostic_message.clone()))
            .unwrap_or_default();
        Err(LdapError::Connect(format!(
            "Bind as {:?} failed: {} {}",
            self.request.name, code, message
        )))
    }
}

/// Runs a SASL bind on every open, with a fresh mechanism each time
pub struct SaslInitializer {
    factory: Box<dyn Fn() -> Box<dyn SaslMechanism> + Send + Sync>,
}

impl SaslInitializer {
    /// Create mechanisms with `factory`
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Box<dyn SaslMechanism> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
        }
    }
}

#[async_trait]
impl ConnectionInitializer for SaslInitializer {
    async fn initialize(&self, connection: &Connection) -> Result<()> {
        let mut mechanism = (self.factory)();
        let result = connection.sasl_bind(mechanism.as_mut()).await?;
        if result.is_success() {
            info!(
                "SASL {} bind to {} succeeded",
                mechanism.name(),
                connection.address()
            );
            return Ok(());
        }
        Err(LdapError::Sasl(format!(
            "{} bind failed: {:?}",
            mechanism.name(),
            result.code()
        )))
    }
}
