//! TCP and TLS transport for LDAP connections.
//!
//! Sockets are opened through the [`Transport`] trait so tests and callers
//! can substitute their own stream source. TLS is layered on top with
//! tokio-rustls, either at connect time (`ldaps://`) or in place via StartTLS.

use crate::config::ServerAddress;
use crate::error::{LdapError, Result};
use async_trait::async_trait;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

/// Byte stream the I/O task can drive
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Boxed stream handed out by a [`Transport`]
pub type BoxedStream = Box<dyn AsyncStream>;

/// Source of connected byte streams
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `address` within `timeout`
    async fn connect(&self, address: &ServerAddress, timeout: Duration) -> Result<BoxedStream>;
}

/// Plain TCP transport
#[derive(Debug, Default, Clone)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, address: &ServerAddress, timeout: Duration) -> Result<BoxedStream> {
        debug!("Connecting to {}", address);
        let stream = tokio::time::timeout(
            timeout,
            TcpStream::connect((address.host.as_str(), address.port)),
        )
        .await
        .map_err(|_| {
            LdapError::Connect(format!("Connect to {} timed out after {:?}", address, timeout))
        })?
        .map_err(|e| LdapError::io(&format!("Connect to {} failed", address), e))?;

        stream
            .set_nodelay(true)
            .map_err(|e| LdapError::io("Failed to set TCP_NODELAY", e))?;

        Ok(Box::new(stream))
    }
}

/// Unified stream type that can be either plain or TLS
pub enum IoStream {
    /// Plain stream
    Plain(BoxedStream),
    /// TLS client stream
    Tls(Box<tokio_rustls::client::TlsStream<BoxedStream>>),
}

impl IoStream {
    /// Whether TLS is active on this stream
    pub fn is_tls(&self) -> bool {
        matches!(self, IoStream::Tls(_))
    }
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::result::Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// TLS client support
pub mod tls {
    use super::*;
    use anyhow::Context as AnyhowContext;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore};
    use std::sync::Arc;
    use tokio_rustls::TlsConnector;
    use tracing::info;

    fn load_roots(ca_pem: &str) -> anyhow::Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        let ca_results: std::result::Result<Vec<_>, _> =
            rustls_pemfile::certs(&mut ca_pem.as_bytes()).collect();
        let ca_certs = ca_results.context("Failed to parse CA certificates")?;
        if ca_certs.is_empty() {
            anyhow::bail!("No CA certificates found");
        }
        for ca_cert in ca_certs {
            roots
                .add(CertificateDer::from(ca_cert))
                .context("Failed to add CA certificate to root store")?;
        }
        Ok(roots)
    }

    /// Create a client configuration trusting the CAs in `ca_pem`
    pub fn make_client_config(ca_pem: &str) -> anyhow::Result<ClientConfig> {
        info!("Creating TLS client configuration");

        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let roots = load_roots(ca_pem)?;
        Ok(ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth())
    }

    /// Create a client configuration presenting a client certificate,
    /// as needed by SASL EXTERNAL
    pub fn make_client_config_with_cert(
        cert_chain_pem: &str,
        private_key_pem: &str,
        ca_pem: &str,
    ) -> anyhow::Result<ClientConfig> {
        info!("Creating TLS client configuration with client certificate");

        let _ = rustls::crypto::ring::default_provider().install_default();

        let roots = load_roots(ca_pem)?;

        let cert_results: std::result::Result<Vec<_>, _> =
            rustls_pemfile::certs(&mut cert_chain_pem.as_bytes()).collect();
        let certs = cert_results.context("Failed to parse certificate chain")?;
        if certs.is_empty() {
            anyhow::bail!("No certificates found in certificate chain");
        }

        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut private_key_pem.as_bytes())
            .context("Failed to parse private key")?
            .ok_or_else(|| anyhow::anyhow!("No private key found"))?;

        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .context("Failed to configure client certificate")
    }

    /// Run the TLS handshake over `stream`
    pub async fn connect_tls(
        config: Arc<ClientConfig>,
        stream: BoxedStream,
        sni: &str,
    ) -> Result<IoStream> {
        debug!("Starting TLS handshake (SNI: {})", sni);

        let connector = TlsConnector::from(config);
        let server_name = ServerName::try_from(sni.to_owned())
            .map_err(|_| LdapError::Tls(format!("Invalid server name: {}", sni)))?;

        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| LdapError::Tls(format!("TLS handshake failed (SNI: {}): {}", sni, e)))?;

        debug!("TLS established (SNI: {})", sni);
        Ok(IoStream::Tls(Box::new(tls_stream)))
    }
}
