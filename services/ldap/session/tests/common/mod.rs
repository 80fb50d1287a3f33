//! Scripted LDAP server and helpers for connection tests.

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ldap_session::{
    BoxedStream, ConnectionConfig, LdapError, QualityOfProtection, SaslMechanism, SecurityLayer,
    ServerAddress,
};
use ldap_wire::{
    encode_sasl_buffer, BindResponse, ExtendedResponse, FrameDecoder, LdapResult, Message,
    MessageId, Request, RequestMessage, Response, ResponseMessage, ResultCode, SaslBufferDecoder,
};
use parking_lot::Mutex;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

/// What the server does with one request
pub enum Reply {
    /// Send these messages in order
    Respond(Vec<ResponseMessage>),
    /// Send nothing
    Silent,
    /// Drop the socket
    Disconnect,
    /// Send the response, then run the TLS handshake
    StartTls(ResponseMessage),
    /// Send the response, then wrap all traffic with the layer
    InstallLayer(ResponseMessage, Box<dyn SecurityLayer>),
}

/// Something to push to the client outside of a request
pub enum Push {
    Message(ResponseMessage),
    Raw(Bytes),
    Disconnect,
}

type Handler = dyn Fn(&RequestMessage) -> Reply + Send + Sync;

struct Shared {
    handler: Box<Handler>,
    tls: Option<TlsAcceptor>,
    implicit_tls: bool,
    requests: Mutex<Vec<RequestMessage>>,
    // Bytes read from clients, after TLS and before any SASL layer
    inbound: Mutex<Vec<u8>>,
    connections: AtomicUsize,
    control: Mutex<Option<mpsc::UnboundedSender<Push>>>,
}

/// In-process LDAP server driven by a handler closure
pub struct MockServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept: JoinHandle<()>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&RequestMessage) -> Reply + Send + Sync + 'static,
    {
        Self::start_inner(Box::new(handler), None, false).await
    }

    /// Server able to answer StartTLS
    pub async fn start_with_tls<F>(handler: F, config: ServerConfig) -> Self
    where
        F: Fn(&RequestMessage) -> Reply + Send + Sync + 'static,
    {
        Self::start_inner(Box::new(handler), Some(config), false).await
    }

    /// Server speaking TLS from the first byte
    pub async fn start_ldaps<F>(handler: F, config: ServerConfig) -> Self
    where
        F: Fn(&RequestMessage) -> Reply + Send + Sync + 'static,
    {
        Self::start_inner(Box::new(handler), Some(config), true).await
    }

    async fn start_inner(handler: Box<Handler>, tls: Option<ServerConfig>, implicit_tls: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            handler,
            tls: tls.map(|c| TlsAcceptor::from(Arc::new(c))),
            implicit_tls,
            requests: Mutex::new(Vec::new()),
            inbound: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            control: Mutex::new(None),
        });

        let accept_shared = shared.clone();
        let accept = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let shared = accept_shared.clone();
                tokio::spawn(async move {
                    let _ = socket.set_nodelay(true);
                    serve(Box::new(socket), shared).await;
                });
            }
        });

        Self {
            addr,
            shared,
            accept,
        }
    }

    pub fn address(&self) -> ServerAddress {
        ServerAddress::ldap("127.0.0.1", self.addr.port())
    }

    pub fn ldaps_address(&self) -> ServerAddress {
        ServerAddress::ldaps("127.0.0.1", self.addr.port())
    }

    pub fn requests(&self) -> Vec<RequestMessage> {
        self.shared.requests.lock().clone()
    }

    /// Everything clients sent, as seen under TLS
    pub fn inbound_bytes(&self) -> Vec<u8> {
        self.shared.inbound.lock().clone()
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Push to the most recent client connection
    pub fn push(&self, push: Push) {
        if let Some(control) = self.shared.control.lock().as_ref() {
            let _ = control.send(push);
        }
    }

    /// Stop accepting new connections
    pub fn stop_accepting(&self) {
        self.accept.abort();
    }

    /// Wait until `count` requests have been seen
    pub async fn wait_for_requests(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.shared.requests.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("server did not receive expected requests");
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

struct ServerSession {
    stream: BoxedStream,
    layer: Option<Box<dyn SecurityLayer>>,
    inbound: BytesMut,
    plain: BytesMut,
    frames: FrameDecoder,
    sasl: SaslBufferDecoder,
}

impl ServerSession {
    async fn send(&mut self, message: &ResponseMessage) -> std::io::Result<()> {
        let frame = message.encode();
        let bytes = match self.layer.as_mut() {
            Some(layer) => encode_sasl_buffer(&layer.wrap(&frame).expect("server wrap")),
            None => frame,
        };
        self.write_raw(&bytes).await
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    fn decode(&mut self) -> Vec<RequestMessage> {
        match self.layer.as_mut() {
            Some(layer) => {
                while let Ok(Some(wrapped)) = self.sasl.decode(&mut self.inbound) {
                    let plain = layer.unwrap(&wrapped).expect("server unwrap");
                    self.plain.extend_from_slice(&plain);
                }
            }
            None => {
                self.plain.extend_from_slice(&self.inbound);
                self.inbound.clear();
            }
        }

        let mut requests = Vec::new();
        while let Ok(Some(frame)) = self.frames.decode(&mut self.plain) {
            requests.push(RequestMessage::parse(frame).expect("client sent a valid request"));
        }
        requests
    }
}

async fn serve(socket: BoxedStream, shared: Arc<Shared>) {
    shared.connections.fetch_add(1, Ordering::SeqCst);
    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    *shared.control.lock() = Some(push_tx);

    let stream: BoxedStream = match (&shared.tls, shared.implicit_tls) {
        (Some(acceptor), true) => match acceptor.accept(socket).await {
            Ok(tls) => Box::new(tls),
            Err(_) => return,
        },
        _ => socket,
    };

    let mut session = ServerSession {
        stream,
        layer: None,
        inbound: BytesMut::with_capacity(4096),
        plain: BytesMut::new(),
        frames: FrameDecoder::new(),
        sasl: SaslBufferDecoder::new(),
    };

    loop {
        let buffered = session.inbound.len();
        tokio::select! {
            push = push_rx.recv() => match push {
                Some(Push::Message(message)) => {
                    if session.send(&message).await.is_err() {
                        return;
                    }
                }
                Some(Push::Raw(bytes)) => {
                    if session.write_raw(&bytes).await.is_err() {
                        return;
                    }
                }
                Some(Push::Disconnect) | None => return,
            },
            read = session.stream.read_buf(&mut session.inbound) => {
                match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
                shared
                    .inbound
                    .lock()
                    .extend_from_slice(&session.inbound[buffered..]);
                for request in session.decode() {
                    shared.requests.lock().push(request.clone());
                    match (shared.handler)(&request) {
                        Reply::Respond(messages) => {
                            for message in messages {
                                if session.send(&message).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Reply::Silent => {}
                        Reply::Disconnect => return,
                        Reply::StartTls(response) => {
                            if session.send(&response).await.is_err() {
                                return;
                            }
                            let Some(acceptor) = shared.tls.clone() else {
                                return;
                            };
                            let (placeholder, _) = tokio::io::duplex(1);
                            let raw = std::mem::replace(&mut session.stream, Box::new(placeholder));
                            match acceptor.accept(raw).await {
                                Ok(tls) => session.stream = Box::new(tls),
                                Err(_) => return,
                            }
                        }
                        Reply::InstallLayer(response, layer) => {
                            if session.send(&response).await.is_err() {
                                return;
                            }
                            session.layer = Some(layer);
                        }
                    }
                }
            }
        }
    }
}

/// Successful terminal response matching the request type
pub fn success_for(request: &RequestMessage) -> Option<ResponseMessage> {
    let id = request.message_id;
    let op = match &request.op {
        Request::Bind(_) => Response::Bind(BindResponse {
            result: LdapResult::success(),
            server_sasl_creds: None,
        }),
        Request::Search(_) => Response::SearchDone(LdapResult::success()),
        Request::Modify(_) => Response::Modify(LdapResult::success()),
        Request::Add(_) => Response::Add(LdapResult::success()),
        Request::Delete(_) => Response::Delete(LdapResult::success()),
        Request::ModifyDn(_) => Response::ModifyDn(LdapResult::success()),
        Request::Compare(_) => Response::Compare(LdapResult::new(ResultCode::CompareTrue)),
        Request::Extended(_) => Response::Extended(ExtendedResponse {
            result: LdapResult::success(),
            name: None,
            value: None,
        }),
        Request::Unbind | Request::Abandon(_) => return None,
    };
    Some(Message::new(id, op))
}

/// Answer every request with success
pub fn echo(request: &RequestMessage) -> Reply {
    match success_for(request) {
        Some(response) => Reply::Respond(vec![response]),
        None => Reply::Silent,
    }
}

pub fn bind_response(id: MessageId, code: ResultCode, creds: Option<&'static [u8]>) -> ResponseMessage {
    Message::new(
        id,
        Response::Bind(BindResponse {
            result: LdapResult::new(code),
            server_sasl_creds: creds.map(Bytes::from_static),
        }),
    )
}

/// Config pointing at `server` with reconnects off and a short connect timeout
pub fn config_for(address: ServerAddress) -> ConnectionConfig {
    let mut config = ConnectionConfig::new(address);
    config.connect_timeout = Duration::from_secs(2);
    config.auto_reconnect = false;
    config.reconnect_backoff = Duration::from_millis(20);
    config.max_reconnect_backoff = Duration::from_millis(100);
    config.close_timeout = Duration::from_secs(2);
    config
}

/// Whether `needle` occurs anywhere in `haystack`
pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Test PKI: a CA and a `localhost` server certificate it signed
pub struct TestPki {
    pub ca_pem: String,
    pub server_config: ServerConfig,
}

pub fn test_pki() -> TestPki {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut ca_params = CertificateParams::new(Vec::<String>::new()).expect("ca params");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "LDAP Test CA");
    let ca_key = KeyPair::generate().expect("Failed to generate CA key pair");
    let ca_cert = ca_params.self_signed(&ca_key).expect("Failed to self-sign CA");

    let mut params = CertificateParams::new(vec!["localhost".to_string()]).expect("server params");
    params.distinguished_name.push(DnType::CommonName, "localhost");
    let key = KeyPair::generate().expect("Failed to generate server key pair");
    let cert = params
        .signed_by(&key, &ca_cert, &ca_key)
        .expect("Failed to sign server certificate");

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![cert.der().clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
        .expect("server TLS config");

    TestPki {
        ca_pem: ca_cert.pem(),
        server_config,
    }
}

const LAYER_KEY: [u8; 32] = [7u8; 32];

/// AEAD security layer with per-direction nonce counters
pub struct ChaChaLayer {
    cipher: ChaCha20Poly1305,
    send_dir: u8,
    recv_dir: u8,
    sent: u64,
    received: u64,
}

impl ChaChaLayer {
    pub fn client() -> Self {
        Self::new(0, 1)
    }

    pub fn server() -> Self {
        Self::new(1, 0)
    }

    fn new(send_dir: u8, recv_dir: u8) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&LAYER_KEY)),
            send_dir,
            recv_dir,
            sent: 0,
            received: 0,
        }
    }

    fn nonce(dir: u8, counter: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[0] = dir;
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }
}

impl SecurityLayer for ChaChaLayer {
    fn wrap(&mut self, plain: &[u8]) -> ldap_session::Result<Vec<u8>> {
        let nonce = Self::nonce(self.send_dir, self.sent);
        self.sent += 1;
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| LdapError::Sasl("encrypt failed".into()))
    }

    fn unwrap(&mut self, wrapped: &[u8]) -> ldap_session::Result<Vec<u8>> {
        let nonce = Self::nonce(self.recv_dir, self.received);
        self.received += 1;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), wrapped)
            .map_err(|_| LdapError::Sasl("decrypt failed".into()))
    }
}

/// Two-step mechanism negotiating confidentiality
pub struct TestMechanism {
    pub challenges: usize,
}

impl SaslMechanism for TestMechanism {
    fn name(&self) -> &str {
        "X-TEST"
    }

    fn initial_response(&mut self) -> ldap_session::Result<Option<Bytes>> {
        Ok(Some(Bytes::from_static(b"hello")))
    }

    fn evaluate_challenge(&mut self, challenge: Option<&[u8]>) -> ldap_session::Result<Option<Bytes>> {
        self.challenges += 1;
        match challenge {
            Some(b"challenge") => Ok(Some(Bytes::from_static(b"response"))),
            _ => Err(LdapError::Sasl("unexpected challenge".into())),
        }
    }

    fn qop(&self) -> QualityOfProtection {
        QualityOfProtection::AuthConf
    }

    fn security_layer(&mut self) -> Option<Box<dyn SecurityLayer>> {
        Some(Box::new(ChaChaLayer::client()))
    }
}
