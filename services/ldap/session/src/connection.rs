//! LDAP connection lifecycle, request writing and response dispatch.
//!
//! A [`Connection`] owns one socket at a time, driven by an I/O task. Three
//! gates coordinate callers:
//!
//! - the reconnect gate: writes share it, reconnect holds it exclusively, so
//!   writes wait (up to `reconnect_timeout`) while the socket is replaced;
//! - the bind gate: writes share it and fail fast with
//!   [`LdapError::BindInProgress`] while a bind or StartTLS holds it;
//! - the close lock: serializes close against transport-loss handling.
//!
//! Message IDs restart at 1 on every socket. Assigning an ID, registering the
//! handle and queueing the frame happen under one lock, so IDs reach the
//! wire in increasing order.

use crate::config::{ConnectionConfig, ServerAddress};
use crate::driver::{IoCommand, IoDriver};
use crate::error::{LdapError, Result};
use crate::handle::{HandleShared, Intermediate, OperationHandle, OperationResult, Outcome};
use crate::initializer::ConnectionInitializer;
use crate::registry::HandleMap;
use crate::security::{SaslMechanism, SecurityLayer};
use crate::transport::{tls, IoStream, TcpTransport, Transport};
use bytes::Bytes;
use futures::future::BoxFuture;
use ldap_wire::{
    encode_with_id, BindRequest, ExtendedRequest, Message, MessageId, Request, Response,
    ResponseMessage, ResultCode, STARTTLS_OID,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{
    mpsc, oneshot, Mutex as AsyncMutex, OwnedRwLockWriteGuard, RwLock, RwLockWriteGuard,
};
use tracing::{debug, error, info, trace, warn};

tokio::task_local! {
    /// Set while a task runs the open sequence; its writes bypass the
    /// reconnect gate, which a reconnecting opener already holds
    static OPENER: ();
}

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket
    Closed,
    /// Socket up, StartTLS and initializers running
    Opening,
    /// Ready for operations
    Open,
    /// Close in progress
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Opening => "opening",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Connection statistics
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// When the current socket finished opening
    pub opened_at: Option<Instant>,
    /// Successful reconnects
    pub reconnects: u64,
    /// Requests re-sent after a reconnect
    pub replayed: u64,
    /// Most recent transport failure
    pub last_error: Option<LdapError>,
    /// Requests awaiting a result
    pub pending: usize,
}

/// Whether a write must take a shared bind permit
pub(crate) enum BindPermit {
    /// Take it, failing fast if a bind holds the connection
    Acquire,
    /// The caller holds the bind gate exclusively
    Held,
}

struct WireState {
    next_id: MessageId,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    commands: Option<mpsc::UnboundedSender<IoCommand>>,
    generation: u64,
    tls_active: bool,
    sasl_active: bool,
}

/// Exclusive hold on the bind gate.
///
/// Empty for the opener: while opening, only its own writes are admitted.
pub(crate) struct BindGuard<'a> {
    // Cleared before the lock is released
    _flag: Option<BindFlag<'a>>,
    _lock: Option<RwLockWriteGuard<'a, ()>>,
}

struct BindFlag<'a>(&'a AtomicBool);

impl Drop for BindFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn next_message_id(id: MessageId) -> MessageId {
    if id >= MessageId::MAX {
        1
    } else {
        id + 1
    }
}

/// Requests whose sender holds the bind gate exclusively; never replayed
fn is_exclusive(request: &Request) -> bool {
    match request {
        Request::Bind(_) => true,
        Request::Extended(extended) => extended.oid == STARTTLS_OID,
        _ => false,
    }
}

fn response_matches(request: &Request, response: &Response) -> bool {
    matches!(
        (request, response),
        (Request::Bind(_), Response::Bind(_))
            | (Request::Search(_), Response::SearchDone(_))
            | (Request::Modify(_), Response::Modify(_))
            | (Request::Add(_), Response::Add(_))
            | (Request::Delete(_), Response::Delete(_))
            | (Request::ModifyDn(_), Response::ModifyDn(_))
            | (Request::Compare(_), Response::Compare(_))
            | (Request::Extended(_), Response::Extended(_))
    )
}

pub(crate) struct ConnectionInner {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    initializers: Vec<Arc<dyn ConnectionInitializer>>,
    registry: HandleMap,
    state: Mutex<ConnectionState>,
    wire: Mutex<WireState>,
    reconnect_gate: Arc<RwLock<()>>,
    bind_gate: Arc<RwLock<()>>,
    binding: AtomicBool,
    close_lock: AsyncMutex<()>,
    closed_by_user: AtomicBool,
    stats: Mutex<ConnectionStats>,
}

impl ConnectionInner {
    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn ensure_closed(&self) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Closed {
            return Err(LdapError::IllegalState(format!(
                "connection to {} is {}",
                self.config.address, state
            )));
        }
        Ok(())
    }

    async fn open(self: &Arc<Self>) -> Result<()> {
        self.config.validate()?;
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Closed {
                return Err(LdapError::IllegalState(format!(
                    "cannot open connection while {}",
                    *state
                )));
            }
            *state = ConnectionState::Opening;
        }
        info!("Opening connection to {}", self.config.address);

        match OPENER.scope((), self.open_sequence()).await {
            Ok(()) => {
                let opened = {
                    let mut state = self.state.lock();
                    if *state == ConnectionState::Opening {
                        *state = ConnectionState::Open;
                        true
                    } else {
                        false
                    }
                };
                if !opened {
                    return Err(LdapError::Closed(
                        "connection closed while opening".into(),
                    ));
                }
                self.stats.lock().opened_at = Some(Instant::now());
                info!("Connection to {} open", self.config.address);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to open connection to {}: {}", self.config.address, e);
                self.close().await;
                self.stats.lock().last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    async fn open_sequence(self: &Arc<Self>) -> Result<()> {
        self.establish().await?;

        if self.config.use_start_tls {
            self.start_tls().await?;
        }

        let connection = Connection {
            inner: self.clone(),
        };
        for initializer in &self.initializers {
            initializer.initialize(&connection).await?;
        }
        Ok(())
    }

    async fn establish(self: &Arc<Self>) -> Result<()> {
        let address = &self.config.address;
        let raw = self
            .transport
            .connect(address, self.config.connect_timeout)
            .await?;

        let stream = if address.is_ldaps() {
            let settings = self.config.tls.as_ref().ok_or_else(|| {
                LdapError::Tls("TLS settings required for ldaps://".into())
            })?;
            tls::connect_tls(
                settings.client_config.clone(),
                raw,
                &self.config.tls_server_name(),
            )
            .await?
        } else {
            IoStream::Plain(raw)
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let generation = {
            let mut wire = self.wire.lock();
            wire.generation += 1;
            wire.next_id = 1;
            wire.tls_active = stream.is_tls();
            wire.sasl_active = false;
            wire.outbound = Some(outbound_tx);
            wire.commands = Some(command_tx);
            wire.generation
        };

        let driver = IoDriver::new(
            stream,
            outbound_rx,
            command_rx,
            Arc::downgrade(self),
            generation,
            self.config.max_frame_size,
            self.config.read_timeout,
        );
        tokio::spawn(driver.run());

        self.registry.open();
        debug!("Transport {} established to {}", generation, address);
        Ok(())
    }

    fn detach_wire(&self) -> Option<mpsc::UnboundedSender<IoCommand>> {
        let mut wire = self.wire.lock();
        wire.outbound = None;
        wire.tls_active = false;
        wire.sasl_active = false;
        wire.commands.take()
    }

    pub(crate) async fn close(self: &Arc<Self>) {
        let _guard = self.close_lock.lock().await;

        let active = {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Open | ConnectionState::Opening => {
                    *state = ConnectionState::Closing;
                    true
                }
                _ => false,
            }
        };

        if !active {
            if !(self.config.auto_reconnect && self.config.auto_replay) {
                self.registry
                    .notify_all_of_failure(LdapError::Closed("connection closed".into()));
            }
            return;
        }

        info!("Closing connection to {}", self.config.address);
        self.registry.close();
        let abandoned = self.registry.abandon_in_flight();
        if abandoned > 0 {
            debug!("Abandoned {} in-flight operations", abandoned);
        }
        self.send_unregistered(Request::Unbind);

        if let Some(commands) = self.detach_wire() {
            let (ack, done) = oneshot::channel();
            if commands.send(IoCommand::Shutdown { ack }).is_ok()
                && tokio::time::timeout(self.config.close_timeout, done)
                    .await
                    .is_err()
            {
                warn!(
                    "I/O task for {} did not stop within {:?}",
                    self.config.address, self.config.close_timeout
                );
            }
        }

        *self.state.lock() = ConnectionState::Closed;
        self.stats.lock().opened_at = None;
        self.registry
            .notify_all_of_failure(LdapError::Closed("connection closed".into()));
        debug!("Connection to {} closed", self.config.address);
    }

    /// Called by the I/O task when its socket fails.
    ///
    /// Returns a boxed future: it may spawn a reconnect, which in turn
    /// spawns a new I/O task.
    pub(crate) fn on_transport_closed(
        self: Arc<Self>,
        generation: u64,
        err: LdapError,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let close_guard = self.close_lock.lock().await;

            let current = self.wire.lock().generation;
            if current != generation {
                debug!("Ignoring loss of stale transport {}", generation);
                return;
            }

            let previous = {
                let mut state = self.state.lock();
                let previous = *state;
                if matches!(previous, ConnectionState::Open | ConnectionState::Opening) {
                    *state = ConnectionState::Closed;
                }
                previous
            };

            match previous {
                ConnectionState::Open => {}
                ConnectionState::Opening => {
                    // The opener sees its own operations fail and cleans up
                    debug!("Transport lost while opening: {}", err);
                    self.registry.close();
                    self.detach_wire();
                    self.registry
                        .notify_all_of_failure(LdapError::Closed(err.to_string()));
                    return;
                }
                _ => return,
            }

            warn!("Connection to {} lost: {}", self.config.address, err);
            self.stats.lock().last_error = Some(err.clone());
            self.stats.lock().opened_at = None;
            self.registry.close();
            self.detach_wire();
            drop(close_guard);

            if self.config.auto_reconnect {
                let gate = self.reconnect_gate.clone().write_owned().await;
                let inner = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = inner.reconnect_exclusive(gate).await {
                        error!("Reconnect to {} failed: {}", inner.config.address, e);
                    }
                });
            } else {
                self.registry
                    .notify_all_of_failure(LdapError::Closed(err.to_string()));
            }
        })
    }

    pub(crate) async fn reconnect(self: &Arc<Self>) -> Result<()> {
        self.ensure_closed()?;
        let gate = self.reconnect_gate.clone().write_owned().await;
        self.reconnect_exclusive(gate).await
    }

    async fn reconnect_exclusive(self: &Arc<Self>, gate: OwnedRwLockWriteGuard<()>) -> Result<()> {
        // Another reconnect may have won while we waited for the gate
        self.ensure_closed()?;

        // Binds and StartTLS are never replayed; their callers must release
        // the bind gate before initializers bind
        let (exclusive, pending): (Vec<_>, Vec<_>) = self
            .registry
            .clear()
            .into_iter()
            .partition(|handle| is_exclusive(handle.request()));
        for handle in exclusive {
            debug!("Failing {} request cut off by connection loss", handle.request().name());
            handle.complete_exception(LdapError::Closed(
                "connection lost before a result arrived".into(),
            ));
        }
        let attempts = self.config.reconnect_attempts.max(1);
        let mut backoff = self.config.reconnect_backoff;
        let mut attempt = 0;

        let result = loop {
            if self.closed_by_user.load(Ordering::Acquire) {
                break Err(LdapError::Closed("connection closed during reconnect".into()));
            }
            attempt += 1;
            info!(
                "Reconnecting to {} (attempt {}/{}, {} pending)",
                self.config.address,
                attempt,
                attempts,
                pending.len()
            );

            match self.open().await {
                Ok(()) => break Ok(()),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        "Reconnect to {} failed: {}; retrying in {:?}",
                        self.config.address, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.max_reconnect_backoff);
                }
                Err(e) => break Err(e),
            }
        };
        drop(gate);

        match result {
            Ok(()) => {
                self.stats.lock().reconnects += 1;
                self.replay(pending).await;
                Ok(())
            }
            Err(e) => {
                let failure = LdapError::Connect(format!("reconnect failed: {}", e));
                for handle in pending {
                    handle.complete_exception(failure.clone());
                }
                Err(e)
            }
        }
    }

    async fn replay(self: &Arc<Self>, pending: Vec<Arc<HandleShared>>) {
        for handle in pending {
            if self.config.auto_replay && handle.prepare_replay(self.config.max_replays) {
                debug!("Replaying {} request", handle.request().name());
                if self.write(&handle, BindPermit::Acquire).await.is_ok() {
                    self.stats.lock().replayed += 1;
                }
            } else {
                handle.complete_exception(LdapError::Closed(
                    "connection lost before a result arrived".into(),
                ));
            }
        }
    }

    /// Write a request, failing its handle on error
    pub(crate) async fn write(&self, handle: &Arc<HandleShared>, permit: BindPermit) -> Result<()> {
        let result = self.write_gated(handle, permit).await;
        if let Err(e) = &result {
            debug!("Failed to write {} request: {}", handle.request().name(), e);
            handle.complete_exception(e.clone());
        }
        result
    }

    async fn write_gated(&self, handle: &Arc<HandleShared>, permit: BindPermit) -> Result<()> {
        let opener = OPENER.try_with(|_| ()).is_ok();

        let _reconnect = if opener {
            None
        } else {
            let permit = match self.config.reconnect_timeout {
                Some(limit) => tokio::time::timeout(limit, self.reconnect_gate.read())
                    .await
                    .map_err(|_| LdapError::ReconnectInProgress)?,
                None => self.reconnect_gate.read().await,
            };
            Some(permit)
        };

        match self.state() {
            ConnectionState::Open => {}
            ConnectionState::Opening if opener => {}
            other => {
                return Err(LdapError::Closed(format!(
                    "connection to {} is {}",
                    self.config.address, other
                )))
            }
        }

        // Both permits are released once the frame is queued
        let _bind = match permit {
            BindPermit::Acquire => Some(
                self.bind_gate
                    .try_read()
                    .map_err(|_| LdapError::BindInProgress)?,
            ),
            BindPermit::Held => None,
        };

        self.enqueue(handle)
    }

    fn enqueue(&self, handle: &Arc<HandleShared>) -> Result<()> {
        let mut wire = self.wire.lock();
        let outbound = wire
            .outbound
            .clone()
            .ok_or_else(|| LdapError::Closed("transport unavailable".into()))?;

        let id = wire.next_id;
        let frame = handle.prepare_send(id)?;
        if let Some(previous) = self.registry.put(id, handle.clone())? {
            let _ = self.registry.put(id, previous);
            error!("Message ID {} is already pending", id);
            return Err(LdapError::Internal(format!(
                "message ID {} already in use",
                id
            )));
        }
        wire.next_id = next_message_id(id);

        if outbound.send(frame).is_err() {
            self.registry.remove(id);
            return Err(LdapError::Closed("transport closed".into()));
        }
        trace!(message_id = id, "Queued {} request", handle.request().name());
        Ok(())
    }

    /// Queue a request that gets no response (Abandon, Unbind)
    fn send_unregistered(&self, request: Request) {
        let mut wire = self.wire.lock();
        let Some(outbound) = wire.outbound.clone() else {
            return;
        };
        let id = wire.next_id;
        wire.next_id = next_message_id(id);
        if outbound.send(encode_with_id(id, &request, &[])).is_err() {
            debug!("Dropped {} request: transport closed", request.name());
        }
    }

    pub(crate) fn send_abandon(&self, id: MessageId) {
        self.send_unregistered(Request::Abandon(id));
    }

    pub(crate) fn forget(&self, id: MessageId) {
        self.registry.remove(id);
    }

    pub(crate) fn dispatch(&self, message: ResponseMessage) {
        let id = message.message_id;
        if id == 0 {
            self.on_unsolicited(message);
            return;
        }

        let Some(handle) = self.registry.get(id) else {
            debug!(message_id = id, "Dropping {} for unknown message ID", message.op.name());
            return;
        };

        if message.op.is_terminal() {
            self.registry.remove(id);
            if response_matches(handle.request(), &message.op) {
                handle.complete_result(message);
            } else {
                handle.complete_exception(LdapError::Protocol(format!(
                    "{} received for {} request",
                    message.op.name(),
                    handle.request().name()
                )));
            }
            return;
        }

        let Message { op, controls, .. } = message;
        let item = match op {
            Response::SearchEntry(entry) => Intermediate::Entry(entry),
            Response::SearchReference(uris) => Intermediate::Reference(uris),
            Response::Intermediate(response) => Intermediate::Response(response),
            other => {
                warn!("Unexpected {} for message ID {}", other.name(), id);
                return;
            }
        };
        handle.deliver(item, controls);
    }

    pub(crate) fn dispatch_undecodable(&self, id: Option<MessageId>, err: LdapError) {
        match id.filter(|id| *id != 0).and_then(|id| self.registry.remove(id)) {
            Some(handle) => {
                handle.complete_exception(err);
            }
            None => debug!("Undecodable response matched no pending request: {}", err),
        }
    }

    fn on_unsolicited(&self, message: ResponseMessage) {
        let Response::Extended(notification) = message.op else {
            warn!("Ignoring unsolicited {}", message.op.name());
            return;
        };

        if notification.is_notice_of_disconnection() {
            warn!(
                "Server {} sent notice of disconnection: {:?} {}",
                self.config.address,
                notification.result.code,
                notification.result.diagnostic_message
            );
        } else {
            info!(
                "Unsolicited notification {:?} from {}",
                notification.name, self.config.address
            );
        }

        let delivered = self.registry.notify_all_of_unsolicited(&notification);
        debug!("Notification delivered to {} pending operations", delivered);
    }

    pub(crate) async fn acquire_bind(&self) -> Result<BindGuard<'_>> {
        if OPENER.try_with(|_| ()).is_ok() {
            return Ok(BindGuard {
                _flag: None,
                _lock: None,
            });
        }
        if self
            .binding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LdapError::BindInProgress);
        }
        let flag = BindFlag(&self.binding);
        let lock = self.bind_gate.write().await;
        Ok(BindGuard {
            _flag: Some(flag),
            _lock: Some(lock),
        })
    }

    fn new_handle(self: &Arc<Self>, request: Request) -> OperationHandle {
        OperationHandle::new(self.clone(), request, self.config.response_timeout)
    }

    fn command(&self, command: IoCommand) -> Result<()> {
        let commands = self
            .wire
            .lock()
            .commands
            .clone()
            .ok_or_else(|| LdapError::Closed("transport unavailable".into()))?;
        commands
            .send(command)
            .map_err(|_| LdapError::Closed("transport closed".into()))
    }

    pub(crate) async fn start_tls(self: &Arc<Self>) -> Result<()> {
        let settings = self
            .config
            .tls
            .clone()
            .ok_or_else(|| LdapError::Tls("no TLS settings configured".into()))?;
        let tls_active = self.wire.lock().tls_active;
        if tls_active {
            return Err(LdapError::Connect("TLS already active".into()));
        }

        let _permit = self.acquire_bind().await?;

        let handle = self.new_handle(Request::Extended(ExtendedRequest::start_tls()));
        self.write(handle.shared(), BindPermit::Held).await?;
        let result = handle.await_outcome().await?;
        if !result.is_success() {
            let (code, message) = result
                .result()
                .map(|r| (r.code, r.diagnostic_message.clone()))
                .unwrap_or((ResultCode::Other, String::new()));
            return Err(LdapError::Tls(format!(
                "StartTLS refused: {:?} {}",
                code, message
            )));
        }

        let (ack, done) = oneshot::channel();
        self.command(IoCommand::StartTls {
            config: settings.client_config.clone(),
            server_name: self.config.tls_server_name(),
            ack,
        })?;
        done.await
            .map_err(|_| LdapError::Closed("transport closed during TLS handshake".into()))??;

        self.wire.lock().tls_active = true;
        info!("StartTLS complete with {}", self.config.address);
        Ok(())
    }

    pub(crate) async fn sasl_bind(
        self: &Arc<Self>,
        mechanism: &mut dyn SaslMechanism,
    ) -> Result<OperationResult> {
        let sasl_active = self.wire.lock().sasl_active;
        if sasl_active {
            return Err(LdapError::IllegalState(
                "SASL security layer already installed".into(),
            ));
        }

        let _permit = self.acquire_bind().await?;
        debug!("SASL bind using {}", mechanism.name());

        let mut credentials = mechanism.initial_response()?;
        loop {
            let request = Request::Bind(BindRequest::sasl(mechanism.name(), credentials.take()));
            let handle = self.new_handle(request);
            self.write(handle.shared(), BindPermit::Held).await?;
            let result = handle.await_outcome().await?;

            let (code, server_creds) = match &result.response {
                Response::Bind(bind) => (bind.result.code, bind.server_sasl_creds.clone()),
                other => {
                    return Err(LdapError::Protocol(format!(
                        "{} received for bind request",
                        other.name()
                    )))
                }
            };

            match code {
                ResultCode::SaslBindInProgress => {
                    credentials = mechanism.evaluate_challenge(server_creds.as_deref())?;
                }
                ResultCode::Success => {
                    mechanism.complete(server_creds.as_deref())?;
                    let qop = mechanism.qop();
                    if qop.needs_layer() {
                        let layer = mechanism.security_layer().ok_or_else(|| {
                            LdapError::Sasl(format!(
                                "{} negotiated {} without a security layer",
                                mechanism.name(),
                                qop.as_str()
                            ))
                        })?;
                        self.install_security_layer(layer).await?;
                        info!("SASL {} security layer installed", qop.as_str());
                    }
                    return Ok(result);
                }
                _ => return Ok(result),
            }
        }
    }

    async fn install_security_layer(&self, layer: Box<dyn SecurityLayer>) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.command(IoCommand::InstallSecurityLayer { layer, ack })?;
        done.await
            .map_err(|_| LdapError::Closed("transport closed while installing security layer".into()))?;
        self.wire.lock().sasl_active = true;
        Ok(())
    }
}

/// An LDAP connection.
///
/// Cheap to clone; clones share the socket and pending requests.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

/// Builder for connections with a custom transport or initializers
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    initializers: Vec<Arc<dyn ConnectionInitializer>>,
}

impl ConnectionBuilder {
    /// Open sockets through `transport` instead of plain TCP
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    /// Run `initializer` after every open, including reconnects
    pub fn initializer(mut self, initializer: impl ConnectionInitializer + 'static) -> Self {
        self.initializers.push(Arc::new(initializer));
        self
    }

    /// Build the connection; it starts closed
    pub fn build(self) -> Connection {
        Connection {
            inner: Arc::new(ConnectionInner {
                config: self.config,
                transport: self.transport,
                initializers: self.initializers,
                registry: HandleMap::new(),
                state: Mutex::new(ConnectionState::Closed),
                wire: Mutex::new(WireState {
                    next_id: 1,
                    outbound: None,
                    commands: None,
                    generation: 0,
                    tls_active: false,
                    sasl_active: false,
                }),
                reconnect_gate: Arc::new(RwLock::new(())),
                bind_gate: Arc::new(RwLock::new(())),
                binding: AtomicBool::new(false),
                close_lock: AsyncMutex::new(()),
                closed_by_user: AtomicBool::new(false),
                stats: Mutex::new(ConnectionStats::default()),
            }),
        }
    }
}

impl Connection {
    /// Connection over plain TCP with no initializers
    pub fn new(config: ConnectionConfig) -> Self {
        Self::builder(config).build()
    }

    /// Start building a connection
    pub fn builder(config: ConnectionConfig) -> ConnectionBuilder {
        ConnectionBuilder {
            config,
            transport: Arc::new(TcpTransport),
            initializers: Vec::new(),
        }
    }

    /// Connect, then run StartTLS (if configured) and the initializers.
    ///
    /// On any failure the connection is closed again and the error returned.
    pub async fn open(&self) -> Result<()> {
        self.inner.closed_by_user.store(false, Ordering::Release);
        self.inner.open().await
    }

    /// Abandon in-flight operations, unbind, and close the socket.
    ///
    /// Safe to call repeatedly.
    pub async fn close(&self) {
        self.inner.closed_by_user.store(true, Ordering::Release);
        self.inner.close().await
    }

    /// Reopen a closed connection and replay pending requests
    pub async fn reconnect(&self) -> Result<()> {
        self.inner.closed_by_user.store(false, Ordering::Release);
        self.inner.reconnect().await
    }

    /// Create a handle for `request`
    pub fn operation(&self, request: Request) -> OperationHandle {
        self.inner.new_handle(request)
    }

    /// Bind, holding the connection exclusively until the result arrives
    pub async fn bind(&self, request: BindRequest) -> Outcome {
        self.operation(Request::Bind(request)).execute().await
    }

    /// Run a SASL bind to completion, installing a security layer if the
    /// mechanism negotiated one
    pub async fn sasl_bind(&self, mechanism: &mut dyn SaslMechanism) -> Outcome {
        self.inner.sasl_bind(mechanism).await
    }

    /// Upgrade the socket with StartTLS.
    ///
    /// Fails with [`LdapError::Connect`] if TLS is already active.
    pub async fn start_tls(&self) -> Result<()> {
        self.inner.start_tls().await
    }

    /// Ask the server who this connection is bound as (RFC 4532)
    pub async fn who_am_i(&self) -> Result<String> {
        let result = self
            .operation(Request::Extended(ExtendedRequest::who_am_i()))
            .execute()
            .await?;
        match result.response {
            Response::Extended(response) if response.result.is_success() => Ok(response
                .value
                .map(|v| String::from_utf8_lossy(&v).into_owned())
                .unwrap_or_default()),
            Response::Extended(response) => Err(LdapError::Protocol(format!(
                "Who am I? failed: {:?} {}",
                response.result.code, response.result.diagnostic_message
            ))),
            other => Err(LdapError::Protocol(format!(
                "{} received for extended request",
                other.name()
            ))),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Whether operations can be sent
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Whether TLS protects the current socket
    pub fn is_tls(&self) -> bool {
        self.inner.wire.lock().tls_active
    }

    /// Whether a SASL security layer wraps the current socket
    pub fn has_security_layer(&self) -> bool {
        self.inner.wire.lock().sasl_active
    }

    /// Server address
    pub fn address(&self) -> &ServerAddress {
        &self.inner.config.address
    }

    /// Configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Requests awaiting a result
    pub fn pending_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> ConnectionStats {
        let mut stats = self.inner.stats.lock().clone();
        stats.pending = self.inner.registry.len();
        stats
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.inner.config.address.to_string())
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}
