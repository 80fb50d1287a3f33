//! Operation handles.
//!
//! Every request travels as an [`OperationHandle`]. The connection keeps the
//! shared half in its pending registry keyed by message ID; the caller keeps
//! the handle and awaits its outcome. The outcome is delivered through a
//! oneshot channel whose sender is taken exactly once, so a result, a
//! failure, an abandon and a timeout can race without double delivery.

use crate::connection::{BindPermit, ConnectionInner};
use crate::error::{LdapError, Result};
use bytes::Bytes;
use ldap_wire::{
    encode_with_id, Control, ExtendedResponse, IntermediateResponse, LdapResult, MessageId,
    Request, Response, ResponseMessage, ResultCode, SearchEntry,
};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Outcome of one operation
pub type Outcome = Result<OperationResult>;

/// Non-terminal message routed to a handle
#[derive(Debug, Clone, PartialEq)]
pub enum Intermediate {
    /// Search result entry
    Entry(SearchEntry),
    /// Search result reference URIs
    Reference(Vec<String>),
    /// Intermediate response
    Response(IntermediateResponse),
    /// Unsolicited notification received while in flight
    Notification(ExtendedResponse),
}

/// Final result of an operation with everything gathered before it
#[derive(Debug, Clone)]
pub struct OperationResult {
    /// Message ID the result arrived under
    pub message_id: MessageId,
    /// Terminal response
    pub response: Response,
    /// Controls from intermediate and terminal messages, in arrival order
    pub controls: Vec<Control>,
    /// Search entries, unless streamed to a subscriber
    pub entries: Vec<SearchEntry>,
    /// Search references, unless streamed to a subscriber
    pub references: Vec<Vec<String>>,
    /// Intermediate responses, unless streamed to a subscriber
    pub intermediates: Vec<IntermediateResponse>,
    /// Unsolicited notifications seen while in flight, unless streamed
    pub notifications: Vec<ExtendedResponse>,
}

impl OperationResult {
    /// LDAPResult of the terminal response
    pub fn result(&self) -> Option<&LdapResult> {
        self.response.result()
    }

    /// Result code, if the response carries one
    pub fn code(&self) -> Option<ResultCode> {
        self.result().map(|r| r.code)
    }

    /// Whether the server reported success
    pub fn is_success(&self) -> bool {
        self.result().map(|r| r.is_success()).unwrap_or(false)
    }

    /// Referral URIs from the terminal result
    pub fn referrals(&self) -> &[String] {
        self.result().map(|r| r.referrals.as_slice()).unwrap_or(&[])
    }
}

/// Lifecycle of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleState {
    Created,
    Sent,
    Complete,
}

#[derive(Default)]
struct Collected {
    entries: Vec<SearchEntry>,
    references: Vec<Vec<String>>,
    intermediates: Vec<IntermediateResponse>,
    notifications: Vec<ExtendedResponse>,
    controls: Vec<Control>,
}

impl Collected {
    fn push(&mut self, item: Intermediate) {
        match item {
            Intermediate::Entry(e) => self.entries.push(e),
            Intermediate::Reference(r) => self.references.push(r),
            Intermediate::Response(r) => self.intermediates.push(r),
            Intermediate::Notification(n) => self.notifications.push(n),
        }
    }
}

struct Progress {
    state: HandleState,
    message_id: Option<MessageId>,
    sent_at: Option<Instant>,
    received_at: Option<Instant>,
    replays: u32,
    controls: Vec<Control>,
    response_timeout: Option<Duration>,
    listener: Option<mpsc::UnboundedSender<Intermediate>>,
    collected: Collected,
    completion: Option<oneshot::Sender<Outcome>>,
}

impl Progress {
    fn finish(&mut self) {
        self.state = HandleState::Complete;
        self.listener = None;
    }

    fn is_in_flight(&self) -> bool {
        self.state == HandleState::Sent && self.sent_at.is_some() && self.received_at.is_none()
    }
}

/// Half of a handle shared with the pending registry
pub(crate) struct HandleShared {
    request: Request,
    progress: Mutex<Progress>,
    conn: Weak<ConnectionInner>,
}

impl HandleShared {
    fn new(
        request: Request,
        response_timeout: Option<Duration>,
        conn: Weak<ConnectionInner>,
    ) -> (Arc<Self>, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let shared = Arc::new(Self {
            request,
            progress: Mutex::new(Progress {
                state: HandleState::Created,
                message_id: None,
                sent_at: None,
                received_at: None,
                replays: 0,
                controls: Vec::new(),
                response_timeout,
                listener: None,
                collected: Collected::default(),
                completion: Some(tx),
            }),
            conn,
        });
        (shared, rx)
    }

    #[cfg(test)]
    pub(crate) fn detached(request: Request) -> (Arc<Self>, oneshot::Receiver<Outcome>) {
        Self::new(request, None, Weak::new())
    }

    pub(crate) fn request(&self) -> &Request {
        &self.request
    }

    pub(crate) fn message_id(&self) -> Option<MessageId> {
        self.progress.lock().message_id
    }

    pub(crate) fn state(&self) -> HandleState {
        self.progress.lock().state
    }

    pub(crate) fn is_in_flight(&self) -> bool {
        self.progress.lock().is_in_flight()
    }

    /// Encode under `message_id` and mark sent
    pub(crate) fn prepare_send(&self, message_id: MessageId) -> Result<Bytes> {
        let mut p = self.progress.lock();
        if p.state != HandleState::Created {
            return Err(LdapError::IllegalState(format!(
                "{} operation cannot be sent while {:?}",
                self.request.name(),
                p.state
            )));
        }
        let frame = encode_with_id(message_id, &self.request, &p.controls);
        p.state = HandleState::Sent;
        p.message_id = Some(message_id);
        p.sent_at = Some(Instant::now());
        p.received_at = None;
        Ok(frame)
    }

    /// Route a non-terminal message to the subscriber or the result buffer
    pub(crate) fn deliver(&self, item: Intermediate, controls: Vec<Control>) {
        let mut guard = self.progress.lock();
        let p = &mut *guard;
        if p.state != HandleState::Sent {
            debug!(
                "Dropping intermediate message for {} operation in state {:?}",
                self.request.name(),
                p.state
            );
            return;
        }
        p.collected.controls.extend(controls);
        match p.listener.as_ref() {
            Some(listener) => {
                if let Err(mpsc::error::SendError(item)) = listener.send(item) {
                    // Subscriber went away; keep collecting instead
                    p.listener = None;
                    p.collected.push(item);
                }
            }
            None => p.collected.push(item),
        }
    }

    /// Resolve with the terminal response; false if already resolved
    pub(crate) fn complete_result(&self, message: ResponseMessage) -> bool {
        let (sender, result) = {
            let mut p = self.progress.lock();
            if p.state == HandleState::Complete {
                return false;
            }
            p.finish();
            p.received_at = Some(Instant::now());

            let collected = std::mem::take(&mut p.collected);
            let mut controls = collected.controls;
            controls.extend(message.controls);

            let result = OperationResult {
                message_id: message.message_id,
                response: message.op,
                controls,
                entries: collected.entries,
                references: collected.references,
                intermediates: collected.intermediates,
                notifications: collected.notifications,
            };
            (p.completion.take(), result)
        };

        trace!(
            "Operation {} completed with {}",
            result.message_id,
            result.response.name()
        );
        if let Some(tx) = sender {
            let _ = tx.send(Ok(result));
        }
        true
    }

    /// Resolve with a failure; false if already resolved
    pub(crate) fn complete_exception(&self, err: LdapError) -> bool {
        let sender = {
            let mut p = self.progress.lock();
            if p.state == HandleState::Complete {
                return false;
            }
            p.finish();
            p.completion.take()
        };
        if let Some(tx) = sender {
            let _ = tx.send(Err(err));
        }
        true
    }

    /// Abandon if in flight: forget the ID, tell the server, fail the caller.
    ///
    /// No-op (false) when not sent yet or already resolved.
    pub(crate) fn abandon_with(&self, err: LdapError) -> bool {
        let (message_id, sender) = {
            let mut p = self.progress.lock();
            if !p.is_in_flight() {
                return false;
            }
            p.finish();
            (p.message_id, p.completion.take())
        };

        if let (Some(id), Some(conn)) = (message_id, self.conn.upgrade()) {
            debug!("Abandoning {} operation {}", self.request.name(), id);
            conn.forget(id);
            conn.send_abandon(id);
        }
        if let Some(tx) = sender {
            let _ = tx.send(Err(err));
        }
        true
    }

    /// Response timeout elapsed
    pub(crate) fn expire(&self, limit: Duration) {
        if !self.abandon_with(LdapError::Timeout(limit)) {
            self.complete_exception(LdapError::Timeout(limit));
        }
    }

    /// Reset for a resend after reconnect, within the replay budget
    pub(crate) fn prepare_replay(&self, max_replays: u32) -> bool {
        if self.request.is_bind() {
            return false;
        }
        let mut p = self.progress.lock();
        if p.state == HandleState::Complete || p.replays >= max_replays {
            return false;
        }
        p.replays += 1;
        p.state = HandleState::Created;
        p.message_id = None;
        p.sent_at = None;
        p.received_at = None;
        p.collected = Collected::default();
        true
    }
}

/// Caller's side of one LDAP operation.
///
/// Created by [`crate::Connection::operation`]. Non-bind requests use
/// [`send`](Self::send) then [`wait`](Self::wait), or
/// [`execute`](Self::execute); bind requests must use `execute`, which holds
/// the connection exclusively for the exchange.
pub struct OperationHandle {
    shared: Arc<HandleShared>,
    conn: Arc<ConnectionInner>,
    outcome: oneshot::Receiver<Outcome>,
}

impl OperationHandle {
    pub(crate) fn new(
        conn: Arc<ConnectionInner>,
        request: Request,
        response_timeout: Option<Duration>,
    ) -> Self {
        let (shared, outcome) = HandleShared::new(request, response_timeout, Arc::downgrade(&conn));
        Self {
            shared,
            conn,
            outcome,
        }
    }

    /// Attach request controls; only effective before sending
    pub fn with_controls(self, controls: Vec<Control>) -> Self {
        self.shared.progress.lock().controls = controls;
        self
    }

    /// Override the connection's default response timeout
    pub fn with_response_timeout(self, timeout: Option<Duration>) -> Self {
        self.shared.progress.lock().response_timeout = timeout;
        self
    }

    /// Stream intermediate messages instead of collecting them in the result.
    ///
    /// The receiver ends when the operation resolves.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Intermediate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.progress.lock().listener = Some(tx);
        rx
    }

    /// The request
    pub fn request(&self) -> &Request {
        self.shared.request()
    }

    /// Message ID assigned on the current socket, once sent
    pub fn message_id(&self) -> Option<MessageId> {
        self.shared.message_id()
    }

    /// When the request was last written
    pub fn sent_at(&self) -> Option<Instant> {
        self.shared.progress.lock().sent_at
    }

    /// When the terminal response arrived
    pub fn received_at(&self) -> Option<Instant> {
        self.shared.progress.lock().received_at
    }

    /// Whether the outcome has been decided
    pub fn is_complete(&self) -> bool {
        self.shared.state() == HandleState::Complete
    }

    /// Write the request without waiting for the result
    pub async fn send(&self) -> Result<()> {
        let request = self.shared.request();
        if request.is_bind() || !request.expects_response() {
            let err = LdapError::IllegalState(format!(
                "{} requests cannot be sent through send()",
                request.name()
            ));
            self.shared.complete_exception(err.clone());
            return Err(err);
        }
        self.conn.write(&self.shared, BindPermit::Acquire).await
    }

    /// Wait for the outcome of a sent request
    pub async fn wait(self) -> Outcome {
        if self.shared.request().is_bind() {
            return Err(LdapError::IllegalState(
                "bind requests must use execute()".into(),
            ));
        }
        self.await_outcome().await
    }

    /// Send and wait.
    ///
    /// Bind requests fail fast with [`LdapError::BindInProgress`] if another
    /// bind is running, then wait for writes already under way to reach the
    /// transport. Operations sent earlier stay in flight during the bind.
    pub async fn execute(self) -> Outcome {
        if !self.shared.request().is_bind() {
            self.send().await?;
            return self.await_outcome().await;
        }

        let conn = self.conn.clone();
        let permit = match conn.acquire_bind().await {
            Ok(permit) => permit,
            Err(e) => {
                self.shared.complete_exception(e.clone());
                return Err(e);
            }
        };
        conn.write(&self.shared, BindPermit::Held).await?;
        let outcome = self.await_outcome().await;
        drop(permit);
        outcome
    }

    /// Abandon the operation if it is in flight.
    ///
    /// Returns false, doing nothing, if it was not sent yet or already done.
    pub fn abandon(&self) -> bool {
        self.shared.abandon_with(LdapError::Abandoned)
    }

    pub(crate) fn shared(&self) -> &Arc<HandleShared> {
        &self.shared
    }

    pub(crate) async fn await_outcome(mut self) -> Outcome {
        let limit = self.shared.progress.lock().response_timeout;
        let received = match limit {
            Some(limit) => match tokio::time::timeout(limit, &mut self.outcome).await {
                Ok(received) => received,
                Err(_) => {
                    debug!(
                        "{} operation timed out after {:?}",
                        self.shared.request().name(),
                        limit
                    );
                    self.shared.expire(limit);
                    (&mut self.outcome).await
                }
            },
            None => (&mut self.outcome).await,
        };
        received.unwrap_or_else(|_| {
            Err(LdapError::Internal(
                "operation dropped without a result".into(),
            ))
        })
    }
}

impl std::fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let p = self.shared.progress.lock();
        f.debug_struct("OperationHandle")
            .field("request", &self.shared.request.name())
            .field("message_id", &p.message_id)
            .field("state", &p.state)
            .finish()
    }
}
