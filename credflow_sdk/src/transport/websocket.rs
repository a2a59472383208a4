//! Persistent-connection transport.
//!
//! One long-lived channel carries every flow. Each outbound request is tagged
//! with a fresh `flowId` and parked in a pending table until the response with
//! the same `flowId` arrives, its timeout fires, or the channel goes away.
//! `progress` messages are broadcast to subscribers and never settle a request.
//!
//! Connection states: `Disconnected -> Connecting -> Open -> Disconnected`.
//! Concurrent [WebSocketTransport::connect] calls share one connection attempt.
//! An unclean close rejects everything pending and schedules reconnection with
//! exponential backoff; when the attempt budget runs out a single
//! [TransportError::ReconnectionExhausted] is reported to error subscribers.

use async_trait::async_trait;
use futures::{
    StreamExt,
    channel::mpsc,
    future::{BoxFuture, FutureExt, Shared},
};
use serde_json::{Map, Value};
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{
    ErrorCallback, ProgressCallback, Subscribers, Subscription, Transport, TransportError,
    channel::{CLOSE_ABNORMAL, CLOSE_NORMAL, ChannelEvent, Connector, EventStream, Frame, redact},
};
use crate::{
    definitions::{
        FlowProgressEvent, FlowRequest, FlowResponse, InboundMessage, IssuanceFlowParams,
        IssuanceFlowResult, MESSAGE_GENERIC_REQUEST, PresentationFlowParams,
        PresentationFlowResult, TransportType,
    },
    retry::RetryPolicy,
    token::AuthToken,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Generate a fresh correlation id
pub fn new_flow_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub url: Url,
    pub request_timeout: Duration,
    pub reconnect: RetryPolicy,
}

impl WebSocketConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect: RetryPolicy::default(),
        }
    }
}

/// Observable connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Open,
}

type Outcome = Result<InboundMessage, TransportError>;
type ConnectAttempt = Shared<BoxFuture<'static, Result<(), TransportError>>>;

enum LinkState {
    Disconnected,
    Connecting(ConnectAttempt),
    Open(Link),
}

struct Link {
    generation: u64,
    outbound: mpsc::UnboundedSender<Frame>,
}

struct PendingRequest {
    ticket: u64,
    respond: oneshot::Sender<Outcome>,
}

struct Inner {
    config: WebSocketConfig,
    connector: Arc<dyn Connector>,
    token: AuthToken,
    state: Mutex<LinkState>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    progress: Subscribers<FlowProgressEvent>,
    errors: Subscribers<TransportError>,
    generation: AtomicU64,
    tickets: AtomicU64,
    shutdown: AtomicBool,
}

/// Transport multiplexing flows over one persistent channel
#[derive(Clone)]
pub struct WebSocketTransport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("url", &self.inner.config.url.as_str())
            .field("phase", &self.phase())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

impl WebSocketTransport {
    pub fn new(config: WebSocketConfig, connector: Arc<dyn Connector>, token: AuthToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                token,
                state: Mutex::new(LinkState::Disconnected),
                pending: Mutex::new(HashMap::new()),
                progress: Subscribers::new(),
                errors: Subscribers::new(),
                generation: AtomicU64::new(0),
                tickets: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        match &*self.inner.lock_state() {
            LinkState::Disconnected => ConnectionPhase::Disconnected,
            LinkState::Connecting(_) => ConnectionPhase::Connecting,
            LinkState::Open(_) => ConnectionPhase::Open,
        }
    }

    /// Number of requests waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.inner.lock_pending().len()
    }

    #[cfg(test)]
    pub(crate) fn subscriber_counts(&self) -> (usize, usize) {
        (self.inner.progress.len(), self.inner.errors.len())
    }

    /// Rotate the auth token. Requests in flight are unaffected; the token is
    /// used from the next connection attempt on.
    pub fn set_auth_token(&self, token: Option<String>) {
        self.inner.token.set(token);
    }

    /// Open the channel, joining an attempt that is already running
    pub async fn connect(&self) -> Result<(), TransportError> {
        Inner::connect(&self.inner).await
    }

    /// Close the channel intentionally; pending requests fail with
    /// [TransportError::Disconnected] and no reconnection is attempted
    pub async fn disconnect(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        let previous = std::mem::replace(&mut *self.inner.lock_state(), LinkState::Disconnected);
        let rejected = self.inner.reject_all();

        if let LinkState::Open(link) = previous {
            // dropping the sender afterwards lets the writer close the channel
            let _ = link.outbound.unbounded_send(Frame::Close(CLOSE_NORMAL));
            info!(
                "disconnected from {}, {rejected} pending requests rejected",
                self.inner.config.url
            );
        }
    }

    async fn round_trip(
        &self,
        mut message: Map<String, Value>,
        flow_id: Option<String>,
    ) -> Result<InboundMessage, TransportError> {
        let flow_id = flow_id.filter(|id| !id.is_empty()).unwrap_or_else(new_flow_id);
        message.insert("flowId".into(), Value::String(flow_id.clone()));
        let text = Value::Object(message).to_string();

        let ticket = self.inner.tickets.fetch_add(1, Ordering::SeqCst);
        let (respond, response) = oneshot::channel();
        let outbound = self.inner.register(&flow_id, PendingRequest { ticket, respond })?;
        let _entry = PendingEntry {
            inner: &self.inner,
            flow_id: &flow_id,
            ticket,
        };

        outbound
            .unbounded_send(Frame::Text(text))
            .map_err(|_| TransportError::NotConnected)?;
        debug!("sent request {flow_id}");

        let timeout = self.inner.config.request_timeout;
        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => {
                warn!("request {flow_id} timed out after {timeout:?}");
                Err(TransportError::RequestTimeout {
                    flow_id: flow_id.clone(),
                    timeout,
                })
            }
        }
    }
}

/// Removes a request's own pending entry however its wait ends
struct PendingEntry<'a> {
    inner: &'a Inner,
    flow_id: &'a str,
    ticket: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        let mut pending = self.inner.lock_pending();
        if pending
            .get(self.flow_id)
            .is_some_and(|entry| entry.ticket == self.ticket)
        {
            pending.remove(self.flow_id);
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enters a request into the pending table while the link is held open.
    ///
    /// Lock order is state then pending; a close flips the state before it
    /// drains the table, so every entry made here is seen by that drain.
    fn register(
        &self,
        flow_id: &str,
        request: PendingRequest,
    ) -> Result<mpsc::UnboundedSender<Frame>, TransportError> {
        let state = self.lock_state();
        let LinkState::Open(link) = &*state else {
            return Err(TransportError::NotConnected);
        };

        let mut pending = self.lock_pending();
        if pending.contains_key(flow_id) {
            return Err(TransportError::InvalidFlowParams(format!(
                "flow id '{flow_id}' already has a request in flight"
            )));
        }
        pending.insert(flow_id.to_string(), request);

        Ok(link.outbound.clone())
    }

    fn connection_url(&self) -> Url {
        let mut url = self.config.url.clone();
        if let Some(token) = self.token.get() {
            url.query_pairs_mut().append_pair("token", &token);
        }

        url
    }

    async fn connect(this: &Arc<Self>) -> Result<(), TransportError> {
        let attempt = {
            let mut state = this.lock_state();
            match &*state {
                LinkState::Open(_) => return Ok(()),
                LinkState::Connecting(attempt) => attempt.clone(),
                LinkState::Disconnected => {
                    this.shutdown.store(false, Ordering::SeqCst);
                    let attempt = Self::open(this.clone()).boxed().shared();
                    *state = LinkState::Connecting(attempt.clone());
                    attempt
                }
            }
        };

        attempt.await
    }

    async fn open(this: Arc<Self>) -> Result<(), TransportError> {
        let generation = this.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let url = this.connection_url();
        info!("connecting to {}", redact(&url));

        let channel = match this.connector.open(&url).await {
            Ok(channel) => channel,
            Err(e) => {
                let mut state = this.lock_state();
                if this.generation.load(Ordering::SeqCst) == generation {
                    *state = LinkState::Disconnected;
                }
                return Err(e);
            }
        };

        let (outbound, frames) = mpsc::unbounded();
        {
            let mut state = this.lock_state();
            if this.generation.load(Ordering::SeqCst) != generation {
                // disconnect() ran while the channel was opening
                return Err(TransportError::Disconnected);
            }
            *state = LinkState::Open(Link {
                generation,
                outbound,
            });
        }

        tokio::spawn(async move {
            if let Err(e) = frames.map(Ok).forward(channel.sink).await {
                debug!("flow channel writer stopped: {e}");
            }
        });
        tokio::spawn(Self::read_loop(
            Arc::downgrade(&this),
            generation,
            channel.events,
        ));

        info!("connected to {}", this.config.url);
        Ok(())
    }

    async fn read_loop(inner: Weak<Self>, generation: u64, mut events: EventStream) {
        while let Some(event) = events.next().await {
            let Some(this) = inner.upgrade() else {
                return;
            };

            match event {
                ChannelEvent::Text(text) => this.dispatch(&text),
                ChannelEvent::Closed { code, reason } => {
                    this.handle_close(generation, code, &reason);
                    return;
                }
            }
        }

        if let Some(this) = inner.upgrade() {
            this.handle_close(generation, CLOSE_ABNORMAL, "channel ended");
        }
    }

    fn dispatch(&self, text: &str) {
        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("dropping undecodable message: {e}");
                return;
            }
        };

        if message.is_progress() {
            match message.progress_event() {
                Some(event) => {
                    self.progress.emit(&event);
                }
                None => warn!("dropping progress message without flow id or stage"),
            }
            return;
        }

        let Some(flow_id) = message.flow_id.as_deref() else {
            warn!("dropping '{}' message without flow id", message.kind);
            return;
        };

        let Some(entry) = self.lock_pending().remove(flow_id) else {
            warn!(
                "dropping '{}' message for {flow_id}: no request is pending",
                message.kind
            );
            return;
        };

        debug!("received '{}' for {flow_id}", message.kind);
        let outcome = if message.is_error() {
            Err(TransportError::Remote(message.flow_error()))
        } else {
            Ok(message)
        };

        if entry.respond.send(outcome).is_err() {
            debug!("requester went away before its response arrived");
        }
    }

    /// Reject and clear every pending request, returns how many were pending
    fn reject_all(&self) -> usize {
        let drained: Vec<PendingRequest> = self.lock_pending().drain().map(|(_, e)| e).collect();
        let count = drained.len();

        for entry in drained {
            let _ = entry.respond.send(Err(TransportError::Disconnected));
        }

        count
    }

    fn handle_close(self: &Arc<Self>, generation: u64, code: u16, reason: &str) {
        {
            let mut state = self.lock_state();
            match &*state {
                LinkState::Open(link) if link.generation == generation => {
                    *state = LinkState::Disconnected;
                }
                // a newer connection replaced this one, or disconnect() already cleaned up
                _ => return,
            }
        }

        let rejected = self.reject_all();

        if code == CLOSE_NORMAL || self.shutdown.load(Ordering::SeqCst) {
            info!("connection to {} closed ({code})", self.config.url);
            return;
        }

        warn!(
            "connection to {} lost ({code} {reason}), {rejected} pending requests rejected",
            self.config.url
        );
        tokio::spawn(Self::reconnect(Arc::downgrade(self)));
    }

    async fn reconnect(inner: Weak<Self>) {
        let Some(policy) = inner.upgrade().map(|this| this.config.reconnect) else {
            return;
        };

        let mut attempts = 0;
        for delay in policy.schedule() {
            tokio::time::sleep(delay).await;

            let Some(this) = inner.upgrade() else {
                return;
            };
            if this.shutdown.load(Ordering::SeqCst) {
                return;
            }

            attempts += 1;
            info!("reconnection attempt {attempts} to {}", this.config.url);
            match Self::connect(&this).await {
                Ok(()) => return,
                Err(e) => warn!("reconnection attempt {attempts} failed: {e}"),
            }
        }

        if let Some(this) = inner.upgrade() {
            if this.shutdown.load(Ordering::SeqCst) {
                return;
            }
            error!(
                "giving up on {} after {attempts} reconnection attempts",
                this.config.url
            );
            this.errors
                .emit(&TransportError::ReconnectionExhausted { attempts });
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportType {
        TransportType::Persistent
    }

    async fn connect(&self) -> Result<(), TransportError> {
        WebSocketTransport::connect(self).await
    }

    async fn disconnect(&self) {
        WebSocketTransport::disconnect(self).await
    }

    fn is_connected(&self) -> bool {
        self.phase() == ConnectionPhase::Open
    }

    async fn start_issuance_flow(
        &self,
        params: IssuanceFlowParams,
    ) -> Result<IssuanceFlowResult, TransportError> {
        let phase = params.phase()?;
        let reply = self
            .round_trip(params.to_message(phase), params.flow_id.clone())
            .await?;

        IssuanceFlowResult::from_message(reply)
    }

    async fn start_presentation_flow(
        &self,
        params: PresentationFlowParams,
    ) -> Result<PresentationFlowResult, TransportError> {
        let phase = params.phase()?;
        let reply = self
            .round_trip(params.to_message(phase), params.flow_id.clone())
            .await?;

        PresentationFlowResult::from_message(reply)
    }

    async fn request(&self, request: FlowRequest) -> Result<FlowResponse, TransportError> {
        let mut message = Map::new();
        message.insert("type".into(), MESSAGE_GENERIC_REQUEST.into());
        message.insert("flow".into(), request.domain.as_str().into());
        message.insert("action".into(), request.action.into());
        if let Some(payload) = request.payload {
            message.insert("payload".into(), payload);
        }

        match self.round_trip(message, None).await {
            Ok(reply) => {
                let mut fields = reply.fields;
                let data = fields.remove("data").unwrap_or(Value::Object(fields));
                Ok(FlowResponse::success(Some(data)))
            }
            Err(TransportError::Remote(error)) => Ok(FlowResponse::failure(error)),
            Err(e) => Err(e),
        }
    }

    fn on_progress(&self, callback: ProgressCallback) -> Subscription {
        self.inner.progress.subscribe(callback)
    }

    fn on_error(&self, callback: ErrorCallback) -> Subscription {
        self.inner.errors.subscribe(callback)
    }
}
