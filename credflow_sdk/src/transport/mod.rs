use async_trait::async_trait;
use std::{
    collections::BTreeMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, PoisonError, Weak},
};

use crate::definitions::{
    FlowProgressEvent, FlowRequest, FlowResponse, IssuanceFlowParams, IssuanceFlowResult,
    PresentationFlowParams, PresentationFlowResult, TransportType,
};

pub mod channel;
pub mod direct;
pub mod error;
pub mod http;
pub mod proxy;
pub mod websocket;

pub use channel::{Channel, ChannelEvent, Connector, Frame, WebSocketConnector};
pub use direct::{DirectProbe, DirectTransport};
pub use error::TransportError;
pub use http::{HttpResponse, ReqwestChannel, RequestChannel};
pub use proxy::ProxyTransport;
pub use websocket::{ConnectionPhase, WebSocketConfig, WebSocketTransport};

pub type ProgressCallback = Arc<dyn Fn(&FlowProgressEvent) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// The contract every transport carrying flow traffic implements
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportType;

    /// Establish readiness; resolves once the transport can carry requests
    async fn connect(&self) -> Result<(), TransportError>;

    /// Tear down the underlying channel, rejecting anything still pending
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    async fn start_issuance_flow(
        &self,
        params: IssuanceFlowParams,
    ) -> Result<IssuanceFlowResult, TransportError>;

    async fn start_presentation_flow(
        &self,
        params: PresentationFlowParams,
    ) -> Result<PresentationFlowResult, TransportError>;

    /// Passthrough for operations outside the named protocols
    async fn request(&self, request: FlowRequest) -> Result<FlowResponse, TransportError>;

    fn on_progress(&self, callback: ProgressCallback) -> Subscription;

    fn on_error(&self, callback: ErrorCallback) -> Subscription;
}

/// Handle to a registered callback; the callback is removed when this is dropped
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// A subscription on a source that never emits
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct HandlerSet<T> {
    next_id: u64,
    handlers: BTreeMap<u64, Handler<T>>,
}

/// Independent event handlers; a panicking handler is logged and skipped
pub(crate) struct Subscribers<T> {
    set: Arc<Mutex<HandlerSet<T>>>,
}

impl<T: 'static> Subscribers<T> {
    pub(crate) fn new() -> Self {
        Self {
            set: Arc::new(Mutex::new(HandlerSet {
                next_id: 0,
                handlers: BTreeMap::new(),
            })),
        }
    }

    pub(crate) fn subscribe(&self, handler: Handler<T>) -> Subscription {
        let id = {
            let mut set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
            let id = set.next_id;
            set.next_id += 1;
            set.handlers.insert(id, handler);
            id
        };

        let set: Weak<Mutex<HandlerSet<T>>> = Arc::downgrade(&self.set);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(set) = set.upgrade() {
                    set.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .handlers
                        .remove(&id);
                }
            })),
        }
    }

    /// Deliver `event` to every handler, returns how many completed without panicking
    pub(crate) fn emit(&self, event: &T) -> usize {
        // handlers run outside the lock so they may (un)subscribe
        let handlers: Vec<Handler<T>> = self
            .set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .values()
            .cloned()
            .collect();

        handlers
            .into_iter()
            .filter(|handler| {
                let delivered = catch_unwind(AssertUnwindSafe(|| handler(event))).is_ok();
                if !delivered {
                    tracing::warn!("event subscriber panicked, continuing with the others");
                }
                delivered
            })
            .count()
    }

    pub(crate) fn len(&self) -> usize {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .len()
    }
}

/// Stand-in used when no transport could be selected; every operation fails fast
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    fn kind(&self) -> TransportType {
        TransportType::None
    }

    async fn connect(&self) -> Result<(), TransportError> {
        Err(TransportError::NoTransport)
    }

    async fn disconnect(&self) {}

    fn is_connected(&self) -> bool {
        false
    }

    async fn start_issuance_flow(
        &self,
        _params: IssuanceFlowParams,
    ) -> Result<IssuanceFlowResult, TransportError> {
        Err(TransportError::NoTransport)
    }

    async fn start_presentation_flow(
        &self,
        _params: PresentationFlowParams,
    ) -> Result<PresentationFlowResult, TransportError> {
        Err(TransportError::NoTransport)
    }

    async fn request(&self, _request: FlowRequest) -> Result<FlowResponse, TransportError> {
        Err(TransportError::NoTransport)
    }

    fn on_progress(&self, _callback: ProgressCallback) -> Subscription {
        Subscription::noop()
    }

    fn on_error(&self, _callback: ErrorCallback) -> Subscription {
        Subscription::noop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn failing_subscriber(_: &String) {
        panic!("subscriber failure")
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let subscribers = Subscribers::<String>::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let _first = subscribers.subscribe(Arc::new(failing_subscriber));
        let counter = seen.clone();
        let _second = subscribers.subscribe(Arc::new(move |_: &String| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(subscribers.emit(&"event".to_string()), 1);
        assert_eq!(subscribers.emit(&"event".to_string()), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let subscribers = Subscribers::<u32>::new();

        let first = subscribers.subscribe(Arc::new(|_: &u32| {}));
        let second = subscribers.subscribe(Arc::new(|_: &u32| {}));
        assert_eq!(subscribers.len(), 2);

        drop(first);
        assert_eq!(subscribers.len(), 1);

        second.unsubscribe();
        assert_eq!(subscribers.emit(&1), 0);
    }

    #[tokio::test]
    async fn null_transport_fails_fast() {
        let transport = NullTransport;

        assert!(!transport.is_connected());
        assert_eq!(transport.kind(), TransportType::None);
        assert_eq!(
            transport.connect().await.unwrap_err(),
            TransportError::NoTransport
        );
        assert_eq!(
            transport
                .start_issuance_flow(IssuanceFlowParams::default())
                .await
                .unwrap_err(),
            TransportError::NoTransport
        );
        assert_eq!(
            transport
                .request(FlowRequest::generic("ping", None))
                .await
                .unwrap_err(),
            TransportError::NoTransport
        );
    }
}
