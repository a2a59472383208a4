//! Transport selection for one wallet session.
//!
//! A [SessionContext] owns the transports a session may use and decides which
//! one carries flow traffic. The persistent-connection transport is gated three
//! ways: the configuration must allow it and name its URL, the backend must
//! advertise it, and an auth token must be present. Only then is an instance
//! created and connected; token rotation updates that instance in place.

use serde::Deserialize;
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tracing::{info, warn};
use url::Url;

use crate::{
    definitions::{ConnectionState, TransportType},
    discovery::{CapabilityManifest, CapabilityService, DEFAULT_CAPABILITY_TTL, capability},
    retry::RetryPolicy,
    token::{AuthToken, TokenRefresher, TokenSource},
    transport::{
        Connector, DirectTransport, NullTransport, ProxyTransport, ReqwestChannel,
        RequestChannel, Transport, TransportError, WebSocketConfig, WebSocketConnector,
        WebSocketTransport, websocket::DEFAULT_REQUEST_TIMEOUT,
    },
};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{0} is not a valid URL: {1}")]
    InvalidUrl(&'static str, String),
    #[error("{0} names an unknown transport '{1}'")]
    InvalidTransport(&'static str, String),
}

/// Static session configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Transports that may be used at all
    pub allowed_transports: Vec<TransportType>,
    /// Selection order, the first usable transport wins
    pub preference: Vec<TransportType>,
    pub websocket_url: Option<Url>,
    pub proxy_url: Option<Url>,
    pub direct_url: Option<Url>,
    /// Where the capability manifest is fetched, defaults to `proxy_url`
    pub backend_url: Option<Url>,
    /// Origin presented when probing issuers directly
    pub origin: String,
    pub request_timeout: Duration,
    pub reconnect: RetryPolicy,
    pub capability_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            allowed_transports: vec![TransportType::Persistent, TransportType::Proxy],
            preference: vec![TransportType::Persistent, TransportType::Proxy],
            websocket_url: None,
            proxy_url: None,
            direct_url: None,
            backend_url: None,
            origin: "null".into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect: RetryPolicy::default(),
            capability_ttl: DEFAULT_CAPABILITY_TTL,
        }
    }
}

impl SessionConfig {
    /// Read the configuration from `CREDFLOW_*` environment variables,
    /// keeping the defaults for anything unset
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let url = |key: &'static str| -> Result<Option<Url>, ConfigError> {
            lookup(key)
                .filter(|value| !value.is_empty())
                .map(|value| {
                    Url::parse(&value).map_err(|e| ConfigError::InvalidUrl(key, e.to_string()))
                })
                .transpose()
        };
        let transports = |key: &'static str| -> Result<Option<Vec<TransportType>>, ConfigError> {
            lookup(key)
                .filter(|value| !value.is_empty())
                .map(|value| {
                    value
                        .split(',')
                        .map(|name| {
                            name.parse::<TransportType>()
                                .map_err(|name| ConfigError::InvalidTransport(key, name))
                        })
                        .collect::<Result<Vec<_>, _>>()
                })
                .transpose()
        };

        let mut config = Self {
            websocket_url: url("CREDFLOW_WS_URL")?,
            proxy_url: url("CREDFLOW_PROXY_URL")?,
            direct_url: url("CREDFLOW_DIRECT_URL")?,
            backend_url: url("CREDFLOW_BACKEND_URL")?,
            ..Self::default()
        };

        if let Some(allowed) = transports("CREDFLOW_TRANSPORTS")? {
            config.allowed_transports = allowed;
        }
        if let Some(preference) = transports("CREDFLOW_PREFERENCE")? {
            config.preference = preference;
        }
        if let Some(origin) = lookup("CREDFLOW_ORIGIN").filter(|o| !o.is_empty()) {
            config.origin = origin;
        }

        Ok(config)
    }

    pub fn allows(&self, kind: TransportType) -> bool {
        self.allowed_transports.contains(&kind)
    }

    /// Base URL of the capability manifest
    pub fn discovery_endpoint(&self) -> Option<&Url> {
        self.backend_url.as_ref().or(self.proxy_url.as_ref())
    }
}

/// Lifecycle of the persistent-connection transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistentLifecycle {
    None,
    Connecting,
    Open,
}

impl PersistentLifecycle {
    /// The lifecycle state implied by the gating inputs and the live connection
    pub fn from_inputs(
        token_present: bool,
        capability_confirmed: bool,
        config_allows: bool,
        connected: bool,
    ) -> Self {
        match (token_present && capability_confirmed && config_allows, connected) {
            (false, _) => PersistentLifecycle::None,
            (true, false) => PersistentLifecycle::Connecting,
            (true, true) => PersistentLifecycle::Open,
        }
    }
}

/// The transport currently carrying flow traffic
#[derive(Clone)]
pub enum ActiveTransport {
    WebSocket(WebSocketTransport),
    Proxy(Arc<ProxyTransport>),
    Direct(Arc<DirectTransport>),
    None(NullTransport),
}

impl ActiveTransport {
    pub fn kind(&self) -> TransportType {
        self.transport().kind()
    }

    pub fn transport(&self) -> &dyn Transport {
        match self {
            ActiveTransport::WebSocket(transport) => transport,
            ActiveTransport::Proxy(transport) => transport.as_ref(),
            ActiveTransport::Direct(transport) => transport.as_ref(),
            ActiveTransport::None(transport) => transport,
        }
    }
}

impl std::fmt::Debug for ActiveTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ActiveTransport({})", self.kind())
    }
}

#[derive(Default)]
struct SessionState {
    capabilities: Option<CapabilityManifest>,
    websocket: Option<WebSocketTransport>,
    error: Option<TransportError>,
}

pub struct SessionContext {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    token: AuthToken,
    discovery: CapabilityService,
    proxy: Option<Arc<ProxyTransport>>,
    direct: Option<Arc<DirectTransport>>,
    state: Mutex<SessionState>,
}

impl SessionContext {
    /// A session talking to real backends over tungstenite and reqwest
    pub fn new(config: SessionConfig) -> Self {
        Self::with_collaborators(config, Arc::new(WebSocketConnector), Arc::new(ReqwestChannel))
    }

    pub fn with_collaborators(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        channel: Arc<dyn RequestChannel>,
    ) -> Self {
        let token = AuthToken::default();

        let proxy = config
            .proxy_url
            .clone()
            .filter(|_| config.allows(TransportType::Proxy))
            .map(|url| Arc::new(ProxyTransport::new(url, channel.clone(), token.clone())));

        let direct = config
            .direct_url
            .clone()
            .filter(|_| config.allows(TransportType::Direct))
            .map(|url| {
                Arc::new(DirectTransport::new(channel.clone(), config.origin.clone()).with_endpoint(url))
            });

        Self {
            discovery: CapabilityService::with_ttl(channel, config.capability_ttl),
            config,
            connector,
            token,
            proxy,
            direct,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Refresh the session token through `source` when the proxy is answered with 401
    pub fn with_token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        let refresher = Arc::new(TokenRefresher::new(source, self.token.clone()));

        if let Some(proxy) = self.proxy.take() {
            let url = proxy.base_url().clone();
            let channel = proxy.channel();
            self.proxy = Some(Arc::new(
                ProxyTransport::new(url, channel, self.token.clone()).with_refresher(refresher),
            ));
        }

        self
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn discovery(&self) -> &CapabilityService {
        &self.discovery
    }

    pub fn auth_token(&self) -> &AuthToken {
        &self.token
    }

    /// Set or clear the auth token and bring the persistent transport in line
    pub async fn set_auth_token(&self, token: Option<String>) {
        self.token.set(token);
        self.sync_persistent().await;
    }

    /// Record the capability manifest of the backend, `None` when unknown
    pub async fn set_capabilities(&self, manifest: Option<CapabilityManifest>) {
        self.lock().capabilities = manifest;
        self.sync_persistent().await;
    }

    /// Re-run capability discovery and probe the direct transport
    pub async fn refresh_capabilities(&self) {
        let manifest = match self.config.discovery_endpoint() {
            Some(endpoint) => self.discovery.fetch_status(endpoint).await,
            None => None,
        };

        if let Some(direct) = &self.direct {
            if let Err(e) = direct.connect().await {
                warn!("direct transport probe failed: {e}");
            }
        }

        self.set_capabilities(manifest).await;
    }

    fn capability_confirmed(&self, state: &SessionState) -> bool {
        state
            .capabilities
            .as_ref()
            .is_some_and(|manifest| manifest.has_capability(capability::WEBSOCKET))
    }

    fn persistent_configured(&self) -> bool {
        self.config.allows(TransportType::Persistent) && self.config.websocket_url.is_some()
    }

    /// Create, keep or tear down the persistent transport for the current inputs
    async fn sync_persistent(&self) {
        enum Action {
            Connect(WebSocketTransport),
            Teardown(WebSocketTransport),
            Keep,
        }

        let action = {
            let mut state = self.lock();
            let wanted = self.token.is_present()
                && self.capability_confirmed(&state)
                && self.persistent_configured();

            match (wanted, state.websocket.take()) {
                (true, Some(existing)) => {
                    state.websocket = Some(existing);
                    Action::Keep
                }
                (true, None) => match self.create_persistent() {
                    Some(created) => {
                        state.websocket = Some(created.clone());
                        Action::Connect(created)
                    }
                    None => Action::Keep,
                },
                (false, Some(existing)) => Action::Teardown(existing),
                (false, None) => Action::Keep,
            }
        };

        match action {
            Action::Connect(transport) => {
                if let Err(e) = transport.connect().await {
                    warn!("persistent transport failed to connect: {e}");
                    self.lock().error = Some(e);
                }
            }
            Action::Teardown(transport) => {
                info!("tearing down persistent transport");
                transport.disconnect().await;
            }
            Action::Keep => {}
        }
    }

    fn create_persistent(&self) -> Option<WebSocketTransport> {
        let url = self.config.websocket_url.clone()?;

        let mut config = WebSocketConfig::new(url);
        config.request_timeout = self.config.request_timeout;
        config.reconnect = self.config.reconnect;

        Some(WebSocketTransport::new(
            config,
            self.connector.clone(),
            self.token.clone(),
        ))
    }

    /// Transports that pass configuration and capability gating, in preference order
    pub fn available_transports(&self) -> Vec<TransportType> {
        let state = self.lock();

        let mut available: Vec<TransportType> = Vec::new();
        let candidates = self.config.preference.iter().chain([
            &TransportType::Persistent,
            &TransportType::Proxy,
            &TransportType::Direct,
        ]);
        for &kind in candidates {
            if available.contains(&kind) {
                continue;
            }

            let is_available = match kind {
                TransportType::Persistent => {
                    self.persistent_configured() && self.capability_confirmed(&state)
                }
                TransportType::Proxy => self.proxy.is_some(),
                TransportType::Direct => self.direct.is_some(),
                TransportType::None => false,
            };

            if is_available {
                available.push(kind);
            }
        }

        available
    }

    /// The first available transport in preference order that can carry traffic right now
    pub fn active_transport(&self) -> ActiveTransport {
        let available = self.available_transports();
        let websocket = self.lock().websocket.clone();

        for kind in &self.config.preference {
            if !available.contains(kind) {
                continue;
            }

            match kind {
                TransportType::Persistent => {
                    if let Some(transport) = websocket.as_ref().filter(|t| t.is_connected()) {
                        return ActiveTransport::WebSocket(transport.clone());
                    }
                }
                TransportType::Proxy => {
                    if let Some(proxy) = &self.proxy {
                        return ActiveTransport::Proxy(proxy.clone());
                    }
                }
                // a viable direct issuer is listed as available, but flows cannot run over it yet
                TransportType::Direct | TransportType::None => {}
            }
        }

        ActiveTransport::None(NullTransport)
    }

    pub fn connection_state(&self) -> ConnectionState {
        let active = self.active_transport();

        ConnectionState {
            transport_type: active.kind(),
            is_connected: active.transport().is_connected(),
            available_transports: self.available_transports(),
        }
    }

    pub fn persistent_lifecycle(&self) -> PersistentLifecycle {
        let state = self.lock();
        let connected = state
            .websocket
            .as_ref()
            .is_some_and(WebSocketTransport::is_connected);

        PersistentLifecycle::from_inputs(
            self.token.is_present(),
            self.capability_confirmed(&state),
            self.persistent_configured(),
            connected,
        )
    }

    /// The persistent transport instance, when one exists
    pub fn persistent(&self) -> Option<WebSocketTransport> {
        self.lock().websocket.clone()
    }

    /// Connect the persistent transport again, e.g. after reconnection gave up
    pub async fn reconnect(&self) {
        let existing = self.lock().websocket.clone();

        match existing {
            Some(transport) => {
                if let Err(e) = transport.connect().await {
                    warn!("reconnecting the persistent transport failed: {e}");
                    self.lock().error = Some(e);
                }
            }
            None => self.sync_persistent().await,
        }
    }

    /// Last connection failure recorded by the session
    pub fn error(&self) -> Option<TransportError> {
        self.lock().error.clone()
    }

    pub fn clear_error(&self) {
        self.lock().error = None;
    }

    /// Disconnect and drop the persistent transport
    pub async fn shutdown(&self) {
        let existing = self.lock().websocket.take();

        if let Some(transport) = existing {
            transport.disconnect().await;
        }
    }
}
