use crate::definitions::FlowError;
use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("no transport is configured")]
    NoTransport,
    #[error("unsupported flow type '{0}'")]
    UnsupportedFlowType(String),
    #[error("{0}")]
    LegacyFlowRequired(&'static str),
    #[error("invalid flow parameters: {0}")]
    InvalidFlowParams(String),
    #[error("connection to '{0}' failed: {1}")]
    Connection(String, String),
    #[error("transport is not connected")]
    NotConnected,
    #[error("connection closed before a response arrived")]
    Disconnected,
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectionExhausted { attempts: u32 },
    #[error("request '{flow_id}' timed out after {timeout:?}")]
    RequestTimeout { flow_id: String, timeout: Duration },
    #[error("{}", .0.message)]
    Remote(FlowError),
    #[error("{0} is not implemented by the direct transport")]
    Unimplemented(&'static str),
    #[error("fetching '{0}' failed: {1}")]
    Http(String, String),
    #[error("invalid message received '{0}'")]
    InvalidMessageReceived(String),
    #[error("invalid transport scheme '{0}'")]
    InvalidTransportScheme(String),
    #[error("internal error")]
    Internal,
}

impl TransportError {
    /// Stable machine-readable identifier for this error
    pub fn code(&self) -> &str {
        match self {
            TransportError::NoTransport => "NO_TRANSPORT",
            TransportError::UnsupportedFlowType(_) | TransportError::LegacyFlowRequired(_) => {
                "UNSUPPORTED_FLOW_TYPE"
            }
            TransportError::InvalidFlowParams(_) => "INVALID_FLOW_PARAMS",
            TransportError::Connection(..) => "CONNECTION_ERROR",
            TransportError::NotConnected => "NOT_CONNECTED",
            TransportError::Disconnected => "DISCONNECTED",
            TransportError::ReconnectionExhausted { .. } => "RECONNECTION_EXHAUSTED",
            TransportError::RequestTimeout { .. } => "REQUEST_TIMEOUT",
            TransportError::Remote(error) => &error.code,
            TransportError::Unimplemented(_) => "UNIMPLEMENTED",
            TransportError::Http(..) => "HTTP_ERROR",
            TransportError::InvalidMessageReceived(_) => "INVALID_MESSAGE",
            TransportError::InvalidTransportScheme(_) => "INVALID_SCHEME",
            TransportError::Internal => "INTERNAL_ERROR",
        }
    }

    /// Whether the error stems from connectivity rather than from the caller or the remote party
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            TransportError::Connection(..)
                | TransportError::NotConnected
                | TransportError::Disconnected
                | TransportError::ReconnectionExhausted { .. }
                | TransportError::RequestTimeout { .. }
        )
    }
}

impl From<&TransportError> for FlowError {
    fn from(error: &TransportError) -> Self {
        match error {
            TransportError::Remote(remote) => remote.clone(),
            other => FlowError::new(other.code(), other.to_string()),
        }
    }
}

impl From<TransportError> for FlowError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Remote(remote) => remote,
            other => FlowError::from(&other),
        }
    }
}
