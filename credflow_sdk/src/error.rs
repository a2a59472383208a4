/// Error originating from the credflow library
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error: {0}")]
    Transport(#[from] crate::transport::TransportError),
    #[error("Error: {0}")]
    Discovery(#[from] crate::discovery::DiscoveryError),
    #[error("Error: {0}")]
    Refresh(#[from] crate::token::RefreshError),
    #[error("Error: {0}")]
    Config(#[from] crate::session::ConfigError),
    #[error("Error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Error: {0}")]
    Flow(crate::definitions::FlowError),
    #[error("Internal error")]
    Internal,
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::Internal
    }
}

impl From<crate::definitions::FlowError> for Error {
    fn from(error: crate::definitions::FlowError) -> Self {
        Self::Flow(error)
    }
}

impl Error {
    /// Machine-readable code, matching the codes carried by failed flow results
    pub fn code(&self) -> &str {
        match self {
            Error::Transport(e) => e.code(),
            Error::Discovery(_) => "DISCOVERY_ERROR",
            Error::Refresh(_) => "REFRESH_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Json(_) => "INVALID_MESSAGE",
            Error::Flow(e) => &e.code,
            Error::Internal => "INTERNAL_ERROR",
        }
    }
}
