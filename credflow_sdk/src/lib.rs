#![deny(rustdoc::broken_intra_doc_links)]

//! # Credflow
//!
//! Transport orchestration for the two multi-step protocols of a credential
//! wallet: credential issuance and verifiable presentation.
//!
//! Flow traffic travels over one of several interchangeable transports:
//!
//! - a persistent WebSocket connection ([WebSocketTransport]) that multiplexes
//!   concurrent flows by correlation id, reports progress out of band and
//!   reconnects with exponential backoff;
//! - a stateless proxy ([ProxyTransport]) for generic request/response traffic;
//! - a direct wallet-to-issuer transport ([DirectTransport]), currently only
//!   able to probe whether an issuer would accept it.
//!
//! A [SessionContext] decides which transport is active, based on the
//! configuration, the auth token and the capabilities the backend advertises.
//! The [IssuanceFlow] and [PresentationFlow] facades run protocol phases over
//! whatever transport is active and always answer with a result carrying a
//! `success` flag.
//!
//! ## Example
//!
//! ```rust,no_run
//! use credflow_sdk::{
//!     CredentialOffer, Error, FlowCallbacks, IssuanceFlow, SessionConfig, SessionContext,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let session = Arc::new(SessionContext::new(SessionConfig::from_env()?));
//!     session.refresh_capabilities().await;
//!     session.set_auth_token(Some("access-token".into())).await;
//!
//!     let issuance = IssuanceFlow::new(session.clone(), FlowCallbacks::default());
//!     let result = issuance
//!         .handle_offer(CredentialOffer::Uri("openid-credential-offer://?x=1".into()))
//!         .await;
//!
//!     if !result.success {
//!         eprintln!("offer rejected: {:?}", result.error);
//!     }
//!
//!     Ok(())
//! }
//! ```

/// Wire-level data structures shared by all transports
pub mod definitions;

/// Capability manifests and their per-endpoint cache
pub mod discovery;
mod error;

/// Orchestration facades for issuance and presentation
pub mod flow;
mod http_client;

/// Backoff policy for re-establishing dropped connections
pub mod retry;

/// Transport selection and session configuration
pub mod session;

/// Auth token cell and single-flight refresh
pub mod token;

/// Code (built using [tokio](https://tokio.rs/) foundations) for carrying flow
/// traffic over the various transports.
pub mod transport;


pub use definitions::{
    ConnectionState, CredentialSelection, FlowDomain, FlowError, FlowProgressEvent, FlowRequest,
    FlowResponse, IssuanceFlowParams, IssuanceFlowResult, PresentationFlowParams,
    PresentationFlowResult, TransportType,
};
pub use discovery::{CapabilityManifest, CapabilityService};
pub use error::Error;
pub use flow::{
    AuthorizationGrant, CredentialOffer, FlowCallbacks, IssuanceFlow, IssuanceStep,
    PresentationFlow, PresentationResponse, PresentationStep, SigningRequest, SigningService,
};
pub use session::{ActiveTransport, SessionConfig, SessionContext};
pub use token::{AuthToken, TokenRefresher, TokenSource};
pub use transport::{
    DirectTransport, NullTransport, ProxyTransport, Transport, TransportError, WebSocketTransport,
};
