//! Flow orchestration facade.
//!
//! [IssuanceFlow] and [PresentationFlow] expose the real-world phases of the
//! two protocols as named operations. Every operation returns a result with a
//! `success` flag; failures never escape as errors. Over the persistent
//! transport, progress and error events are forwarded to the caller's
//! callbacks for the duration of the call only.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};

use crate::{
    definitions::{FlowError, FlowProgressEvent},
    session::{ActiveTransport, SessionContext},
    transport::{ProgressCallback, Subscription, Transport, TransportError},
};

mod issuance;
mod presentation;

pub use issuance::{
    AuthorizationGrant, CredentialOffer, IssuanceFlow, IssuanceStep, LegacyCredentialResponse,
    LegacyIssuance, LegacyOffer,
};
pub use presentation::{
    LegacyAuthorizationRequest, LegacyPresentation, LegacySubmission, PresentationFlow,
    PresentationResponse, PresentationStep,
};

pub type FlowErrorCallback = Arc<dyn Fn(&FlowError) + Send + Sync>;
pub type StepCallback = Arc<dyn Fn(&StepInfo) + Send + Sync>;

/// Caller hooks, all optional
#[derive(Clone, Default)]
pub struct FlowCallbacks {
    pub on_progress: Option<ProgressCallback>,
    pub on_error: Option<FlowErrorCallback>,
    pub on_step: Option<StepCallback>,
}

/// Presentation metadata of a flow step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepInfo {
    pub name: &'static str,
    pub message: &'static str,
    pub progress: u8,
    pub is_terminal: bool,
    pub requires_user_input: bool,
}

/// A step of one of the flow state machines
pub trait FlowStep: Copy + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    const IDLE: Self;
    const ERROR: Self;

    /// Every step, in protocol order
    fn all() -> &'static [Self];

    /// Stable snake_case name, also used as progress `stage`
    fn name(&self) -> &'static str;
    fn message(&self) -> &'static str;
    fn progress(&self) -> u8;
    fn requires_user_input(&self) -> bool;

    fn is_terminal(&self) -> bool;

    fn from_stage(stage: &str) -> Option<Self> {
        Self::all().iter().copied().find(|step| step.name() == stage)
    }

    fn info(&self) -> StepInfo {
        StepInfo {
            name: self.name(),
            message: self.message(),
            progress: self.progress(),
            is_terminal: self.is_terminal(),
            requires_user_input: self.requires_user_input(),
        }
    }
}

struct TrackerState<S> {
    step: S,
    error: Option<FlowError>,
}

/// Current step and last error of a facade, shared with the event forwarders
pub(crate) struct StepTracker<S: FlowStep> {
    state: Arc<Mutex<TrackerState<S>>>,
    callbacks: FlowCallbacks,
}

impl<S: FlowStep> Clone for StepTracker<S> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            callbacks: self.callbacks.clone(),
        }
    }
}

impl<S: FlowStep> StepTracker<S> {
    pub(crate) fn new(callbacks: FlowCallbacks) -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState {
                step: S::IDLE,
                error: None,
            })),
            callbacks,
        }
    }

    pub(crate) fn step(&self) -> S {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).step
    }

    pub(crate) fn error(&self) -> Option<FlowError> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .error
            .clone()
    }

    /// Enter the first step of an operation, forgetting the previous error
    pub(crate) fn begin(&self, step: S) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .error = None;
        self.set(step);
    }

    pub(crate) fn set(&self, step: S) {
        let changed = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = state.step != step;
            state.step = step;
            changed
        };

        if changed {
            tracing::debug!("flow step {}", step.name());
            if let Some(on_step) = &self.callbacks.on_step {
                on_step(&step.info());
            }
        }
    }

    pub(crate) fn fail(&self, error: FlowError) {
        tracing::debug!("flow failed: {error}");
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .error = Some(error.clone());
        self.set(S::ERROR);

        if let Some(on_error) = &self.callbacks.on_error {
            on_error(&error);
        }
    }

    /// Forward events of `flow_id` to the callbacks while the returned guards live.
    ///
    /// Only the persistent transport emits events; for any other transport
    /// nothing is subscribed.
    pub(crate) fn watch(&self, transport: &ActiveTransport, flow_id: &str) -> Vec<Subscription> {
        let ActiveTransport::WebSocket(transport) = transport else {
            return Vec::new();
        };

        let tracker = self.clone();
        let watched = flow_id.to_string();
        let progress = transport.on_progress(Arc::new(move |event: &FlowProgressEvent| {
            if event.flow_id != watched {
                return;
            }
            if let Some(step) = S::from_stage(&event.stage) {
                tracker.set(step);
            }
            if let Some(on_progress) = &tracker.callbacks.on_progress {
                on_progress(event);
            }
        }));

        let on_error = self.callbacks.on_error.clone();
        let errors = transport.on_error(Arc::new(move |error: &TransportError| {
            if let Some(on_error) = &on_error {
                on_error(&FlowError::from(error));
            }
        }));

        vec![progress, errors]
    }
}

/// Anything that can name the transport a flow should use right now
pub trait ActiveTransportSource: Send + Sync {
    fn active_transport(&self) -> ActiveTransport;
}

impl ActiveTransportSource for SessionContext {
    fn active_transport(&self) -> ActiveTransport {
        SessionContext::active_transport(self)
    }
}

impl ActiveTransportSource for ActiveTransport {
    fn active_transport(&self) -> ActiveTransport {
        self.clone()
    }
}

/// What the signing service is asked to sign
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub audience: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disclosed_claims: Vec<String>,
}

/// Opaque signed artifact, e.g. a key proof or a presentation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedArtifact {
    pub format: String,
    pub value: Value,
}

/// Produces holder-binding proofs and presentations; the cryptography is not our concern
#[async_trait]
pub trait SigningService: Send + Sync {
    async fn sign(&self, request: SigningRequest) -> Result<SignedArtifact, FlowError>;
}

pub(crate) async fn sign_with(
    signer: Option<&Arc<dyn SigningService>>,
    request: SigningRequest,
) -> Result<Value, FlowError> {
    let signer = signer.ok_or_else(|| {
        FlowError::from(TransportError::InvalidFlowParams(
            "no signing service is configured".into(),
        ))
    })?;

    let artifact = signer.sign(request).await?;
    serde_json::to_value(artifact).map_err(|e| FlowError::new("SIGNING_FAILED", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_map_to_steps() {
        assert_eq!(
            IssuanceStep::from_stage("fetching_metadata"),
            Some(IssuanceStep::FetchingMetadata)
        );
        assert_eq!(
            PresentationStep::from_stage("matching_credentials"),
            Some(PresentationStep::MatchingCredentials)
        );
        assert_eq!(IssuanceStep::from_stage("unknown"), None);
    }

    #[test]
    fn step_metadata() {
        let info = IssuanceStep::AwaitingConsent.info();
        assert!(info.requires_user_input);
        assert!(!info.is_terminal);

        assert!(IssuanceStep::Complete.is_terminal());
        assert!(PresentationStep::Error.is_terminal());
        assert_eq!(PresentationStep::Complete.progress(), 100);

        // progress never decreases along the protocol order
        for pair in IssuanceStep::all().windows(2) {
            if pair[1] != IssuanceStep::Error {
                assert!(pair[0].progress() <= pair[1].progress());
            }
        }
    }

    #[test]
    fn tracker_reports_step_changes_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let tracker = StepTracker::<PresentationStep>::new(FlowCallbacks {
            on_step: Some(Arc::new(move |info: &StepInfo| sink.lock().unwrap().push(info.name))),
            ..Default::default()
        });

        tracker.begin(PresentationStep::ParsingRequest);
        tracker.set(PresentationStep::ParsingRequest);
        tracker.fail(FlowError::new("X", "y"));
        assert_eq!(tracker.error().unwrap().code, "X");

        tracker.begin(PresentationStep::ParsingRequest);
        assert!(tracker.error().is_none());
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["parsing_request", "error", "parsing_request"]
        );
    }

    #[tokio::test]
    async fn missing_signer_is_a_parameter_error() {
        let error = sign_with(None, SigningRequest::default()).await.unwrap_err();

        assert_eq!(error.code, "INVALID_FLOW_PARAMS");
    }
}
