use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::{
    ActiveTransportSource, FlowCallbacks, FlowStep, SigningRequest, SigningService, StepTracker,
    sign_with,
};
use crate::{
    definitions::{
        CredentialSelection, FlowError, PresentationFlowParams, PresentationFlowResult,
    },
    session::ActiveTransport,
    transport::{TransportError, websocket::new_flow_id},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentationStep {
    Idle,
    ParsingRequest,
    MatchingCredentials,
    AwaitingSelection,
    Signing,
    Submitting,
    Complete,
    Error,
}

const PRESENTATION_STEPS: [PresentationStep; 8] = [
    PresentationStep::Idle,
    PresentationStep::ParsingRequest,
    PresentationStep::MatchingCredentials,
    PresentationStep::AwaitingSelection,
    PresentationStep::Signing,
    PresentationStep::Submitting,
    PresentationStep::Complete,
    PresentationStep::Error,
];

impl FlowStep for PresentationStep {
    const IDLE: Self = PresentationStep::Idle;
    const ERROR: Self = PresentationStep::Error;

    fn all() -> &'static [Self] {
        &PRESENTATION_STEPS
    }

    fn name(&self) -> &'static str {
        match self {
            PresentationStep::Idle => "idle",
            PresentationStep::ParsingRequest => "parsing_request",
            PresentationStep::MatchingCredentials => "matching_credentials",
            PresentationStep::AwaitingSelection => "awaiting_selection",
            PresentationStep::Signing => "signing",
            PresentationStep::Submitting => "submitting",
            PresentationStep::Complete => "complete",
            PresentationStep::Error => "error",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            PresentationStep::Idle => "Ready",
            PresentationStep::ParsingRequest => "Reading the verifier's request",
            PresentationStep::MatchingCredentials => "Finding matching credentials",
            PresentationStep::AwaitingSelection => "Choose what to share",
            PresentationStep::Signing => "Signing the presentation",
            PresentationStep::Submitting => "Sending the presentation",
            PresentationStep::Complete => "Presentation sent",
            PresentationStep::Error => "Presentation failed",
        }
    }

    fn progress(&self) -> u8 {
        match self {
            PresentationStep::Idle | PresentationStep::Error => 0,
            PresentationStep::ParsingRequest => 15,
            PresentationStep::MatchingCredentials => 35,
            PresentationStep::AwaitingSelection => 50,
            PresentationStep::Signing => 70,
            PresentationStep::Submitting => 85,
            PresentationStep::Complete => 100,
        }
    }

    fn requires_user_input(&self) -> bool {
        *self == PresentationStep::AwaitingSelection
    }

    fn is_terminal(&self) -> bool {
        matches!(self, PresentationStep::Complete | PresentationStep::Error)
    }
}

/// Authorization request as resolved by the legacy implementation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegacyAuthorizationRequest {
    pub verifier: Option<Value>,
    pub client_id: String,
    pub nonce: Option<String>,
    pub requested_claims: Option<Value>,
    pub matched_credentials: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacySubmission {
    pub redirect_uri: Option<String>,
}

/// Presentation without orchestration, used over the proxy transport
#[async_trait]
pub trait LegacyPresentation: Send + Sync {
    async fn resolve_request(
        &self,
        request_uri: &str,
    ) -> Result<LegacyAuthorizationRequest, FlowError>;

    async fn submit(
        &self,
        request_uri: &str,
        selections: &[CredentialSelection],
        presentation: Option<&Value>,
    ) -> Result<LegacySubmission, FlowError>;
}

impl From<LegacyAuthorizationRequest> for PresentationFlowResult {
    fn from(request: LegacyAuthorizationRequest) -> Self {
        Self {
            success: true,
            verifier: request.verifier,
            client_id: Some(request.client_id),
            nonce: request.nonce,
            requested_claims: request.requested_claims,
            matched_credentials: Some(request.matched_credentials),
            ..Default::default()
        }
    }
}

impl From<LegacySubmission> for PresentationFlowResult {
    fn from(submission: LegacySubmission) -> Self {
        Self {
            success: true,
            redirect_uri: submission.redirect_uri,
            ..Default::default()
        }
    }
}

/// The holder's answer to an authorization request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresentationResponse {
    /// Flow returned by [PresentationFlow::handle_authorization_request]
    pub flow_id: Option<String>,
    pub request_uri: Option<String>,
    pub selections: Vec<CredentialSelection>,
    /// Sign a presentation locally before submitting it
    pub signing: Option<SigningRequest>,
}

/// Verifiable presentation, one method per protocol phase
pub struct PresentationFlow {
    source: Arc<dyn ActiveTransportSource>,
    legacy: Option<Arc<dyn LegacyPresentation>>,
    signer: Option<Arc<dyn SigningService>>,
    tracker: StepTracker<PresentationStep>,
}

impl PresentationFlow {
    pub fn new(source: Arc<dyn ActiveTransportSource>, callbacks: FlowCallbacks) -> Self {
        Self {
            source,
            legacy: None,
            signer: None,
            tracker: StepTracker::new(callbacks),
        }
    }

    pub fn with_legacy(mut self, legacy: Arc<dyn LegacyPresentation>) -> Self {
        self.legacy = Some(legacy);
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn SigningService>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn step(&self) -> PresentationStep {
        self.tracker.step()
    }

    pub fn error(&self) -> Option<FlowError> {
        self.tracker.error()
    }

    /// Resolve a verifier's request and match it against the wallet's credentials
    pub async fn handle_authorization_request(&self, request_uri: &str) -> PresentationFlowResult {
        self.tracker.begin(PresentationStep::ParsingRequest);

        let transport = self.source.active_transport();
        let outcome = match (&transport, &self.legacy) {
            (ActiveTransport::Proxy(_), Some(legacy)) => legacy
                .resolve_request(request_uri)
                .await
                .map(PresentationFlowResult::from),
            _ => {
                let params = PresentationFlowParams {
                    request_uri: Some(request_uri.to_string()),
                    ..Default::default()
                };
                self.orchestrate(&transport, params).await
            }
        };

        self.finish(outcome, PresentationStep::AwaitingSelection)
    }

    /// Submit the selected credentials, signing the presentation first when asked to
    pub async fn send_response(&self, response: PresentationResponse) -> PresentationFlowResult {
        let PresentationResponse {
            flow_id,
            request_uri,
            selections,
            signing,
        } = response;

        let first = if signing.is_some() {
            PresentationStep::Signing
        } else {
            PresentationStep::Submitting
        };
        self.tracker.begin(first);

        let outcome: Result<PresentationFlowResult, FlowError> = async {
            let presentation = match signing {
                Some(mut request) => {
                    if request.disclosed_claims.is_empty() {
                        request.disclosed_claims = selections
                            .iter()
                            .flat_map(|s| s.disclosed_claims.iter().cloned())
                            .collect();
                    }
                    let presentation = sign_with(self.signer.as_ref(), request).await?;
                    self.tracker.set(PresentationStep::Submitting);
                    Some(presentation)
                }
                None => None,
            };

            let transport = self.source.active_transport();
            match (&transport, &self.legacy) {
                (ActiveTransport::Proxy(_), Some(legacy)) => {
                    let request_uri = request_uri.ok_or_else(|| {
                        FlowError::from(TransportError::InvalidFlowParams(
                            "submitting over the proxy transport needs the request uri".into(),
                        ))
                    })?;
                    legacy
                        .submit(&request_uri, &selections, presentation.as_ref())
                        .await
                        .map(PresentationFlowResult::from)
                }
                _ => {
                    let params = PresentationFlowParams {
                        flow_id,
                        request_uri,
                        request: None,
                        selected_credentials: Some(selections),
                        presentation,
                    };
                    self.orchestrate(&transport, params).await
                }
            }
        }
        .await;

        self.finish(outcome, PresentationStep::Complete)
    }

    async fn orchestrate(
        &self,
        transport: &ActiveTransport,
        mut params: PresentationFlowParams,
    ) -> Result<PresentationFlowResult, FlowError> {
        let flow_id = params
            .flow_id
            .get_or_insert_with(new_flow_id)
            .clone();
        let _watch = self.tracker.watch(transport, &flow_id);

        Ok(transport.transport().start_presentation_flow(params).await?)
    }

    fn finish(
        &self,
        outcome: Result<PresentationFlowResult, FlowError>,
        next: PresentationStep,
    ) -> PresentationFlowResult {
        match outcome {
            Ok(result) if result.success => {
                self.tracker.set(next);
                result
            }
            Ok(mut result) => {
                let error = result
                    .error
                    .get_or_insert_with(|| FlowError::new("REMOTE_ERROR", "the flow failed"))
                    .clone();
                self.tracker.fail(error);
                result
            }
            Err(error) => {
                self.tracker.fail(error.clone());
                PresentationFlowResult::failure(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        flow::{SignedArtifact, StepInfo},
        test::mock::MockChannel,
        token::AuthToken,
        transport::ProxyTransport,
    };
    use serde_json::json;
    use std::sync::Mutex;
    use url::Url;

    #[derive(Default)]
    struct RecordingLegacy {
        submitted: Mutex<Vec<(String, usize, Option<Value>)>>,
    }

    #[async_trait]
    impl LegacyPresentation for RecordingLegacy {
        async fn resolve_request(
            &self,
            request_uri: &str,
        ) -> Result<LegacyAuthorizationRequest, FlowError> {
            if request_uri.is_empty() {
                return Err(FlowError::new("INVALID_REQUEST", "empty request"));
            }

            Ok(LegacyAuthorizationRequest {
                client_id: "https://verifier.example.com".into(),
                nonce: Some("n-1".into()),
                matched_credentials: vec![json!({"id": "c1"})],
                ..Default::default()
            })
        }

        async fn submit(
            &self,
            request_uri: &str,
            selections: &[CredentialSelection],
            presentation: Option<&Value>,
        ) -> Result<LegacySubmission, FlowError> {
            self.submitted.lock().unwrap().push((
                request_uri.to_string(),
                selections.len(),
                presentation.cloned(),
            ));

            Ok(LegacySubmission {
                redirect_uri: Some("https://verifier.example.com/done".into()),
            })
        }
    }

    struct ClaimEchoSigner;

    #[async_trait]
    impl SigningService for ClaimEchoSigner {
        async fn sign(&self, request: SigningRequest) -> Result<SignedArtifact, FlowError> {
            Ok(SignedArtifact {
                format: "vp+jwt".into(),
                value: json!(request.disclosed_claims),
            })
        }
    }

    fn proxy() -> Arc<dyn ActiveTransportSource> {
        Arc::new(ActiveTransport::Proxy(Arc::new(ProxyTransport::new(
            Url::parse("https://backend.example.com/api").unwrap(),
            MockChannel::ok(json!(null)),
            AuthToken::default(),
        ))))
    }

    fn selection() -> CredentialSelection {
        CredentialSelection {
            credential_id: "c1".into(),
            disclosed_claims: vec!["given_name".into(), "birthdate".into()],
        }
    }

    #[tokio::test]
    async fn legacy_request_and_signed_submission() {
        let legacy = Arc::new(RecordingLegacy::default());
        let steps = Arc::new(Mutex::new(Vec::new()));
        let sink = steps.clone();
        let flow = PresentationFlow::new(
            proxy(),
            FlowCallbacks {
                on_step: Some(Arc::new(move |info: &StepInfo| sink.lock().unwrap().push(info.name))),
                ..Default::default()
            },
        )
        .with_legacy(legacy.clone())
        .with_signer(Arc::new(ClaimEchoSigner));

        let result = flow
            .handle_authorization_request("openid4vp://?request_uri=https://verifier.example.com/r/1")
            .await;
        assert!(result.success);
        assert_eq!(result.client_id.as_deref(), Some("https://verifier.example.com"));
        assert_eq!(flow.step(), PresentationStep::AwaitingSelection);

        let result = flow
            .send_response(PresentationResponse {
                request_uri: Some("openid4vp://?request_uri=https://verifier.example.com/r/1".into()),
                selections: vec![selection()],
                signing: Some(SigningRequest {
                    nonce: result.nonce,
                    audience: "https://verifier.example.com".into(),
                    disclosed_claims: Vec::new(),
                }),
                ..Default::default()
            })
            .await;

        assert!(result.success);
        assert_eq!(result.redirect_uri.as_deref(), Some("https://verifier.example.com/done"));
        let submitted = legacy.submitted.lock().unwrap();
        assert_eq!(
            submitted[0].2,
            Some(json!({"format": "vp+jwt", "value": ["given_name", "birthdate"]}))
        );
        assert_eq!(
            *steps.lock().unwrap(),
            vec![
                "parsing_request",
                "awaiting_selection",
                "signing",
                "submitting",
                "complete"
            ]
        );
    }

    #[tokio::test]
    async fn proxy_submission_needs_the_request_uri() {
        let flow = PresentationFlow::new(proxy(), FlowCallbacks::default())
            .with_legacy(Arc::new(RecordingLegacy::default()));

        let result = flow
            .send_response(PresentationResponse {
                selections: vec![selection()],
                ..Default::default()
            })
            .await;

        assert_eq!(result.error.unwrap().code, "INVALID_FLOW_PARAMS");
        assert_eq!(flow.step(), PresentationStep::Error);
    }

    #[tokio::test]
    async fn legacy_errors_are_normalized() {
        let flow = PresentationFlow::new(proxy(), FlowCallbacks::default())
            .with_legacy(Arc::new(RecordingLegacy::default()));

        let result = flow.handle_authorization_request("").await;

        assert!(!result.success);
        assert_eq!(flow.error().unwrap().code, "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn direct_transport_reports_unimplemented() {
        use crate::transport::DirectTransport;

        let flow = PresentationFlow::new(
            Arc::new(ActiveTransport::Direct(Arc::new(DirectTransport::new(
                MockChannel::ok(json!(null)),
                "https://wallet.example.com",
            )))),
            FlowCallbacks::default(),
        );

        let result = flow.handle_authorization_request("openid4vp://request").await;

        assert_eq!(result.error.unwrap().code, "UNIMPLEMENTED");
    }
}
