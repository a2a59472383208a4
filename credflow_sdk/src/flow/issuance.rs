use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::{
    ActiveTransportSource, FlowCallbacks, FlowStep, SigningRequest, SigningService, StepTracker,
    sign_with,
};
use crate::{
    definitions::{FlowError, IssuanceFlowParams, IssuanceFlowResult},
    session::ActiveTransport,
    transport::{TransportError, websocket::new_flow_id},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssuanceStep {
    Idle,
    ParsingOffer,
    FetchingMetadata,
    AwaitingConsent,
    Authorizing,
    ExchangingToken,
    RequestingCredential,
    Complete,
    Error,
}

const ISSUANCE_STEPS: [IssuanceStep; 9] = [
    IssuanceStep::Idle,
    IssuanceStep::ParsingOffer,
    IssuanceStep::FetchingMetadata,
    IssuanceStep::AwaitingConsent,
    IssuanceStep::Authorizing,
    IssuanceStep::ExchangingToken,
    IssuanceStep::RequestingCredential,
    IssuanceStep::Complete,
    IssuanceStep::Error,
];

impl FlowStep for IssuanceStep {
    const IDLE: Self = IssuanceStep::Idle;
    const ERROR: Self = IssuanceStep::Error;

    fn all() -> &'static [Self] {
        &ISSUANCE_STEPS
    }

    fn name(&self) -> &'static str {
        match self {
            IssuanceStep::Idle => "idle",
            IssuanceStep::ParsingOffer => "parsing_offer",
            IssuanceStep::FetchingMetadata => "fetching_metadata",
            IssuanceStep::AwaitingConsent => "awaiting_consent",
            IssuanceStep::Authorizing => "authorizing",
            IssuanceStep::ExchangingToken => "exchanging_token",
            IssuanceStep::RequestingCredential => "requesting_credential",
            IssuanceStep::Complete => "complete",
            IssuanceStep::Error => "error",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            IssuanceStep::Idle => "Ready",
            IssuanceStep::ParsingOffer => "Reading the credential offer",
            IssuanceStep::FetchingMetadata => "Contacting the issuer",
            IssuanceStep::AwaitingConsent => "Review the offered credentials",
            IssuanceStep::Authorizing => "Waiting for authorization",
            IssuanceStep::ExchangingToken => "Obtaining an access token",
            IssuanceStep::RequestingCredential => "Requesting the credential",
            IssuanceStep::Complete => "Credential received",
            IssuanceStep::Error => "Issuance failed",
        }
    }

    fn progress(&self) -> u8 {
        match self {
            IssuanceStep::Idle | IssuanceStep::Error => 0,
            IssuanceStep::ParsingOffer => 10,
            IssuanceStep::FetchingMetadata => 25,
            IssuanceStep::AwaitingConsent => 40,
            IssuanceStep::Authorizing => 55,
            IssuanceStep::ExchangingToken => 70,
            IssuanceStep::RequestingCredential => 85,
            IssuanceStep::Complete => 100,
        }
    }

    fn requires_user_input(&self) -> bool {
        matches!(self, IssuanceStep::AwaitingConsent | IssuanceStep::Authorizing)
    }

    fn is_terminal(&self) -> bool {
        matches!(self, IssuanceStep::Complete | IssuanceStep::Error)
    }
}

/// A credential offer, by reference or by value
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialOffer {
    Uri(String),
    Value(Value),
}

/// Authorization code returned to the wallet's redirect URI
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationGrant {
    pub code: String,
    pub code_verifier: Option<String>,
    pub redirect_uri: Option<String>,
}

/// Offer as resolved by the legacy implementation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegacyOffer {
    pub issuer_metadata: Value,
    pub credential_offer: Value,
    pub credential_configurations: Option<Value>,
    pub authorization_url: Option<String>,
    pub tx_code: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegacyCredentialResponse {
    pub credentials: Vec<Value>,
    pub c_nonce: Option<String>,
    pub authorization_url: Option<String>,
}

/// Phase-by-phase issuance without orchestration, used over the proxy transport
#[async_trait]
pub trait LegacyIssuance: Send + Sync {
    async fn resolve_offer(&self, offer: &CredentialOffer) -> Result<LegacyOffer, FlowError>;

    async fn request_credential(
        &self,
        configuration_id: &str,
        holder_binding: &Value,
    ) -> Result<LegacyCredentialResponse, FlowError>;

    async fn exchange_authorization_code(
        &self,
        grant: &AuthorizationGrant,
    ) -> Result<LegacyCredentialResponse, FlowError>;
}

impl From<LegacyOffer> for IssuanceFlowResult {
    fn from(offer: LegacyOffer) -> Self {
        Self {
            success: true,
            issuer_metadata: Some(offer.issuer_metadata),
            credential_offer: Some(offer.credential_offer),
            credential_configurations: offer.credential_configurations,
            authorization_url: offer.authorization_url,
            tx_code: offer.tx_code,
            ..Default::default()
        }
    }
}

impl From<LegacyCredentialResponse> for IssuanceFlowResult {
    fn from(response: LegacyCredentialResponse) -> Self {
        Self {
            success: true,
            credentials: Some(response.credentials).filter(|c| !c.is_empty()),
            c_nonce: response.c_nonce,
            authorization_url: response.authorization_url,
            ..Default::default()
        }
    }
}

const PRE_AUTHORIZED_OVER_PROXY: &str =
    "pre-authorized issuance over the proxy transport is not supported, \
     start it again once the persistent transport is available";

/// Credential issuance, one method per protocol phase
pub struct IssuanceFlow {
    source: Arc<dyn ActiveTransportSource>,
    legacy: Option<Arc<dyn LegacyIssuance>>,
    signer: Option<Arc<dyn SigningService>>,
    tracker: StepTracker<IssuanceStep>,
}

impl IssuanceFlow {
    pub fn new(source: Arc<dyn ActiveTransportSource>, callbacks: FlowCallbacks) -> Self {
        Self {
            source,
            legacy: None,
            signer: None,
            tracker: StepTracker::new(callbacks),
        }
    }

    pub fn with_legacy(mut self, legacy: Arc<dyn LegacyIssuance>) -> Self {
        self.legacy = Some(legacy);
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn SigningService>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn step(&self) -> IssuanceStep {
        self.tracker.step()
    }

    pub fn error(&self) -> Option<FlowError> {
        self.tracker.error()
    }

    /// Parse an offer and fetch the issuer metadata
    pub async fn handle_offer(&self, offer: CredentialOffer) -> IssuanceFlowResult {
        self.tracker.begin(IssuanceStep::ParsingOffer);

        let transport = self.source.active_transport();
        let outcome = match (&transport, &self.legacy) {
            (ActiveTransport::Proxy(_), Some(legacy)) => {
                legacy.resolve_offer(&offer).await.map(IssuanceFlowResult::from)
            }
            _ => {
                let mut params = IssuanceFlowParams::default();
                match offer {
                    CredentialOffer::Uri(uri) => params.credential_offer_uri = Some(uri),
                    CredentialOffer::Value(value) => params.credential_offer = Some(value),
                }
                self.orchestrate(&transport, params).await
            }
        };

        self.finish(outcome, |_| IssuanceStep::AwaitingConsent)
    }

    /// Consent to a configuration, binding the credential to a key of the holder
    pub async fn accept_offer(
        &self,
        flow_id: Option<String>,
        configuration_id: &str,
        binding: SigningRequest,
    ) -> IssuanceFlowResult {
        self.tracker.begin(IssuanceStep::Authorizing);

        let outcome: Result<IssuanceFlowResult, FlowError> = async {
            let holder_binding = sign_with(self.signer.as_ref(), binding).await?;

            let transport = self.source.active_transport();
            match (&transport, &self.legacy) {
                (ActiveTransport::Proxy(_), Some(legacy)) => legacy
                    .request_credential(configuration_id, &holder_binding)
                    .await
                    .map(IssuanceFlowResult::from),
                _ => {
                    let params = IssuanceFlowParams {
                        flow_id,
                        holder_binding: Some(holder_binding),
                        credential_configuration_id: Some(configuration_id.to_string()),
                        ..Default::default()
                    };
                    self.orchestrate(&transport, params).await
                }
            }
        }
        .await;

        self.finish(outcome, |result| {
            if result.credentials.is_some() {
                IssuanceStep::Complete
            } else if result.authorization_url.is_some() {
                IssuanceStep::Authorizing
            } else {
                IssuanceStep::RequestingCredential
            }
        })
    }

    /// Continue after the authorization server redirected back with a code
    pub async fn handle_authorization_redirect(
        &self,
        flow_id: Option<String>,
        grant: AuthorizationGrant,
    ) -> IssuanceFlowResult {
        self.tracker.begin(IssuanceStep::ExchangingToken);

        let transport = self.source.active_transport();
        let outcome = match (&transport, &self.legacy) {
            (ActiveTransport::Proxy(_), Some(legacy)) => legacy
                .exchange_authorization_code(&grant)
                .await
                .map(IssuanceFlowResult::from),
            _ => {
                let params = IssuanceFlowParams {
                    flow_id,
                    authorization_code: Some(grant.code),
                    code_verifier: grant.code_verifier,
                    redirect_uri: grant.redirect_uri,
                    ..Default::default()
                };
                self.orchestrate(&transport, params).await
            }
        };

        self.finish(outcome, completion)
    }

    /// Redeem a pre-authorized code, with the transaction code when the offer asked for one
    pub async fn request_with_pre_authorization(
        &self,
        flow_id: Option<String>,
        pre_authorized_code: &str,
        tx_code: Option<&str>,
    ) -> IssuanceFlowResult {
        self.tracker.begin(IssuanceStep::ExchangingToken);

        let transport = self.source.active_transport();
        let outcome = match &transport {
            ActiveTransport::Proxy(_) => Err(FlowError::from(
                TransportError::LegacyFlowRequired(PRE_AUTHORIZED_OVER_PROXY),
            )),
            _ => {
                let params = IssuanceFlowParams {
                    flow_id,
                    pre_authorized_code: Some(pre_authorized_code.to_string()),
                    tx_code: tx_code.map(str::to_string),
                    ..Default::default()
                };
                self.orchestrate(&transport, params).await
            }
        };

        self.finish(outcome, completion)
    }

    async fn orchestrate(
        &self,
        transport: &ActiveTransport,
        mut params: IssuanceFlowParams,
    ) -> Result<IssuanceFlowResult, FlowError> {
        let flow_id = params
            .flow_id
            .get_or_insert_with(new_flow_id)
            .clone();
        let _watch = self.tracker.watch(transport, &flow_id);

        Ok(transport.transport().start_issuance_flow(params).await?)
    }

    fn finish(
        &self,
        outcome: Result<IssuanceFlowResult, FlowError>,
        next: impl FnOnce(&IssuanceFlowResult) -> IssuanceStep,
    ) -> IssuanceFlowResult {
        match outcome {
            Ok(result) if result.success => {
                self.tracker.set(next(&result));
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
                IssuanceFlowResult::failure(error)
            }
        }
    }
}

fn completion(result: &IssuanceFlowResult) -> IssuanceStep {
    if result.credentials.is_some() {
        IssuanceStep::Complete
    } else {
        IssuanceStep::RequestingCredential
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        flow::SignedArtifact,
        test::mock::{MockChannel, MockConnector},
        token::AuthToken,
        transport::{ProxyTransport, WebSocketConfig, WebSocketTransport},
    };
    use serde_json::json;
    use std::sync::Mutex;
    use url::Url;

    struct FakeLegacy;

    #[async_trait]
    impl LegacyIssuance for FakeLegacy {
        async fn resolve_offer(&self, offer: &CredentialOffer) -> Result<LegacyOffer, FlowError> {
            match offer {
                CredentialOffer::Uri(uri) if uri.starts_with("openid-credential-offer://") => {
                    Ok(LegacyOffer {
                        issuer_metadata: json!({"issuer": "https://issuer.example.com"}),
                        credential_offer: json!({"credential_configuration_ids": ["Degree"]}),
                        ..Default::default()
                    })
                }
                _ => Err(FlowError::new("INVALID_OFFER", "Invalid credential offer")),
            }
        }

        async fn request_credential(
            &self,
            configuration_id: &str,
            holder_binding: &Value,
        ) -> Result<LegacyCredentialResponse, FlowError> {
            Ok(LegacyCredentialResponse {
                credentials: vec![json!({"id": configuration_id, "binding": holder_binding})],
                ..Default::default()
            })
        }

        async fn exchange_authorization_code(
            &self,
            grant: &AuthorizationGrant,
        ) -> Result<LegacyCredentialResponse, FlowError> {
            Ok(LegacyCredentialResponse {
                credentials: vec![json!(grant.code)],
                c_nonce: Some("nonce".into()),
                ..Default::default()
            })
        }
    }

    struct FakeSigner;

    #[async_trait]
    impl SigningService for FakeSigner {
        async fn sign(&self, request: SigningRequest) -> Result<SignedArtifact, FlowError> {
            Ok(SignedArtifact {
                format: "jwt".into(),
                value: json!(format!("signed-for-{}", request.audience)),
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

    fn recorded_errors() -> (Arc<Mutex<Vec<String>>>, FlowCallbacks) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let callbacks = FlowCallbacks {
            on_error: Some(Arc::new(move |e: &FlowError| sink.lock().unwrap().push(e.code.clone()))),
            ..Default::default()
        };
        (errors, callbacks)
    }

    #[tokio::test]
    async fn proxy_path_uses_the_legacy_implementation() {
        let flow = IssuanceFlow::new(proxy(), FlowCallbacks::default())
            .with_legacy(Arc::new(FakeLegacy))
            .with_signer(Arc::new(FakeSigner));

        let result = flow
            .handle_offer(CredentialOffer::Uri("openid-credential-offer://?x=1".into()))
            .await;
        assert!(result.success);
        assert_eq!(
            result.issuer_metadata,
            Some(json!({"issuer": "https://issuer.example.com"}))
        );
        assert_eq!(flow.step(), IssuanceStep::AwaitingConsent);

        let result = flow
            .accept_offer(
                None,
                "Degree",
                SigningRequest {
                    audience: "https://issuer.example.com".into(),
                    ..Default::default()
                },
            )
            .await;
        assert!(result.success);
        assert_eq!(flow.step(), IssuanceStep::Complete);
        assert_eq!(
            result.credentials.unwrap()[0]["binding"]["value"],
            "signed-for-https://issuer.example.com"
        );
    }

    #[tokio::test]
    async fn legacy_failures_are_normalized() {
        let (errors, callbacks) = recorded_errors();
        let flow = IssuanceFlow::new(proxy(), callbacks).with_legacy(Arc::new(FakeLegacy));

        let result = flow
            .handle_offer(CredentialOffer::Value(json!({"bogus": true})))
            .await;

        assert!(!result.success);
        assert_eq!(result.error.unwrap().message, "Invalid credential offer");
        assert_eq!(flow.step(), IssuanceStep::Error);
        assert_eq!(flow.error().unwrap().code, "INVALID_OFFER");
        assert_eq!(*errors.lock().unwrap(), vec!["INVALID_OFFER".to_string()]);
    }

    #[tokio::test]
    async fn proxy_without_legacy_implementation_reports_directive() {
        let flow = IssuanceFlow::new(proxy(), FlowCallbacks::default());

        let result = flow
            .handle_offer(CredentialOffer::Uri("openid-credential-offer://?x=1".into()))
            .await;

        assert_eq!(result.error.unwrap().code, "UNSUPPORTED_FLOW_TYPE");
    }

    #[tokio::test]
    async fn pre_authorization_is_unsupported_over_the_proxy() {
        let flow = IssuanceFlow::new(proxy(), FlowCallbacks::default())
            .with_legacy(Arc::new(FakeLegacy));

        let result = flow
            .request_with_pre_authorization(None, "pre-code", Some("1234"))
            .await;

        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, "UNSUPPORTED_FLOW_TYPE");
        assert_eq!(flow.step(), IssuanceStep::Error);
    }

    #[tokio::test]
    async fn consent_without_signer_fails_before_any_transport_call() {
        let flow = IssuanceFlow::new(proxy(), FlowCallbacks::default())
            .with_legacy(Arc::new(FakeLegacy));

        let result = flow
            .accept_offer(Some("f1".into()), "Degree", SigningRequest::default())
            .await;

        assert_eq!(result.error.unwrap().code, "INVALID_FLOW_PARAMS");
    }

    #[tokio::test]
    async fn no_transport_is_a_failure_result() {
        let flow = IssuanceFlow::new(
            Arc::new(ActiveTransport::None(Default::default())),
            FlowCallbacks::default(),
        );

        let result = flow
            .handle_authorization_redirect(
                Some("f1".into()),
                AuthorizationGrant {
                    code: "code".into(),
                    ..Default::default()
                },
            )
            .await;

        assert_eq!(result.error.unwrap().code, "NO_TRANSPORT");
        assert_eq!(flow.step(), IssuanceStep::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_path_forwards_events_of_its_own_flow_only() {
        let connector = MockConnector::new();
        let transport = WebSocketTransport::new(
            WebSocketConfig::new(Url::parse("wss://backend.example.com/ws").unwrap()),
            connector.clone(),
            AuthToken::new(Some("token".into())),
        );
        transport.connect().await.unwrap();
        let mut server = connector.server(0);

        let stages = Arc::new(Mutex::new(Vec::new()));
        let sink = stages.clone();
        let flow = Arc::new(IssuanceFlow::new(
            Arc::new(ActiveTransport::WebSocket(transport.clone())),
            FlowCallbacks {
                on_progress: Some(Arc::new(move |event: &crate::definitions::FlowProgressEvent| {
                    sink.lock().unwrap().push(event.stage.clone())
                })),
                ..Default::default()
            },
        ));

        let call = tokio::spawn({
            let flow = flow.clone();
            async move {
                flow.handle_authorization_redirect(
                    Some("flow-7".into()),
                    AuthorizationGrant {
                        code: "auth-code".into(),
                        code_verifier: Some("verifier".into()),
                        redirect_uri: None,
                    },
                )
                .await
            }
        });

        let request = server.next_request().await;
        assert_eq!(request["type"], "flow.continue");
        assert_eq!(request["action"], "token");
        assert_eq!(request["authorizationCode"], "auth-code");
        server.reply(json!({"flowId": "other", "type": "progress", "stage": "exchanging_token"}));
        server.reply(json!({"flowId": "flow-7", "type": "progress", "stage": "requesting_credential"}));
        server.reply(json!({"flowId": "flow-7", "type": "flow.result", "credentials": ["vc"]}));

        let result = call.await.unwrap();
        assert!(result.success);
        assert_eq!(result.credentials, Some(vec![json!("vc")]));
        assert_eq!(flow.step(), IssuanceStep::Complete);
        assert_eq!(*stages.lock().unwrap(), vec!["requesting_credential".to_string()]);

        // subscriptions end with the call
        assert_eq!(transport.subscriber_counts(), (0, 0));
    }
}
