use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr};

use crate::transport::TransportError;

/// Outbound message types of the persistent-connection wire protocol
pub const MESSAGE_FLOW_START: &str = "flow.start";
pub const MESSAGE_FLOW_CONTINUE: &str = "flow.continue";
pub const MESSAGE_GENERIC_REQUEST: &str = "generic.request";

/// Inbound message types with a dedicated meaning, any other type is a result
pub const MESSAGE_PROGRESS: &str = "progress";
pub const MESSAGE_ERROR: &str = "error";

/// Protocol domain a [FlowRequest] belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowDomain {
    Issuance,
    Presentation,
    Generic,
}

impl FlowDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowDomain::Issuance => "issuance",
            FlowDomain::Presentation => "presentation",
            FlowDomain::Generic => "generic",
        }
    }
}

impl fmt::Display for FlowDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generic passthrough request, used for operations outside the two named protocols
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRequest {
    #[serde(rename = "type")]
    pub domain: FlowDomain,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl FlowRequest {
    pub fn generic(action: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            domain: FlowDomain::Generic,
            action: action.into(),
            payload,
        }
    }
}

/// Machine-readable error carried by failed flow operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl FlowError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Response to a [FlowRequest]
///
/// A successful response never carries an error and a failed one always does;
/// the constructors and the deserializer both uphold this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFlowResponse")]
pub struct FlowResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<FlowError>,
}

#[derive(Deserialize)]
struct RawFlowResponse {
    success: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<FlowError>,
}

impl TryFrom<RawFlowResponse> for FlowResponse {
    type Error = String;

    fn try_from(raw: RawFlowResponse) -> Result<Self, Self::Error> {
        match (raw.success, raw.error) {
            (true, None) => Ok(FlowResponse::success(raw.data)),
            (false, Some(error)) => Ok(FlowResponse {
                success: false,
                data: raw.data,
                error: Some(error),
            }),
            (true, Some(_)) => Err("successful response carries an error".into()),
            (false, None) => Err("failed response without an error".into()),
        }
    }
}

impl FlowResponse {
    pub fn success(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failure(error: FlowError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn error(&self) -> Option<&FlowError> {
        self.error.as_ref()
    }

    pub fn into_result(self) -> Result<Option<Value>, FlowError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data),
        }
    }
}

/// Out-of-band progress notification for a running flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowProgressEvent {
    pub flow_id: String,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Kind of transport carrying flow traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Persistent,
    Proxy,
    Direct,
    None,
}

impl TransportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Persistent => "persistent",
            TransportType::Proxy => "proxy",
            TransportType::Direct => "direct",
            TransportType::None => "none",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "persistent" | "websocket" | "ws" => Ok(TransportType::Persistent),
            "proxy" | "http" => Ok(TransportType::Proxy),
            "direct" => Ok(TransportType::Direct),
            "none" => Ok(TransportType::None),
            other => Err(other.to_string()),
        }
    }
}

/// Live view of the selected transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub transport_type: TransportType,
    pub is_connected: bool,
    pub available_transports: Vec<TransportType>,
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

/// Phases of the credential-issuance protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuancePhase {
    Start,
    Consent,
    TokenExchange,
    PreAuthorized,
}

impl IssuancePhase {
    pub fn action(&self) -> &'static str {
        match self {
            IssuancePhase::Start => "start",
            IssuancePhase::Consent => "consent",
            IssuancePhase::TokenExchange => "token",
            IssuancePhase::PreAuthorized => "pre_authorized",
        }
    }

    /// Wire fields that belong to this phase
    fn fields(&self) -> &'static [&'static str] {
        match self {
            IssuancePhase::Start => &["credentialOfferUri", "credentialOffer"],
            IssuancePhase::Consent => &["holderBinding", "credentialConfigurationId"],
            IssuancePhase::TokenExchange => &["authorizationCode", "codeVerifier", "redirectUri"],
            IssuancePhase::PreAuthorized => &["preAuthorizedCode", "txCode"],
        }
    }
}

/// Parameters for any phase of the issuance protocol
///
/// A call populates only the fields of the phase it wants to run, see
/// [IssuanceFlowParams::phase] for how the phase is inferred.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuanceFlowParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_offer_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_offer: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_binding: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_configuration_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_authorized_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_code: Option<String>,
}

impl IssuanceFlowParams {
    /// Infer the requested phase from the populated fields.
    ///
    /// When several combinations are populated the most advanced phase wins:
    /// consent, then token exchange, then pre-authorized, then start.
    pub fn phase(&self) -> Result<IssuancePhase, TransportError> {
        if self.holder_binding.is_some() && present(&self.credential_configuration_id) {
            Ok(IssuancePhase::Consent)
        } else if present(&self.authorization_code) {
            Ok(IssuancePhase::TokenExchange)
        } else if present(&self.pre_authorized_code) {
            Ok(IssuancePhase::PreAuthorized)
        } else if present(&self.credential_offer_uri) || self.credential_offer.is_some() {
            Ok(IssuancePhase::Start)
        } else {
            Err(TransportError::InvalidFlowParams(
                "issuance requires a credential offer, a holder binding with a configuration id, \
                 an authorization code or a pre-authorized code"
                    .into(),
            ))
        }
    }

    /// Build the outbound wire message for `phase`, without the correlation id
    pub fn to_message(&self, phase: IssuancePhase) -> Map<String, Value> {
        let mut message = phase_message(FlowDomain::Issuance, phase == IssuancePhase::Start);
        if phase != IssuancePhase::Start {
            message.insert("action".into(), phase.action().into());
        }
        copy_fields(self, phase.fields(), &mut message);

        message
    }
}

/// Result of any issuance phase; only the fields the server sent are populated
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuanceFlowResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_offer: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_configurations: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_code: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c_nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FlowError>,
}

impl IssuanceFlowResult {
    /// Map an inbound server message field by field
    pub fn from_message(message: InboundMessage) -> Result<Self, TransportError> {
        message.map_result()
    }

    pub fn failure(error: FlowError) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Default::default()
        }
    }
}

/// One credential chosen for a presentation, with the claims to disclose
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSelection {
    pub credential_id: String,
    #[serde(default)]
    pub disclosed_claims: Vec<String>,
}

/// Phases of the presentation protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationPhase {
    Start,
    Submit,
}

impl PresentationPhase {
    pub fn action(&self) -> &'static str {
        match self {
            PresentationPhase::Start => "start",
            PresentationPhase::Submit => "submit",
        }
    }

    fn fields(&self) -> &'static [&'static str] {
        match self {
            PresentationPhase::Start => &["requestUri", "request"],
            PresentationPhase::Submit => &["requestUri", "selectedCredentials", "presentation"],
        }
    }
}

/// Parameters for any phase of the presentation protocol
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentationFlowParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_credentials: Option<Vec<CredentialSelection>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presentation: Option<Value>,
}

impl PresentationFlowParams {
    /// A credential selection always means submit, even when the request is repeated
    pub fn phase(&self) -> Result<PresentationPhase, TransportError> {
        if self.selected_credentials.is_some() {
            Ok(PresentationPhase::Submit)
        } else if present(&self.request_uri) || self.request.is_some() {
            Ok(PresentationPhase::Start)
        } else {
            Err(TransportError::InvalidFlowParams(
                "presentation requires an authorization request or a credential selection".into(),
            ))
        }
    }

    pub fn to_message(&self, phase: PresentationPhase) -> Map<String, Value> {
        let mut message =
            phase_message(FlowDomain::Presentation, phase == PresentationPhase::Start);
        if phase != PresentationPhase::Start {
            message.insert("action".into(), phase.action().into());
        }
        copy_fields(self, phase.fields(), &mut message);

        message
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentationFlowResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verifier: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_claims: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_credentials: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FlowError>,
}

impl PresentationFlowResult {
    pub fn from_message(message: InboundMessage) -> Result<Self, TransportError> {
        message.map_result()
    }

    pub fn failure(error: FlowError) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Default::default()
        }
    }
}

fn phase_message(domain: FlowDomain, start: bool) -> Map<String, Value> {
    let kind = if start {
        MESSAGE_FLOW_START
    } else {
        MESSAGE_FLOW_CONTINUE
    };

    let mut message = Map::new();
    message.insert("type".into(), kind.into());
    message.insert("flow".into(), domain.as_str().into());

    message
}

fn copy_fields<T: Serialize>(params: &T, fields: &[&str], message: &mut Map<String, Value>) {
    // the parameter structs only hold strings, json values and plain structs
    let Ok(Value::Object(mut all)) = serde_json::to_value(params) else {
        return;
    };

    for field in fields {
        if let Some(value) = all.remove(*field) {
            message.insert((*field).to_string(), value);
        }
    }
}

/// A message received over the persistent connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "flowId", default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text).map_err(|e| TransportError::InvalidMessageReceived(e.to_string()))
    }

    pub fn is_progress(&self) -> bool {
        self.kind == MESSAGE_PROGRESS
    }

    pub fn is_error(&self) -> bool {
        self.kind == MESSAGE_ERROR
    }

    /// Interpret a `progress` message; `None` when it lacks a flow id or a stage
    pub fn progress_event(&self) -> Option<FlowProgressEvent> {
        let flow_id = self.flow_id.clone()?;
        let stage = self.fields.get("stage")?.as_str()?.to_string();

        Some(FlowProgressEvent {
            flow_id,
            stage,
            progress: self
                .fields
                .get("progress")
                .and_then(Value::as_u64)
                .map(|p| p.min(100) as u8),
            message: self
                .fields
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            payload: self.fields.get("payload").cloned(),
        })
    }

    /// The error carried by an `error` message
    pub fn flow_error(&self) -> FlowError {
        let error = self.fields.get("error");
        let text = |key: &str| {
            error
                .and_then(|e| e.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let mut flow_error = FlowError::new(
            text("code").unwrap_or_else(|| "REMOTE_ERROR".into()),
            text("message").unwrap_or_else(|| "the server reported an error".into()),
        );
        flow_error.details = error.and_then(|e| e.get("details")).cloned();

        flow_error
    }

    fn map_result<T: DeserializeOwned>(self) -> Result<T, TransportError> {
        let success = !self.is_error();
        let error = (!success).then(|| self.flow_error());

        let mut fields = self.fields;
        fields.insert("success".into(), Value::Bool(success));
        match error {
            Some(error) => {
                let error = serde_json::to_value(error)
                    .map_err(|e| TransportError::InvalidMessageReceived(e.to_string()))?;
                fields.insert("error".into(), error);
            }
            None => {
                fields.remove("error");
            }
        }
        if let Some(flow_id) = self.flow_id {
            fields.insert("flowId".into(), Value::String(flow_id));
        }

        serde_json::from_value(Value::Object(fields))
            .map_err(|e| TransportError::InvalidMessageReceived(e.to_string()))
    }
}

// helpers for generating arbitrary flow parameters
#[cfg(feature = "fuzzing")]
pub mod fuzzing;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn issuance_phase_dispatch() {
        let start = IssuanceFlowParams {
            credential_offer_uri: Some("openid-credential-offer://?x=1".into()),
            ..Default::default()
        };
        assert_eq!(start.phase().unwrap(), IssuancePhase::Start);

        let consent = IssuanceFlowParams {
            holder_binding: Some(json!({"proof": "..."})),
            credential_configuration_id: Some("UniversityDegree".into()),
            ..Default::default()
        };
        assert_eq!(consent.phase().unwrap(), IssuancePhase::Consent);

        let token = IssuanceFlowParams {
            authorization_code: Some("code".into()),
            ..Default::default()
        };
        assert_eq!(token.phase().unwrap(), IssuancePhase::TokenExchange);

        let pre_authorized = IssuanceFlowParams {
            pre_authorized_code: Some("pre".into()),
            ..Default::default()
        };
        assert_eq!(pre_authorized.phase().unwrap(), IssuancePhase::PreAuthorized);
    }

    #[test]
    fn issuance_phase_requires_a_combination() {
        let holder_only = IssuanceFlowParams {
            holder_binding: Some(json!("binding")),
            credential_offer_uri: Some(String::new()),
            ..Default::default()
        };

        assert!(matches!(
            holder_only.phase(),
            Err(TransportError::InvalidFlowParams(_))
        ));
        assert!(IssuanceFlowParams::default().phase().is_err());
    }

    #[test]
    fn issuance_phase_precedence() {
        let params = IssuanceFlowParams {
            credential_offer_uri: Some("openid-credential-offer://?x=1".into()),
            pre_authorized_code: Some("pre".into()),
            ..Default::default()
        };

        assert_eq!(params.phase().unwrap(), IssuancePhase::PreAuthorized);
    }

    #[test]
    fn presentation_phase_dispatch() {
        let start = PresentationFlowParams {
            request_uri: Some("openid4vp://?request_uri=https://verifier.example.com/r/1".into()),
            ..Default::default()
        };
        assert_eq!(start.phase().unwrap(), PresentationPhase::Start);

        let submit = PresentationFlowParams {
            selected_credentials: Some(vec![]),
            ..start.clone()
        };
        assert_eq!(submit.phase().unwrap(), PresentationPhase::Submit);

        assert!(PresentationFlowParams::default().phase().is_err());
    }

    #[test]
    fn outbound_messages_only_carry_phase_fields() {
        let params = IssuanceFlowParams {
            authorization_code: Some("code".into()),
            code_verifier: Some("verifier".into()),
            credential_offer_uri: Some("ignored".into()),
            ..Default::default()
        };

        let message = params.to_message(IssuancePhase::TokenExchange);
        assert_eq!(
            Value::Object(message),
            json!({
                "type": "flow.continue",
                "flow": "issuance",
                "action": "token",
                "authorizationCode": "code",
                "codeVerifier": "verifier",
            })
        );

        let start = PresentationFlowParams {
            request_uri: Some("openid4vp://request".into()),
            ..Default::default()
        };
        assert_eq!(
            Value::Object(start.to_message(PresentationPhase::Start)),
            json!({"type": "flow.start", "flow": "presentation", "requestUri": "openid4vp://request"})
        );
    }

    #[test]
    fn result_mapping_omits_absent_fields() {
        let message = InboundMessage::parse(
            r#"{"flowId":"f1","type":"flow.result","issuerMetadata":{"issuer":"https://issuer.example.com"},"unknown":1}"#,
        )
        .unwrap();

        let result = IssuanceFlowResult::from_message(message).unwrap();
        assert!(result.success);
        assert_eq!(result.flow_id.as_deref(), Some("f1"));
        assert_eq!(
            result.issuer_metadata,
            Some(json!({"issuer": "https://issuer.example.com"}))
        );
        assert_eq!(result.authorization_url, None);
        assert_eq!(result.credentials, None);
    }

    #[test]
    fn error_messages_map_to_failed_results() {
        let message = InboundMessage::parse(
            r#"{"flowId":"f1","type":"error","error":{"code":"DENIED","message":"user denied"}}"#,
        )
        .unwrap();

        let result = PresentationFlowResult::from_message(message).unwrap();
        assert!(!result.success);
        assert_eq!(result.error, Some(FlowError::new("DENIED", "user denied")));
    }

    #[test]
    fn malformed_result_fields_are_rejected() {
        let message =
            InboundMessage::parse(r#"{"flowId":"f1","type":"flow.result","credentials":"nope"}"#)
                .unwrap();

        assert!(matches!(
            IssuanceFlowResult::from_message(message),
            Err(TransportError::InvalidMessageReceived(_))
        ));
    }

    #[test]
    fn progress_events() {
        let message = InboundMessage::parse(
            r#"{"flowId":"f1","type":"progress","stage":"fetching_metadata","progress":250}"#,
        )
        .unwrap();

        let event = message.progress_event().unwrap();
        assert_eq!(event.stage, "fetching_metadata");
        assert_eq!(event.progress, Some(100));
        assert_eq!(event.message, None);
    }

    #[test]
    fn flow_response_invariant() {
        assert!(serde_json::from_str::<FlowResponse>(r#"{"success":false}"#).is_err());
        assert!(
            serde_json::from_str::<FlowResponse>(
                r#"{"success":true,"error":{"code":"X","message":"y"}}"#
            )
            .is_err()
        );

        let response: FlowResponse =
            serde_json::from_str(r#"{"success":true,"data":{"a":1}}"#).unwrap();
        assert_eq!(response.into_result().unwrap(), Some(json!({"a": 1})));
    }
}
