use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use super::{
    ErrorCallback, ProgressCallback, Subscription, Transport, TransportError,
    http::{HttpResponse, RequestChannel},
};
use crate::{
    definitions::{
        FlowDomain, FlowError, FlowRequest, FlowResponse, IssuanceFlowParams, IssuanceFlowResult,
        PresentationFlowParams, PresentationFlowResult, TransportType,
    },
    token::{AuthToken, TokenRefresher},
};

const ISSUANCE_DIRECTIVE: &str = "issuance is not orchestrated over the proxy transport, \
     use the legacy issuance flow instead";
const PRESENTATION_DIRECTIVE: &str = "presentation is not orchestrated over the proxy transport, \
     use the legacy presentation flow instead";

/// Stateless request/response transport for generic passthrough requests.
///
/// The generic `action` is resolved as a path relative to the proxy base URL;
/// requests without payload are sent as GET, with payload as POST.
pub struct ProxyTransport {
    base_url: Url,
    channel: Arc<dyn RequestChannel>,
    token: AuthToken,
    refresher: Option<Arc<TokenRefresher>>,
}

impl std::fmt::Debug for ProxyTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyTransport")
            .field("base_url", &self.base_url.as_str())
            .field("token", &self.token)
            .finish()
    }
}

impl ProxyTransport {
    pub fn new(base_url: Url, channel: Arc<dyn RequestChannel>, token: AuthToken) -> Self {
        let mut base_url = base_url;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Self {
            base_url,
            channel,
            token,
            refresher: None,
        }
    }

    /// Refresh the token once and retry when a request is answered with 401
    pub fn with_refresher(mut self, refresher: Arc<TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub(crate) fn channel(&self) -> Arc<dyn RequestChannel> {
        self.channel.clone()
    }

    /// Resolve `action` below the base URL; anything escaping it is refused,
    /// as the request carries the bearer token
    fn endpoint(&self, action: &str) -> Result<Url, TransportError> {
        let invalid =
            |reason: &str| TransportError::InvalidFlowParams(format!("invalid action '{action}': {reason}"));

        let relative = action.trim_start_matches('/');
        if Url::parse(relative).is_ok() || relative.contains('\\') {
            return Err(invalid("not a path below the proxy base"));
        }

        let path = relative.split(['?', '#']).next().unwrap_or_default();
        if path.split('/').any(|segment| segment == "." || segment == "..") {
            return Err(invalid("dot segments are not allowed"));
        }

        let url = self
            .base_url
            .join(relative)
            .map_err(|e| invalid(&e.to_string()))?;

        if url.origin() != self.base_url.origin() || !url.path().starts_with(self.base_url.path()) {
            return Err(invalid("not a path below the proxy base"));
        }

        Ok(url)
    }

    fn headers(&self) -> Result<HeaderMap, TransportError> {
        let mut headers = HeaderMap::new();

        if let Some(token) = self.token.get() {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.as_str()))
                .map_err(|_| TransportError::InvalidFlowParams("malformed auth token".into()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        Ok(headers)
    }

    async fn send(&self, url: &Url, payload: Option<&Value>) -> Result<HttpResponse, TransportError> {
        let headers = self.headers()?;

        match payload {
            Some(body) => self.channel.post(url, body, headers).await,
            None => self.channel.get(url, headers).await,
        }
    }
}

/// Map a non-success response onto a structured failure
fn failure(response: &HttpResponse) -> FlowError {
    let text = |key: &str| response.data.get(key).and_then(Value::as_str);

    let code = text("error")
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP_{}", response.status));
    let message = text("error_description")
        .or_else(|| text("message"))
        .map(str::to_string)
        .unwrap_or_else(|| format!("request failed with status {}", response.status));

    let error = FlowError::new(code, message);
    if response.data.is_null() {
        error
    } else {
        error.with_details(response.data.clone())
    }
}

#[async_trait]
impl Transport for ProxyTransport {
    fn kind(&self) -> TransportType {
        TransportType::Proxy
    }

    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self) {}

    fn is_connected(&self) -> bool {
        true
    }

    async fn start_issuance_flow(
        &self,
        _params: IssuanceFlowParams,
    ) -> Result<IssuanceFlowResult, TransportError> {
        Err(TransportError::LegacyFlowRequired(ISSUANCE_DIRECTIVE))
    }

    async fn start_presentation_flow(
        &self,
        _params: PresentationFlowParams,
    ) -> Result<PresentationFlowResult, TransportError> {
        Err(TransportError::LegacyFlowRequired(PRESENTATION_DIRECTIVE))
    }

    async fn request(&self, request: FlowRequest) -> Result<FlowResponse, TransportError> {
        if request.domain != FlowDomain::Generic {
            return Err(TransportError::UnsupportedFlowType(
                request.domain.as_str().to_string(),
            ));
        }

        let url = self.endpoint(&request.action)?;
        let payload = request.payload.as_ref();

        let mut response = self.send(&url, payload).await?;

        if response.status == 401 {
            if let Some(refresher) = &self.refresher {
                match refresher.refresh().await {
                    Ok(_) => {
                        debug!("retrying {} with a refreshed token", request.action);
                        response = self.send(&url, payload).await?;
                    }
                    Err(e) => warn!("token refresh after 401 failed: {e}"),
                }
            }
        }

        if response.is_success() {
            let data = Some(response.data).filter(|data| !data.is_null());
            Ok(FlowResponse::success(data))
        } else {
            Ok(FlowResponse::failure(failure(&response)))
        }
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
    use crate::{
        test::mock::{Method, MockChannel},
        token::{RefreshError, TokenSource},
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn proxy_for(channel: &Arc<MockChannel>, token: &str) -> ProxyTransport {
        ProxyTransport::new(
            Url::parse("https://wallet.example.com/api").unwrap(),
            channel.clone(),
            AuthToken::new(Some(token.into())),
        )
    }

    #[tokio::test]
    async fn always_connected() {
        let channel = MockChannel::ok(json!(null));
        let proxy = proxy_for(&channel, "t");

        assert!(proxy.is_connected());
        proxy.connect().await.unwrap();
        proxy.disconnect().await;
        assert!(proxy.is_connected());
        assert_eq!(channel.call_count(), 0);
    }

    #[tokio::test]
    async fn named_flows_direct_to_legacy_implementation() {
        let channel = MockChannel::ok(json!(null));
        let proxy = proxy_for(&channel, "t");

        let error = proxy
            .start_issuance_flow(IssuanceFlowParams::default())
            .await
            .unwrap_err();
        assert_eq!(error.code(), "UNSUPPORTED_FLOW_TYPE");
        assert!(error.to_string().contains("legacy issuance flow"));

        let error = proxy
            .start_presentation_flow(PresentationFlowParams::default())
            .await
            .unwrap_err();
        assert!(error.to_string().contains("legacy presentation flow"));
        assert_eq!(channel.call_count(), 0);
    }

    #[tokio::test]
    async fn only_generic_requests_are_supported() {
        let channel = MockChannel::ok(json!(null));
        let proxy = proxy_for(&channel, "t");

        let error = proxy
            .request(FlowRequest {
                domain: FlowDomain::Issuance,
                action: "start".into(),
                payload: None,
            })
            .await
            .unwrap_err();

        assert_eq!(error, TransportError::UnsupportedFlowType("issuance".into()));
        assert_eq!(channel.call_count(), 0);
    }

    #[tokio::test]
    async fn generic_requests_choose_method_by_payload() {
        let channel = MockChannel::ok(json!({"items": []}));
        let proxy = proxy_for(&channel, "secret");

        let response = proxy
            .request(FlowRequest::generic("credentials", None))
            .await
            .unwrap();
        assert_eq!(response.data(), Some(&json!({"items": []})));

        proxy
            .request(FlowRequest::generic("/credentials/delete", Some(json!({"id": "c1"}))))
            .await
            .unwrap();

        let calls = channel.calls();
        assert_eq!(calls[0].method, Method::Get);
        assert_eq!(calls[0].url.as_str(), "https://wallet.example.com/api/credentials");
        assert_eq!(calls[0].authorization.as_deref(), Some("Bearer secret"));
        assert_eq!(calls[1].method, Method::Post);
        assert_eq!(
            calls[1].url.as_str(),
            "https://wallet.example.com/api/credentials/delete"
        );
        assert_eq!(calls[1].body, Some(json!({"id": "c1"})));
    }

    #[tokio::test]
    async fn actions_cannot_leave_the_proxy_base() {
        let channel = MockChannel::ok(json!(null));
        let proxy = proxy_for(&channel, "secret");

        for action in [
            "https://evil.example/steal",
            "../admin",
            "credentials/../../admin",
            "%2e%2e/admin",
            "..\\admin",
        ] {
            let error = proxy
                .request(FlowRequest::generic(action, None))
                .await
                .unwrap_err();
            assert_eq!(error.code(), "INVALID_FLOW_PARAMS", "{action}");
        }

        assert_eq!(channel.call_count(), 0);
    }

    #[tokio::test]
    async fn actions_may_carry_a_query() {
        let channel = MockChannel::ok(json!(null));
        let proxy = proxy_for(&channel, "secret");

        proxy
            .request(FlowRequest::generic("credentials?format=jwt", None))
            .await
            .unwrap();

        assert_eq!(
            channel.calls()[0].url.as_str(),
            "https://wallet.example.com/api/credentials?format=jwt"
        );
    }

    #[tokio::test]
    async fn non_success_is_a_structured_failure() {
        let channel = MockChannel::new(|_| {
            Ok(HttpResponse::new(
                400,
                json!({"error": "invalid_request", "error_description": "missing id"}),
            ))
        });
        let proxy = proxy_for(&channel, "t");

        let response = proxy
            .request(FlowRequest::generic("credentials/delete", Some(json!({}))))
            .await
            .unwrap();

        let error = response.error().unwrap();
        assert_eq!(error.code, "invalid_request");
        assert_eq!(error.message, "missing id");

        let channel = MockChannel::new(|_| Ok(HttpResponse::new(503, Value::Null)));
        let response = proxy_for(&channel, "t")
            .request(FlowRequest::generic("status", None))
            .await
            .unwrap();
        assert_eq!(response.error().unwrap().code, "HTTP_503");
    }

    #[tokio::test]
    async fn network_failure_is_an_error() {
        let channel = MockChannel::new(|call| {
            Err(TransportError::Http(call.url.to_string(), "connection reset".into()))
        });

        let error = proxy_for(&channel, "t")
            .request(FlowRequest::generic("status", None))
            .await
            .unwrap_err();

        assert_eq!(error.code(), "HTTP_ERROR");
    }

    struct FixedSource(AtomicUsize, Result<&'static str, RefreshError>);

    #[async_trait]
    impl TokenSource for FixedSource {
        async fn refresh_token(&self) -> Result<String, RefreshError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            self.1.clone().map(str::to_string)
        }
    }

    #[tokio::test]
    async fn unauthorized_triggers_one_refresh_and_one_retry() {
        let channel = MockChannel::new(|call| {
            if call.authorization.as_deref() == Some("Bearer fresh") {
                Ok(HttpResponse::new(200, json!({"ok": true})))
            } else {
                Ok(HttpResponse::new(401, json!({"error": "unauthorized"})))
            }
        });
        let source = Arc::new(FixedSource(AtomicUsize::new(0), Ok("fresh")));
        let token = AuthToken::new(Some("expired".into()));
        let proxy = ProxyTransport::new(
            Url::parse("https://wallet.example.com/api/").unwrap(),
            channel.clone(),
            token.clone(),
        )
        .with_refresher(Arc::new(TokenRefresher::new(source.clone(), token.clone())));

        let response = proxy
            .request(FlowRequest::generic("credentials", None))
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(channel.call_count(), 2);
        assert_eq!(source.0.load(Ordering::SeqCst), 1);
        assert_eq!(token.get().as_deref().map(String::as_str), Some("fresh"));
    }

    #[tokio::test]
    async fn unauthorized_is_retried_at_most_once() {
        let channel = MockChannel::new(|_| Ok(HttpResponse::new(401, json!({"error": "unauthorized"}))));
        let source = Arc::new(FixedSource(AtomicUsize::new(0), Ok("still-bad")));
        let token = AuthToken::new(Some("expired".into()));
        let proxy = proxy_for(&channel, "expired")
            .with_refresher(Arc::new(TokenRefresher::new(source.clone(), token)));

        let response = proxy
            .request(FlowRequest::generic("credentials", None))
            .await
            .unwrap();

        assert_eq!(response.error().unwrap().code, "unauthorized");
        assert_eq!(channel.call_count(), 2);
        assert_eq!(source.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_returns_the_original_failure() {
        let channel = MockChannel::new(|_| Ok(HttpResponse::new(401, Value::Null)));
        let source = Arc::new(FixedSource(
            AtomicUsize::new(0),
            Err(RefreshError::Rejected("expired".into())),
        ));
        let token = AuthToken::new(Some("expired".into()));
        let proxy = ProxyTransport::new(
            Url::parse("https://wallet.example.com/api/").unwrap(),
            channel.clone(),
            token.clone(),
        )
        .with_refresher(Arc::new(TokenRefresher::new(source, token)));

        let response = proxy
            .request(FlowRequest::generic("credentials", None))
            .await
            .unwrap();

        assert_eq!(response.error().unwrap().code, "HTTP_401");
        assert_eq!(channel.call_count(), 1);
    }
}
