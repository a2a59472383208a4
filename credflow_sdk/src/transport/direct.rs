use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ORIGIN};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tracing::{info, warn};
use url::Url;

use super::{
    ErrorCallback, ProgressCallback, Subscription, Transport, TransportError, http::RequestChannel,
};
use crate::definitions::{
    FlowRequest, FlowResponse, IssuanceFlowParams, IssuanceFlowResult, PresentationFlowParams,
    PresentationFlowResult, TransportType,
};

/// Metadata document every credential issuer publishes
pub const ISSUER_METADATA_PATH: &str = ".well-known/openid-credential-issuer";

const ALLOW_ORIGIN: &str = "access-control-allow-origin";

/// Outcome of probing an issuer for direct wallet-to-issuer traffic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectProbe {
    pub reachable: bool,
    pub cross_origin_allowed: bool,
}

impl DirectProbe {
    pub fn is_viable(&self) -> bool {
        self.reachable && self.cross_origin_allowed
    }
}

/// Wallet-to-issuer transport without a backend in between.
///
/// Only the viability probe exists; every flow operation reports
/// [TransportError::Unimplemented].
pub struct DirectTransport {
    channel: Arc<dyn RequestChannel>,
    origin: String,
    endpoint: Option<Url>,
    viable: AtomicBool,
}

impl DirectTransport {
    pub fn new(channel: Arc<dyn RequestChannel>, origin: impl Into<String>) -> Self {
        Self {
            channel,
            origin: origin.into(),
            endpoint: None,
            viable: AtomicBool::new(false),
        }
    }

    /// Probe this issuer on [Transport::connect]
    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Check whether `endpoint` answers its issuer metadata and allows our origin
    pub async fn probe(&self, endpoint: &Url) -> DirectProbe {
        let url = match metadata_url(endpoint) {
            Ok(url) => url,
            Err(e) => {
                warn!("cannot probe {endpoint}: {e}");
                return DirectProbe::default();
            }
        };

        let mut headers = HeaderMap::new();
        match HeaderValue::from_str(&self.origin) {
            Ok(origin) => {
                headers.insert(ORIGIN, origin);
            }
            Err(_) => warn!("origin '{}' is not a valid header value", self.origin),
        }

        let response = match self.channel.get(&url, headers).await {
            Ok(response) => response,
            Err(e) => {
                warn!("direct probe of {url} failed: {e}");
                return DirectProbe::default();
            }
        };

        let cross_origin_allowed = response
            .header(ALLOW_ORIGIN)
            .is_some_and(|allowed| allowed == "*" || allowed == self.origin);

        DirectProbe {
            reachable: response.is_success(),
            cross_origin_allowed,
        }
    }
}

fn metadata_url(endpoint: &Url) -> Result<Url, url::ParseError> {
    let mut base = endpoint.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }

    base.join(ISSUER_METADATA_PATH)
}

#[async_trait]
impl Transport for DirectTransport {
    fn kind(&self) -> TransportType {
        TransportType::Direct
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let Some(endpoint) = &self.endpoint else {
            return Err(TransportError::Unimplemented("connecting without an issuer endpoint"));
        };

        let probe = self.probe(endpoint).await;
        self.viable.store(probe.is_viable(), Ordering::SeqCst);
        info!("direct transport to {endpoint}: {probe:?}");

        Ok(())
    }

    async fn disconnect(&self) {
        self.viable.store(false, Ordering::SeqCst);
    }

    /// Reflects the last probe
    fn is_connected(&self) -> bool {
        self.viable.load(Ordering::SeqCst)
    }

    async fn start_issuance_flow(
        &self,
        _params: IssuanceFlowParams,
    ) -> Result<IssuanceFlowResult, TransportError> {
        Err(TransportError::Unimplemented("issuance"))
    }

    async fn start_presentation_flow(
        &self,
        _params: PresentationFlowParams,
    ) -> Result<PresentationFlowResult, TransportError> {
        Err(TransportError::Unimplemented("presentation"))
    }

    async fn request(&self, _request: FlowRequest) -> Result<FlowResponse, TransportError> {
        Err(TransportError::Unimplemented("generic requests"))
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
    use crate::{test::mock::MockChannel, transport::http::HttpResponse};
    use serde_json::json;

    const WALLET_ORIGIN: &str = "https://wallet.example.com";

    fn cors_response(status: u16, allow: Option<&'static str>) -> HttpResponse {
        let mut response = HttpResponse::new(status, json!({"credential_issuer": "https://issuer.example.com"}));
        if let Some(allow) = allow {
            response
                .headers
                .insert(ALLOW_ORIGIN, HeaderValue::from_static(allow));
        }
        response
    }

    #[tokio::test]
    async fn probe_checks_metadata_and_cors() {
        let channel = MockChannel::new(|_| Ok(cors_response(200, Some(WALLET_ORIGIN))));
        let direct = DirectTransport::new(channel.clone(), WALLET_ORIGIN);

        let probe = direct
            .probe(&Url::parse("https://issuer.example.com/tenant").unwrap())
            .await;

        assert!(probe.is_viable());
        let calls = channel.calls();
        assert_eq!(
            calls[0].url.as_str(),
            "https://issuer.example.com/tenant/.well-known/openid-credential-issuer"
        );
        assert_eq!(calls[0].origin.as_deref(), Some(WALLET_ORIGIN));
    }

    #[tokio::test]
    async fn missing_cors_header_is_not_viable() {
        let channel = MockChannel::new(|_| Ok(cors_response(200, None)));
        let direct = DirectTransport::new(channel, WALLET_ORIGIN)
            .with_endpoint(Url::parse("https://issuer.example.com").unwrap());

        direct.connect().await.unwrap();

        assert!(!direct.is_connected());
    }

    #[tokio::test]
    async fn connect_reflects_successful_probe() {
        let channel = MockChannel::new(|_| Ok(cors_response(200, Some("*"))));
        let direct = DirectTransport::new(channel, WALLET_ORIGIN)
            .with_endpoint(Url::parse("https://issuer.example.com").unwrap());

        direct.connect().await.unwrap();
        assert!(direct.is_connected());

        direct.disconnect().await;
        assert!(!direct.is_connected());
    }

    #[tokio::test]
    async fn unreachable_issuer_is_not_viable() {
        let channel = MockChannel::new(|call| {
            Err(TransportError::Http(call.url.to_string(), "dns failure".into()))
        });
        let direct = DirectTransport::new(channel, WALLET_ORIGIN);

        let probe = direct
            .probe(&Url::parse("https://issuer.example.com").unwrap())
            .await;

        assert_eq!(probe, DirectProbe::default());
    }

    #[tokio::test]
    async fn flows_are_unimplemented() {
        let direct = DirectTransport::new(MockChannel::ok(json!(null)), WALLET_ORIGIN);

        assert_eq!(
            direct
                .start_issuance_flow(IssuanceFlowParams::default())
                .await
                .unwrap_err()
                .code(),
            "UNIMPLEMENTED"
        );
        assert_eq!(
            direct
                .request(FlowRequest::generic("ping", None))
                .await
                .unwrap_err(),
            TransportError::Unimplemented("generic requests")
        );
        assert!(direct.connect().await.is_err());
    }
}
