use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::Value;
use url::Url;

use super::TransportError;

/// Response of a stateless request; non-JSON bodies are carried as a JSON string
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub data: Value,
    pub headers: HeaderMap,
}

impl HttpResponse {
    pub fn new(status: u16, data: Value) -> Self {
        Self {
            status,
            data,
            headers: HeaderMap::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Stateless request/response channel consumed by the proxy transport,
/// the direct transport and capability discovery
#[async_trait]
pub trait RequestChannel: Send + Sync {
    async fn get(&self, url: &Url, headers: HeaderMap) -> Result<HttpResponse, TransportError>;

    async fn post(
        &self,
        url: &Url,
        body: &Value,
        headers: HeaderMap,
    ) -> Result<HttpResponse, TransportError>;
}

/// [RequestChannel] over the process-wide reqwest client
#[derive(Debug, Default, Clone, Copy)]
pub struct ReqwestChannel;

impl ReqwestChannel {
    async fn execute(
        &self,
        url: &Url,
        request: reqwest::RequestBuilder,
    ) -> Result<HttpResponse, TransportError> {
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Http(url.to_string(), e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Http(url.to_string(), e.to_string()))?;

        let data = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if !(200..300).contains(&status) {
            tracing::debug!("{url} answered {status}");
        }

        Ok(HttpResponse {
            status,
            data,
            headers,
        })
    }

    fn client(&self) -> Result<&'static reqwest::Client, TransportError> {
        crate::http_client::shared_client()
    }
}

#[async_trait]
impl RequestChannel for ReqwestChannel {
    async fn get(&self, url: &Url, headers: HeaderMap) -> Result<HttpResponse, TransportError> {
        let request = self.client()?.get(url.clone()).headers(headers);

        self.execute(url, request).await
    }

    async fn post(
        &self,
        url: &Url,
        body: &Value,
        headers: HeaderMap,
    ) -> Result<HttpResponse, TransportError> {
        let request = self.client()?.post(url.clone()).headers(headers).json(body);

        self.execute(url, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn response_helpers() {
        let mut response = HttpResponse::new(204, Value::Null);
        response.headers.insert(
            "access-control-allow-origin",
            HeaderValue::from_static("*"),
        );

        assert!(response.is_success());
        assert_eq!(response.header("Access-Control-Allow-Origin"), Some("*"));
        assert!(!HttpResponse::new(404, Value::Null).is_success());
    }

    #[tokio::test]
    async fn unreachable_host_is_an_http_error() {
        let url = Url::parse("http://127.0.0.1:9/status").unwrap();

        let error = ReqwestChannel.get(&url, HeaderMap::new()).await.unwrap_err();

        assert!(matches!(error, TransportError::Http(address, _) if address == url.as_str()));
    }
}
