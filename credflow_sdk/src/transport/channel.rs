use async_stream::stream;
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::tungstenite::{
    self, Message, Utf8Bytes,
    protocol::{CloseFrame, frame::coding::CloseCode},
};
use url::Url;

use super::TransportError;
#[cfg(feature = "use_local_certificate")]
use {
    rustls_pki_types::{CertificateDer, pem::PemObject},
    std::sync::Arc,
    tokio_tungstenite::Connector as TlsConnector,
    tracing::warn,
};

pub(crate) const SCHEME_HTTP: &str = "http";
pub(crate) const SCHEME_HTTPS: &str = "https";

pub(crate) const SCHEME_WS: &str = "ws";
pub(crate) const SCHEME_WSS: &str = "wss";

/// Close code sent on an intentional disconnect; no reconnection follows it
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code reported when the peer sent no status
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Close code reported when the connection dropped without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Frame written to a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close(u16),
}

/// Event read from a channel; `Closed` is always the last one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Text(String),
    Closed { code: u16, reason: String },
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
pub type EventStream = Pin<Box<dyn Stream<Item = ChannelEvent> + Send>>;

/// An open bidirectional channel
pub struct Channel {
    pub sink: FrameSink,
    pub events: EventStream,
}

/// Opens bidirectional channels; [Connector::open] resolves once the channel is open
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &Url) -> Result<Channel, TransportError>;
}

/// Opens WebSocket channels using tokio-tungstenite
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

pub(crate) fn websocket_url(address: &Url) -> Result<Url, TransportError> {
    let mut ws_address = address.clone();

    match address.scheme() {
        SCHEME_WS | SCHEME_WSS => Ok(()),
        SCHEME_HTTP => ws_address.set_scheme(SCHEME_WS),
        SCHEME_HTTPS => ws_address.set_scheme(SCHEME_WSS),
        _ => Err(()),
    }
    .map_err(|_| TransportError::InvalidTransportScheme(address.scheme().to_owned()))?;

    Ok(ws_address)
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &Url) -> Result<Channel, TransportError> {
        let ws_address = websocket_url(url)?;

        #[allow(unused_mut)]
        let mut connector = None;
        #[cfg(feature = "use_local_certificate")]
        {
            warn!("Using local root CA (should only be used for local testing)");
            connector = Some(TlsConnector::Rustls(local_client_config()?));
        }

        let ws_stream = match tokio_tungstenite::connect_async_tls_with_config(
            ws_address.as_str(),
            None,
            false,
            connector,
        )
        .await
        {
            Ok((stream, _)) => stream,
            Err(e) => {
                return Err(TransportError::Connection(
                    redact(&ws_address),
                    e.to_string(),
                ));
            }
        };

        let address = redact(&ws_address);
        let (sender, mut receiver) = ws_stream.split();

        let sink = sender
            .with(|frame: Frame| async move {
                Ok::<_, tungstenite::Error>(match frame {
                    Frame::Text(text) => Message::Text(text.into()),
                    Frame::Close(code) => Message::Close(Some(CloseFrame {
                        code: CloseCode::from(code),
                        reason: Utf8Bytes::from_static("client disconnect"),
                    })),
                })
            })
            .sink_map_err(move |e| TransportError::Connection(address.clone(), e.to_string()));

        let events = stream! {
            let mut closed = false;

            while let Some(message) = receiver.next().await {
                match message {
                    Ok(Message::Text(text)) => yield ChannelEvent::Text(text.as_str().to_owned()),
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
                            .unwrap_or((CLOSE_NO_STATUS, String::new()));
                        yield ChannelEvent::Closed { code, reason };
                        closed = true;
                        break;
                    }
                    Ok(Message::Binary(_)) => {
                        tracing::warn!("ignoring binary frame on flow channel");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("flow channel read failed: {e}");
                        break;
                    }
                }
            }

            if !closed {
                yield ChannelEvent::Closed {
                    code: CLOSE_ABNORMAL,
                    reason: "connection dropped".to_string(),
                };
            }
        };

        Ok(Channel {
            sink: Box::pin(sink),
            events: Box::pin(events),
        })
    }
}

/// Trust only the root CA found at `CREDFLOW_ROOT_CA`
#[cfg(feature = "use_local_certificate")]
pub(crate) fn local_client_config() -> Result<Arc<rustls::ClientConfig>, TransportError> {
    let path = std::env::var("CREDFLOW_ROOT_CA").map_err(|_| {
        TransportError::Connection("local root CA".into(), "CREDFLOW_ROOT_CA is not set".into())
    })?;
    let cert = std::fs::read(&path)
        .map_err(|e| TransportError::Connection(path.clone(), e.to_string()))?;

    let mut store = rustls::RootCertStore::empty();
    store.add_parsable_certificates(CertificateDer::pem_slice_iter(&cert).flatten());

    Ok(Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(store)
            .with_no_client_auth(),
    ))
}

/// Strip the query so auth tokens never end up in logs or errors
pub(crate) fn redact(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}
