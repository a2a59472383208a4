use once_cell::sync::OnceCell;
use std::time::Duration;

use crate::transport::TransportError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The client shared by every stateless request of the process, built on first use
pub(crate) fn shared_client() -> Result<&'static reqwest::Client, TransportError> {
    static CLIENT: OnceCell<reqwest::Client> = OnceCell::new();

    CLIENT.get_or_try_init(|| {
        let builder = reqwest::Client::builder()
            .user_agent(concat!("credflow/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT);

        #[cfg(feature = "use_local_certificate")]
        let builder = builder.add_root_certificate(local_root_ca()?);

        builder
            .build()
            .map_err(|e| TransportError::Http("http client".into(), e.to_string()))
    })
}

#[cfg(feature = "use_local_certificate")]
fn local_root_ca() -> Result<reqwest::Certificate, TransportError> {
    tracing::warn!("trusting the local root CA, only meant for local testing");

    let path = std::env::var("CREDFLOW_ROOT_CA")
        .map_err(|_| TransportError::Http("local root CA".into(), "CREDFLOW_ROOT_CA is not set".into()))?;
    let pem = std::fs::read(&path).map_err(|e| TransportError::Http(path.clone(), e.to_string()))?;

    reqwest::Certificate::from_pem(&pem).map_err(|e| TransportError::Http(path, e.to_string()))
}
