//! Capability discovery.
//!
//! Backends publish a manifest at `<endpoint>/status` listing the optional
//! features they support. Manifests are cached per endpoint; failures are
//! cached too, so a broken backend is asked at most once per TTL window.
//! Callers gating features on a capability never see an error: an
//! unreachable backend simply has no capabilities.

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::RwLock, time::Instant};
use tracing::{debug, warn};
use url::Url;

use crate::transport::{TransportError, http::RequestChannel};

pub const DEFAULT_CAPABILITY_TTL: Duration = Duration::from_secs(5 * 60);

const STATUS_PATH: &str = "status";

/// Well-known capability names
pub mod capability {
    /// The persistent-connection transport
    pub const WEBSOCKET: &str = "websocket";
}

/// Capability manifest published by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityManifest {
    pub status: String,
    pub service: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default = "legacy_api_version")]
    pub api_version: u32,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn legacy_api_version() -> u32 {
    1
}

impl CapabilityManifest {
    /// What a deployment predating capability discovery is assumed to offer
    pub fn legacy() -> Self {
        Self {
            status: "ok".into(),
            service: "unknown".into(),
            roles: Vec::new(),
            api_version: legacy_api_version(),
            capabilities: Vec::new(),
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DiscoveryError {
    #[error("invalid status endpoint for '{0}': {1}")]
    InvalidEndpoint(String, String),
    #[error("status request failed: {0}")]
    Transport(#[from] TransportError),
    #[error("status endpoint '{0}' answered {1}")]
    Status(String, u16),
    #[error("malformed capability manifest from '{0}': {1}")]
    Malformed(String, String),
}

struct CacheEntry {
    result: Result<CapabilityManifest, DiscoveryError>,
    expires_at: Instant,
}

/// Fetches and caches capability manifests, keyed by endpoint base URL
pub struct CapabilityService {
    channel: Arc<dyn RequestChannel>,
    ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl CapabilityService {
    pub fn new(channel: Arc<dyn RequestChannel>) -> Self {
        Self::with_ttl(channel, DEFAULT_CAPABILITY_TTL)
    }

    pub fn with_ttl(channel: Arc<dyn RequestChannel>, ttl: Duration) -> Self {
        Self {
            channel,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the manifest of `endpoint`, serving fresh cache entries
    /// (including cached failures) without touching the network
    pub async fn try_fetch_status(
        &self,
        endpoint: &Url,
    ) -> Result<CapabilityManifest, DiscoveryError> {
        let key = cache_key(endpoint);

        if let Some(entry) = self.cache.read().await.get(&key) {
            if entry.expires_at > Instant::now() {
                debug!("capabilities of {key} served from cache");
                return entry.result.clone();
            }
        }

        let result = self.fetch_manifest(endpoint).await;

        self.cache.write().await.insert(
            key,
            CacheEntry {
                result: result.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );

        result
    }

    /// Like [CapabilityService::try_fetch_status], but failures are logged and
    /// reported as `None`
    pub async fn fetch_status(&self, endpoint: &Url) -> Option<CapabilityManifest> {
        match self.try_fetch_status(endpoint).await {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!("capability discovery for {endpoint} failed: {e}");
                None
            }
        }
    }

    pub async fn has_capability(&self, endpoint: &Url, capability: &str) -> bool {
        self.fetch_status(endpoint)
            .await
            .is_some_and(|manifest| manifest.has_capability(capability))
    }

    pub async fn capabilities(&self, endpoint: &Url) -> Vec<String> {
        self.fetch_status(endpoint)
            .await
            .map(|manifest| manifest.capabilities)
            .unwrap_or_default()
    }

    /// Whether `endpoint` advertises the persistent-connection transport
    pub async fn supports_websocket(&self, endpoint: &Url) -> bool {
        self.has_capability(endpoint, capability::WEBSOCKET).await
    }

    /// Forget every cached manifest and failure, e.g. at login or logout
    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }

    async fn fetch_manifest(&self, endpoint: &Url) -> Result<CapabilityManifest, DiscoveryError> {
        let url = status_url(endpoint)?;
        let response = self.channel.get(&url, HeaderMap::new()).await?;

        if response.status == 404 {
            debug!("{endpoint} has no status endpoint, assuming a legacy deployment");
            return Ok(CapabilityManifest::legacy());
        }

        if !response.is_success() {
            return Err(DiscoveryError::Status(url.to_string(), response.status));
        }

        serde_json::from_value(response.data)
            .map_err(|e| DiscoveryError::Malformed(url.to_string(), e.to_string()))
    }
}

fn cache_key(endpoint: &Url) -> String {
    endpoint.as_str().trim_end_matches('/').to_string()
}

fn status_url(endpoint: &Url) -> Result<Url, DiscoveryError> {
    let mut base = endpoint.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }

    base.join(STATUS_PATH)
        .map_err(|e| DiscoveryError::InvalidEndpoint(endpoint.to_string(), e.to_string()))
}
