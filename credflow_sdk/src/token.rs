//! Auth token handling shared by the transports of one session.
//!
//! [AuthToken] is the single mutable credential a session owns; every transport
//! created for the session holds a handle to the same cell, so rotating the token
//! updates them all in place. [TokenRefresher] coordinates refreshes so that
//! concurrent callers hitting an expired token trigger exactly one refresh.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use zeroize::Zeroizing;

/// Shared, swappable bearer token
#[derive(Clone, Default)]
pub struct AuthToken {
    inner: Arc<RwLock<Option<Zeroizing<String>>>>,
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthToken")
            .field("present", &self.is_present())
            .finish()
    }
}

impl AuthToken {
    pub fn new(token: Option<String>) -> Self {
        let cell = Self::default();
        cell.set(token);
        cell
    }

    /// Replace the token; empty strings count as no token
    pub fn set(&self, token: Option<String>) {
        let token = token.filter(|t| !t.is_empty()).map(Zeroizing::new);
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    pub fn get(&self) -> Option<Zeroizing<String>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_present(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RefreshError {
    #[error("token refresh was rejected: {0}")]
    Rejected(String),
    #[error("token refresh failed: {0}")]
    Failed(String),
}

/// Obtains a fresh token, e.g. by redeeming a refresh token
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn refresh_token(&self) -> Result<String, RefreshError>;
}

type RefreshFuture = Shared<BoxFuture<'static, Result<String, RefreshError>>>;

/// Single-flight token refresh bound to one [AuthToken]
pub struct TokenRefresher {
    source: Arc<dyn TokenSource>,
    token: AuthToken,
    in_flight: Mutex<Option<RefreshFuture>>,
}

impl TokenRefresher {
    pub fn new(source: Arc<dyn TokenSource>, token: AuthToken) -> Self {
        Self {
            source,
            token,
            in_flight: Mutex::new(None),
        }
    }

    /// Refresh the token, joining a refresh that is already running.
    ///
    /// On success the shared [AuthToken] holds the new token before this returns.
    pub async fn refresh(&self) -> Result<String, RefreshError> {
        let refresh = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.as_ref() {
                Some(refresh) => refresh.clone(),
                None => {
                    let source = self.source.clone();
                    let token = self.token.clone();
                    let refresh = async move {
                        let fresh = source.refresh_token().await?;
                        token.set(Some(fresh.clone()));
                        tracing::debug!("auth token refreshed");
                        Ok(fresh)
                    }
                    .boxed()
                    .shared();
                    *in_flight = Some(refresh.clone());
                    refresh
                }
            }
        };

        let outcome = refresh.await;

        // the slot may already hold a newer refresh started after ours settled
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight.as_ref().is_some_and(|f| f.peek().is_some()) {
            *in_flight = None;
        }

        outcome
    }

    pub fn is_refreshing(&self) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|f| f.peek().is_none())
    }

    /// Forget any refresh in flight; the next call starts a new one
    pub fn reset(&self) {
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn token(&self) -> &AuthToken {
        &self.token
    }
}
