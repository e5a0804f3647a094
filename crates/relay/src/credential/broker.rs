// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential broker: caches the access token and renews it just before expiry.
//!
//! Refresh is single-flight. Callers that find the token stale while an
//! exchange is running await that exchange and share its outcome, success or
//! failure. A finished exchange is forgotten, so the next stale read starts a
//! new one.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use tokio::sync::{Mutex, RwLock};

use crate::credential::persist::{self, PersistedCredentials};
use crate::credential::{epoch_secs, CredentialStatus, TokenEndpoint};
use crate::error::RelayError;

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

type RefreshFlight = Shared<BoxFuture<'static, Result<String, RelayError>>>;

#[derive(Default)]
struct TokenState {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: u64, // epoch seconds
}

impl TokenState {
    /// The cached token, if it stays valid for more than `margin_secs`.
    fn fresh_token(&self, margin_secs: u64, now: u64) -> Option<String> {
        let token = self.access_token.as_ref()?;
        (now.saturating_add(margin_secs) < self.expires_at).then(|| token.clone())
    }
}

/// Hands out valid bearer tokens for the device API.
pub struct CredentialBroker {
    tokens: RwLock<TokenState>,
    in_flight: Mutex<Option<RefreshFlight>>,
    endpoint: Arc<dyn TokenEndpoint>,
    margin_secs: u64,
    persist_path: Option<PathBuf>,
}

impl CredentialBroker {
    pub fn new(
        endpoint: Arc<dyn TokenEndpoint>,
        refresh_token: Option<String>,
        margin: Duration,
        persist_path: Option<PathBuf>,
    ) -> Arc<Self> {
        let tokens = TokenState {
            refresh_token: refresh_token.filter(|t| !t.is_empty()),
            ..TokenState::default()
        };
        Arc::new(Self {
            tokens: RwLock::new(tokens),
            in_flight: Mutex::new(None),
            endpoint,
            margin_secs: margin.as_secs(),
            persist_path,
        })
    }

    /// Seed state from a persisted credential file.
    ///
    /// The persisted refresh token replaces the configured one: it may have
    /// been rotated since the configuration was written.
    pub async fn load_persisted(&self, creds: &PersistedCredentials) {
        let mut tokens = self.tokens.write().await;
        if !creds.refresh_token.is_empty() {
            tokens.refresh_token = Some(creds.refresh_token.clone());
        }
        if let Some(ref access) = creds.access_token {
            tokens.access_token = Some(access.clone());
            tokens.expires_at = creds.expires_at;
        }
    }

    /// Install a known access token.
    pub async fn seed(&self, access_token: String, expires_in: u64) {
        let mut tokens = self.tokens.write().await;
        tokens.access_token = Some(access_token);
        tokens.expires_at = epoch_secs() + expires_in;
    }

    /// Return a token valid for at least the refresh margin, refreshing first if needed.
    pub async fn valid_access_token(self: &Arc<Self>) -> Result<String, RelayError> {
        {
            let tokens = self.tokens.read().await;
            if let Some(token) = tokens.fresh_token(self.margin_secs, epoch_secs()) {
                return Ok(token);
            }
            if tokens.refresh_token.is_none() {
                return Err(RelayError::NotAuthenticated);
            }
        }
        self.join_refresh(false).await
    }

    /// Exchange the refresh token now, or join the exchange already running.
    pub async fn refresh(self: &Arc<Self>) -> Result<String, RelayError> {
        self.join_refresh(true).await
    }

    pub async fn status(&self) -> CredentialStatus {
        let tokens = self.tokens.read().await;
        let now = epoch_secs();
        CredentialStatus {
            authenticated: tokens.fresh_token(self.margin_secs, now).is_some(),
            has_refresh_token: tokens.refresh_token.is_some(),
            expires_in_secs: tokens
                .access_token
                .as_ref()
                .map(|_| tokens.expires_at.saturating_sub(now)),
        }
    }

    async fn join_refresh(self: &Arc<Self>, force: bool) -> Result<String, RelayError> {
        let flight = {
            let mut in_flight = self.in_flight.lock().await;
            // A finished flight left behind by a cancelled waiter is never rejoined.
            match in_flight.as_ref().filter(|flight| flight.peek().is_none()) {
                Some(flight) => flight.clone(),
                None => {
                    // A flight may have finished between the caller's stale read and now.
                    if !force {
                        let tokens = self.tokens.read().await;
                        if let Some(token) = tokens.fresh_token(self.margin_secs, epoch_secs()) {
                            return Ok(token);
                        }
                    }
                    let broker = Arc::clone(self);
                    let flight = async move { broker.exchange().await }.boxed().shared();
                    *in_flight = Some(flight.clone());
                    flight
                }
            }
        };

        let result = flight.clone().await;

        let mut in_flight = self.in_flight.lock().await;
        if in_flight.as_ref().is_some_and(|current| Shared::ptr_eq(current, &flight)) {
            *in_flight = None;
        }
        result
    }

    async fn exchange(&self) -> Result<String, RelayError> {
        let refresh_token =
            self.tokens.read().await.refresh_token.clone().ok_or(RelayError::NotAuthenticated)?;

        let response = match self.endpoint.exchange(&refresh_token).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(err = %e, "access token refresh failed");
                return Err(e);
            }
        };
        let Some(access_token) = response.access_token.filter(|t| !t.is_empty()) else {
            tracing::warn!("token response has no access_token");
            return Err(RelayError::Auth("token response has no access_token".to_owned()));
        };
        let lifetime =
            if response.expires_in == 0 { DEFAULT_TOKEN_LIFETIME_SECS } else { response.expires_in };

        let snapshot = {
            let mut tokens = self.tokens.write().await;
            tokens.access_token = Some(access_token.clone());
            tokens.expires_at = epoch_secs() + lifetime;
            if let Some(rotated) = response.refresh_token.filter(|t| !t.is_empty()) {
                if tokens.refresh_token.as_deref() != Some(rotated.as_str()) {
                    tracing::info!("refresh token rotated");
                }
                tokens.refresh_token = Some(rotated);
            }
            PersistedCredentials {
                refresh_token: tokens.refresh_token.clone().unwrap_or_default(),
                access_token: tokens.access_token.clone(),
                expires_at: tokens.expires_at,
            }
        };

        tracing::info!(expires_in = lifetime, "access token refreshed");
        self.persist(&snapshot);
        Ok(access_token)
    }

    /// Persist current credentials to disk.
    fn persist(&self, creds: &PersistedCredentials) {
        let Some(ref path) = self.persist_path else {
            return;
        };
        if let Err(e) = persist::save(path, creds) {
            tracing::warn!(path = %path.display(), err = %e, "failed to persist credentials");
        }
    }
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;
