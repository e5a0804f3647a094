// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OAuth token refresh over HTTP.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::credential::{TokenEndpoint, TokenResponse};
use crate::error::RelayError;

/// Longest error body carried into an auth error message.
const MAX_ERROR_BODY: usize = 256;

/// Token endpoint speaking the OAuth2 `refresh_token` grant.
pub struct OAuthTokenEndpoint {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl OAuthTokenEndpoint {
    pub fn new(token_url: &str, client_id: &str, client_secret: &str) -> Self {
        crate::ensure_crypto();
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            token_url: token_url.to_owned(),
            client_id: client_id.to_owned(),
            client_secret: client_secret.to_owned(),
        }
    }
}

impl TokenEndpoint for OAuthTokenEndpoint {
    fn exchange<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<TokenResponse, RelayError>> {
        do_refresh(&self.http, &self.token_url, &self.client_id, &self.client_secret, refresh_token)
            .boxed()
    }
}

/// Perform a single token refresh request. Never retried.
pub async fn do_refresh(
    client: &reqwest::Client,
    token_url: &str,
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
) -> Result<TokenResponse, RelayError> {
    let resp = client
        .post(token_url)
        .form(&[
            ("grant_type", "refresh_token"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("refresh_token", refresh_token),
        ])
        .send()
        .await
        .map_err(|e| RelayError::Auth(format!("token endpoint unreachable: {e}")))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let text: String = text.chars().take(MAX_ERROR_BODY).collect();
        return Err(RelayError::Auth(format!("refresh failed ({status}): {text}")));
    }

    resp.json::<TokenResponse>()
        .await
        .map_err(|e| RelayError::Auth(format!("malformed token response: {e}")))
}
