// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential brokering: a durable refresh token exchanged on demand for
//! short-lived bearer tokens used against the device API.

pub mod broker;
pub mod persist;
pub mod refresh;

use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Standard OAuth2 token response.
///
/// `access_token` is optional so a response without one is reported as an
/// auth failure instead of a decode error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

/// Exchanges a refresh token for a new access token.
pub trait TokenEndpoint: Send + Sync {
    fn exchange<'a>(&'a self, refresh_token: &'a str)
        -> BoxFuture<'a, Result<TokenResponse, RelayError>>;
}

/// Broker status as reported by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialStatus {
    /// A cached access token is currently valid.
    pub authenticated: bool,
    pub has_refresh_token: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in_secs: Option<u64>,
}

pub fn epoch_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
