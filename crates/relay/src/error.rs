// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire error codes for the relay API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Unauthorized,
    BadRequest,
    NotAuthenticated,
    AuthFailed,
    SlotNotFound,
    UpstreamError,
    SpawnFailed,
    GrantExpired,
    NotReady,
    Internal,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::BadRequest => 400,
            Self::NotAuthenticated => 401,
            Self::AuthFailed => 502,
            Self::SlotNotFound => 404,
            Self::UpstreamError => 502,
            Self::SpawnFailed => 500,
            Self::GrantExpired => 410,
            Self::NotReady => 503,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::BadRequest => "BAD_REQUEST",
            Self::NotAuthenticated => "NOT_AUTHENTICATED",
            Self::AuthFailed => "AUTH_FAILED",
            Self::SlotNotFound => "SLOT_NOT_FOUND",
            Self::UpstreamError => "UPSTREAM_ERROR",
            Self::SpawnFailed => "SPAWN_FAILED",
            Self::GrantExpired => "GRANT_EXPIRED",
            Self::NotReady => "NOT_READY",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.as_str().to_owned(), message: message.into() }
    }

    pub fn to_http_response(
        &self,
        message: impl Into<String>,
    ) -> (StatusCode, Json<ErrorResponse>) {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse { error: self.to_error_body(message) };
        (status, Json(body))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Failures raised by the broker, grant client, and orchestrator.
///
/// `Clone` so a single in-flight credential refresh can hand the same
/// failure to every waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// No refresh token is configured.
    NotAuthenticated,
    /// The token endpoint rejected the exchange or returned no access token.
    Auth(String),
    /// The device API returned a non-success or malformed response.
    Upstream(String),
    /// A stream grant response carried no feed URL.
    MissingUrl,
    /// The relay program could not be launched.
    ProcessSpawn(String),
    /// A grant was used or extended after its expiry.
    GrantExpired(String),
    /// The referenced slot does not exist.
    NotFound(String),
    /// The slot exists but has not produced a playable manifest.
    NotReady(String),
    InvalidArgument(String),
    Io(String),
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotAuthenticated => ErrorCode::NotAuthenticated,
            Self::Auth(_) => ErrorCode::AuthFailed,
            Self::Upstream(_) | Self::MissingUrl => ErrorCode::UpstreamError,
            Self::ProcessSpawn(_) => ErrorCode::SpawnFailed,
            Self::GrantExpired(_) => ErrorCode::GrantExpired,
            Self::NotFound(_) => ErrorCode::SlotNotFound,
            Self::NotReady(_) => ErrorCode::NotReady,
            Self::InvalidArgument(_) => ErrorCode::BadRequest,
            Self::Io(_) => ErrorCode::Internal,
        }
    }

    pub fn to_http_response(&self) -> (StatusCode, Json<ErrorResponse>) {
        self.code().to_http_response(self.to_string())
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAuthenticated => f.write_str("no refresh token configured"),
            Self::Auth(msg) => write!(f, "token exchange failed: {msg}"),
            Self::Upstream(msg) => write!(f, "device api error: {msg}"),
            Self::MissingUrl => f.write_str("stream grant response has no feed url"),
            Self::ProcessSpawn(msg) => write!(f, "failed to spawn relay: {msg}"),
            Self::GrantExpired(slot) => write!(f, "stream grant for slot {slot} has expired"),
            Self::NotFound(slot) => write!(f, "slot not found: {slot}"),
            Self::NotReady(msg) => write!(f, "stream not ready: {msg}"),
            Self::InvalidArgument(msg) => f.write_str(msg),
            Self::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl std::error::Error for RelayError {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
