// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Read-only serving of slot manifests and segments.

use std::io;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};

use crate::error::RelayError;
use crate::state::RelayState;

fn content_type(file: &str) -> &'static str {
    if file.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else {
        "video/mp2t"
    }
}

/// `GET /slots/{id}/{file}`
///
/// Manifest requests wait for the slot to become ready; segments are served
/// as stored.
pub async fn slot_artifact(
    State(s): State<Arc<RelayState>>,
    Path((slot, file)): Path<(String, String)>,
) -> Response {
    let path = match s.orchestrator.store().resolve_artifact(&slot, &file) {
        Ok(path) => path,
        Err(e) => return e.to_http_response().into_response(),
    };

    if file.ends_with(".m3u8") {
        if let Err(e) = s.orchestrator.wait_ready(&slot, s.config.ready_timeout()).await {
            tracing::debug!(slot = %slot, err = %e, "manifest not available");
            return e.to_http_response().into_response();
        }
    }

    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, content_type(&file)), (header::CACHE_CONTROL, "no-cache")],
            bytes,
        )
            .into_response(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            RelayError::NotFound(format!("{slot}/{file}")).to_http_response().into_response()
        }
        Err(e) => {
            tracing::warn!(slot = %slot, file = %file, err = %e, "failed to read artifact");
            RelayError::Io(e.to_string()).to_http_response().into_response()
        }
    }
}
