// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers for the relay API.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, RelayError};
use crate::slot::SlotInfo;
use crate::state::RelayState;

// -- Request/Response types ---------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub slot_count: usize,
    pub authenticated: bool,
}

/// Body of `POST /api/v1/slots/{id}`: exactly one of the two sources.
#[derive(Debug, Default, Deserialize)]
pub struct StartSlotRequest {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub feed_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SlotView {
    #[serde(flatten)]
    pub slot: SlotInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_expires_at: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StopResponse {
    pub id: String,
    pub stopped: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExtendResponse {
    pub id: String,
    pub device_id: String,
    pub expires_at: u64,
}

// -- Handlers -----------------------------------------------------------------

/// `GET /api/v1/health`
pub async fn health(State(s): State<Arc<RelayState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "running".to_owned(),
        slot_count: s.orchestrator.slot_count().await,
        authenticated: s.broker.status().await.authenticated,
    })
}

/// `GET /api/v1/devices`
pub async fn list_devices(State(s): State<Arc<RelayState>>) -> impl IntoResponse {
    match s.grants.list_devices().await {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => {
            tracing::warn!(err = %e, "device listing failed");
            e.to_http_response().into_response()
        }
    }
}

/// `GET /api/v1/slots`
pub async fn list_slots(State(s): State<Arc<RelayState>>) -> impl IntoResponse {
    let slots = s.orchestrator.list().await;
    let grants = s.slot_grants.read().await;
    let views: Vec<SlotView> = slots
        .into_iter()
        .map(|slot| {
            let grant = grants.get(&slot.id).filter(|g| g.generation == slot.generation);
            SlotView {
                device_id: grant.map(|g| g.grant.device_id.clone()),
                grant_expires_at: grant.map(|g| g.grant.expires_at),
                slot,
            }
        })
        .collect();
    Json(views)
}

/// `POST /api/v1/slots/{id}` — start or replace a slot.
pub async fn start_slot(
    State(s): State<Arc<RelayState>>,
    Path(id): Path<String>,
    body: Result<Json<StartSlotRequest>, JsonRejection>,
) -> impl IntoResponse {
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => {
            return ErrorCode::BadRequest.to_http_response(rejection.body_text()).into_response();
        }
    };
    let result = match (req.device_id.as_deref(), req.feed_url.as_deref()) {
        (Some(device_id), None) => s.start_device(&id, device_id).await,
        (None, Some(feed_url)) => s.start_feed(&id, feed_url).await,
        _ => Err(RelayError::InvalidArgument(
            "exactly one of device_id or feed_url is required".to_owned(),
        )),
    };
    match result {
        Ok(started) => Json(started).into_response(),
        Err(e) => {
            tracing::warn!(slot = %id, err = %e, "slot start failed");
            e.to_http_response().into_response()
        }
    }
}

/// `DELETE /api/v1/slots/{id}` — idempotent stop.
pub async fn stop_slot(
    State(s): State<Arc<RelayState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let stopped = s.stop_slot(&id).await;
    Json(StopResponse { id, stopped })
}

/// `POST /api/v1/slots/{id}/extend`
pub async fn extend_slot(
    State(s): State<Arc<RelayState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match s.extend_slot(&id).await {
        Ok(grant) => {
            Json(ExtendResponse { id, device_id: grant.device_id, expires_at: grant.expires_at })
                .into_response()
        }
        Err(e) => e.to_http_response().into_response(),
    }
}

/// `GET /api/v1/credentials/status`
pub async fn credentials_status(State(s): State<Arc<RelayState>>) -> impl IntoResponse {
    Json(s.broker.status().await)
}
