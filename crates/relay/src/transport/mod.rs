// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the relay.

pub mod auth;
pub mod http;
pub mod media;
pub mod ws;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::RelayState;

/// Build the axum `Router` with all relay routes.
pub fn build_router(state: Arc<RelayState>) -> Router {
    Router::new()
        // Health (no auth)
        .route("/api/v1/health", get(http::health))
        .route("/api/v1/devices", get(http::list_devices))
        // Slot lifecycle
        .route("/api/v1/slots", get(http::list_slots))
        .route("/api/v1/slots/{id}", post(http::start_slot).delete(http::stop_slot))
        .route("/api/v1/slots/{id}/extend", post(http::extend_slot))
        .route("/api/v1/credentials/status", get(http::credentials_status))
        // Media (no auth)
        .route("/slots/{id}/{file}", get(media::slot_artifact))
        // Slot events
        .route("/ws/events", get(ws::ws_events_handler))
        // Middleware
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_layer))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
