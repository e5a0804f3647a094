// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Slot event WebSocket: fans out orchestrator and grant events to
//! dashboard clients over a single `/ws/events` connection.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

use crate::events::{SlotEvent, SlotFilter};
use crate::state::RelayState;
use crate::transport::auth;

/// Query parameters for the event WebSocket.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Auth token.
    pub token: Option<String>,
    /// Comma-separated slot IDs, or "all" (default: "all").
    #[serde(default = "default_slots")]
    pub slots: String,
}

fn default_slots() -> String {
    "all".to_owned()
}

/// `GET /ws/events` — WebSocket upgrade for the slot event stream.
pub async fn ws_events_handler(
    State(state): State<Arc<RelayState>>,
    Query(query): Query<EventsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if let Err(code) =
        auth::validate_ws_token(query.token.as_deref(), state.config.auth_token.as_deref())
    {
        return code.to_http_response("unauthorized").into_response();
    }

    let filter = SlotFilter::new(&query.slots);
    ws.on_upgrade(move |socket| handle_events_connection(state, filter, socket)).into_response()
}

/// Current slots as `started` (and `ready`) events, so a client starts from a full picture.
async fn backfill_events(state: &RelayState, filter: &SlotFilter) -> Vec<SlotEvent> {
    let mut events = Vec::new();
    for slot in state.orchestrator.list().await {
        let started =
            SlotEvent::Started { slot: slot.id.clone(), generation: slot.generation, pid: slot.pid };
        if !filter.wants(&started) {
            continue;
        }
        events.push(started);
        if slot.ready {
            events.push(SlotEvent::Ready { slot: slot.id, generation: slot.generation });
        }
    }
    events
}

/// Per-connection event loop.
async fn handle_events_connection(state: Arc<RelayState>, filter: SlotFilter, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Subscribe before the backfill so nothing falls between the two.
    let mut event_rx = state.orchestrator.subscribe();

    for event in backfill_events(&state, &filter).await {
        if let Ok(json) = serde_json::to_string(&event) {
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
    }

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            event = event_rx.recv() => {
                let event = match event {
                    Ok(e) => e,
                    Err(RecvError::Lagged(n)) => {
                        tracing::debug!(skipped = n, "event client lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if filter.wants(&event) {
                    if let Ok(json) = serde_json::to_string(&event) {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}
