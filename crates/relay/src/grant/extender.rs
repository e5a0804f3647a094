// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Background renewal of stream grants that are about to expire.

use std::sync::Arc;

use crate::error::RelayError;
use crate::events::SlotEvent;
use crate::state::RelayState;

/// Spawn a single background task that extends expiring grants of running slots.
pub fn spawn_grant_extender(state: Arc<RelayState>) {
    let interval = state.config.extend_check_interval();
    let margin_secs = state.config.extend_margin_secs;

    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            extend_expiring(&state, margin_secs).await;
        }
    });
}

/// Extend every tracked grant within `margin_secs` of expiry.
pub async fn extend_expiring(state: &RelayState, margin_secs: u64) {
    for slot in state.grants_expiring_within(margin_secs).await {
        match state.extend_slot(&slot).await {
            Ok(_) => {}
            // The slot stopped or was restarted since the snapshot.
            Err(RelayError::NotFound(_)) => {
                tracing::debug!(slot = %slot, "dropped grant of finished slot");
            }
            Err(e) => {
                tracing::warn!(slot = %slot, err = %e, "stream grant extension failed");
                state
                    .orchestrator
                    .emit(SlotEvent::GrantExtendFailed { slot: slot.clone(), error: e.to_string() });
            }
        }
    }
}
