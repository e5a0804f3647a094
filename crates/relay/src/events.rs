// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Slot lifecycle events.
//!
//! A relay exiting after `start` returned is only observable here: the caller
//! of `start` has already got its answer. Dashboards and serving layers
//! subscribe to learn about exits, readiness, and grant renewals.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::slot::diagnostics::FailureKind;

/// Events emitted by the orchestrator and grant extender, keyed by slot id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlotEvent {
    /// A relay process was spawned.
    Started {
        slot: String,
        generation: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    /// The manifest lists at least one segment.
    Ready { slot: String, generation: u64 },
    /// The relay printed a failure marker.
    Diagnostic { slot: String, generation: u64, kind: FailureKind, line: String },
    /// The relay process exited.
    Exited {
        slot: String,
        generation: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
    },
    /// The slot was stopped on request.
    Stopped { slot: String, generation: u64 },
    /// The slot's stream grant was extended.
    GrantExtended { slot: String, expires_at: u64 },
    /// Extending the slot's stream grant failed.
    GrantExtendFailed { slot: String, error: String },
}

impl SlotEvent {
    /// Return the slot identifier for this event.
    pub fn slot(&self) -> &str {
        match self {
            Self::Started { slot, .. }
            | Self::Ready { slot, .. }
            | Self::Diagnostic { slot, .. }
            | Self::Exited { slot, .. }
            | Self::Stopped { slot, .. }
            | Self::GrantExtended { slot, .. }
            | Self::GrantExtendFailed { slot, .. } => slot,
        }
    }

    /// Wire name of the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Ready { .. } => "ready",
            Self::Diagnostic { .. } => "diagnostic",
            Self::Exited { .. } => "exited",
            Self::Stopped { .. } => "stopped",
            Self::GrantExtended { .. } => "grant_extended",
            Self::GrantExtendFailed { .. } => "grant_extend_failed",
        }
    }
}

/// Create the shared event channel.
pub fn channel() -> broadcast::Sender<SlotEvent> {
    let (tx, _) = broadcast::channel(256);
    tx
}

/// Which events a subscriber wants.
#[derive(Debug, Clone)]
pub struct SlotFilter {
    slots: Option<Vec<String>>,
}

impl SlotFilter {
    /// Parse a comma-separated slot list; "all" or empty means every slot.
    pub fn new(slots: &str) -> Self {
        let slots = slots.trim();
        if slots.is_empty() || slots == "all" {
            return Self { slots: None };
        }
        let ids = slots.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from);
        Self { slots: Some(ids.collect()) }
    }

    pub fn wants(&self, event: &SlotEvent) -> bool {
        match &self.slots {
            None => true,
            Some(ids) => ids.iter().any(|id| id == event.slot()),
        }
    }
}
