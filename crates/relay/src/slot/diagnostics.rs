// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Classification of relay stderr output.
//!
//! Lines that match a failure marker are surfaced as log events. They never
//! change slot state; only process exit does.

use regex::RegexSet;
use serde::{Deserialize, Serialize};

/// Kind of failure a relay reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Unauthorized,
    Unreachable,
    BadInput,
    StreamEnded,
    Other,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Unreachable => "unreachable",
            Self::BadInput => "bad_input",
            Self::StreamEnded => "stream_ended",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Order matters: the first matching pattern decides the kind.
const MARKERS: &[(&str, FailureKind)] = &[
    (r"(?i)\b(401|403)\b.*(unauthorized|forbidden)", FailureKind::Unauthorized),
    (r"(?i)unauthorized|forbidden", FailureKind::Unauthorized),
    (r"(?i)connection (refused|reset|timed out)", FailureKind::Unreachable),
    (r"(?i)no route to host|network is unreachable|name or service not known", FailureKind::Unreachable),
    (r"(?i)invalid data found|could not find codec|unsupported", FailureKind::BadInput),
    (r"(?i)end of file|immediate exit requested", FailureKind::StreamEnded),
    (r"(?i)\berror\b|\bfailed\b", FailureKind::Other),
];

/// Compiled failure markers.
pub struct FailureMarkers {
    set: RegexSet,
}

impl FailureMarkers {
    pub fn new() -> Self {
        let set = RegexSet::new(MARKERS.iter().map(|(p, _)| *p)).unwrap_or_else(|_| RegexSet::empty());
        Self { set }
    }

    /// Classify a stderr line; `None` for ordinary chatter.
    pub fn classify(&self, line: &str) -> Option<FailureKind> {
        self.set.matches(line).iter().next().map(|idx| MARKERS[idx].1)
    }
}

impl Default for FailureMarkers {
    fn default() -> Self {
        Self::new()
    }
}
