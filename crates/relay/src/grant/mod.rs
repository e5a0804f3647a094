// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Time-limited camera feed grants from the device API.

pub mod client;
pub mod extender;

use serde::{Deserialize, Serialize};

/// A live feed grant for one device.
///
/// Extension renews the token and expiry; the feed URL is fixed for the
/// grant's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamGrant {
    pub device_id: String,
    #[serde(skip_serializing)]
    pub feed_url: String,
    #[serde(skip_serializing)]
    pub extension_token: String,
    /// Expiry as epoch seconds.
    pub expires_at: u64,
}

impl StreamGrant {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn expires_within(&self, margin_secs: u64, now: u64) -> bool {
        now.saturating_add(margin_secs) >= self.expires_at
    }

    /// Fold an extension into this grant.
    pub fn renewed(&self, renewal: GrantRenewal) -> Self {
        Self {
            device_id: self.device_id.clone(),
            feed_url: self.feed_url.clone(),
            extension_token: renewal.extension_token,
            expires_at: renewal.expires_at,
        }
    }
}

/// Result of extending a grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRenewal {
    pub extension_token: String,
    pub expires_at: u64,
}

/// A camera reported by the device API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub device_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}
