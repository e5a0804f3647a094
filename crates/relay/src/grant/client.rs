// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP client for the device API's live stream commands.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::json;

use crate::credential::broker::CredentialBroker;
use crate::error::RelayError;
use crate::grant::{DeviceInfo, GrantRenewal, StreamGrant};

const GENERATE_STREAM: &str = "sdm.devices.commands.CameraLiveStream.GenerateRtspStream";
const EXTEND_STREAM: &str = "sdm.devices.commands.CameraLiveStream.ExtendRtspStream";
const INFO_TRAIT: &str = "sdm.devices.traits.Info";

/// Longest error body carried into an upstream error message.
const MAX_ERROR_BODY: usize = 256;

#[derive(Debug, Deserialize)]
struct CommandResponse {
    #[serde(default)]
    results: Option<CommandResults>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandResults {
    #[serde(default)]
    stream_urls: Option<StreamUrls>,
    #[serde(default)]
    stream_extension_token: Option<String>,
    #[serde(default)]
    expires_at: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamUrls {
    #[serde(default)]
    rtsp_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    #[serde(default)]
    devices: Vec<DeviceRecord>,
}

#[derive(Debug, Deserialize)]
struct DeviceRecord {
    name: String,
    #[serde(rename = "type", default)]
    device_type: String,
    #[serde(default)]
    traits: HashMap<String, serde_json::Value>,
}

impl DeviceRecord {
    fn into_info(self) -> DeviceInfo {
        let display_name = self
            .traits
            .get(INFO_TRAIT)
            .and_then(|info| info.get("customName"))
            .and_then(|name| name.as_str())
            .filter(|name| !name.is_empty())
            .map(str::to_owned);
        let id = self.name.rsplit('/').next().unwrap_or_default().to_owned();
        DeviceInfo { id, device_type: self.device_type, display_name }
    }
}

/// Requests and extends feed grants with a bearer token from the broker.
///
/// Holds no grant state of its own.
pub struct StreamGrantClient {
    http: reqwest::Client,
    api_url: String,
    project_id: String,
    broker: Arc<CredentialBroker>,
}

impl StreamGrantClient {
    pub fn new(api_url: &str, project_id: &str, broker: Arc<CredentialBroker>) -> Self {
        crate::ensure_crypto();
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            api_url: api_url.trim_end_matches('/').to_owned(),
            project_id: project_id.to_owned(),
            broker,
        }
    }

    /// List the project's devices.
    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>, RelayError> {
        let token = self.broker.valid_access_token().await?;
        let url = format!("{}/enterprises/{}/devices", self.api_url, self.project_id);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| RelayError::Upstream(format!("list devices: {e}")))?;
        let list: DeviceList = decode(resp, "list devices").await?;
        Ok(list.devices.into_iter().map(DeviceRecord::into_info).collect())
    }

    /// Request a fresh feed grant for a device.
    pub async fn request_grant(&self, device_id: &str) -> Result<StreamGrant, RelayError> {
        let results = self.execute(device_id, GENERATE_STREAM, json!({})).await?;
        let feed_url = results
            .stream_urls
            .and_then(|urls| urls.rtsp_url)
            .filter(|url| !url.is_empty())
            .ok_or(RelayError::MissingUrl)?;
        let extension_token = required(results.stream_extension_token, "streamExtensionToken")?;
        let expires_at = parse_expiry(results.expires_at.as_deref())?;

        tracing::info!(device = %device_id, expires_at, "stream grant issued");
        Ok(StreamGrant { device_id: device_id.to_owned(), feed_url, extension_token, expires_at })
    }

    /// Extend an existing grant. The feed URL does not change.
    pub async fn extend_grant(
        &self,
        device_id: &str,
        extension_token: &str,
    ) -> Result<GrantRenewal, RelayError> {
        let params = json!({ "streamExtensionToken": extension_token });
        let results = self.execute(device_id, EXTEND_STREAM, params).await?;
        let extension_token = required(results.stream_extension_token, "streamExtensionToken")?;
        let expires_at = parse_expiry(results.expires_at.as_deref())?;

        tracing::debug!(device = %device_id, expires_at, "stream grant extended");
        Ok(GrantRenewal { extension_token, expires_at })
    }

    async fn execute(
        &self,
        device_id: &str,
        command: &str,
        params: serde_json::Value,
    ) -> Result<CommandResults, RelayError> {
        validate_device_id(device_id)?;
        let token = self.broker.valid_access_token().await?;
        let url = format!(
            "{}/enterprises/{}/devices/{}:executeCommand",
            self.api_url, self.project_id, device_id
        );
        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&json!({ "command": command, "params": params }))
            .send()
            .await
            .map_err(|e| RelayError::Upstream(format!("{command}: {e}")))?;
        let body: CommandResponse = decode(resp, command).await?;
        body.results.ok_or_else(|| RelayError::Upstream(format!("{command}: response has no results")))
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
    what: &str,
) -> Result<T, RelayError> {
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let text: String = text.chars().take(MAX_ERROR_BODY).collect();
        return Err(RelayError::Upstream(format!("{what} failed ({status}): {text}")));
    }
    resp.json::<T>()
        .await
        .map_err(|e| RelayError::Upstream(format!("{what}: malformed response: {e}")))
}

fn required(value: Option<String>, field: &str) -> Result<String, RelayError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RelayError::Upstream(format!("response has no {field}")))
}

/// Parse an RFC 3339 timestamp into epoch seconds.
fn parse_expiry(value: Option<&str>) -> Result<u64, RelayError> {
    let raw = value.ok_or_else(|| RelayError::Upstream("response has no expiresAt".to_owned()))?;
    let time = humantime::parse_rfc3339_weak(raw)
        .map_err(|e| RelayError::Upstream(format!("invalid expiresAt {raw:?}: {e}")))?;
    Ok(time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs())
}

/// Device ids end up in a URL path and must be a single plain segment.
pub fn validate_device_id(id: &str) -> Result<(), RelayError> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(RelayError::InvalidArgument(format!("invalid device id: {id:?}")));
    }
    Ok(())
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
