// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: a fake device API and broker builders.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::credential::broker::CredentialBroker;
use crate::credential::{TokenEndpoint, TokenResponse};
use crate::error::RelayError;
use crate::events;
use crate::slot::orchestrator::SlotOrchestrator;
use crate::state::RelayState;

/// Token endpoint that always fails. Pair with a seeded broker.
pub struct RejectingEndpoint;

impl TokenEndpoint for RejectingEndpoint {
    fn exchange<'a>(&'a self, _: &'a str) -> BoxFuture<'a, Result<TokenResponse, RelayError>> {
        async { Err(RelayError::Auth("invalid_grant".to_owned())) }.boxed()
    }
}

/// Broker holding a valid access token `at-test`.
pub async fn seeded_broker() -> Arc<CredentialBroker> {
    let broker = CredentialBroker::new(
        Arc::new(RejectingEndpoint),
        Some("rt-test".to_owned()),
        Duration::from_secs(60),
        None,
    );
    broker.seed("at-test".to_owned(), 3600).await;
    broker
}

/// Broker with no credentials at all.
pub fn empty_broker() -> Arc<CredentialBroker> {
    CredentialBroker::new(Arc::new(RejectingEndpoint), None, Duration::from_secs(60), None)
}

/// A request seen by [`FakeDeviceApi`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub authorization: Option<String>,
    pub body: Value,
}

#[derive(Default)]
struct Inner {
    requests: Vec<RecordedRequest>,
    replies: Vec<(StatusCode, Value)>,
}

/// In-process device API answering with queued replies.
///
/// The last queued reply repeats once the queue is down to one entry.
#[derive(Clone, Default)]
pub struct FakeDeviceApi {
    inner: Arc<Mutex<Inner>>,
}

impl FakeDeviceApi {
    pub fn reply(&self, status: StatusCode, body: Value) -> &Self {
        if let Ok(mut inner) = self.inner.lock() {
            inner.replies.push((status, body));
        }
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.lock().map(|inner| inner.requests.clone()).unwrap_or_default()
    }

    fn record(&self, request: RecordedRequest) -> (StatusCode, Json<Value>) {
        let Ok(mut inner) = self.inner.lock() else {
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(Value::Null));
        };
        inner.requests.push(request);
        let reply = match inner.replies.len() {
            0 => (StatusCode::NOT_FOUND, json!({ "error": "no reply queued" })),
            1 => inner.replies[0].clone(),
            _ => inner.replies.remove(0),
        };
        (reply.0, Json(reply.1))
    }

    /// Serve on an ephemeral port. Returns the API base URL.
    pub async fn spawn(&self) -> anyhow::Result<String> {
        let app = Router::new()
            .route("/v1/enterprises/{project}/devices", get(list_devices))
            .route("/v1/enterprises/{project}/devices/{command}", post(execute_command))
            .with_state(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(format!("http://{addr}/v1"))
    }
}

fn authorization(headers: &HeaderMap) -> Option<String> {
    headers.get("authorization").and_then(|v| v.to_str().ok()).map(str::to_owned)
}

async fn list_devices(
    State(api): State<FakeDeviceApi>,
    Path(project): Path<String>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    api.record(RecordedRequest {
        path: format!("{project}/devices"),
        authorization: authorization(&headers),
        body: Value::Null,
    })
}

async fn execute_command(
    State(api): State<FakeDeviceApi>,
    Path((project, command)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    api.record(RecordedRequest {
        path: format!("{project}/devices/{command}"),
        authorization: authorization(&headers),
        body,
    })
}

/// Successful GenerateRtspStream / ExtendRtspStream reply body.
pub fn stream_reply(url: Option<&str>, extension_token: &str, expires_at: &str) -> Value {
    let mut results = json!({
        "streamExtensionToken": extension_token,
        "expiresAt": expires_at,
    });
    if let Some(url) = url {
        results["streamUrls"] = json!({ "rtspUrl": url });
    }
    json!({ "results": results })
}

/// Relay script: writes a one-segment manifest into `$2`, then idles.
pub const HLS_SCRIPT: &str = r#"dir="$2"
printf 'ts' > "$dir/segment00000.ts"
printf '#EXTM3U\n#EXTINF:2.0,\nsegment00000.ts\n' > "$dir/stream.m3u8"
exec sleep 30"#;

/// Config running `sh -c <script> relay {input} {dir}` as the relay.
pub fn test_config(api_url: &str, staging_root: &std::path::Path, script: &str) -> RelayConfig {
    let root = staging_root.to_string_lossy().into_owned();
    RelayConfig::parse_from([
        "camrelay",
        "--project-id",
        "proj",
        "--device-api-url",
        api_url,
        "--staging-root",
        root.as_str(),
        "--relay-program",
        "sh",
        "--relay-arg",
        "-c",
        "--relay-arg",
        script,
        "--relay-arg",
        "relay",
        "--relay-arg",
        "{input}",
        "--relay-arg",
        "{dir}",
        "--ready-poll-ms",
        "20",
        "--ready-timeout-ms",
        "3000",
    ])
}

/// State over a seeded broker, talking to `api_url`.
pub async fn test_state(
    api_url: &str,
    staging_root: &std::path::Path,
    script: &str,
) -> anyhow::Result<Arc<RelayState>> {
    let config = test_config(api_url, staging_root, script);
    let orchestrator = SlotOrchestrator::new(config.orchestrator_config()?, events::channel());
    let state = RelayState::new(config, CancellationToken::new(), seeded_broker().await, orchestrator);
    Ok(Arc::new(state))
}
