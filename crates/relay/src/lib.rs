// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Camrelay: relays cloud camera feeds into per-slot rolling HLS segments.

pub mod config;
pub mod credential;
pub mod error;
pub mod events;
pub mod grant;
pub mod slot;
pub mod state;
pub mod transport;

#[cfg(test)]
pub mod test_support;

use std::sync::{Arc, Once};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::RelayConfig;
use crate::grant::extender::spawn_grant_extender;
use crate::state::RelayState;
use crate::transport::build_router;

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls.
/// Safe to call multiple times; only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Initialize tracing from `--log-level` and `--log-format`.
pub fn init_tracing(config: &RelayConfig) {
    use tracing_subscriber::fmt;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Cancel `shutdown` on SIGTERM or SIGINT.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                tracing::info!("received SIGTERM");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                tracing::info!("received SIGINT");
            }
            _ = shutdown.cancelled() => return,
        }
        shutdown.cancel();
    });
}

/// Run the relay server until shutdown, then stop every slot.
pub async fn run(config: RelayConfig) -> anyhow::Result<()> {
    ensure_crypto();
    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();

    let state = Arc::new(RelayState::build(config.clone(), shutdown.clone()).await?);
    let status = state.broker.status().await;
    if !status.has_refresh_token {
        tracing::warn!("no refresh token configured; device requests will fail until one is provided");
    }

    spawn_signal_handler(shutdown.clone());
    if config.auto_extend {
        spawn_grant_extender(Arc::clone(&state));
    }

    let router = build_router(Arc::clone(&state));
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(
        staging_root = %state.orchestrator.store().root().display(),
        "camrelay listening on {addr}"
    );
    let served =
        axum::serve(listener, router).with_graceful_shutdown(shutdown.clone().cancelled_owned()).await;

    shutdown.cancel();
    state.orchestrator.stop_all().await;
    served?;
    Ok(())
}
