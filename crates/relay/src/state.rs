// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::credential::broker::CredentialBroker;
use crate::credential::refresh::OAuthTokenEndpoint;
use crate::credential::{epoch_secs, persist};
use crate::error::RelayError;
use crate::events::{self, SlotEvent};
use crate::grant::client::StreamGrantClient;
use crate::grant::StreamGrant;
use crate::slot::orchestrator::SlotOrchestrator;
use crate::slot::store::validate_slot_id;
use crate::slot::SlotInfo;

/// Grant backing a device slot, tied to the relay generation it was started for.
#[derive(Debug, Clone)]
pub struct SlotGrant {
    pub generation: u64,
    pub grant: StreamGrant,
}

/// Result of starting a slot.
#[derive(Debug, Clone, Serialize)]
pub struct SlotStarted {
    pub slot: SlotInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant: Option<StreamGrant>,
}

/// Shared relay state.
pub struct RelayState {
    pub config: RelayConfig,
    pub shutdown: CancellationToken,
    pub broker: Arc<CredentialBroker>,
    pub grants: StreamGrantClient,
    pub orchestrator: Arc<SlotOrchestrator>,
    pub slot_grants: RwLock<HashMap<String, SlotGrant>>,
}

impl RelayState {
    pub fn new(
        config: RelayConfig,
        shutdown: CancellationToken,
        broker: Arc<CredentialBroker>,
        orchestrator: Arc<SlotOrchestrator>,
    ) -> Self {
        let grants = StreamGrantClient::new(
            &config.device_api_url,
            config.project_id.as_deref().unwrap_or_default(),
            Arc::clone(&broker),
        );
        Self {
            config,
            shutdown,
            broker,
            grants,
            orchestrator,
            slot_grants: RwLock::new(HashMap::new()),
        }
    }

    /// Wire up the broker and orchestrator from configuration.
    ///
    /// A persisted credential file, when present, seeds the broker.
    pub async fn build(config: RelayConfig, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let endpoint = OAuthTokenEndpoint::new(
            &config.token_url,
            config.client_id.as_deref().unwrap_or_default(),
            config.client_secret.as_deref().unwrap_or_default(),
        );
        let cred_path = config.credential_path();
        let broker = CredentialBroker::new(
            Arc::new(endpoint),
            config.refresh_token.clone(),
            Duration::from_secs(config.refresh_margin_secs),
            Some(cred_path.clone()),
        );
        if cred_path.exists() {
            match persist::load(&cred_path) {
                Ok(creds) => {
                    broker.load_persisted(&creds).await;
                    tracing::info!(path = %cred_path.display(), "loaded persisted credentials");
                }
                Err(e) => {
                    tracing::warn!(path = %cred_path.display(), err = %e, "failed to load persisted credentials");
                }
            }
        }

        let orchestrator = SlotOrchestrator::new(config.orchestrator_config()?, events::channel());
        Ok(Self::new(config, shutdown, broker, orchestrator))
    }

    /// Obtain a grant for `device_id` and start a relay reading it.
    ///
    /// Grant failures leave the slot table untouched.
    pub async fn start_device(&self, slot_id: &str, device_id: &str) -> Result<SlotStarted, RelayError> {
        validate_slot_id(slot_id)?;
        let grant = self.grants.request_grant(device_id).await?;
        let result = self.orchestrator.start(slot_id, &grant.feed_url).await;

        let mut slot_grants = self.slot_grants.write().await;
        match result {
            Ok(slot) => {
                // A concurrent start for the same slot may have finished first.
                if slot_grants.get(slot_id).is_none_or(|g| g.generation < slot.generation) {
                    slot_grants.insert(
                        slot_id.to_owned(),
                        SlotGrant { generation: slot.generation, grant: grant.clone() },
                    );
                }
                Ok(SlotStarted { slot, grant: Some(grant) })
            }
            Err(e) => {
                // A replacing start may have already terminated the previous relay.
                if !self.orchestrator.contains(slot_id).await {
                    slot_grants.remove(slot_id);
                }
                Err(e)
            }
        }
    }

    /// Start a relay on a caller-supplied feed URL. No grant is tracked.
    pub async fn start_feed(&self, slot_id: &str, feed_url: &str) -> Result<SlotStarted, RelayError> {
        if feed_url.trim().is_empty() {
            return Err(RelayError::InvalidArgument("feed_url must not be empty".to_owned()));
        }
        let slot = self.orchestrator.start(slot_id, feed_url).await?;
        self.slot_grants.write().await.remove(slot_id);
        Ok(SlotStarted { slot, grant: None })
    }

    pub async fn stop_slot(&self, slot_id: &str) -> bool {
        self.slot_grants.write().await.remove(slot_id);
        self.orchestrator.stop(slot_id).await
    }

    /// Extend the grant backing a running device slot.
    pub async fn extend_slot(&self, slot_id: &str) -> Result<StreamGrant, RelayError> {
        let current = self.current_grant(slot_id).await?;
        if current.grant.is_expired(epoch_secs()) {
            // An expired grant cannot be extended; stop tracking it.
            let mut slot_grants = self.slot_grants.write().await;
            if slot_grants.get(slot_id).is_some_and(|g| g.generation == current.generation) {
                slot_grants.remove(slot_id);
            }
            return Err(RelayError::GrantExpired(slot_id.to_owned()));
        }

        let renewal = self
            .grants
            .extend_grant(&current.grant.device_id, &current.grant.extension_token)
            .await?;
        let renewed = current.grant.renewed(renewal);

        {
            let mut slot_grants = self.slot_grants.write().await;
            // The slot may have been restarted while the request was in flight.
            if slot_grants.get(slot_id).is_some_and(|g| g.generation == current.generation) {
                slot_grants.insert(
                    slot_id.to_owned(),
                    SlotGrant { generation: current.generation, grant: renewed.clone() },
                );
            }
        }

        tracing::info!(slot = %slot_id, expires_at = renewed.expires_at, "stream grant extended");
        self.orchestrator.emit(SlotEvent::GrantExtended {
            slot: slot_id.to_owned(),
            expires_at: renewed.expires_at,
        });
        Ok(renewed)
    }

    /// The tracked grant for a slot, dropped if its relay is gone.
    async fn current_grant(&self, slot_id: &str) -> Result<SlotGrant, RelayError> {
        let tracked = self.slot_grants.read().await.get(slot_id).cloned();
        let Some(tracked) = tracked else {
            return Err(RelayError::NotFound(slot_id.to_owned()));
        };
        let live = self.orchestrator.get(slot_id).await;
        if live.is_some_and(|info| info.generation == tracked.generation) {
            return Ok(tracked);
        }
        let mut slot_grants = self.slot_grants.write().await;
        if slot_grants.get(slot_id).is_some_and(|g| g.generation == tracked.generation) {
            slot_grants.remove(slot_id);
        }
        Err(RelayError::NotFound(slot_id.to_owned()))
    }

    /// Slots whose grants expire within `margin_secs`.
    pub async fn grants_expiring_within(&self, margin_secs: u64) -> Vec<String> {
        let now = epoch_secs();
        let slot_grants = self.slot_grants.read().await;
        let mut slots: Vec<String> = slot_grants
            .iter()
            .filter(|(_, g)| g.grant.expires_within(margin_secs, now))
            .map(|(slot, _)| slot.clone())
            .collect();
        slots.sort();
        slots
    }
}

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
