// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use nix::sys::signal::Signal;

use crate::slot::orchestrator::OrchestratorConfig;
use crate::slot::RelayCommand;

/// Camera feed relay: turns cloud camera streams into rolling HLS segments.
#[derive(Debug, Clone, Parser)]
#[command(name = "camrelay", version, about)]
pub struct RelayConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "CAMRELAY_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 9900, env = "CAMRELAY_PORT")]
    pub port: u16,

    /// Bearer token for API auth. If unset, auth is disabled.
    #[arg(long, env = "CAMRELAY_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Log filter directive (tracing `EnvFilter` syntax).
    #[arg(long, default_value = "info", env = "CAMRELAY_LOG_LEVEL")]
    pub log_level: String,

    /// Log output format: "text" or "json".
    #[arg(long, default_value = "text", env = "CAMRELAY_LOG_FORMAT")]
    pub log_format: String,

    /// OAuth client ID used for token refresh.
    #[arg(long, env = "CAMRELAY_CLIENT_ID")]
    pub client_id: Option<String>,

    /// OAuth client secret used for token refresh.
    #[arg(long, env = "CAMRELAY_CLIENT_SECRET")]
    pub client_secret: Option<String>,

    /// Long-lived refresh token. Overridden by a persisted credential file.
    #[arg(long, env = "CAMRELAY_REFRESH_TOKEN")]
    pub refresh_token: Option<String>,

    /// OAuth token endpoint.
    #[arg(long, default_value = "https://www.googleapis.com/oauth2/v4/token", env = "CAMRELAY_TOKEN_URL")]
    pub token_url: String,

    /// Refresh access tokens this many seconds before they expire.
    #[arg(long, default_value_t = 60, env = "CAMRELAY_REFRESH_MARGIN_SECS")]
    pub refresh_margin_secs: u64,

    /// Device API base URL.
    #[arg(
        long,
        default_value = "https://smartdevicemanagement.googleapis.com/v1",
        env = "CAMRELAY_DEVICE_API_URL"
    )]
    pub device_api_url: String,

    /// Device API project (enterprise) ID.
    #[arg(long, env = "CAMRELAY_PROJECT_ID")]
    pub project_id: Option<String>,

    /// Directory for persisted credentials.
    #[arg(long, env = "CAMRELAY_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Root directory for per-slot segment staging.
    #[arg(long, env = "CAMRELAY_STAGING_ROOT")]
    pub staging_root: Option<PathBuf>,

    /// Relay program to launch per slot.
    #[arg(long, default_value = "ffmpeg", env = "CAMRELAY_RELAY_PROGRAM")]
    pub relay_program: String,

    /// Relay argument template (repeatable). Defaults to an ffmpeg HLS command line.
    #[arg(long = "relay-arg", allow_hyphen_values = true)]
    pub relay_args: Vec<String>,

    /// Target segment duration in seconds.
    #[arg(long, default_value_t = 2, env = "CAMRELAY_SEGMENT_SECS")]
    pub segment_secs: u32,

    /// Number of segments kept in the manifest window.
    #[arg(long, default_value_t = 6, env = "CAMRELAY_SEGMENT_WINDOW")]
    pub segment_window: u32,

    /// Signal sent to a relay when its slot is stopped or replaced.
    #[arg(long, default_value = "SIGKILL", env = "CAMRELAY_STOP_SIGNAL")]
    pub stop_signal: String,

    /// How long a replacing start waits for the previous relay to exit.
    #[arg(long, default_value_t = 5000, env = "CAMRELAY_REPLACE_WAIT_MS")]
    pub replace_wait_ms: u64,

    /// Manifest readiness poll interval in milliseconds.
    #[arg(long, default_value_t = 250, env = "CAMRELAY_READY_POLL_MS")]
    pub ready_poll_ms: u64,

    /// How long a manifest request waits for a slot to become ready.
    #[arg(long, default_value_t = 15000, env = "CAMRELAY_READY_TIMEOUT_MS")]
    pub ready_timeout_ms: u64,

    /// Extend stream grants automatically before they expire.
    #[arg(long, env = "CAMRELAY_AUTO_EXTEND")]
    pub auto_extend: bool,

    /// Grant extension check interval in milliseconds.
    #[arg(long, default_value_t = 30000, env = "CAMRELAY_EXTEND_CHECK_MS")]
    pub extend_check_ms: u64,

    /// Extend grants expiring within this many seconds.
    #[arg(long, default_value_t = 120, env = "CAMRELAY_EXTEND_MARGIN_SECS")]
    pub extend_margin_secs: u64,
}

impl RelayConfig {
    /// Check cross-field constraints that clap cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.log_format.as_str() {
            "text" | "json" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        self.parsed_stop_signal()?;
        if self.segment_secs == 0 || self.segment_window == 0 {
            anyhow::bail!("--segment-secs and --segment-window must be positive");
        }
        if self.project_id.as_deref().is_none_or(str::is_empty) {
            anyhow::bail!("--project-id is required");
        }
        Ok(())
    }

    pub fn parsed_stop_signal(&self) -> anyhow::Result<Signal> {
        let name = self.stop_signal.to_uppercase();
        let name = if name.starts_with("SIG") { name } else { format!("SIG{name}") };
        name.parse::<Signal>().map_err(|_| anyhow::anyhow!("invalid stop signal: {}", self.stop_signal))
    }

    /// Resolve the directory for persisted relay state.
    ///
    /// Checks `--state-dir`, then `$XDG_STATE_HOME/camrelay`,
    /// then `$HOME/.local/state/camrelay`.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.state_dir {
            return dir.clone();
        }
        if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
            return PathBuf::from(xdg).join("camrelay");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local/state/camrelay");
        }
        PathBuf::from(".camrelay")
    }

    pub fn credential_path(&self) -> PathBuf {
        self.state_dir().join("credentials.json")
    }

    pub fn staging_root(&self) -> PathBuf {
        self.staging_root.clone().unwrap_or_else(|| std::env::temp_dir().join("camrelay"))
    }

    pub fn relay_command(&self) -> RelayCommand {
        let command = RelayCommand::ffmpeg(&self.relay_program, self.segment_secs, self.segment_window);
        if self.relay_args.is_empty() {
            command
        } else {
            command.with_args(self.relay_args.clone())
        }
    }

    pub fn orchestrator_config(&self) -> anyhow::Result<OrchestratorConfig> {
        Ok(OrchestratorConfig {
            staging_root: self.staging_root(),
            command: self.relay_command(),
            stop_signal: self.parsed_stop_signal()?,
            replace_wait: Duration::from_millis(self.replace_wait_ms),
            ready_poll: Duration::from_millis(self.ready_poll_ms),
        })
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn extend_check_interval(&self) -> Duration {
        Duration::from_millis(self.extend_check_ms)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
