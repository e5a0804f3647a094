// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential persistence: load/save to JSON file with atomic writes.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Persisted broker state.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCredentials {
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Access token expiry as epoch seconds.
    #[serde(default)]
    pub expires_at: u64,
}

/// Load persisted credentials from a JSON file.
pub fn load(path: &Path) -> anyhow::Result<PersistedCredentials> {
    let contents = std::fs::read_to_string(path)?;
    let creds: PersistedCredentials = serde_json::from_str(&contents)?;
    Ok(creds)
}

/// Save persisted credentials to a JSON file atomically (write tmp + rename).
///
/// The temp name carries the PID and a counter so concurrent saves never
/// share a temp file.
pub fn save(path: &Path, creds: &PersistedCredentials) -> anyhow::Result<()> {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(creds)?;
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_name = format!(
        "{}.{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id(),
        seq,
    );
    let tmp_path = path.with_file_name(tmp_name);
    std::fs::write(&tmp_path, json)?;
    restrict_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Owner-only access: the file holds a long-lived refresh token.
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}
