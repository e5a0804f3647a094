// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Staging directory policy for slot artifacts.
//!
//! The relay owns the contents of a slot directory while it runs. This module
//! only names paths, clears a directory before a new relay starts, removes it
//! after a relay is gone, and inspects the manifest for readiness.

use std::io;
use std::path::{Path, PathBuf};

use crate::error::RelayError;

/// Manifest written by the relay.
pub const MANIFEST_NAME: &str = "stream.m3u8";

/// Segment filename pattern handed to the relay.
pub const SEGMENT_PATTERN: &str = "segment%05d.ts";

const MAX_SLOT_ID_LEN: usize = 64;

/// Reject ids that are empty, too long, or not safe as a single path component.
pub fn validate_slot_id(id: &str) -> Result<(), RelayError> {
    if id.is_empty() || id.len() > MAX_SLOT_ID_LEN {
        return Err(RelayError::InvalidArgument(format!(
            "slot id must be 1-{MAX_SLOT_ID_LEN} characters"
        )));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(RelayError::InvalidArgument(format!("invalid slot id: {id}")));
    }
    Ok(())
}

/// Root of all slot staging directories.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    root: PathBuf,
}

impl SegmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn slot_dir(&self, slot_id: &str) -> PathBuf {
        self.root.join(slot_id)
    }

    pub fn manifest_path(&self, slot_id: &str) -> PathBuf {
        self.slot_dir(slot_id).join(MANIFEST_NAME)
    }

    /// Create the slot directory and delete everything left in it.
    pub async fn prepare(&self, slot_id: &str) -> io::Result<PathBuf> {
        let dir = self.slot_dir(slot_id);
        tokio::fs::create_dir_all(&dir).await?;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let result = if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match result {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(dir)
    }

    /// Delete the slot directory. Absent directories are fine.
    pub async fn remove(&self, slot_id: &str) -> io::Result<()> {
        match tokio::fs::remove_dir_all(self.slot_dir(slot_id)).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// Resolve a manifest or segment name inside a slot directory.
    pub fn resolve_artifact(&self, slot_id: &str, name: &str) -> Result<PathBuf, RelayError> {
        validate_slot_id(slot_id)?;
        let plain = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains(['/', '\\'])
            && !name.contains("..");
        if !plain || !(name.ends_with(".m3u8") || name.ends_with(".ts")) {
            return Err(RelayError::InvalidArgument(format!("invalid artifact name: {name}")));
        }
        Ok(self.slot_dir(slot_id).join(name))
    }
}

/// URI lines of an HLS manifest, in playback order.
pub fn manifest_segments(text: &str) -> Vec<&str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with('#')).collect()
}

/// True once the manifest exists and lists at least one segment.
pub async fn manifest_ready(path: &Path) -> bool {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => !manifest_segments(&text).is_empty(),
        Err(_) => false,
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
