// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Viewing slots: one supervised relay process per slot id, each writing a
//! rolling HLS window into its own staging directory.

pub mod diagnostics;
pub mod orchestrator;
pub mod store;

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::slot::store::{MANIFEST_NAME, SEGMENT_PATTERN};

/// Command line used to launch a relay.
///
/// Arguments may contain placeholders that are filled in per slot:
/// `{input}`, `{dir}`, `{manifest}`, `{segments}`, `{segment_secs}`, `{window}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCommand {
    pub program: String,
    pub args: Vec<String>,
    pub segment_secs: u32,
    pub window: u32,
}

impl RelayCommand {
    /// ffmpeg remuxing the feed into an HLS sliding window.
    pub fn ffmpeg(program: &str, segment_secs: u32, window: u32) -> Self {
        let args = [
            "-hide_banner",
            "-loglevel",
            "warning",
            "-rtsp_transport",
            "tcp",
            "-i",
            "{input}",
            "-c",
            "copy",
            "-f",
            "hls",
            "-hls_time",
            "{segment_secs}",
            "-hls_list_size",
            "{window}",
            "-hls_flags",
            "delete_segments",
            "-hls_segment_filename",
            "{segments}",
            "{manifest}",
        ];
        Self {
            program: program.to_owned(),
            args: args.iter().map(|a| (*a).to_owned()).collect(),
            segment_secs,
            window,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Substitute placeholders for one relay launch.
    pub fn render(&self, input: &str, dir: &Path) -> Vec<String> {
        let dir_str = dir.to_string_lossy();
        let manifest = dir.join(MANIFEST_NAME);
        let segments = dir.join(SEGMENT_PATTERN);
        let manifest = manifest.to_string_lossy();
        let segments = segments.to_string_lossy();
        let segment_secs = self.segment_secs.to_string();
        let window = self.window.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", input)
                    .replace("{dir}", &dir_str)
                    .replace("{manifest}", &manifest)
                    .replace("{segments}", &segments)
                    .replace("{segment_secs}", &segment_secs)
                    .replace("{window}", &window)
            })
            .collect()
    }
}

/// Snapshot of a registered slot.
#[derive(Debug, Clone, Serialize)]
pub struct SlotInfo {
    pub id: String,
    pub generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub dir: PathBuf,
    /// Feed URLs carry upstream stream tokens; never serialized.
    #[serde(skip)]
    pub feed_url: String,
    pub started_at_ms: u64,
    pub uptime_secs: u64,
    pub ready: bool,
}
