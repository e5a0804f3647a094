// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Slot orchestrator: at most one supervised relay process per slot id.
//!
//! Every table mutation (`start`, `stop`, exit-observer removal) runs under the
//! table's write lock, and `start` holds it from replacement through spawn.
//! Each spawn gets a fresh generation; an exit observer removes the slot only
//! while its generation is still the registered one.
//!
//! A stopped relay stays in the table as draining until it exits, so a later
//! `start` of the same id waits for it before clearing the directory.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{broadcast, watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::events::SlotEvent;
use crate::slot::diagnostics::FailureMarkers;
use crate::slot::store::{manifest_ready, validate_slot_id, SegmentStore};
use crate::slot::{RelayCommand, SlotInfo};
use crate::state::epoch_ms;

/// Longest stderr line carried in a diagnostic event.
const MAX_DIAGNOSTIC_CHARS: usize = 512;

/// Orchestrator settings, derived from [`crate::config::RelayConfig`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub staging_root: PathBuf,
    pub command: RelayCommand,
    /// Sent once on stop or replace. No escalation follows.
    pub stop_signal: Signal,
    /// Upper bound a replacing `start` waits for the old relay to exit.
    pub replace_wait: Duration,
    pub ready_poll: Duration,
}

/// A registered relay process.
struct SlotEntry {
    id: String,
    generation: u64,
    pid: Option<u32>,
    dir: PathBuf,
    feed_url: String,
    started_at: Instant,
    started_at_ms: u64,
    exited: watch::Receiver<bool>,
    ready: watch::Receiver<bool>,
    /// Cancels the readiness watcher.
    cancel: CancellationToken,
}

impl SlotEntry {
    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    fn info(&self) -> SlotInfo {
        SlotInfo {
            id: self.id.clone(),
            generation: self.generation,
            pid: self.pid,
            dir: self.dir.clone(),
            feed_url: self.feed_url.clone(),
            started_at_ms: self.started_at_ms,
            uptime_secs: self.started_at.elapsed().as_secs(),
            ready: *self.ready.borrow(),
        }
    }
}

/// Slot table guarded by a single lock.
#[derive(Default)]
struct SlotTable {
    live: HashMap<String, Arc<SlotEntry>>,
    /// Stopped relays that may still write into their directory.
    draining: HashMap<String, Arc<SlotEntry>>,
}

/// Maps slot ids to live relay processes.
pub struct SlotOrchestrator {
    slots: RwLock<SlotTable>,
    store: SegmentStore,
    config: OrchestratorConfig,
    markers: Arc<FailureMarkers>,
    next_generation: AtomicU64,
    event_tx: broadcast::Sender<SlotEvent>,
}

impl SlotOrchestrator {
    pub fn new(config: OrchestratorConfig, event_tx: broadcast::Sender<SlotEvent>) -> Arc<Self> {
        Arc::new(Self {
            slots: RwLock::new(SlotTable::default()),
            store: SegmentStore::new(config.staging_root.clone()),
            config,
            markers: Arc::new(FailureMarkers::new()),
            next_generation: AtomicU64::new(0),
            event_tx,
        })
    }

    pub fn store(&self) -> &SegmentStore {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SlotEvent> {
        self.event_tx.subscribe()
    }

    pub fn emit(&self, event: SlotEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Start a relay for `slot_id` reading `feed_url`, replacing any running one.
    ///
    /// Returns a snapshot of the new slot, including its staging directory.
    /// On error nothing is registered.
    pub async fn start(
        self: &Arc<Self>,
        slot_id: &str,
        feed_url: &str,
    ) -> Result<SlotInfo, RelayError> {
        validate_slot_id(slot_id)?;
        let mut slots = self.slots.write().await;

        if let Some(prev) = slots.live.remove(slot_id) {
            tracing::info!(slot = %slot_id, generation = prev.generation, "replacing running relay");
            self.terminate(&prev);
            let _ = self.event_tx.send(SlotEvent::Stopped {
                slot: prev.id.clone(),
                generation: prev.generation,
            });
            // The old relay must not write into the directory once it is cleared.
            self.await_exit(&prev).await;
        }
        if let Some(stopped) = slots.draining.remove(slot_id) {
            tracing::debug!(slot = %slot_id, generation = stopped.generation, "waiting for stopped relay to exit");
            self.await_exit(&stopped).await;
        }

        let dir = self
            .store
            .prepare(slot_id)
            .await
            .map_err(|e| RelayError::Io(format!("prepare staging dir for {slot_id}: {e}")))?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let program = &self.config.command.program;
        let mut cmd = Command::new(program);
        cmd.args(self.config.command.render(feed_url, &dir));
        cmd.current_dir(&dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(slot = %slot_id, program = %program, err = %e, "failed to spawn relay");
                if let Err(err) = self.store.remove(slot_id).await {
                    tracing::warn!(slot = %slot_id, err = %err, "failed to remove staging dir");
                }
                return Err(RelayError::ProcessSpawn(format!("{program}: {e}")));
            }
        };

        let pid = child.id();
        let (exit_tx, exited) = watch::channel(false);
        let (ready_tx, ready) = watch::channel(false);
        let entry = Arc::new(SlotEntry {
            id: slot_id.to_owned(),
            generation,
            pid,
            dir,
            feed_url: feed_url.to_owned(),
            started_at: Instant::now(),
            started_at_ms: epoch_ms(),
            exited,
            ready,
            cancel: CancellationToken::new(),
        });
        slots.live.insert(slot_id.to_owned(), Arc::clone(&entry));
        drop(slots);
        let info = entry.info();

        if let Some(stderr) = child.stderr.take() {
            self.spawn_diagnostics(Arc::clone(&entry), stderr);
        }
        self.spawn_readiness_watcher(Arc::clone(&entry), ready_tx);
        let orchestrator = Arc::clone(self);
        let supervised = Arc::clone(&entry);
        tokio::spawn(async move {
            orchestrator.supervise(supervised, child, exit_tx).await;
        });

        let _ = self.event_tx.send(SlotEvent::Started { slot: slot_id.to_owned(), generation, pid });
        tracing::info!(slot = %slot_id, generation, pid = ?pid, "relay started");
        Ok(info)
    }

    /// Stop a slot. Returns whether a slot was registered.
    ///
    /// The staging directory is removed once the relay has exited, unless the
    /// slot was started again in the meantime.
    pub async fn stop(self: &Arc<Self>, slot_id: &str) -> bool {
        let entry = {
            let mut slots = self.slots.write().await;
            let Some(entry) = slots.live.remove(slot_id) else {
                tracing::debug!(slot = %slot_id, "stop requested for unknown slot");
                return false;
            };
            self.terminate(&entry);
            slots.draining.insert(slot_id.to_owned(), Arc::clone(&entry));
            entry
        };

        let _ = self
            .event_tx
            .send(SlotEvent::Stopped { slot: entry.id.clone(), generation: entry.generation });
        tracing::info!(slot = %slot_id, generation = entry.generation, "relay stopped");

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.remove_dir_after_exit(entry).await;
        });
        true
    }

    /// Stop every slot, wait for the relays to exit, and remove their directories.
    pub async fn stop_all(&self) {
        let mut slots = self.slots.write().await;
        let live: Vec<Arc<SlotEntry>> = slots.live.drain().map(|(_, entry)| entry).collect();
        let draining: Vec<Arc<SlotEntry>> = slots.draining.drain().map(|(_, entry)| entry).collect();
        if live.is_empty() && draining.is_empty() {
            return;
        }

        for entry in &live {
            self.terminate(entry);
            let _ = self
                .event_tx
                .send(SlotEvent::Stopped { slot: entry.id.clone(), generation: entry.generation });
        }
        let entries: Vec<Arc<SlotEntry>> = live.into_iter().chain(draining).collect();
        for entry in &entries {
            self.await_exit(entry).await;
            if let Err(e) = self.store.remove(&entry.id).await {
                tracing::warn!(slot = %entry.id, err = %e, "failed to remove staging dir");
            }
        }
        drop(slots);
        tracing::info!(count = entries.len(), "all relays stopped");
    }

    /// Wait until the slot's manifest lists a segment.
    ///
    /// Returns the manifest path. Fails with `NotReady` on timeout or when the
    /// relay exits first.
    pub async fn wait_ready(&self, slot_id: &str, timeout: Duration) -> Result<PathBuf, RelayError> {
        let entry = self
            .slots
            .read()
            .await
            .live
            .get(slot_id)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(slot_id.to_owned()))?;

        let mut ready = entry.ready.clone();
        let mut exited = entry.exited.clone();
        let became_ready = tokio::select! {
            biased;
            ok = async { ready.wait_for(|r| *r).await.is_ok() } => ok,
            _ = async { let _ = exited.wait_for(|e| *e).await; } => false,
            _ = tokio::time::sleep(timeout) => {
                return Err(RelayError::NotReady(format!("slot {slot_id} produced no segments yet")));
            }
        };

        if became_ready {
            Ok(self.store.manifest_path(slot_id))
        } else {
            Err(RelayError::NotReady(format!("relay for slot {slot_id} exited")))
        }
    }

    pub async fn list(&self) -> Vec<SlotInfo> {
        let slots = self.slots.read().await;
        let mut infos: Vec<SlotInfo> = slots.live.values().map(|entry| entry.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn get(&self, slot_id: &str) -> Option<SlotInfo> {
        self.slots.read().await.live.get(slot_id).map(|entry| entry.info())
    }

    pub async fn contains(&self, slot_id: &str) -> bool {
        self.slots.read().await.live.contains_key(slot_id)
    }

    pub async fn slot_count(&self) -> usize {
        self.slots.read().await.live.len()
    }

    /// Send the stop signal once. The entry must already be out of the live table.
    fn terminate(&self, entry: &SlotEntry) {
        entry.cancel.cancel();
        if entry.has_exited() {
            return;
        }
        let Some(pid) = entry.pid.and_then(|p| i32::try_from(p).ok()) else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid), self.config.stop_signal) {
            tracing::debug!(slot = %entry.id, pid, err = %e, "failed to signal relay");
        }
    }

    /// Wait (bounded) for a terminated relay to be reaped.
    async fn await_exit(&self, entry: &SlotEntry) -> bool {
        let mut exited = entry.exited.clone();
        let in_time =
            tokio::time::timeout(self.config.replace_wait, exited.wait_for(|e| *e)).await.is_ok();
        if !in_time {
            tracing::error!(
                slot = %entry.id,
                generation = entry.generation,
                pid = ?entry.pid,
                signal = %self.config.stop_signal,
                "relay still running after termination signal"
            );
        }
        in_time
    }

    /// Remove a stopped relay's directory once it has exited.
    ///
    /// Skipped when a later `start` or `stop_all` already took over the slot.
    async fn remove_dir_after_exit(&self, entry: Arc<SlotEntry>) {
        if !self.await_exit(&entry).await {
            let mut exited = entry.exited.clone();
            let _ = exited.wait_for(|e| *e).await;
        }
        let mut slots = self.slots.write().await;
        if !slots.draining.get(&entry.id).is_some_and(|d| d.generation == entry.generation) {
            return;
        }
        slots.draining.remove(&entry.id);
        if let Err(e) = self.store.remove(&entry.id).await {
            tracing::warn!(slot = %entry.id, err = %e, "failed to remove staging dir");
        }
    }

    /// Exit observer: owns the child until it is reaped.
    async fn supervise(
        self: Arc<Self>,
        entry: Arc<SlotEntry>,
        mut child: Child,
        exit_tx: watch::Sender<bool>,
    ) {
        let status = child.wait().await;
        let _ = exit_tx.send(true);
        entry.cancel.cancel();

        let removed = {
            let mut slots = self.slots.write().await;
            let current =
                slots.live.get(&entry.id).is_some_and(|cur| cur.generation == entry.generation);
            if current {
                slots.live.remove(&entry.id);
                // Nothing restarts the slot, so its segments go with it.
                if let Err(e) = self.store.remove(&entry.id).await {
                    tracing::warn!(slot = %entry.id, err = %e, "failed to remove staging dir");
                }
            }
            current
        };

        let (code, signal) = match &status {
            Ok(s) => (s.code(), s.signal()),
            Err(e) => {
                tracing::warn!(slot = %entry.id, generation = entry.generation, err = %e, "failed to wait for relay");
                (None, None)
            }
        };
        if removed {
            tracing::warn!(slot = %entry.id, generation = entry.generation, ?code, ?signal, "relay exited, slot removed");
        } else {
            tracing::info!(slot = %entry.id, generation = entry.generation, ?code, ?signal, "relay exited");
        }
        let _ = self.event_tx.send(SlotEvent::Exited {
            slot: entry.id.clone(),
            generation: entry.generation,
            code,
            signal,
        });
    }

    fn spawn_diagnostics(&self, entry: Arc<SlotEntry>, stderr: ChildStderr) {
        let markers = Arc::clone(&self.markers);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(slot = %entry.id, err = %e, "relay stderr closed");
                        break;
                    }
                };
                let Some(kind) = markers.classify(&line) else {
                    tracing::trace!(slot = %entry.id, line = %line, "relay output");
                    continue;
                };
                let line = truncate_line(&line, MAX_DIAGNOSTIC_CHARS);
                tracing::warn!(slot = %entry.id, generation = entry.generation, %kind, line = %line, "relay reported failure");
                let _ = event_tx.send(SlotEvent::Diagnostic {
                    slot: entry.id.clone(),
                    generation: entry.generation,
                    kind,
                    line,
                });
            }
        });
    }

    fn spawn_readiness_watcher(&self, entry: Arc<SlotEntry>, ready_tx: watch::Sender<bool>) {
        let manifest = self.store.manifest_path(&entry.id);
        let poll = self.config.ready_poll.max(Duration::from_millis(10));
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(poll);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = entry.cancel.cancelled() => return,
                    _ = timer.tick() => {}
                }
                if manifest_ready(&manifest).await {
                    let _ = ready_tx.send(true);
                    tracing::debug!(slot = %entry.id, generation = entry.generation, "relay output ready");
                    let _ = event_tx
                        .send(SlotEvent::Ready { slot: entry.id.clone(), generation: entry.generation });
                    return;
                }
            }
        });
    }
}

/// Truncate to at most `max` characters on a char boundary.
fn truncate_line(line: &str, max: usize) -> String {
    match line.char_indices().nth(max) {
        Some((idx, _)) => line[..idx].to_owned(),
        None => line.to_owned(),
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
