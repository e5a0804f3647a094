// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::Path;

use super::*;
use crate::events;
use crate::slot::diagnostics::FailureKind;
use crate::slot::store::{manifest_segments, MANIFEST_NAME};

/// Writes the feed url and a one-segment manifest, then idles.
const HLS_SCRIPT: &str = r#"dir="$2"
printf '%s\n' "$1" > "$dir/input.txt"
printf 'ts' > "$dir/segment00000.ts"
printf '#EXTM3U\n#EXTINF:2.0,\nsegment00000.ts\n' > "$dir/stream.m3u8"
exec sleep 30"#;

const IDLE_SCRIPT: &str = "exec sleep 30";

fn orchestrator_with(root: &Path, program: &str, script: &str) -> Arc<SlotOrchestrator> {
    orchestrator_signalled(root, program, script, Signal::SIGKILL)
}

fn orchestrator_signalled(
    root: &Path,
    program: &str,
    script: &str,
    stop_signal: Signal,
) -> Arc<SlotOrchestrator> {
    let command = RelayCommand::ffmpeg(program, 2, 6).with_args(vec![
        "-c".into(),
        script.into(),
        "relay".into(),
        "{input}".into(),
        "{dir}".into(),
    ]);
    let config = OrchestratorConfig {
        staging_root: root.to_path_buf(),
        command,
        stop_signal,
        replace_wait: Duration::from_secs(5),
        ready_poll: Duration::from_millis(20),
    };
    SlotOrchestrator::new(config, events::channel())
}

fn orchestrator(root: &Path, script: &str) -> Arc<SlotOrchestrator> {
    orchestrator_with(root, "sh", script)
}

fn is_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

async fn wait_for_death(pid: u32) -> bool {
    for _ in 0..250 {
        if !is_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn wait_for_path_gone(path: &Path) -> bool {
    for _ in 0..250 {
        if !path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Receive events until one matches, or give up after five seconds.
async fn next_matching(
    rx: &mut broadcast::Receiver<SlotEvent>,
    pred: impl Fn(&SlotEvent) -> bool,
) -> Option<SlotEvent> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv()).await.ok()?.ok()?;
        if pred(&event) {
            return Some(event);
        }
    }
}

async fn pid_of(orch: &SlotOrchestrator, slot: &str) -> anyhow::Result<u32> {
    orch.get(slot).await.and_then(|info| info.pid).ok_or_else(|| anyhow::anyhow!("no pid for {slot}"))
}

#[tokio::test]
async fn stop_is_idempotent() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let orch = orchestrator(tmp.path(), IDLE_SCRIPT);

    orch.start("0", "rtsp://cam/live").await?;
    let pid = pid_of(&orch, "0").await?;
    assert!(is_alive(pid));

    assert!(orch.stop("0").await);
    assert!(wait_for_death(pid).await);
    assert!(!orch.stop("0").await);
    assert!(!orch.stop("never-started").await);
    assert!(!orch.contains("0").await);
    Ok(())
}

#[tokio::test]
async fn restart_replaces_running_relay() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let orch = orchestrator(tmp.path(), HLS_SCRIPT);
    let mut rx = orch.subscribe();

    orch.start("A", "rtsp://cam/one").await?;
    let first = orch.get("A").await.ok_or_else(|| anyhow::anyhow!("missing slot"))?;
    let dir = orch.start("A", "rtsp://cam/two").await?.dir;
    let second = orch.get("A").await.ok_or_else(|| anyhow::anyhow!("missing slot"))?;

    let (Some(old_pid), Some(new_pid)) = (first.pid, second.pid) else {
        anyhow::bail!("relays have no pid");
    };
    assert_ne!(old_pid, new_pid);
    assert!(second.generation > first.generation);
    assert_eq!(second.feed_url, "rtsp://cam/two");
    assert_eq!(orch.slot_count().await, 1);
    assert!(!is_alive(old_pid));
    assert!(is_alive(new_pid));

    // The old relay's exit must not unregister its replacement.
    let old_gen = first.generation;
    let exited = next_matching(&mut rx, |e| {
        matches!(e, SlotEvent::Exited { slot, generation, .. } if slot == "A" && *generation == old_gen)
    })
    .await;
    assert!(exited.is_some());
    assert_eq!(orch.get("A").await.map(|info| info.generation), Some(second.generation));

    orch.wait_ready("A", Duration::from_secs(5)).await?;
    assert_eq!(std::fs::read_to_string(dir.join("input.txt"))?, "rtsp://cam/two\n");

    orch.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn start_clears_stale_artifacts() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let stale_dir = tmp.path().join("A");
    std::fs::create_dir_all(&stale_dir)?;
    std::fs::write(stale_dir.join(MANIFEST_NAME), "#EXTM3U\nsegment00009.ts\n")?;
    std::fs::write(stale_dir.join("segment00009.ts"), b"old")?;

    let orch = orchestrator(tmp.path(), IDLE_SCRIPT);
    let dir = orch.start("A", "rtsp://cam/live").await?.dir;

    assert_eq!(dir, stale_dir);
    assert!(!dir.join(MANIFEST_NAME).exists());
    assert!(!dir.join("segment00009.ts").exists());

    orch.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn spontaneous_exit_unregisters_slot() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let orch = orchestrator(
        tmp.path(),
        "echo 'Connection to tcp://10.0.0.2:443 failed: Connection refused' >&2; exit 3",
    );
    let mut exits = orch.subscribe();
    let mut diagnostics = orch.subscribe();

    orch.start("0", "rtsp://cam/live").await?;

    let exited = next_matching(&mut exits, |e| matches!(e, SlotEvent::Exited { .. })).await;
    let Some(SlotEvent::Exited { slot, code, .. }) = exited else {
        anyhow::bail!("no exit event");
    };
    assert_eq!(slot, "0");
    assert_eq!(code, Some(3));
    assert!(!orch.contains("0").await);

    let diagnostic = next_matching(&mut diagnostics, |e| matches!(e, SlotEvent::Diagnostic { .. })).await;
    let Some(SlotEvent::Diagnostic { kind, line, .. }) = diagnostic else {
        anyhow::bail!("no diagnostic event");
    };
    assert_eq!(kind, FailureKind::Unreachable);
    assert!(line.contains("Connection refused"));
    assert!(wait_for_path_gone(&tmp.path().join("0")).await);
    Ok(())
}

#[tokio::test]
async fn spawn_failure_registers_nothing() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let orch = orchestrator_with(tmp.path(), "/nonexistent/camrelay-relay", IDLE_SCRIPT);

    let result = orch.start("0", "rtsp://cam/live").await;

    assert!(matches!(result, Err(RelayError::ProcessSpawn(_))), "{result:?}");
    assert!(!orch.contains("0").await);
    assert!(!tmp.path().join("0").exists());
    Ok(())
}

#[tokio::test]
async fn invalid_slot_id_is_rejected_before_spawn() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let orch = orchestrator(tmp.path(), IDLE_SCRIPT);

    let result = orch.start("../escape", "rtsp://cam/live").await;

    assert!(matches!(result, Err(RelayError::InvalidArgument(_))));
    assert_eq!(orch.slot_count().await, 0);
    assert_eq!(std::fs::read_dir(tmp.path())?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn wait_ready_returns_manifest_with_segments() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let orch = orchestrator(tmp.path(), HLS_SCRIPT);
    let mut rx = orch.subscribe();

    orch.start("0", "rtsp://cam/live").await?;
    let manifest = orch.wait_ready("0", Duration::from_secs(5)).await?;

    assert_eq!(manifest, tmp.path().join("0").join(MANIFEST_NAME));
    let text = std::fs::read_to_string(&manifest)?;
    assert!(!manifest_segments(&text).is_empty());
    assert!(next_matching(&mut rx, |e| matches!(e, SlotEvent::Ready { .. })).await.is_some());
    assert_eq!(orch.get("0").await.map(|info| info.ready), Some(true));

    let pid = pid_of(&orch, "0").await?;
    assert!(orch.stop("0").await);
    assert!(wait_for_death(pid).await);
    assert!(!orch.stop("0").await);
    Ok(())
}

#[tokio::test]
async fn wait_ready_times_out_without_segments() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let orch = orchestrator(tmp.path(), IDLE_SCRIPT);

    orch.start("0", "rtsp://cam/live").await?;
    let result = orch.wait_ready("0", Duration::from_millis(100)).await;
    assert!(matches!(result, Err(RelayError::NotReady(_))), "{result:?}");

    let missing = orch.wait_ready("nope", Duration::from_millis(100)).await;
    assert!(matches!(missing, Err(RelayError::NotFound(_))));

    orch.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn wait_ready_fails_fast_when_relay_exits() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let orch = orchestrator(tmp.path(), "sleep 0.2; exit 1");

    orch.start("0", "rtsp://cam/live").await?;
    let started = Instant::now();
    let result = orch.wait_ready("0", Duration::from_secs(10)).await;

    assert!(matches!(result, Err(RelayError::NotReady(_))), "{result:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[tokio::test]
async fn stop_removes_directory_after_exit() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let orch = orchestrator(tmp.path(), HLS_SCRIPT);

    let dir = orch.start("0", "rtsp://cam/live").await?.dir;
    orch.wait_ready("0", Duration::from_secs(5)).await?;
    assert!(orch.stop("0").await);

    assert!(wait_for_path_gone(&dir).await);
    Ok(())
}

#[tokio::test]
async fn stop_all_stops_every_slot() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let orch = orchestrator(tmp.path(), IDLE_SCRIPT);

    let mut pids = Vec::new();
    for slot in ["0", "1", "2"] {
        orch.start(slot, "rtsp://cam/live").await?;
        pids.push(pid_of(&orch, slot).await?);
    }
    assert_eq!(orch.list().await.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(), ["0", "1", "2"]);

    orch.stop_all().await;

    assert_eq!(orch.slot_count().await, 0);
    for pid in pids {
        assert!(!is_alive(pid), "pid {pid} survived");
    }
    assert_eq!(std::fs::read_dir(tmp.path())?.count(), 0);
    Ok(())
}

/// Traps TERM, then writes a late manifest entry before exiting.
const LINGERING_SCRIPT: &str = r##"dir="$2"
trap 'sleep 0.3; printf "#EXTM3U\n#EXTINF:2.0,\nstale00042.ts\n" > "$dir/stream.m3u8"; exit 0' TERM
while true; do sleep 0.05; done"##;

#[tokio::test]
async fn start_after_stop_waits_for_stopped_relay() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let orch = orchestrator_signalled(tmp.path(), "sh", LINGERING_SCRIPT, Signal::SIGTERM);
    orch.start("A", "rtsp://cam/old").await?;
    let old_pid = pid_of(&orch, "A").await?;
    // Let the shell install its trap.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(orch.stop("A").await);
    let dir = orch.start("A", "rtsp://cam/new").await?.dir;

    // The stopped relay exited before the directory was cleared.
    assert!(!is_alive(old_pid));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!dir.join(MANIFEST_NAME).exists());
    assert_eq!(orch.get("A").await.map(|info| info.ready), Some(false));
    assert!(dir.exists());

    orch.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn spontaneous_exit_leaves_no_directory_behind() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let orch = orchestrator(tmp.path(), r#"printf 'ts' > "$2/segment00000.ts"; exit 1"#);
    let mut rx = orch.subscribe();

    orch.start("0", "rtsp://cam/live").await?;
    assert!(next_matching(&mut rx, |e| matches!(e, SlotEvent::Exited { .. })).await.is_some());

    assert!(!orch.stop("0").await);
    orch.stop_all().await;

    assert!(wait_for_path_gone(&tmp.path().join("0")).await);
    assert_eq!(std::fs::read_dir(tmp.path())?.count(), 0);
    Ok(())
}

#[test]
fn truncate_line_respects_char_boundaries() {
    assert_eq!(truncate_line("héllo", 2), "hé");
    assert_eq!(truncate_line("short", 64), "short");
}
