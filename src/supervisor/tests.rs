use super::command::header_blob;
use super::drain::{drain_output, LineTokenizer};
use super::monitor::{
    evaluate_window, monitor_loop, parse_speed, HealthWindow, MonitorContext, WindowVerdict,
};
use super::*;
use crate::config::{CaptureConfig, MonitorConfig};
use crate::error::{OracleError, SupervisionError};
use crate::oracle::{LivenessOracle, StreamInfo, StreamUrlOptions};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

fn test_capture_config() -> CaptureConfig {
    CaptureConfig {
        output: "./recordings/test".to_string(),
        format: "flv".to_string(),
        segment: None,
        extra_args: Vec::new(),
        headers: BTreeMap::from([
            ("Referer".to_string(), "https://live.example".to_string()),
            ("User-Agent".to_string(), "test-agent".to_string()),
        ]),
        ffmpeg: "ffmpeg".to_string(),
        debug: false,
    }
}

/// Short intervals so loop tests finish in well under a second per window.
fn fast_monitor_config() -> MonitorConfig {
    MonitorConfig {
        poll_interval_ms: 15,
        window_ms: 120,
        partial_line_flush_ms: 100,
        graceful_stop_wait_ms: 300,
        low_speed_threshold: 0.9,
        low_speed_strike_limit: 2,
        oracle_poll_ticks: 3,
        disable_lowspeed_interrupt: false,
    }
}

struct MockOracle {
    on_air: AtomicBool,
    fail_queries: AtomicBool,
    polls: AtomicU32,
}

impl MockOracle {
    fn with_state(on_air: bool, fail_queries: bool) -> Arc<Self> {
        Arc::new(Self {
            on_air: AtomicBool::new(on_air),
            fail_queries: AtomicBool::new(fail_queries),
            polls: AtomicU32::new(0),
        })
    }

    fn on_air() -> Arc<Self> {
        Self::with_state(true, false)
    }

    fn offline() -> Arc<Self> {
        Self::with_state(false, false)
    }

    fn failing() -> Arc<Self> {
        Self::with_state(true, true)
    }

    fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LivenessOracle for MockOracle {
    async fn is_available(&self) -> std::result::Result<bool, OracleError> {
        Ok(true)
    }

    async fn is_on_air(&self) -> std::result::Result<bool, OracleError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(OracleError::parse("mock transport failure"));
        }
        Ok(self.on_air.load(Ordering::SeqCst))
    }

    async fn resolve_stream_url(
        &self,
        _options: &StreamUrlOptions,
    ) -> std::result::Result<String, OracleError> {
        Ok("https://cdn.example/live.flv".to_string())
    }

    async fn stream_info(&self) -> std::result::Result<StreamInfo, OracleError> {
        Ok(StreamInfo {
            title: "test stream".to_string(),
            streamer: "tester".to_string(),
            avatar_url: String::new(),
            keyframe_url: String::new(),
        })
    }

    fn stream_headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

// ---- argument construction ----

#[test]
fn test_args_without_segmenting() {
    let config = test_capture_config();
    let args = build_capture_args("https://cdn.example/live.flv", &config);

    assert!(!args.windows(2).any(|w| w == ["-f", "segment"]));
    assert_eq!(args.last().map(String::as_str), Some("./recordings/test.flv"));

    let input = args.iter().position(|a| a == "-i").unwrap();
    assert_eq!(args[input + 1], "https://cdn.example/live.flv");
    assert!(args.windows(2).any(|w| w == ["-c", "copy"]));
    assert!(args
        .windows(2)
        .any(|w| w == ["-movflags", "faststart+frag_keyframe+empty_moov"]));
}

#[test]
fn test_args_with_segmenting() {
    let mut config = test_capture_config();
    config.segment = Some(3600);
    let args = build_capture_args("https://cdn.example/live.flv", &config);

    assert!(args.windows(2).any(|w| w == ["-f", "segment"]));
    assert!(args.windows(2).any(|w| w == ["-segment_time", "3600"]));
    assert!(args.windows(2).any(|w| w == ["-reset_timestamps", "1"]));
    assert_eq!(args.last().map(String::as_str), Some("./recordings/test.flv"));
}

#[test]
fn test_args_extra_args_precede_input() {
    let mut config = test_capture_config();
    config.extra_args = vec!["-rw_timeout".to_string(), "10000000".to_string()];
    let args = build_capture_args("https://cdn.example/live.flv", &config);

    let extra = args.iter().position(|a| a == "-rw_timeout").unwrap();
    let input = args.iter().position(|a| a == "-i").unwrap();
    assert!(extra < input);
}

#[test]
fn test_header_blob_is_crlf_joined() {
    let config = test_capture_config();
    assert_eq!(
        header_blob(&config.headers),
        "Referer: https://live.example\r\nUser-Agent: test-agent\r\n"
    );
}

// ---- line tokenizer ----

#[test]
fn test_tokenizer_preserves_line_order() {
    let mut tokenizer = LineTokenizer::new();
    let mut lines = Vec::new();
    for byte in b"frame=1\nframe=2\r" {
        if let Some(line) = tokenizer.feed(*byte) {
            lines.push(line);
        }
    }
    assert_eq!(lines, vec!["frame=1", "frame=2"]);
    assert!(tokenizer.take().is_none());
}

#[test]
fn test_tokenizer_handles_nul_and_empty_lines() {
    let mut tokenizer = LineTokenizer::new();
    let mut lines = Vec::new();
    for byte in b"a\0\r\nb\n" {
        if let Some(line) = tokenizer.feed(*byte) {
            lines.push(line);
        }
    }
    // the \r\n run after "a" produces no empty lines
    assert_eq!(lines, vec!["a", "b"]);
}

// ---- drain loop ----

#[tokio::test]
async fn test_drain_preserves_lines_and_order() {
    let (mut writer, reader) = tokio::io::duplex(64);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let stopped = Arc::new(AtomicBool::new(false));

    let drain = tokio::spawn(drain_output(
        reader,
        tx,
        Arc::clone(&stopped),
        Duration::from_secs(10),
    ));

    writer.write_all(b"frame=1\nframe=2\r").await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), "frame=1");
    assert_eq!(rx.recv().await.unwrap(), "frame=2");

    drop(writer);
    drain.await.unwrap();
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_drain_flushes_stuck_partial_line_once() {
    let (mut writer, reader) = tokio::io::duplex(64);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let stopped = Arc::new(AtomicBool::new(false));

    let drain = tokio::spawn(drain_output(
        reader,
        tx,
        Arc::clone(&stopped),
        Duration::from_millis(200),
    ));

    // No terminator; the drain must flush it on its own after ~200ms
    writer.write_all(b"size=1024kB speed=0.85").await.unwrap();
    let flushed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("partial line was never flushed")
        .unwrap();
    assert_eq!(flushed, "size=1024kB speed=0.85");

    // The flushed text must not reappear with the next complete line
    writer.write_all(b"frame=100\n").await.unwrap();
    let next = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("follow-up line was never drained")
        .unwrap();
    assert_eq!(next, "frame=100");

    drop(writer);
    drain.await.unwrap();
}

#[tokio::test]
async fn test_drain_exits_on_stop_flag() {
    let (_writer, reader) = tokio::io::duplex(64);
    let (tx, _rx) = mpsc::unbounded_channel();
    let stopped = Arc::new(AtomicBool::new(false));

    let drain = tokio::spawn(drain_output(
        reader,
        tx,
        Arc::clone(&stopped),
        Duration::from_secs(10),
    ));

    stopped.store(true, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(2), drain)
        .await
        .expect("drain loop ignored the stop flag")
        .unwrap();
}

// ---- throughput parsing ----

#[test]
fn test_parse_speed() {
    assert_eq!(parse_speed("bitrate=559.9kbits/s speed=0.85x"), Some(0.85));
    assert_eq!(parse_speed("bitrate=559.9kbits/s speed= 1.2x"), Some(1.2));
    assert_eq!(parse_speed("frame= 100 fps=30 q=-1.0"), None);
    assert_eq!(parse_speed("speed=x"), None);
}

// ---- window evaluation ----

fn progress_line(speed: &str) -> String {
    format!(
        "frame= 450 fps= 30 q=-1.0 size= 2048kB time=00:00:15.00 bitrate= 1117.4kbits/s speed={}x",
        speed
    )
}

#[test]
fn test_empty_window_is_a_stall() {
    let monitor = fast_monitor_config();
    let mut window = HealthWindow::new();
    assert!(matches!(
        evaluate_window(&mut window, &monitor),
        WindowVerdict::Fail(SupervisionError::Stall)
    ));
}

#[test]
fn test_low_speed_strikes_accumulate() {
    let monitor = fast_monitor_config();
    let mut window = HealthWindow::new();

    window.absorb(progress_line("0.85"));
    assert!(matches!(
        evaluate_window(&mut window, &monitor),
        WindowVerdict::Continue
    ));
    assert_eq!(window.low_speed_strikes, 1);
    window.reset_interval();

    window.absorb(progress_line("0.70"));
    assert!(matches!(
        evaluate_window(&mut window, &monitor),
        WindowVerdict::Fail(SupervisionError::LowThroughput)
    ));
}

#[test]
fn test_good_window_resets_strikes() {
    let monitor = fast_monitor_config();
    let mut window = HealthWindow::new();

    for speed in ["0.85", "1.2", "0.85"] {
        window.absorb(progress_line(speed));
        assert!(matches!(
            evaluate_window(&mut window, &monitor),
            WindowVerdict::Continue
        ));
        window.reset_interval();
    }
    // low, good, low: the good window broke the consecutive run
    assert_eq!(window.low_speed_strikes, 1);
}

#[test]
fn test_window_without_speed_field_keeps_strikes() {
    let monitor = fast_monitor_config();
    let mut window = HealthWindow::new();

    window.absorb(progress_line("0.85"));
    assert!(matches!(
        evaluate_window(&mut window, &monitor),
        WindowVerdict::Continue
    ));
    window.reset_interval();

    window.absorb("frame= 451 fps= 30 q=-1.0".to_string());
    assert!(matches!(
        evaluate_window(&mut window, &monitor),
        WindowVerdict::Continue
    ));
    assert_eq!(window.low_speed_strikes, 1);
}

#[test]
fn test_lowspeed_interrupt_can_be_disabled() {
    let mut monitor = fast_monitor_config();
    monitor.disable_lowspeed_interrupt = true;
    let mut window = HealthWindow::new();

    for _ in 0..4 {
        window.absorb(progress_line("0.50"));
        assert!(matches!(
            evaluate_window(&mut window, &monitor),
            WindowVerdict::Continue
        ));
        window.reset_interval();
    }
    assert_eq!(window.low_speed_strikes, 0);
}

#[test]
fn test_drop_marker_fails_window() {
    let monitor = fast_monitor_config();
    let mut window = HealthWindow::new();

    window.absorb(progress_line("1.0"));
    window.absorb("[flv @ 0x5595] Packet mismatch 1024 25364, dropping it.".to_string());
    assert!(matches!(
        evaluate_window(&mut window, &monitor),
        WindowVerdict::Fail(SupervisionError::StreamDrop)
    ));
}

// ---- monitor loop against real processes ----

async fn spawn_sleeper() -> Arc<Mutex<Option<tokio::process::Child>>> {
    let child = Command::new("sleep")
        .arg("60")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .expect("failed to spawn sleep");
    Arc::new(Mutex::new(Some(child)))
}

async fn spawn_exited() -> Arc<Mutex<Option<tokio::process::Child>>> {
    let mut child = Command::new("true")
        .stdin(std::process::Stdio::null())
        .spawn()
        .expect("failed to spawn true");
    let _ = child.wait().await;
    Arc::new(Mutex::new(Some(child)))
}

async fn kill_sleeper(child: &Arc<Mutex<Option<tokio::process::Child>>>) {
    if let Some(child) = child.lock().await.as_mut() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

fn monitor_context(
    child: Arc<Mutex<Option<tokio::process::Child>>>,
    lines: mpsc::UnboundedReceiver<String>,
    oracle: Arc<MockOracle>,
) -> MonitorContext {
    MonitorContext {
        child,
        lines,
        oracle,
        monitor: fast_monitor_config(),
        stopped: Arc::new(AtomicBool::new(false)),
        started_at: Instant::now(),
        piped: true,
    }
}

#[tokio::test]
async fn test_unexpected_exit_while_on_air_fails() {
    let child = spawn_exited().await;
    let (_tx, rx) = mpsc::unbounded_channel();
    let oracle = MockOracle::on_air();

    let result = monitor_loop(monitor_context(child, rx, oracle)).await;
    assert_eq!(
        result,
        SupervisionResult::Failed(SupervisionError::UnexpectedExit)
    );
}

#[tokio::test]
async fn test_exit_while_offline_is_a_normal_end() {
    let child = spawn_exited().await;
    let (_tx, rx) = mpsc::unbounded_channel();
    let oracle = MockOracle::offline();

    let result = monitor_loop(monitor_context(child, rx, oracle)).await;
    assert_eq!(result, SupervisionResult::NormalEnd);
}

#[tokio::test]
async fn test_exit_with_failing_oracle_is_treated_as_unexpected() {
    let child = spawn_exited().await;
    let (_tx, rx) = mpsc::unbounded_channel();
    let oracle = MockOracle::failing();

    let result = monitor_loop(monitor_context(child, rx, oracle)).await;
    assert_eq!(
        result,
        SupervisionResult::Failed(SupervisionError::UnexpectedExit)
    );
}

#[tokio::test]
async fn test_offline_detected_on_third_window_tick() {
    let child = spawn_sleeper().await;
    let (tx, rx) = mpsc::unbounded_channel();
    let oracle = MockOracle::offline();

    // Keep every window fed so only the oracle can end the run
    tokio::spawn(async move {
        loop {
            if tx.send(progress_line("1.0")).is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });

    let started = Instant::now();
    let result = monitor_loop(monitor_context(
        Arc::clone(&child),
        rx,
        Arc::clone(&oracle),
    ))
    .await;

    assert_eq!(result, SupervisionResult::NormalEnd);
    // Three full windows elapse before the first oracle poll
    assert!(started.elapsed() >= Duration::from_millis(3 * 120));
    assert_eq!(oracle.polls(), 1);

    kill_sleeper(&child).await;
}

#[tokio::test]
async fn test_transient_oracle_error_keeps_run_alive() {
    let child = spawn_sleeper().await;
    let (tx, rx) = mpsc::unbounded_channel();
    let oracle = MockOracle::failing();

    tokio::spawn(async move {
        loop {
            if tx.send(progress_line("1.0")).is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });

    let ctx = monitor_context(Arc::clone(&child), rx, Arc::clone(&oracle));
    let stopped = Arc::clone(&ctx.stopped);

    let handle = tokio::spawn(monitor_loop(ctx));

    // Long enough for two failed oracle polls (ticks 3 and 6)
    tokio::time::sleep(Duration::from_millis(850)).await;
    assert!(!handle.is_finished());
    assert!(oracle.polls() >= 1);

    stopped.store(true, Ordering::SeqCst);
    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("monitor loop ignored the stop flag")
        .unwrap();
    assert_eq!(result, SupervisionResult::NormalEnd);

    kill_sleeper(&child).await;
}

#[tokio::test]
async fn test_silent_window_is_a_stall_failure() {
    let child = spawn_sleeper().await;
    let (_tx, rx) = mpsc::unbounded_channel();
    let oracle = MockOracle::on_air();

    let result = monitor_loop(monitor_context(Arc::clone(&child), rx, oracle)).await;
    assert_eq!(result, SupervisionResult::Failed(SupervisionError::Stall));

    kill_sleeper(&child).await;
}

// ---- full supervisor lifecycle ----

/// Fake capture binary: ignores its arguments and exits once the quit
/// command arrives on stdin, like ffmpeg's `q` handling.
fn fake_capture_binary(script: &str) -> (tempfile::TempDir, String) {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("fake-ffmpeg.sh");
    std::fs::write(&path, script).expect("failed to write fake binary");

    let mut perms = std::fs::metadata(&path).expect("stat failed").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod failed");

    let binary = path.to_string_lossy().into_owned();
    (dir, binary)
}

fn supervisor_for_binary(binary: String, oracle: Arc<MockOracle>) -> CaptureSupervisor {
    let mut capture = test_capture_config();
    capture.ffmpeg = binary;

    let mut monitor = fast_monitor_config();
    // Wide window: these tests exercise lifecycle, not stall detection
    monitor.window_ms = 5_000;

    CaptureSupervisorBuilder::new()
        .stream_url("https://cdn.example/live.flv")
        .capture(capture)
        .monitor(monitor)
        .oracle(oracle)
        .build()
        .expect("failed to build supervisor")
}

#[tokio::test]
async fn test_supervisor_stop_is_idempotent() {
    let (_dir, binary) = fake_capture_binary("#!/bin/sh\nhead -c 1 >/dev/null\n");
    let supervisor = supervisor_for_binary(binary, MockOracle::on_air());

    supervisor.start().await.expect("start failed");
    assert!(supervisor.is_running());

    supervisor.stop().await;
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert!(!supervisor.is_running());

    // Second stop returns immediately with nothing left to do
    let again = Instant::now();
    supervisor.stop().await;
    assert!(again.elapsed() < Duration::from_millis(100));
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn test_supervisor_is_single_shot() {
    let (_dir, binary) = fake_capture_binary("#!/bin/sh\nhead -c 1 >/dev/null\n");
    let supervisor = supervisor_for_binary(binary, MockOracle::on_air());

    supervisor.start().await.expect("start failed");
    supervisor.stop().await;

    assert!(supervisor.start().await.is_err());
}

#[tokio::test]
async fn test_supervisor_reports_unexpected_exit() {
    let (_dir, binary) = fake_capture_binary("#!/bin/sh\nexit 0\n");
    let supervisor = supervisor_for_binary(binary, MockOracle::on_air());

    supervisor.start().await.expect("start failed");
    let result = supervisor.wait().await.expect("wait failed");
    assert_eq!(
        result,
        SupervisionResult::Failed(SupervisionError::UnexpectedExit)
    );
    assert_eq!(supervisor.state(), SupervisorState::Failing);

    supervisor.stop().await;
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn test_supervisor_normal_end_when_source_offline() {
    let (_dir, binary) = fake_capture_binary("#!/bin/sh\nexit 0\n");
    let supervisor = supervisor_for_binary(binary, MockOracle::offline());

    supervisor.start().await.expect("start failed");
    let result = supervisor.wait().await.expect("wait failed");
    assert_eq!(result, SupervisionResult::NormalEnd);
    assert_eq!(supervisor.state(), SupervisorState::Ending);

    supervisor.stop().await;
}
