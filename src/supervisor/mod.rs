use crate::config::{CaptureConfig, MonitorConfig};
use crate::error::{Result, StreamcapError, SupervisionError};
use crate::oracle::LivenessOracle;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

mod builder;
mod command;
mod drain;
mod monitor;

#[cfg(test)]
mod tests;

pub use builder::CaptureSupervisorBuilder;
pub use command::build_capture_args;

use drain::drain_output;
use monitor::{monitor_loop, MonitorContext};

/// Single byte written to the capture process's stdin to request a
/// graceful shutdown.
const QUIT_COMMAND: &[u8] = b"q";

/// Lifecycle states for one capture run. `Stopped` is terminal and
/// single-shot; a new run requires a new supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Ending,
    Failing,
    Stopped,
}

/// Terminal outcome of one capture run, produced exactly once when the
/// health loop exits. The caller decides whether to restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisionResult {
    NormalEnd,
    Failed(SupervisionError),
}

/// Owns one capture-process lifecycle end to end: launch, incremental
/// output draining, periodic health evaluation, termination.
///
/// Two background loops run while the supervisor is `Running`: the drain
/// loop pumps the process's diagnostic stream into a line FIFO, and the
/// health loop consumes it, correlating output with elapsed time and with
/// liveness polls. They share nothing but the FIFO and the stop flag.
pub struct CaptureSupervisor {
    stream_url: String,
    capture: CaptureConfig,
    monitor: MonitorConfig,
    oracle: Arc<dyn LivenessOracle>,
    state: Arc<parking_lot::Mutex<SupervisorState>>,
    stopped: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
    child_stdin: Mutex<Option<ChildStdin>>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
    monitor_task: Mutex<Option<JoinHandle<SupervisionResult>>>,
}

impl CaptureSupervisor {
    pub(crate) fn new(
        stream_url: String,
        capture: CaptureConfig,
        monitor: MonitorConfig,
        oracle: Arc<dyn LivenessOracle>,
    ) -> Self {
        Self {
            stream_url,
            capture,
            monitor,
            oracle,
            state: Arc::new(parking_lot::Mutex::new(SupervisorState::Idle)),
            stopped: Arc::new(AtomicBool::new(false)),
            child: Arc::new(Mutex::new(None)),
            child_stdin: Mutex::new(None),
            drain_task: Mutex::new(None),
            monitor_task: Mutex::new(None),
        }
    }

    /// Launch the capture process and both background loops.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                SupervisorState::Idle => *state = SupervisorState::Starting,
                SupervisorState::Stopped => {
                    return Err(StreamcapError::system(
                        "Capture supervisor is single-shot; build a new one to record again",
                    ));
                }
                _ => {
                    warn!("Capture supervisor is already running");
                    return Ok(());
                }
            }
        }

        let args = build_capture_args(&self.stream_url, &self.capture);
        debug!("Capture process arguments: {:?}", args);

        let mut command = Command::new(&self.capture.ffmpeg);
        command.args(&args).stdin(Stdio::piped());
        if self.capture.debug {
            // Diagnostics go straight to the console; no pipe to drain
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::piped());
        }

        let mut child = command.spawn().map_err(|e| {
            *self.state.lock() = SupervisorState::Idle;
            e
        })?;

        info!(
            "Capture process started (pid {:?}) writing {}",
            child.id(),
            self.capture.output_path()
        );

        *self.child_stdin.lock().await = child.stdin.take();
        let diagnostics = child.stderr.take();
        *self.child.lock().await = Some(child);

        let (tx, rx) = mpsc::unbounded_channel();
        let piped = diagnostics.is_some();
        if let Some(stream) = diagnostics {
            let stopped = Arc::clone(&self.stopped);
            let flush_after = self.monitor.partial_line_flush();
            *self.drain_task.lock().await =
                Some(tokio::spawn(drain_output(stream, tx, stopped, flush_after)));
        } else {
            warn!("Capture diagnostics inherited; health checks are time-based only");
        }

        *self.state.lock() = SupervisorState::Running;

        let ctx = MonitorContext {
            child: Arc::clone(&self.child),
            lines: rx,
            oracle: Arc::clone(&self.oracle),
            monitor: self.monitor.clone(),
            stopped: Arc::clone(&self.stopped),
            started_at: Instant::now(),
            piped,
        };
        let state = Arc::clone(&self.state);
        *self.monitor_task.lock().await = Some(tokio::spawn(async move {
            let result = monitor_loop(ctx).await;
            let mut state = state.lock();
            if *state != SupervisorState::Stopped {
                *state = match &result {
                    SupervisionResult::NormalEnd => SupervisorState::Ending,
                    SupervisionResult::Failed(_) => SupervisorState::Failing,
                };
            }
            result
        }));

        Ok(())
    }

    /// Wait for the health loop to reach a terminal outcome. Does not tear
    /// the capture process down; call [`stop`](Self::stop) afterwards.
    pub async fn wait(&self) -> Result<SupervisionResult> {
        let handle = self.monitor_task.lock().await.take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| StreamcapError::system(format!("Health loop failed: {}", e))),
            None => Err(StreamcapError::system("Capture supervisor is not running")),
        }
    }

    /// Stop the capture: request a graceful process exit, escalate to an
    /// interrupt signal on timeout, and let both loops drain out.
    ///
    /// Idempotent, and best-effort by design -- shutdown problems are
    /// logged, never propagated.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Capture supervisor already stopped");
            return;
        }

        info!("Stopping capture");

        // Ask the process to finalize its output; closing stdin afterwards
        // doubles as EOF for binaries that ignore the quit command
        if let Some(mut stdin) = self.child_stdin.lock().await.take() {
            if let Err(e) = stdin.write_all(QUIT_COMMAND).await {
                debug!("Quit command not delivered: {}", e);
            }
            let _ = stdin.flush().await;
        }

        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            let grace = self.monitor.graceful_stop_wait();
            match timeout(grace, child.wait()).await {
                Ok(Ok(status)) => debug!("Capture process exited with {}", status),
                Ok(Err(e)) => warn!("Error waiting for capture process: {}", e),
                Err(_) => {
                    warn!(
                        "Capture process did not exit within {:?}; sending interrupt",
                        grace
                    );
                    interrupt(child);
                    match child.wait().await {
                        Ok(status) => debug!("Capture process exited with {}", status),
                        Err(e) => warn!("Error waiting for interrupted capture process: {}", e),
                    }
                }
            }
        }
        drop(guard);

        if let Some(task) = self.drain_task.lock().await.take() {
            let _ = task.await;
        }
        if let Some(task) = self.monitor_task.lock().await.take() {
            let _ = task.await;
        }

        *self.state.lock() = SupervisorState::Stopped;
        debug!("Capture supervisor stopped");
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            SupervisorState::Starting | SupervisorState::Running
        )
    }

    /// URL the capture process is pulling from.
    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }
}

#[cfg(unix)]
fn interrupt(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGINT);
        }
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) {
    let _ = child.start_kill();
}
