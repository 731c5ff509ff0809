use super::SupervisionResult;
use crate::config::MonitorConfig;
use crate::error::SupervisionError;
use crate::oracle::LivenessOracle;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Prefix of the capture binary's periodic progress reports. Any other
/// non-empty output line marks a window as anomalous.
pub(crate) const PROGRESS_PREFIX: &str = "frame=";

/// Literal the capture binary emits when it discards stream data.
pub(crate) const DROP_MARKER: &str = "dropping it";

/// Accumulated state for one evaluation interval.
///
/// Text and the most recent line reset after each evaluation; the strike
/// counter and tick counter carry across windows.
pub(crate) struct HealthWindow {
    pub(crate) text: String,
    pub(crate) last_line: Option<String>,
    pub(crate) low_speed_strikes: u32,
    pub(crate) tick: u64,
}

impl HealthWindow {
    pub(crate) fn new() -> Self {
        Self {
            text: String::new(),
            last_line: None,
            low_speed_strikes: 0,
            tick: 1,
        }
    }

    pub(crate) fn absorb(&mut self, line: String) {
        self.text.push_str(&line);
        self.text.push('\n');
        self.last_line = Some(line);
    }

    pub(crate) fn reset_interval(&mut self) {
        self.text.clear();
        self.tick += 1;
    }
}

pub(crate) enum WindowVerdict {
    Continue,
    Fail(SupervisionError),
}

/// Run the per-interval heuristics over an accumulated window.
pub(crate) fn evaluate_window(
    window: &mut HealthWindow,
    monitor: &MonitorConfig,
) -> WindowVerdict {
    // A capture process that produced nothing for a whole window is stuck
    if window.text.is_empty() {
        return WindowVerdict::Fail(SupervisionError::Stall);
    }

    let anomalous = window
        .text
        .lines()
        .any(|line| !line.is_empty() && !line.starts_with(PROGRESS_PREFIX));
    if anomalous {
        debug!("Capture output:\n{}", window.text);
    } else {
        debug!("Capture output: ok");
    }

    if !monitor.disable_lowspeed_interrupt {
        if let Some(speed) = window.last_line.as_deref().and_then(parse_speed) {
            if speed < monitor.low_speed_threshold {
                window.low_speed_strikes += 1;
                warn!(
                    "Stream download is lagging (speed={}x); check network bandwidth",
                    speed
                );
                if window.low_speed_strikes >= monitor.low_speed_strike_limit {
                    return WindowVerdict::Fail(SupervisionError::LowThroughput);
                }
            } else {
                window.low_speed_strikes = 0;
            }
        }
    }

    if window.text.contains(DROP_MARKER) {
        return WindowVerdict::Fail(SupervisionError::StreamDrop);
    }

    WindowVerdict::Continue
}

/// Extract the `speed=<n>x` throughput multiplier from a progress line.
pub(crate) fn parse_speed(line: &str) -> Option<f64> {
    let start = line.find("speed=")? + "speed=".len();
    let rest = &line[start..];
    let end = rest.find('x')?;
    rest[..end].trim().parse().ok()
}

/// Everything the health-evaluation loop needs for one run.
pub(crate) struct MonitorContext {
    pub(crate) child: Arc<Mutex<Option<Child>>>,
    pub(crate) lines: mpsc::UnboundedReceiver<String>,
    pub(crate) oracle: Arc<dyn LivenessOracle>,
    pub(crate) monitor: MonitorConfig,
    pub(crate) stopped: Arc<AtomicBool>,
    pub(crate) started_at: Instant,
    /// False when diagnostics are inherited by the console (debug mode);
    /// text-based checks are skipped and only time-based ones run
    pub(crate) piped: bool,
}

/// Health-evaluation loop. Polls roughly once per `poll_interval`, batches
/// decisions on window boundaries, and exits with the run's terminal
/// outcome. Never tears the process down -- that is `stop()`'s job.
pub(crate) async fn monitor_loop(mut ctx: MonitorContext) -> SupervisionResult {
    let mut window = HealthWindow::new();
    let window_len = ctx.monitor.window();

    loop {
        if ctx.stopped.load(Ordering::Relaxed) {
            debug!("Monitor loop observed stop request");
            return SupervisionResult::NormalEnd;
        }

        while let Ok(line) = ctx.lines.try_recv() {
            window.absorb(line);
        }

        if let Some(status) = try_wait(&ctx.child).await {
            if ctx.stopped.load(Ordering::Relaxed) {
                return SupervisionResult::NormalEnd;
            }
            debug!("Capture process exited with {}", status);
            if !window.text.is_empty() {
                debug!("Last capture output:\n{}", window.text);
            }
            return match ctx.oracle.is_on_air().await {
                Ok(false) => {
                    info!("Source is offline; capture ended normally");
                    SupervisionResult::NormalEnd
                }
                Ok(true) => SupervisionResult::Failed(SupervisionError::UnexpectedExit),
                Err(e) => {
                    // Liveness unknown; restarting is the safe direction
                    warn!("Liveness query failed after process exit: {}", e);
                    SupervisionResult::Failed(SupervisionError::UnexpectedExit)
                }
            };
        }

        if ctx.started_at.elapsed() >= window_len.saturating_mul(window.tick as u32) {
            if ctx.piped {
                if let WindowVerdict::Fail(error) = evaluate_window(&mut window, &ctx.monitor) {
                    return SupervisionResult::Failed(error);
                }
            }

            if window.tick % ctx.monitor.oracle_poll_ticks == 0 {
                match ctx.oracle.is_on_air().await {
                    Ok(false) => {
                        info!("Source went offline; capture ended normally");
                        return SupervisionResult::NormalEnd;
                    }
                    Ok(true) => {}
                    Err(e) => {
                        // Transient; never conflated with "confirmed offline"
                        warn!("Liveness query failed: {}", e);
                    }
                }
            }

            window.reset_interval();
        }

        tokio::time::sleep(ctx.monitor.poll_interval()).await;
    }
}

async fn try_wait(child: &Arc<Mutex<Option<Child>>>) -> Option<ExitStatus> {
    let mut guard = child.lock().await;
    guard.as_mut().and_then(|child| child.try_wait().ok().flatten())
}
