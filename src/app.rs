use crate::config::StreamcapConfig;
use crate::error::Result;
use crate::oracle::{self, LivenessOracle, StreamInfo, StreamUrlOptions};
use crate::recovery::{RestartAction, RestartConfig, RestartPolicy};
use crate::supervisor::{CaptureSupervisorBuilder, SupervisionResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A failed run that stayed up at least this long was not a crash loop;
/// its failure resets the restart budget.
const HEALTHY_RUN: Duration = Duration::from_secs(60);

/// Records one configured source until it goes offline, building a fresh
/// supervisor for every restart attempt.
pub struct CaptureSession {
    config: StreamcapConfig,
    oracle: Arc<dyn LivenessOracle>,
}

impl CaptureSession {
    pub fn new(config: StreamcapConfig) -> Result<Self> {
        let oracle = oracle::from_config(&config.source)?;
        Ok(Self { config, oracle })
    }

    /// Run the capture session to completion. Returns a process exit code.
    pub async fn run(&self) -> Result<i32> {
        let cancel = CancellationToken::new();
        spawn_signal_handlers(cancel.clone());

        if !self.oracle.is_available().await? {
            error!("Source {} does not exist", self.config.source.room_id);
            return Ok(1);
        }

        if !self.oracle.is_on_air().await? {
            info!(
                "Source {} is not live; nothing to record",
                self.config.source.room_id
            );
            return Ok(0);
        }

        let stream_info = match self.oracle.stream_info().await {
            Ok(info) => {
                info!("Recording {}: {}", info.streamer, info.title);
                Some(info)
            }
            Err(e) => {
                warn!("Could not fetch stream info: {}", e);
                None
            }
        };

        let mut policy = RestartPolicy::with_config(RestartConfig::from(&self.config.restart));
        let url_options = StreamUrlOptions::from_source(&self.config.source);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            // Re-resolve on every attempt; stream URLs expire
            let stream_url = self.oracle.resolve_stream_url(&url_options).await?;

            let mut capture = self.config.capture.clone();
            capture.output = expand_output(&capture.output, stream_info.as_ref());
            for (key, value) in self.oracle.stream_headers() {
                capture.headers.insert(key, value);
            }

            let supervisor = CaptureSupervisorBuilder::new()
                .stream_url(stream_url)
                .capture(capture)
                .monitor(self.config.monitor.clone())
                .oracle(Arc::clone(&self.oracle))
                .build()?;

            supervisor.start().await?;
            let run_started = Instant::now();

            let result = tokio::select! {
                result = supervisor.wait() => result?,
                _ = cancel.cancelled() => {
                    info!("Shutdown requested");
                    supervisor.stop().await;
                    break;
                }
            };

            // Tear the process down regardless of outcome
            supervisor.stop().await;

            match result {
                SupervisionResult::NormalEnd => {
                    info!("Capture finished");
                    break;
                }
                SupervisionResult::Failed(supervision_error) => {
                    if run_started.elapsed() >= HEALTHY_RUN {
                        policy.reset();
                    }

                    match policy.on_failure(&supervision_error) {
                        RestartAction::RetryAfterDelay(delay) => {
                            warn!(
                                "Capture failed: {}; restarting in {:?}",
                                supervision_error, delay
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = cancel.cancelled() => break,
                            }
                        }
                        RestartAction::GiveUp => {
                            error!(
                                "Giving up on {}: {}",
                                self.config.source.room_id, supervision_error
                            );
                            return Ok(1);
                        }
                    }

                    // A source that ended while the run was failing is a
                    // normal end, not something to restart into
                    match self.oracle.is_on_air().await {
                        Ok(false) => {
                            info!("Source went offline; capture finished");
                            break;
                        }
                        Ok(true) => {}
                        Err(e) => warn!("Liveness query failed before restart: {}", e),
                    }
                }
            }
        }

        Ok(0)
    }
}

fn spawn_signal_handlers(cancel: CancellationToken) {
    // SIGTERM (service stop) - Unix only
    #[cfg(unix)]
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Ok(mut sigterm) = signal::unix::signal(signal::unix::SignalKind::terminate()) {
                if sigterm.recv().await.is_some() {
                    info!("Received SIGTERM signal");
                    cancel.cancel();
                }
            }
        });
    }

    // SIGINT (Ctrl+C) - cross-platform
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT signal (Ctrl+C)");
            cancel.cancel();
        }
    });
}

/// Expand `{streamer}`, `{title}` and `{time}` placeholders in the output
/// base path.
fn expand_output(template: &str, info: Option<&StreamInfo>) -> String {
    let time = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let mut output = template.replace("{time}", &time);
    match info {
        Some(info) => {
            output = output
                .replace("{streamer}", &sanitize(&info.streamer))
                .replace("{title}", &sanitize(&info.title));
        }
        None => {
            output = output
                .replace("{streamer}", "stream")
                .replace("{title}", "live");
        }
    }
    output
}

/// Keep placeholder expansions path-safe.
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_output_with_info() {
        let info = StreamInfo {
            title: "night/run".to_string(),
            streamer: "streamer-a".to_string(),
            avatar_url: String::new(),
            keyframe_url: String::new(),
        };
        let output = expand_output("./rec/{streamer}_{title}", Some(&info));
        assert_eq!(output, "./rec/streamer-a_night_run");
    }

    #[test]
    fn test_expand_output_without_info() {
        let output = expand_output("./rec/{streamer}", None);
        assert_eq!(output, "./rec/stream");
    }

    #[test]
    fn test_expand_output_time_placeholder() {
        let output = expand_output("./rec/{time}", None);
        assert!(!output.contains("{time}"));
        assert!(output.starts_with("./rec/20"));
    }
}
