use super::CaptureSupervisor;
use crate::config::{CaptureConfig, MonitorConfig};
use crate::error::{Result, StreamcapError};
use crate::oracle::LivenessOracle;
use std::sync::Arc;

/// Builder for a capture supervisor bound to one resolved stream URL.
pub struct CaptureSupervisorBuilder {
    stream_url: Option<String>,
    capture: Option<CaptureConfig>,
    monitor: MonitorConfig,
    oracle: Option<Arc<dyn LivenessOracle>>,
}

impl CaptureSupervisorBuilder {
    pub fn new() -> Self {
        Self {
            stream_url: None,
            capture: None,
            monitor: MonitorConfig::default(),
            oracle: None,
        }
    }

    pub fn stream_url<S: Into<String>>(mut self, url: S) -> Self {
        self.stream_url = Some(url.into());
        self
    }

    pub fn capture(mut self, capture: CaptureConfig) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn oracle(mut self, oracle: Arc<dyn LivenessOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn build(self) -> Result<CaptureSupervisor> {
        let stream_url = self
            .stream_url
            .ok_or_else(|| StreamcapError::system("Stream URL must be specified"))?;
        let capture = self
            .capture
            .ok_or_else(|| StreamcapError::system("Capture configuration must be specified"))?;
        let oracle = self
            .oracle
            .ok_or_else(|| StreamcapError::system("Liveness oracle must be specified"))?;

        Ok(CaptureSupervisor::new(
            stream_url,
            capture,
            self.monitor,
            oracle,
        ))
    }
}

impl Default for CaptureSupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
