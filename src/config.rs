use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StreamcapConfig {
    pub source: SourceConfig,
    pub capture: CaptureConfig,
    pub monitor: MonitorConfig,
    pub restart: RestartSettings,
}

/// Which liveness provider to poll and which source it should watch.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceConfig {
    /// Liveness provider name (currently only "bilibili")
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Provider-specific source identifier (room id); may also arrive via
    /// CLI override, so only validation insists on it
    #[serde(default)]
    pub room_id: String,

    /// Preferred CDN index into the resolved candidate list
    pub cdn_index: Option<usize>,

    /// Preferred CDN host name, substituted into the resolved URL
    pub cdn_host: Option<String>,
}

/// Immutable description of one capture-process invocation.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CaptureConfig {
    /// Output base path; `{streamer}`, `{title}` and `{time}` placeholders
    /// are expanded before a run starts
    #[serde(default = "default_output_base")]
    pub output: String,

    /// Output container format appended to the base path
    #[serde(default = "default_container_format")]
    pub format: String,

    /// Segment duration in seconds; segmented output is enabled when > 0
    pub segment: Option<u64>,

    /// Extra arguments inserted before the input URL
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// HTTP headers forwarded to the capture process
    #[serde(default = "default_stream_headers")]
    pub headers: BTreeMap<String, String>,

    /// Path to the capture binary
    #[serde(default = "default_ffmpeg_binary")]
    pub ffmpeg: String,

    /// Pass capture-process diagnostics through to the console instead of
    /// draining them; health checks degrade to time-based only
    #[serde(default)]
    pub debug: bool,
}

impl CaptureConfig {
    /// Full output path handed to the capture process.
    pub fn output_path(&self) -> String {
        format!("{}.{}", self.output, self.format)
    }
}

/// Supervision cadence and thresholds.
///
/// Exposed as configuration, but the defaults are load-bearing: the health
/// heuristics were tuned against these exact values.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MonitorConfig {
    /// Health-loop poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Evaluation window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Unterminated output lines are flushed after this many milliseconds
    #[serde(default = "default_partial_line_flush_ms")]
    pub partial_line_flush_ms: u64,

    /// How long to wait for a graceful exit before escalating to a signal
    #[serde(default = "default_graceful_stop_wait_ms")]
    pub graceful_stop_wait_ms: u64,

    /// Throughput multiplier below which a window counts as a strike
    #[serde(default = "default_low_speed_threshold")]
    pub low_speed_threshold: f64,

    /// Consecutive low-speed windows tolerated before failing the run
    #[serde(default = "default_low_speed_strike_limit")]
    pub low_speed_strike_limit: u32,

    /// The liveness oracle is polled every this many window ticks
    #[serde(default = "default_oracle_poll_ticks")]
    pub oracle_poll_ticks: u64,

    /// Disable the low-throughput interrupt entirely
    #[serde(default)]
    pub disable_lowspeed_interrupt: bool,
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn partial_line_flush(&self) -> Duration {
        Duration::from_millis(self.partial_line_flush_ms)
    }

    pub fn graceful_stop_wait(&self) -> Duration {
        Duration::from_millis(self.graceful_stop_wait_ms)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            window_ms: default_window_ms(),
            partial_line_flush_ms: default_partial_line_flush_ms(),
            graceful_stop_wait_ms: default_graceful_stop_wait_ms(),
            low_speed_threshold: default_low_speed_threshold(),
            low_speed_strike_limit: default_low_speed_strike_limit(),
            oracle_poll_ticks: default_oracle_poll_ticks(),
            disable_lowspeed_interrupt: false,
        }
    }
}

/// Restart policy applied by the session runner after a failed run.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RestartSettings {
    /// Maximum consecutive restart attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff, in seconds
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    /// Maximum delay between restarts, in seconds
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Whether the delay grows exponentially with each attempt
    #[serde(default = "default_exponential_backoff")]
    pub exponential_backoff: bool,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            exponential_backoff: default_exponential_backoff(),
        }
    }
}

impl StreamcapConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("streamcap.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("source.provider", default_provider())?
            .set_default("source.room_id", "")?
            .set_default("capture.output", default_output_base())?
            .set_default("capture.format", default_container_format())?
            .set_default("capture.ffmpeg", default_ffmpeg_binary())?
            .set_default("monitor.poll_interval_ms", default_poll_interval_ms())?
            .set_default("monitor.window_ms", default_window_ms())?
            .set_default(
                "monitor.partial_line_flush_ms",
                default_partial_line_flush_ms(),
            )?
            .set_default(
                "monitor.graceful_stop_wait_ms",
                default_graceful_stop_wait_ms(),
            )?
            .set_default("monitor.low_speed_threshold", default_low_speed_threshold())?
            .set_default(
                "monitor.low_speed_strike_limit",
                default_low_speed_strike_limit(),
            )?
            .set_default("monitor.oracle_poll_ticks", default_oracle_poll_ticks())?
            .set_default("restart.max_retries", default_max_retries())?
            .set_default("restart.base_delay_secs", default_base_delay_secs())?
            .set_default("restart.max_delay_secs", default_max_delay_secs())?
            .set_default(
                "restart.exponential_backoff",
                default_exponential_backoff(),
            )?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Add environment variables with STREAMCAP_ prefix
            .add_source(Environment::with_prefix("STREAMCAP").separator("_"))
            .build()?;

        let config: StreamcapConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.room_id.trim().is_empty() {
            return Err(ConfigError::Message(
                "Source room_id must not be empty".to_string(),
            ));
        }

        if self.capture.format.trim().is_empty() {
            return Err(ConfigError::Message(
                "Capture format must not be empty".to_string(),
            ));
        }

        if let Some(segment) = self.capture.segment {
            if segment == 0 {
                return Err(ConfigError::Message(
                    "Capture segment duration must be greater than 0".to_string(),
                ));
            }
        }

        if self.monitor.poll_interval_ms == 0 {
            return Err(ConfigError::Message(
                "Monitor poll interval must be greater than 0".to_string(),
            ));
        }

        if self.monitor.window_ms == 0 {
            return Err(ConfigError::Message(
                "Monitor window must be greater than 0".to_string(),
            ));
        }

        if self.monitor.low_speed_threshold <= 0.0 {
            return Err(ConfigError::Message(
                "Monitor low-speed threshold must be greater than 0".to_string(),
            ));
        }

        if self.monitor.oracle_poll_ticks == 0 {
            return Err(ConfigError::Message(
                "Monitor oracle poll cadence must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

// Default value functions
fn default_provider() -> String {
    "bilibili".to_string()
}

fn default_output_base() -> String {
    "./recordings/{streamer}_{time}".to_string()
}
fn default_container_format() -> String {
    "flv".to_string()
}
fn default_ffmpeg_binary() -> String {
    "ffmpeg".to_string()
}
fn default_stream_headers() -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        ),
        (
            "User-Agent".to_string(),
            "Mozilla/5.0 (Linux; Android 5.0; SM-G900P Build/LRX21T) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/75.0.3770.100 Mobile Safari/537.36"
                .to_string(),
        ),
    ])
}

fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_window_ms() -> u64 {
    15_000
}
fn default_partial_line_flush_ms() -> u64 {
    10_000
}
fn default_graceful_stop_wait_ms() -> u64 {
    5_000
}
fn default_low_speed_threshold() -> f64 {
    0.9
}
fn default_low_speed_strike_limit() -> u32 {
    2
}
fn default_oracle_poll_ticks() -> u64 {
    3
}

fn default_max_retries() -> u32 {
    5
}
fn default_base_delay_secs() -> u64 {
    1
}
fn default_max_delay_secs() -> u64 {
    60
}
fn default_exponential_backoff() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> StreamcapConfig {
        StreamcapConfig {
            source: SourceConfig {
                provider: default_provider(),
                room_id: "23197314".to_string(),
                cdn_index: None,
                cdn_host: None,
            },
            capture: CaptureConfig {
                output: "./recordings/test".to_string(),
                format: default_container_format(),
                segment: None,
                extra_args: Vec::new(),
                headers: default_stream_headers(),
                ffmpeg: default_ffmpeg_binary(),
                debug: false,
            },
            monitor: MonitorConfig::default(),
            restart: RestartSettings::default(),
        }
    }

    #[test]
    fn test_defaults_validate() {
        let config = minimal_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_room_id_rejected() {
        let mut config = minimal_config();
        config.source.room_id = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_segment_rejected() {
        let mut config = minimal_config();
        config.capture.segment = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_output_path_appends_format() {
        let config = minimal_config();
        assert_eq!(config.capture.output_path(), "./recordings/test.flv");
    }

    #[test]
    fn test_monitor_defaults_match_tuning() {
        let monitor = MonitorConfig::default();
        assert_eq!(monitor.poll_interval(), Duration::from_secs(1));
        assert_eq!(monitor.window(), Duration::from_secs(15));
        assert_eq!(monitor.partial_line_flush(), Duration::from_secs(10));
        assert_eq!(monitor.graceful_stop_wait(), Duration::from_secs(5));
        assert_eq!(monitor.low_speed_threshold, 0.9);
        assert_eq!(monitor.low_speed_strike_limit, 2);
        assert_eq!(monitor.oracle_poll_ticks, 3);
    }
}
