pub mod app;
pub mod config;
pub mod error;
pub mod oracle;
pub mod recovery;
pub mod supervisor;

pub use app::CaptureSession;
pub use config::{CaptureConfig, MonitorConfig, RestartSettings, SourceConfig, StreamcapConfig};
pub use error::{OracleError, Result, StreamcapError, SupervisionError};
pub use oracle::{BilibiliOracle, CdnPreference, LivenessOracle, StreamInfo, StreamUrlOptions};
pub use recovery::{RestartAction, RestartConfig, RestartPolicy};
pub use supervisor::{
    build_capture_args, CaptureSupervisor, CaptureSupervisorBuilder, SupervisionResult,
    SupervisorState,
};
