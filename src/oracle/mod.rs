use crate::config::SourceConfig;
use crate::error::{OracleError, StreamcapError};
use async_trait::async_trait;
use std::sync::Arc;

mod bilibili;


pub use bilibili::BilibiliOracle;

/// Remote-API-backed answer to "is this source currently streaming", plus
/// on-demand resolution of a playable media URL.
///
/// Every call is an independent network round trip that may fail or time
/// out. A failed call is transient and must never be read as "confirmed
/// offline". One implementation per provider.
#[async_trait]
pub trait LivenessOracle: Send + Sync {
    /// Whether the source exists at all.
    async fn is_available(&self) -> Result<bool, OracleError>;

    /// Whether the source is currently live.
    async fn is_on_air(&self) -> Result<bool, OracleError>;

    /// Resolve the currently playable media URL. Needed only at (re)start,
    /// not during steady-state monitoring.
    async fn resolve_stream_url(&self, options: &StreamUrlOptions)
        -> Result<String, OracleError>;

    /// Channel metadata, used for logging and output naming.
    async fn stream_info(&self) -> Result<StreamInfo, OracleError>;

    /// HTTP headers the capture process should send when pulling the stream.
    fn stream_headers(&self) -> Vec<(String, String)>;
}

/// CDN selection passed to [`LivenessOracle::resolve_stream_url`].
#[derive(Debug, Clone, Default)]
pub struct StreamUrlOptions {
    pub cdn: Option<CdnPreference>,
}

#[derive(Debug, Clone)]
pub enum CdnPreference {
    /// Pick the nth resolved candidate, clamped into range
    Index(usize),
    /// Substitute a named CDN host into the resolved URL
    Host(String),
}

impl StreamUrlOptions {
    pub fn from_source(source: &SourceConfig) -> Self {
        let cdn = if let Some(index) = source.cdn_index {
            Some(CdnPreference::Index(index))
        } else {
            source.cdn_host.clone().map(CdnPreference::Host)
        };
        Self { cdn }
    }
}

/// Channel metadata reported by a provider.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub title: String,
    pub streamer: String,
    pub avatar_url: String,
    pub keyframe_url: String,
}

/// Construct the provider named in configuration.
pub fn from_config(source: &SourceConfig) -> Result<Arc<dyn LivenessOracle>, StreamcapError> {
    match source.provider.as_str() {
        "bilibili" => Ok(Arc::new(BilibiliOracle::new(&source.room_id)?)),
        other => Err(StreamcapError::system(format!(
            "Unknown liveness provider: {}",
            other
        ))),
    }
}
