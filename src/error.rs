use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamcapError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Liveness query error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Capture failed: {0}")]
    Supervision(#[from] SupervisionError),

    #[error("System error: {message}")]
    System { message: String },
}

impl StreamcapError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }
}

/// Transient failure while querying the remote liveness API.
///
/// Never to be read as "confirmed offline" -- the caller retries the poll
/// on the next cadence instead of ending the capture.
#[derive(Error, Debug)]
pub enum OracleError {
    #[error("Liveness request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unexpected liveness response: {details}")]
    Parse { details: String },

    #[error("{provider} stream resolution failed")]
    StreamResolve { provider: String },
}

impl OracleError {
    pub fn parse<S: Into<String>>(details: S) -> Self {
        Self::Parse {
            details: details.into(),
        }
    }
}

/// Terminal conditions that fail a capture run.
///
/// The supervisor surfaces exactly one of these and never retries on its
/// own; restart policy belongs to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisionError {
    #[error("pipe read error, will retry")]
    Stall,

    #[error("download too slow, will retry")]
    LowThroughput,

    #[error("stream read error, will retry")]
    StreamDrop,

    #[error("capture process exited unexpectedly")]
    UnexpectedExit,
}

pub type Result<T> = std::result::Result<T, StreamcapError>;
