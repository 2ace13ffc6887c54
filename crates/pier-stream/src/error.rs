use thiserror::Error;

/// How a streaming operation ended, when it did not simply succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    /// Normal termination path. Never logged as a failure.
    #[error("client disconnected")]
    ClientDisconnected,
    #[error("upstream closed")]
    UpstreamClosed,
    #[error("transport write failed: {0}")]
    TransportWrite(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("external process failed: {0}")]
    ExternalProcess(String),
}

impl StreamError {
    pub fn is_failure(&self) -> bool {
        !matches!(self, StreamError::ClientDisconnected | StreamError::UpstreamClosed)
    }
}
