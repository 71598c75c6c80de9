use std::sync::Arc;

/// Represents a result type for synchronization operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur while synchronizing flag configurations and
/// cohorts.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid server URL configuration.
    #[error("invalid server url configuration")]
    InvalidUrl(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid deployment key or cohort
    /// credentials.
    #[error("unauthorized, credentials are likely invalid")]
    Unauthorized,

    /// The server answered with a status the client does not know how to handle.
    #[error("unexpected response status: {0}")]
    UnexpectedStatus(u16),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Response body could not be parsed.
    #[error("failed to parse response body")]
    Json(#[source] Arc<serde_json::Error>),

    /// The stream did not deliver its first data frame within the connection timeout.
    #[error("timed out waiting for the first flag stream frame")]
    ConnTimeout,

    /// A stream data frame could not be parsed as flag configurations.
    #[error("flag stream delivered a corrupt data frame")]
    DataCorrupt(#[source] Arc<serde_json::Error>),

    /// The flag stream failed.
    #[error("flag stream failed")]
    Stream(#[source] StreamError),

    /// A fallback/retry wrapper was passed another wrapper as its main updater. Nested wrappers
    /// must be flattened into a single wrapper.
    #[error("main updater must not be a fallback retry wrapper")]
    NestedFallbackWrapper,

    /// The operation was cancelled before it could complete.
    #[error("operation cancelled")]
    Cancelled,

    /// The component has been shut down and does not accept new work.
    #[error("component has been shut down")]
    Shutdown,

    /// A background worker panicked. This should normally never happen.
    #[error("background worker panicked")]
    WorkerPanicked,
}

/// Classification of flag stream transport failures.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum StreamError {
    /// No data (including keepalives) arrived within the keepalive timeout.
    #[error("stream keepalive timed out")]
    Timeout,

    /// The connection was reset or failed while reading.
    #[error("stream connection reset")]
    Reset(#[source] Arc<std::io::Error>),

    /// The connection could not be established.
    #[error("stream connection failed")]
    Connect(#[source] Arc<reqwest::Error>),

    /// The server rejected the stream request.
    #[error("stream request failed with status {0}")]
    Status(u16),

    /// The server sent something that is not a valid event stream.
    #[error("stream protocol error: {0}")]
    Protocol(String),

    /// The first frame was received but applying it failed.
    #[error("failed to apply stream update")]
    Update(#[source] Arc<Error>),
}

impl StreamError {
    /// Classify an I/O error raised while reading the stream body.
    pub fn from_io(err: std::io::Error) -> StreamError {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => StreamError::Timeout,
            std::io::ErrorKind::InvalidData => StreamError::Protocol(err.to_string()),
            _ => {
                // Blocking reqwest bodies surface read deadlines as an io error wrapping a
                // reqwest timeout error.
                let is_timeout = err
                    .get_ref()
                    .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
                    .is_some_and(|inner| inner.is_timeout());
                if is_timeout {
                    StreamError::Timeout
                } else {
                    StreamError::Reset(Arc::new(err))
                }
            }
        }
    }
}

impl From<StreamError> for Error {
    fn from(value: StreamError) -> Self {
        Error::Stream(value)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}
