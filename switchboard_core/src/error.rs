use std::sync::Arc;

/// Result type used throughout the SDK core.
///
/// This `Result` type is a standard Rust `Result` type where the error variant
/// is defined by the switchboard-specific [`Error`] enum. Note that flag
/// evaluation never returns `Err`; evaluation failures are reported through
/// [`crate::eval::ErrorKind`] in the evaluation detail instead.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the SDK core.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The request was unauthorized, possibly due to an invalid SDK key.
    #[error("unauthorized, sdk key is likely invalid")]
    Unauthorized,

    /// Invalid base URI configuration.
    #[error("invalid base uri configuration")]
    InvalidBaseUri(#[source] url::ParseError),

    /// The control plane returned a non-success HTTP status.
    #[error("unexpected response status {0}")]
    UnexpectedStatus(u16),

    /// The stream or poll payload could not be parsed.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The streaming connection was lost.
    #[error("stream connection lost: {0}")]
    StreamClosed(String),

    /// A data store operation failed.
    #[error("data store error: {0}")]
    Store(String),

    /// A big segment store operation failed.
    #[error("big segment store error: {0}")]
    BigSegmentStore(String),

    /// Indicates that a background worker thread panicked. This should
    /// normally never happen.
    #[error("background worker panicked")]
    WorkerPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
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

impl Error {
    /// Whether a data source hitting this error must stop permanently instead
    /// of retrying.
    pub(crate) fn is_unrecoverable(&self) -> bool {
        matches!(self, Error::Unauthorized | Error::InvalidBaseUri(_))
    }
}
