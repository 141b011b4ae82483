use std::sync::Arc;

use chrono::{DateTime, Utc};
use http::StatusCode;

/// Everything that can go wrong while talking to the meter.
///
/// The error is [`Clone`] because a single refresh or discovery publishes its outcome to every
/// caller waiting on it.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    #[error("transport failure: {0}")]
    Transport(#[source] Arc<TransportError>),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("the user is authenticated but not allowed to access `{0}`")]
    Permission(String),

    /// The device no longer accepts the bearer token.
    ///
    /// Handled by the client with one re-login, callers see it only through
    /// [`Error::Authentication`] when the re-login does not help.
    #[error("the access token has been invalidated by the device")]
    TokenInvalidated,

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("unknown register `{0}`")]
    UnknownRegister(String),

    #[error("invalid time range: `{start}` is not before `{end}`")]
    InvalidRange { start: DateTime<Utc>, end: DateTime<Utc> },

    #[error(transparent)]
    CounterDiscontinuity(#[from] CounterDiscontinuity),

    #[error("`{path}` responded with {status}")]
    Status { status: StatusCode, path: String },

    #[error("invalid query parameter name {0:?}")]
    InvalidParameter(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl From<TransportError> for Error {
    fn from(error: TransportError) -> Self {
        Self::Transport(Arc::new(error))
    }
}

/// The payload does not match the expected schema.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("failed to parse the response: {0}")]
pub struct ParseError(pub String);

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<roxmltree::Error> for ParseError {
    fn from(error: roxmltree::Error) -> Self {
        Self(format!("malformed XML: {error}"))
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(error: serde_json::Error) -> Self {
        Self(format!("malformed JSON: {error}"))
    }
}

/// Network-level failure reported by a [`crate::Transport`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),

    #[error("{0}")]
    Other(String),
}

/// A cumulative counter went backwards, most likely because the device restarted.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("counter `{register}` went backwards by {delta} between `{start}` and `{end}`")]
pub struct CounterDiscontinuity {
    pub register: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,

    /// Negative counter difference in physical units.
    pub delta: f64,
}
