//! Error types shared across the engines.

use thiserror::Error;

use crate::range::Range;

/// Failures of the request/response channel to the backend.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The backend answered with an error message
    #[error("backend rejected request: {0}")]
    Rejected(String),

    /// The backend answered with a payload of another kind
    #[error("unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse {
        expected: &'static str,
        got: &'static str,
    },

    /// The channel to the backend is gone
    #[error("transport closed")]
    Closed,

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Errors returned by the output engines.
///
/// `StateChanged` is a benign race: the cache moved while a read was being assembled and the
/// caller should simply ask again. `CountMismatch` means the backend or the engine disagree on
/// how many rows a range holds.
#[derive(Debug, Clone, Error)]
pub enum OutputError {
    #[error("range has incorrect format: start and end should be finite, non-negative and ordered (start: {start}, end: {end})")]
    MalformedRange { start: f64, end: f64 },

    #[error("stored range changed while reading: was {was:?}, became {now:?}")]
    StateChanged {
        was: Option<Range>,
        now: Option<Range>,
    },

    #[error("calculation error: got {actual} rows, expected {expected}")]
    CountMismatch { expected: u64, actual: u64 },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl OutputError {
    /// True when the caller is expected to retry transparently
    pub fn is_retryable(&self) -> bool {
        matches!(self, OutputError::StateChanged { .. })
    }
}

/// Errors of the timestamp/time-range controller.
#[derive(Debug, Clone, Error)]
pub enum TimestampError {
    #[error("timestamp format isn't detected")]
    FormatNotDetected,

    #[error("invalid format regex {regex:?}: {reason}")]
    InvalidRegex { regex: String, reason: String },

    #[error("attempt to close a time range without an open point")]
    NoOpenPoint,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors raised while restoring exported session state.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("no importable controller registered as {0:?}")]
    UnknownController(String),

    #[error("hash mismatch for {controller:?}")]
    HashMismatch { controller: String },

    #[error("malformed data for {controller:?}: {source}")]
    Malformed {
        controller: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}
