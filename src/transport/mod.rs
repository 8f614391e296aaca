//! Request/response channel to the backend that owns the stream.
//!
//! Provides:
//! - `Request` / `Response`: closed tagged unions for every payload the engines exchange
//! - `Transport`: the async seam a concrete channel implements
//! - `NotificationSource`: unsolicited pushes (row counts changed, search hit maps)
//! - `Ipc`: a typed client bound to one session
//! - `local::LocalBackend`: an in-process backend over a file

pub mod local;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TransportError;
use crate::range::Range;

/// Parts of a date substituted when a timestamp format lacks them
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateDefaults {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
}

/// Requests understood by the backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    StreamChunk {
        session: String,
        start: u64,
        end: u64,
    },
    SearchChunk {
        session: String,
        start: u64,
        end: u64,
    },
    TimestampDiscover {
        session: String,
    },
    TimestampTest {
        session: String,
        format: String,
    },
    TimestampExtract {
        session: String,
        text: String,
        format: String,
        defaults: DateDefaults,
    },
}

impl Request {
    pub fn session(&self) -> &str {
        match self {
            Request::StreamChunk { session, .. }
            | Request::SearchChunk { session, .. }
            | Request::TimestampDiscover { session }
            | Request::TimestampTest { session, .. }
            | Request::TimestampExtract { session, .. } => session,
        }
    }
}

/// A block of newline-delimited, tagged rows
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub data: String,
    /// First view position in `data`
    pub start: u64,
    /// Last view position in `data`
    pub end: u64,
    /// Authoritative total count of the collection
    pub rows: u64,
}

/// A timestamp format and the regex that finds it in a row
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub format: String,
    pub regex: String,
    #[serde(default)]
    pub flags: Vec<String>,
}

/// Responses sent by the backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    StreamChunk(Chunk),
    SearchChunk(Chunk),
    TimestampFormat(FormatDescriptor),
    Timestamp { timestamp: i64 },
    Error { message: String },
}

impl Response {
    fn kind(&self) -> &'static str {
        match self {
            Response::StreamChunk(_) => "stream_chunk",
            Response::SearchChunk(_) => "search_chunk",
            Response::TimestampFormat(_) => "timestamp_format",
            Response::Timestamp { .. } => "timestamp",
            Response::Error { .. } => "error",
        }
    }
}

/// Unsolicited backend pushes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    StreamUpdated { session: String, rows: u64 },
    SearchUpdated { session: String, rows: u64 },
    /// Stream positions of search hits with the filters each one matched
    SearchResultMap {
        session: String,
        map: BTreeMap<u64, Vec<String>>,
        /// Add to the previous map instead of replacing it
        append: bool,
    },
}

impl Notification {
    pub fn session(&self) -> &str {
        match self {
            Notification::StreamUpdated { session, .. }
            | Notification::SearchUpdated { session, .. }
            | Notification::SearchResultMap { session, .. } => session,
        }
    }
}

/// Trait for request/response channels
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, request: Request) -> Result<Response, TransportError>;
}

/// Trait for backends that push notifications
#[async_trait::async_trait]
pub trait NotificationSource: Send + Sync {
    /// Start receiving notifications
    async fn notifications(&self) -> mpsc::Receiver<Notification>;
}

/// Typed request helpers bound to one session
#[derive(Clone)]
pub struct Ipc {
    transport: Arc<dyn Transport>,
    session: Arc<str>,
}

impl Ipc {
    pub fn new(transport: Arc<dyn Transport>, session: Arc<str>) -> Self {
        Self { transport, session }
    }

    pub fn session(&self) -> &Arc<str> {
        &self.session
    }

    pub async fn stream_chunk(&self, range: Range) -> Result<Chunk, TransportError> {
        let started = Instant::now();
        let response = self
            .transport
            .request(Request::StreamChunk {
                session: self.session.to_string(),
                start: range.start,
                end: range.end,
            })
            .await?;
        match response {
            Response::StreamChunk(chunk) => {
                debug!(
                    session = %self.session,
                    start = range.start,
                    end = range.end,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "stream chunk read"
                );
                Ok(chunk)
            }
            other => Err(unexpected("stream_chunk", other)),
        }
    }

    pub async fn search_chunk(&self, range: Range) -> Result<Chunk, TransportError> {
        let started = Instant::now();
        let response = self
            .transport
            .request(Request::SearchChunk {
                session: self.session.to_string(),
                start: range.start,
                end: range.end,
            })
            .await?;
        match response {
            Response::SearchChunk(chunk) => {
                debug!(
                    session = %self.session,
                    start = range.start,
                    end = range.end,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "search chunk read"
                );
                Ok(chunk)
            }
            other => Err(unexpected("search_chunk", other)),
        }
    }

    pub async fn discover_format(&self) -> Result<FormatDescriptor, TransportError> {
        let response = self
            .transport
            .request(Request::TimestampDiscover {
                session: self.session.to_string(),
            })
            .await?;
        match response {
            Response::TimestampFormat(format) => Ok(format),
            other => Err(unexpected("timestamp_format", other)),
        }
    }

    pub async fn test_format(&self, format: &str) -> Result<FormatDescriptor, TransportError> {
        let response = self
            .transport
            .request(Request::TimestampTest {
                session: self.session.to_string(),
                format: format.to_string(),
            })
            .await?;
        match response {
            Response::TimestampFormat(format) => Ok(format),
            other => Err(unexpected("timestamp_format", other)),
        }
    }

    pub async fn extract_timestamp(
        &self,
        text: &str,
        format: &str,
        defaults: DateDefaults,
    ) -> Result<i64, TransportError> {
        let response = self
            .transport
            .request(Request::TimestampExtract {
                session: self.session.to_string(),
                text: text.to_string(),
                format: format.to_string(),
                defaults,
            })
            .await?;
        match response {
            Response::Timestamp { timestamp } => Ok(timestamp),
            other => Err(unexpected("timestamp", other)),
        }
    }
}

fn unexpected(expected: &'static str, got: Response) -> TransportError {
    match got {
        Response::Error { message } => TransportError::Rejected(message),
        other => TransportError::UnexpectedResponse {
            expected,
            got: other.kind(),
        },
    }
}
