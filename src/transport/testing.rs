//! In-memory transport for unit tests.
//!
//! Serves tagged chunks from generated lines, records every request and can hold
//! responses until a test releases them, which makes response ordering deterministic.

use std::sync::Mutex;

use tokio::sync::{Notify, oneshot};

use super::{Chunk, FormatDescriptor, Request, Response, Transport};
use crate::error::TransportError;
use crate::row::tag_row;

pub(crate) struct MemoryTransport {
    lines: Mutex<Vec<String>>,
    hits: Mutex<Vec<u64>>,
    requests: Mutex<Vec<Request>>,
    arrived: Notify,
    gated: Mutex<bool>,
    gates: Mutex<Vec<Option<oneshot::Sender<()>>>>,
    fail_next: Mutex<Option<String>>,
}

impl MemoryTransport {
    pub(crate) fn with_lines(count: u64) -> Self {
        let lines = (0..count).map(|i| format!("line {i}")).collect();
        Self::from_lines(lines)
    }

    pub(crate) fn from_lines(lines: Vec<String>) -> Self {
        Self {
            lines: Mutex::new(lines),
            hits: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            arrived: Notify::new(),
            gated: Mutex::new(false),
            gates: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
        }
    }

    /// Stream positions matched by the search
    pub(crate) fn set_hits(&self, hits: Vec<u64>) {
        *self.hits.lock().unwrap() = hits;
    }

    /// Hold every following response until `release` is called for it
    pub(crate) fn gate(&self) {
        *self.gated.lock().unwrap() = true;
    }

    /// Let the `index`-th held request (in arrival order) answer
    pub(crate) fn release(&self, index: usize) {
        let sender = self
            .gates
            .lock()
            .unwrap()
            .get_mut(index)
            .and_then(Option::take);
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    pub(crate) fn fail_next(&self, message: &str) {
        *self.fail_next.lock().unwrap() = Some(message.to_string());
    }

    pub(crate) fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Wait until at least `count` requests arrived
    pub(crate) async fn wait_for_requests(&self, count: usize) {
        loop {
            if self.request_count() >= count {
                return;
            }
            self.arrived.notified().await;
        }
    }

    fn answer(&self, request: &Request) -> Response {
        match request {
            Request::StreamChunk { start, end, .. } => {
                let lines = self.lines.lock().unwrap();
                let total = lines.len() as u64;
                let end = (*end).min(total.saturating_sub(1));
                let data = (*start..=end)
                    .filter_map(|i| lines.get(i as usize).map(|l| tag_row(l, i, 1)))
                    .collect::<Vec<_>>()
                    .join("\n");
                Response::StreamChunk(Chunk {
                    data,
                    start: *start,
                    end,
                    rows: total,
                })
            }
            Request::SearchChunk { start, end, .. } => {
                let lines = self.lines.lock().unwrap();
                let hits = self.hits.lock().unwrap();
                let total = hits.len() as u64;
                let end = (*end).min(total.saturating_sub(1));
                let data = (*start..=end)
                    .filter_map(|i| hits.get(i as usize))
                    .map(|&pos| {
                        let line = lines.get(pos as usize).cloned().unwrap_or_default();
                        tag_row(&line, pos, 1)
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                Response::SearchChunk(Chunk {
                    data,
                    start: *start,
                    end,
                    rows: total,
                })
            }
            Request::TimestampDiscover { .. } => Response::TimestampFormat(FormatDescriptor {
                format: "ts".to_string(),
                regex: r"ts=\d+".to_string(),
                flags: Vec::new(),
            }),
            Request::TimestampTest { format, .. } => {
                if format == "bad" {
                    Response::Error {
                        message: "unsupported format".to_string(),
                    }
                } else {
                    Response::TimestampFormat(FormatDescriptor {
                        format: format.clone(),
                        regex: r"ts=\d+".to_string(),
                        flags: Vec::new(),
                    })
                }
            }
            Request::TimestampExtract { text, .. } => {
                match text.strip_prefix("ts=").and_then(|v| v.parse().ok()) {
                    Some(timestamp) => Response::Timestamp { timestamp },
                    None => Response::Error {
                        message: format!("no timestamp in {text:?}"),
                    },
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn request(&self, request: Request) -> Result<Response, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let gate = if *self.gated.lock().unwrap() {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().unwrap().push(Some(tx));
            Some(rx)
        } else {
            None
        };
        self.arrived.notify_one();
        if let Some(rx) = gate {
            rx.await.map_err(|_| TransportError::Closed)?;
        }
        if let Some(message) = self.fail_next.lock().unwrap().take() {
            return Ok(Response::Error { message });
        }
        Ok(self.answer(&request))
    }
}
