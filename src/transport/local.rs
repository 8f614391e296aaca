//! In-process backend over lines held in memory.
//!
//! Lines come from a file (read once or followed with `tail -F`) or are pushed directly.
//! Rows are served tagged the same way a remote backend tags them, so the engines cannot
//! tell the difference.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    Chunk, DateDefaults, FormatDescriptor, Notification, NotificationSource, Request, Response,
    Transport,
};
use crate::config::DEFAULT_CHANNEL_BUFFER;
use crate::error::TransportError;
use crate::filter::SearchFilter;
use crate::row::tag_row;

/// Formats tried by discovery, most specific first
const KNOWN_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%d/%b/%Y:%H:%M:%S",
    "%b %d %H:%M:%S",
    "%m-%d %H:%M:%S%.f",
    "%H:%M:%S%.f",
    "%Y-%m-%d",
];

/// Lines inspected by discovery
const DISCOVERY_SAMPLE: usize = 200;

const YEAR_SPECIFIERS: &[&str] = &["%Y", "%y", "%C", "%G", "%F", "%D", "%c", "%+", "%s"];
const MONTH_SPECIFIERS: &[&str] = &["%m", "%b", "%B", "%h", "%F", "%D", "%c", "%+", "%s", "%j"];
const DAY_SPECIFIERS: &[&str] = &["%d", "%e", "%F", "%D", "%c", "%+", "%s", "%j"];

#[derive(Default)]
struct LocalState {
    lines: Vec<String>,
    filter: Option<SearchFilter>,
    /// Stream positions matching `filter`
    hits: Vec<u64>,
}

/// A backend serving a single session from memory
pub struct LocalBackend {
    session: Arc<str>,
    source_id: u32,
    state: Mutex<LocalState>,
    subscribers: Mutex<Vec<mpsc::Sender<Notification>>>,
}

impl LocalBackend {
    pub fn new(session: impl Into<Arc<str>>) -> Self {
        Self {
            session: session.into(),
            source_id: 1,
            state: Mutex::new(LocalState::default()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn session(&self) -> &Arc<str> {
        &self.session
    }

    fn state(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn line_count(&self) -> u64 {
        self.state().lines.len() as u64
    }

    pub fn hit_count(&self) -> u64 {
        self.state().hits.len() as u64
    }

    pub fn push_line(&self, line: impl Into<String>) {
        self.append(vec![line.into()]);
    }

    /// Read a whole file and append its lines
    pub async fn load(&self, path: &Path) -> Result<u64, TransportError> {
        let text = tokio::fs::read_to_string(path).await?;
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        let count = lines.len() as u64;
        info!(path = %path.display(), lines = count, "file loaded");
        self.append(lines);
        Ok(count)
    }

    /// Append every line of `path`, then keep appending as it grows
    pub fn follow(self: &Arc<Self>, path: PathBuf) -> JoinHandle<Result<(), TransportError>> {
        let backend = Arc::clone(self);
        tokio::spawn(async move {
            let mut child = Command::new("tail")
                .arg("-n")
                .arg("+1")
                .arg("-F")
                .arg(&path)
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()?;

            if let Some(stdout) = child.stdout.take() {
                let mut lines = BufReader::new(stdout).lines();
                while let Some(line) = lines.next_line().await? {
                    backend.push_line(line);
                }
            }

            let status = child.wait().await?;
            if !status.success() {
                return Err(TransportError::Io(format!("tail exited with status: {status}")));
            }
            Ok::<(), TransportError>(())
        })
    }

    /// Search the stream. An empty pattern drops the search. Returns the hit count.
    ///
    /// Pushes the new hit count, then a result map replacing the previous one.
    pub fn set_search(&self, pattern: &str, is_regex: bool) -> u64 {
        let (hits, map) = {
            let mut state = self.state();
            if pattern.is_empty() {
                state.filter = None;
                state.hits.clear();
            } else {
                let filter = SearchFilter::new(pattern, is_regex);
                if !filter.is_valid() {
                    warn!(pattern, "invalid regex, searching as plain text");
                }
                state.hits = filter.hits(&state.lines);
                state.filter = Some(filter);
            }
            (state.hits.len() as u64, result_map(&state.hits, pattern))
        };
        debug!(session = %self.session, pattern, hits, "search updated");
        self.notify(Notification::SearchUpdated {
            session: self.session.to_string(),
            rows: hits,
        });
        self.notify(Notification::SearchResultMap {
            session: self.session.to_string(),
            map,
            append: false,
        });
        hits
    }

    pub fn clear_search(&self) {
        self.set_search("", false);
    }

    fn append(&self, lines: Vec<String>) {
        if lines.is_empty() {
            return;
        }
        let (rows, found) = {
            let mut state = self.state();
            let offset = state.lines.len() as u64;
            let found = match &state.filter {
                Some(filter) => {
                    let new_hits: Vec<u64> = lines
                        .iter()
                        .enumerate()
                        .filter(|(_, line)| filter.matches(line))
                        .map(|(i, _)| offset + i as u64)
                        .collect();
                    let map = result_map(&new_hits, &filter.pattern);
                    (!new_hits.is_empty()).then(|| (new_hits, map))
                }
                None => None,
            };
            let found = found.map(|(new_hits, map)| {
                state.hits.extend(new_hits);
                (state.hits.len() as u64, map)
            });
            state.lines.extend(lines);
            (state.lines.len() as u64, found)
        };
        self.notify(Notification::StreamUpdated {
            session: self.session.to_string(),
            rows,
        });
        if let Some((hits, map)) = found {
            self.notify(Notification::SearchUpdated {
                session: self.session.to_string(),
                rows: hits,
            });
            self.notify(Notification::SearchResultMap {
                session: self.session.to_string(),
                map,
                append: true,
            });
        }
    }

    fn notify(&self, notification: Notification) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| match tx.try_send(notification.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("notification channel full, dropping update");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    fn stream_chunk(&self, start: u64, end: u64) -> Chunk {
        let state = self.state();
        slice_chunk(state.lines.len() as u64, start, end, |i| {
            state
                .lines
                .get(i as usize)
                .map(|line| tag_row(line, i, self.source_id))
        })
    }

    fn search_chunk(&self, start: u64, end: u64) -> Chunk {
        let state = self.state();
        slice_chunk(state.hits.len() as u64, start, end, |i| {
            let position = *state.hits.get(i as usize)?;
            state
                .lines
                .get(position as usize)
                .map(|line| tag_row(line, position, self.source_id))
        })
    }

    fn discover(&self) -> Option<FormatDescriptor> {
        let state = self.state();
        let sample = &state.lines[..state.lines.len().min(DISCOVERY_SAMPLE)];
        KNOWN_FORMATS.iter().find_map(|format| {
            let pattern = strftime_regex(format).ok()?;
            let regex = Regex::new(&pattern).ok()?;
            let parses = |line: &String| {
                regex.find(line).is_some_and(|m| {
                    extract_timestamp(m.as_str(), format, DateDefaults::default()).is_ok()
                })
            };
            sample.iter().any(parses).then(|| FormatDescriptor {
                format: format.to_string(),
                regex: pattern,
                flags: Vec::new(),
            })
        })
    }
}

/// Every hit position mapped to the one pattern that found it
fn result_map(hits: &[u64], pattern: &str) -> BTreeMap<u64, Vec<String>> {
    hits.iter()
        .map(|position| (*position, vec![pattern.to_string()]))
        .collect()
}

fn slice_chunk(total: u64, start: u64, end: u64, line: impl Fn(u64) -> Option<String>) -> Chunk {
    if start >= total {
        return Chunk {
            data: String::new(),
            start,
            end: start,
            rows: total,
        };
    }
    let end = end.min(total - 1);
    let data = (start..=end).filter_map(line).collect::<Vec<_>>().join("\n");
    Chunk {
        data,
        start,
        end,
        rows: total,
    }
}

/// Translate a strftime format into a regex finding it in a line
pub fn strftime_regex(format: &str) -> Result<String, String> {
    let mut regex = String::new();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            regex.push_str(&regex::escape(c.encode_utf8(&mut [0; 4])));
            continue;
        }
        let mut directive = String::new();
        while let Some(next) = chars.next() {
            directive.push(next);
            if next.is_ascii_alphabetic() || next == '%' {
                break;
            }
        }
        let piece = match directive.as_str() {
            "Y" => r"\d{4}",
            "C" | "y" | "m" | "d" | "H" | "I" | "M" | "S" => r"\d{2}",
            "e" => r"[ \d]\d",
            "j" => r"\d{3}",
            "f" => r"\d+",
            ".f" => r"\.\d+",
            ".3f" => r"\.\d{3}",
            ".6f" => r"\.\d{6}",
            ".9f" => r"\.\d{9}",
            "3f" => r"\d{3}",
            "6f" => r"\d{6}",
            "9f" => r"\d{9}",
            "a" | "b" | "h" => "[A-Za-z]{3}",
            "A" | "B" => "[A-Za-z]+",
            "p" => "[AaPp][Mm]",
            "z" => r"[+-]\d{2}:?\d{2}",
            "T" => r"\d{2}:\d{2}:\d{2}",
            "R" => r"\d{2}:\d{2}",
            "F" => r"\d{4}-\d{2}-\d{2}",
            "D" => r"\d{2}/\d{2}/\d{2}",
            "s" => r"\d+",
            "%" => "%",
            other => return Err(format!("unsupported format specifier %{other}")),
        };
        regex.push_str(piece);
    }
    Ok(regex)
}

/// Milliseconds since the epoch (UTC) of `text` written in `format`.
///
/// Missing year, month or day come from `defaults`, then from 1970-01-01.
pub fn extract_timestamp(text: &str, format: &str, defaults: DateDefaults) -> Result<i64, String> {
    let has = |specifiers: &[&str]| specifiers.iter().any(|s| format.contains(s));
    let mut full_format = String::new();
    let mut full_text = String::new();
    if !has(YEAR_SPECIFIERS) {
        full_format.push_str("%Y ");
        full_text.push_str(&format!("{:04} ", defaults.year.unwrap_or(1970)));
    }
    if !has(MONTH_SPECIFIERS) {
        full_format.push_str("%m ");
        full_text.push_str(&format!("{:02} ", defaults.month.unwrap_or(1)));
    }
    if !has(DAY_SPECIFIERS) {
        full_format.push_str("%d ");
        full_text.push_str(&format!("{:02} ", defaults.day.unwrap_or(1)));
    }
    full_format.push_str(format);
    full_text.push_str(text);

    NaiveDateTime::parse_from_str(&full_text, &full_format)
        .or_else(|_| {
            NaiveDate::parse_from_str(&full_text, &full_format)
                .map(|date| date.and_time(NaiveTime::MIN))
        })
        .map(|datetime| datetime.and_utc().timestamp_millis())
        .map_err(|e| format!("cannot parse {text:?} as {format:?}: {e}"))
}

#[async_trait::async_trait]
impl Transport for LocalBackend {
    async fn request(&self, request: Request) -> Result<Response, TransportError> {
        if request.session() != &*self.session {
            return Ok(Response::Error {
                message: format!("unknown session {:?}", request.session()),
            });
        }
        let response = match request {
            Request::StreamChunk { start, end, .. } => {
                Response::StreamChunk(self.stream_chunk(start, end))
            }
            Request::SearchChunk { start, end, .. } => {
                Response::SearchChunk(self.search_chunk(start, end))
            }
            Request::TimestampDiscover { .. } => match self.discover() {
                Some(descriptor) => Response::TimestampFormat(descriptor),
                None => Response::Error {
                    message: "timestamp format isn't detected".to_string(),
                },
            },
            Request::TimestampTest { format, .. } => match strftime_regex(&format) {
                Ok(regex) => Response::TimestampFormat(FormatDescriptor {
                    format,
                    regex,
                    flags: Vec::new(),
                }),
                Err(message) => Response::Error { message },
            },
            Request::TimestampExtract {
                text,
                format,
                defaults,
                ..
            } => match extract_timestamp(&text, &format, defaults) {
                Ok(timestamp) => Response::Timestamp { timestamp },
                Err(message) => Response::Error { message },
            },
        };
        Ok(response)
    }
}

#[async_trait::async_trait]
impl NotificationSource for LocalBackend {
    async fn notifications(&self) -> mpsc::Receiver<Notification> {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_BUFFER);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }
}
