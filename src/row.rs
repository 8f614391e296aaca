//! Rows of output and parsing of raw backend chunks.
//!
//! The backend tags each line with two embedded markers delimited by
//! non-printable characters:
//! - `\u{2}<digits>\u{2}` absolute position of the line in the stream
//! - `\u{3}<digits>\u{3}` identifier of the source the line came from
//!
//! Both are stripped from the content shown to the user.

use std::sync::{Arc, LazyLock};

use regex::Regex;

pub const ROW_NUMBER_SENTINEL: char = '\u{0002}';
pub const SOURCE_ID_SENTINEL: char = '\u{0003}';

static ROW_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("\u{0002}(\\d*)\u{0002}").expect("static regex"));
static SOURCE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("\u{0003}(\\d*)\u{0003}").expect("static regex"));

/// One line of output
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row {
    /// Row text, `None` while the row is not loaded yet
    pub content: Option<String>,
    /// Absolute position in the stream this row derives from
    pub position_in_source: u64,
    /// Position within the rendered collection; `None` marks a spliced bookmark
    pub position_in_view: Option<u64>,
    /// Origin log source, if known
    pub source_id: Option<u32>,
    pub session_id: Arc<str>,
}

impl Row {
    /// A not-yet-loaded row at `position`
    pub fn placeholder(position: u64, session_id: Arc<str>) -> Self {
        Self {
            content: None,
            position_in_source: position,
            position_in_view: Some(position),
            source_id: None,
            session_id,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.content.is_some()
    }

    /// True for a bookmark spliced into a search view
    pub fn is_bookmark(&self) -> bool {
        self.position_in_view.is_none()
    }
}

/// How chunk lines map to positions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkKind {
    /// Raw stream: the view position is the stream position
    Stream,
    /// Search results: lines carry the stream position in their tag, untagged lines are dropped
    Search,
}

/// Extract the embedded stream position of a tagged line
pub fn extract_row_position(line: &str) -> Option<u64> {
    extract_tag(&ROW_NUMBER_RE, line)
}

/// Extract the embedded source id of a tagged line
pub fn extract_source_id(line: &str) -> Option<u32> {
    extract_tag(&SOURCE_ID_RE, line)
}

fn extract_tag<T: std::str::FromStr>(re: &Regex, line: &str) -> Option<T> {
    let mut matches = re.captures_iter(line);
    let first = matches.next()?;
    // More than one tag of the same kind means the line is not trustworthy
    if matches.next().is_some() {
        return None;
    }
    first.get(1)?.as_str().trim().parse().ok()
}

/// Remove position and source tags from a line
pub fn clear_row_str(line: &str) -> String {
    let without_rows = ROW_NUMBER_RE.replace_all(line, "");
    SOURCE_ID_RE.replace_all(&without_rows, "").into_owned()
}

/// Tag a line the way the backend does
pub fn tag_row(line: &str, position: u64, source_id: u32) -> String {
    format!(
        "{line}{ROW_NUMBER_SENTINEL}{position}{ROW_NUMBER_SENTINEL}{SOURCE_ID_SENTINEL}{source_id}{SOURCE_ID_SENTINEL}"
    )
}

/// Parse a newline-delimited chunk whose first line sits at view position `start`
pub fn parse_chunk(data: &str, start: u64, kind: ChunkKind, session_id: &Arc<str>) -> Vec<Row> {
    if data.is_empty() {
        return Vec::new();
    }
    data.split('\n')
        .enumerate()
        .filter_map(|(i, line)| {
            let position = start + i as u64;
            let tagged = extract_row_position(line);
            let position_in_source = match (kind, tagged) {
                (_, Some(tagged)) => tagged,
                (ChunkKind::Stream, None) => position,
                (ChunkKind::Search, None) => return None,
            };
            Some(Row {
                content: Some(clear_row_str(line)),
                position_in_source,
                position_in_view: Some(position),
                source_id: extract_source_id(line),
                session_id: Arc::clone(session_id),
            })
        })
        .collect()
}
