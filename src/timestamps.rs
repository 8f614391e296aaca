//! Timestamp formats and user-defined time ranges.
//!
//! A range is built from two rows in one of two ways:
//! - interactively, by `open` (Idle -> Pending) then `close` (Pending -> Idle)
//! - in bulk, by `add_range` with every pair already known
//!
//! Timestamps are never parsed here. The controller finds the first known format whose regex
//! matches a row and asks the backend to extract the value from the matched text.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::colors::{ColorAllocator, color_holder};
use crate::error::{TimestampError, TransportError};
use crate::events::EventHub;
use crate::importer::Importable;
use crate::transport::{DateDefaults, FormatDescriptor, Ipc};

/// A row taking part in a time range
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedRow {
    pub position: u64,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// Text the format regex matched
    #[serde(default)]
    pub matched: Option<String>,
}

impl TimedRow {
    pub fn new(position: u64, content: impl Into<String>) -> Self {
        Self {
            position,
            content: content.into(),
            timestamp: None,
            matched: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub id: u64,
    #[serde(default)]
    pub alias: Option<String>,
    pub start: TimedRow,
    /// `None` while the range is open
    pub end: Option<TimedRow>,
    pub duration: u64,
    pub color: String,
    pub group: u64,
}

impl TimeRange {
    /// Earliest and latest timestamp of the range
    pub fn bounds(&self) -> (i64, i64) {
        let start = self.start.timestamp.unwrap_or(0);
        let end = self
            .end
            .as_ref()
            .and_then(|row| row.timestamp)
            .unwrap_or(start);
        (start.min(end), start.max(end))
    }

    /// Lowest and highest row position of the range
    pub fn positions(&self) -> (u64, u64) {
        let end = self.end.as_ref().map_or(self.start.position, |row| row.position);
        (self.start.position.min(end), self.start.position.max(end))
    }

    pub fn contains(&self, position: u64) -> bool {
        let (first, last) = self.positions();
        (first..=last).contains(&position)
    }
}

/// Optional identity of a range added in bulk
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeOptions {
    pub id: Option<u64>,
    pub alias: Option<String>,
    pub color: Option<String>,
    pub group: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddRange {
    pub from: TimedRow,
    pub to: TimedRow,
    pub options: RangeOptions,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RangeSelector {
    Id(u64),
    /// Every range carrying this alias
    Alias(String),
}

impl RangeSelector {
    fn matches(&self, range: &TimeRange) -> bool {
        match self {
            RangeSelector::Id(id) => range.id == *id,
            RangeSelector::Alias(alias) => range.alias.as_deref() == Some(alias.as_str()),
        }
    }
}

/// Role of a row relative to the ranges around it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangePosition {
    /// The row is the open point
    Open,
    Begin,
    Middle,
    End,
    /// End of a range where the next range of the same group begins
    EndNested,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartMode {
    #[default]
    Scaled,
    Aligned,
}

/// Aggregate over every range
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeState {
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub duration: u64,
}

/// Offsets cut from both sides of the timeline
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ZoomCursor {
    pub left: f64,
    pub right: f64,
}

#[derive(Clone, Debug)]
pub enum TimestampEvent {
    Updated(Vec<TimeRange>),
    Formats,
    Defaults(DateDefaults),
    Mode(ChartMode),
    Zoom(ZoomCursor),
    /// State worth saving changed
    Export,
}

/// A timestamp format and its compiled regex
#[derive(Clone, Debug)]
pub struct Format {
    pub format: String,
    pub regex: Regex,
    pub flags: Vec<String>,
}

impl Format {
    pub fn compile(descriptor: &FormatDescriptor) -> Result<Self, TimestampError> {
        Ok(Self {
            format: descriptor.format.clone(),
            regex: build_regex(&descriptor.regex, &descriptor.flags)?,
            flags: descriptor.flags.clone(),
        })
    }
}

/// Order two endpoints by timestamp, then by position on an exact tie
fn chronological(a: TimedRow, b: TimedRow) -> (TimedRow, TimedRow) {
    let key = |row: &TimedRow| (row.timestamp.unwrap_or(0), row.position);
    if key(&a) > key(&b) { (b, a) } else { (a, b) }
}

fn build_regex(pattern: &str, flags: &[String]) -> Result<Regex, TimestampError> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in flags.iter().flat_map(|f| f.chars()) {
        match flag {
            'i' => {
                builder.case_insensitive(true);
            }
            'm' => {
                builder.multi_line(true);
            }
            's' => {
                builder.dot_matches_new_line(true);
            }
            'g' | 'u' => {}
            other => debug!(flag = %other, "ignoring unknown regex flag"),
        }
    }
    builder.build().map_err(|e| TimestampError::InvalidRegex {
        regex: pattern.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Sequences {
    range: u64,
    group: u64,
}

#[derive(Serialize, Deserialize)]
struct ExportedFormat {
    format: String,
    regexp: String,
    #[serde(default)]
    flags: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct ExportedState {
    formats: Vec<ExportedFormat>,
    ranges: Vec<TimeRange>,
    #[serde(default)]
    mode: ChartMode,
    #[serde(default)]
    defaults: DateDefaults,
    #[serde(default)]
    sequences: Sequences,
}

#[derive(Default)]
struct TimestampInner {
    formats: Vec<Format>,
    ranges: Vec<TimeRange>,
    open: Option<TimedRow>,
    state: TimeState,
    cursor: ZoomCursor,
    sequences: Sequences,
    mode: ChartMode,
    defaults: DateDefaults,
    colors: ColorAllocator,
}

impl TimestampInner {
    fn range_at(&self, position: u64, except: Option<u64>) -> Option<&TimeRange> {
        self.ranges
            .iter()
            .find(|r| Some(r.id) != except && r.contains(position))
    }

    fn next_range_id(&mut self) -> u64 {
        self.sequences.range += 1;
        self.sequences.range
    }

    fn next_group(&mut self) -> u64 {
        self.sequences.group += 1;
        self.sequences.group
    }

    /// Recompute the aggregate and rescale the cursor; returns the follow-up events
    fn refresh(&mut self, export: bool) -> Vec<TimestampEvent> {
        let previous = self.state.duration;
        let min = self.ranges.iter().map(|r| r.bounds().0).min();
        let max = self.ranges.iter().map(|r| r.bounds().1).max();
        let duration = match (min, max) {
            (Some(min), Some(max)) => max.abs_diff(min),
            _ => 0,
        };
        self.state = TimeState { min, max, duration };

        if self.cursor != ZoomCursor::default() && previous != duration {
            if previous == 0 {
                self.cursor = ZoomCursor::default();
            } else {
                let scale = duration as f64 / previous as f64;
                self.cursor.left *= scale;
                self.cursor.right *= scale;
            }
        }
        let inverted = match (min, max) {
            (Some(min), Some(max)) => {
                (max as f64 - self.cursor.right) - (min as f64 + self.cursor.left) < 0.0
            }
            _ => true,
        };
        if inverted {
            self.cursor = ZoomCursor::default();
        }

        let mut events = Vec::new();
        if self.mode != ChartMode::Aligned {
            events.push(TimestampEvent::Zoom(self.cursor));
        }
        if export {
            events.push(TimestampEvent::Export);
        }
        events
    }
}

/// Owns the formats and time ranges of one session
pub struct TimestampController {
    session_id: Arc<str>,
    ipc: Ipc,
    events: EventHub<TimestampEvent>,
    inner: Mutex<TimestampInner>,
}

impl TimestampController {
    pub fn new(ipc: Ipc, event_capacity: usize) -> Self {
        Self {
            session_id: ipc.session().clone(),
            ipc,
            events: EventHub::new(event_capacity),
            inner: Mutex::new(TimestampInner::default()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, TimestampInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimestampEvent> {
        self.events.subscribe()
    }

    fn publish_all(&self, events: Vec<TimestampEvent>) {
        for event in events {
            self.events.publish(event);
        }
    }

    /// Publish the ranges, then whatever the refreshed aggregate implies
    fn commit(&self, mut inner: MutexGuard<'_, TimestampInner>, export: bool) {
        let mut events = vec![TimestampEvent::Updated(inner.ranges.clone())];
        events.extend(inner.refresh(export));
        drop(inner);
        self.publish_all(events);
    }

    // Formats

    pub fn formats(&self) -> Vec<Format> {
        self.inner().formats.clone()
    }

    pub fn is_detected(&self) -> bool {
        !self.inner().formats.is_empty()
    }

    /// Ask the backend for the format of this session. Known formats are kept unless `update`.
    pub async fn discover(&self, update: bool) -> Result<(), TimestampError> {
        if !update && self.is_detected() {
            return Ok(());
        }
        self.inner().formats.clear();
        let descriptor = match self.ipc.discover_format().await {
            Ok(descriptor) => descriptor,
            Err(TransportError::Rejected(message)) => {
                warn!(session = %self.session_id, %message, "timestamp format not detected");
                return Err(TimestampError::FormatNotDetected);
            }
            Err(err) => return Err(err.into()),
        };
        let format = Format::compile(&descriptor)?;
        info!(session = %self.session_id, format = %format.format, "timestamp format detected");
        self.inner().formats.push(format);
        self.events.publish(TimestampEvent::Formats);
        Ok(())
    }

    /// Regex the backend derives for `format`
    pub async fn validate(&self, format: &str) -> Result<Regex, TimestampError> {
        let descriptor = self.ipc.test_format(format).await?;
        build_regex(&descriptor.regex, &descriptor.flags)
    }

    /// Returns false if the format string is already known
    pub fn add_format(&self, format: Format) -> bool {
        {
            let mut inner = self.inner();
            if inner.formats.iter().any(|f| f.format == format.format) {
                return false;
            }
            inner.formats.push(format);
        }
        self.events.publish(TimestampEvent::Formats);
        true
    }

    pub fn remove_format(&self, format: &str) -> bool {
        let removed = {
            let mut inner = self.inner();
            let before = inner.formats.len();
            inner.formats.retain(|f| f.format != format);
            inner.formats.len() != before
        };
        if removed {
            self.events.publish(TimestampEvent::Formats);
        }
        removed
    }

    /// Text of `content` matched by the first format that matches
    pub fn get_match(&self, content: &str) -> Option<String> {
        self.inner()
            .formats
            .iter()
            .find_map(|f| f.regex.find(content))
            .map(|m| m.as_str().to_string())
    }

    fn locate(&self, content: &str) -> Option<(String, String, DateDefaults)> {
        let inner = self.inner();
        inner.formats.iter().find_map(|f| {
            f.regex
                .find(content)
                .map(|m| (m.as_str().to_string(), f.format.clone(), inner.defaults))
        })
    }

    pub async fn get_timestamp(&self, content: &str) -> Result<Option<i64>, TimestampError> {
        Ok(self.stamp(TimedRow::new(0, content)).await?.and_then(|r| r.timestamp))
    }

    /// `row` with its timestamp and match filled, or `None` if no format matches
    async fn stamp(&self, mut row: TimedRow) -> Result<Option<TimedRow>, TimestampError> {
        let Some((matched, format, defaults)) = self.locate(&row.content) else {
            return Ok(None);
        };
        let timestamp = self
            .ipc
            .extract_timestamp(&matched, &format, defaults)
            .await?;
        row.timestamp = Some(timestamp);
        row.matched = Some(matched);
        Ok(Some(row))
    }

    // Interactive ranges

    pub fn open_row(&self) -> Option<TimedRow> {
        self.inner().open.clone()
    }

    /// Start a range at `row`. `join` keeps the current group instead of starting a new one.
    /// Returns false if a range is already open or the row has no timestamp.
    pub async fn open(&self, row: TimedRow, join: bool) -> Result<bool, TimestampError> {
        if self.inner().open.is_some() {
            return Ok(false);
        }
        let position = row.position;
        let Some(row) = self.stamp(row).await? else {
            debug!(session = %self.session_id, position, "no timestamp, range not opened");
            return Ok(false);
        };
        let ranges = {
            let mut inner = self.inner();
            if inner.open.is_some() {
                return Ok(false);
            }
            if !join {
                inner.next_group();
            }
            inner.open = Some(row);
            inner.ranges.clone()
        };
        debug!(session = %self.session_id, position, "time range opened");
        self.events.publish(TimestampEvent::Updated(ranges));
        Ok(true)
    }

    /// Finish the open range at `row`. Returns `None` if `row` has no timestamp.
    pub async fn close(&self, row: TimedRow) -> Result<Option<TimeRange>, TimestampError> {
        if self.inner().open.is_none() {
            return Err(TimestampError::NoOpenPoint);
        }
        let Some(row) = self.stamp(row).await? else {
            return Ok(None);
        };
        let mut inner = self.inner();
        let Some(open) = inner.open.take() else {
            return Err(TimestampError::NoOpenPoint);
        };
        let opened_at = open.timestamp.unwrap_or(0);
        let closed_at = row.timestamp.unwrap_or(0);
        let (start, end) = chronological(open, row);
        let range = TimeRange {
            id: inner.next_range_id(),
            alias: None,
            duration: closed_at.abs_diff(opened_at),
            color: inner.colors.next_color(),
            group: inner.sequences.group,
            start,
            end: Some(end),
        };
        debug!(
            session = %self.session_id,
            id = range.id,
            duration = range.duration,
            "time range closed"
        );
        inner.ranges.push(range.clone());
        self.commit(inner, true);
        Ok(Some(range))
    }

    /// Forget the open point
    pub fn drop_open(&self) {
        let mut inner = self.inner();
        if inner.open.take().is_some() {
            self.commit(inner, false);
        }
    }

    /// Click on a row while a range is open: close it there and, unless `stop_chain`,
    /// open the next range of the same group at the same row.
    pub async fn handle_row_click(
        &self,
        content: &str,
        position: u64,
        stop_chain: bool,
    ) -> Result<bool, TimestampError> {
        if self.inner().open.is_none() {
            return Ok(false);
        }
        let row = TimedRow::new(position, content);
        if self.close(row.clone()).await?.is_some() && !stop_chain {
            self.open(row, true).await?;
        }
        Ok(true)
    }

    // Bulk ranges

    pub async fn add_range(&self, requests: Vec<AddRange>) -> Result<Vec<TimeRange>, TimestampError> {
        let mut resolved: HashMap<String, Option<(i64, String)>> = HashMap::new();
        for row in requests.iter().flat_map(|r| [&r.from, &r.to]) {
            if row.timestamp.is_some() || resolved.contains_key(&row.content) {
                continue;
            }
            let stamped = self.stamp(TimedRow::new(row.position, row.content.as_str())).await?;
            resolved.insert(
                row.content.clone(),
                stamped.and_then(|r| r.timestamp.zip(r.matched)),
            );
        }
        let fill = |mut row: TimedRow| -> Option<TimedRow> {
            if row.timestamp.is_none() {
                let (timestamp, matched) = resolved.get(&row.content).cloned().flatten()?;
                row.timestamp = Some(timestamp);
                row.matched = Some(matched);
            }
            Some(row)
        };

        let mut inner = self.inner();
        let mut added = Vec::new();
        for request in requests {
            let (Some(from), Some(to)) = (fill(request.from), fill(request.to)) else {
                debug!(session = %self.session_id, "skipping range without timestamps");
                continue;
            };
            let from_at = from.timestamp.unwrap_or(0);
            let to_at = to.timestamp.unwrap_or(0);
            let (start, end) = chronological(from, to);
            let options = request.options;
            let range = TimeRange {
                id: match options.id {
                    Some(id) => id,
                    None => inner.next_range_id(),
                },
                alias: options.alias,
                duration: to_at.abs_diff(from_at),
                color: match options.color {
                    Some(color) => color,
                    None => inner.colors.next_color(),
                },
                group: match options.group {
                    Some(group) => group,
                    None => inner.next_group(),
                },
                start,
                end: Some(end),
            };
            inner.ranges.push(range.clone());
            added.push(range);
        }
        if !added.is_empty() {
            self.commit(inner, true);
        }
        Ok(added)
    }

    pub fn remove_range(&self, selector: &RangeSelector) -> usize {
        let mut inner = self.inner();
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.ranges)
            .into_iter()
            .partition(|r| selector.matches(r));
        inner.ranges = kept;
        for range in &removed {
            inner.colors.release(&range.color);
        }
        if !removed.is_empty() {
            self.commit(inner, true);
        }
        removed.len()
    }

    /// Recolour ranges. An alias selection shades the colour per member of each group.
    pub fn set_range_color(&self, selector: &RangeSelector, color: &str) {
        let mut inner = self.inner();
        match selector {
            RangeSelector::Id(id) => {
                if let Some(range) = inner.ranges.iter_mut().find(|r| r.id == *id) {
                    range.color = color.to_string();
                }
            }
            RangeSelector::Alias(_) => {
                let shade = color_holder(color);
                let mut group = None;
                let mut index = 0;
                for range in inner.ranges.iter_mut().filter(|r| selector.matches(r)) {
                    if group != Some(range.group) {
                        group = Some(range.group);
                        index = 0;
                    }
                    range.color = shade(index);
                    index += 1;
                }
            }
        }
        self.commit(inner, true);
    }

    /// Remove every range except `exceptions` and forget the open point
    pub fn clear(&self, exceptions: &[u64]) {
        let mut inner = self.inner();
        let (kept, removed): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.ranges)
            .into_iter()
            .partition(|r| exceptions.contains(&r.id));
        inner.ranges = kept;
        for range in &removed {
            inner.colors.release(&range.color);
        }
        inner.open = None;
        self.commit(inner, true);
    }

    pub fn ranges(&self) -> Vec<TimeRange> {
        self.inner().ranges.clone()
    }

    pub fn next_group(&self) -> u64 {
        self.inner().next_group()
    }

    // Row decorations

    pub fn position_state(&self, position: u64) -> Option<RangePosition> {
        let inner = self.inner();
        if inner.open.as_ref().is_some_and(|r| r.position == position) {
            return Some(RangePosition::Open);
        }
        let range = inner.range_at(position, None)?;
        let end = range.end.as_ref()?;
        if range.start.position == position {
            return Some(RangePosition::Begin);
        }
        if end.position == position {
            let (_, last) = range.positions();
            let nested = inner
                .range_at(last, Some(range.id))
                .is_some_and(|next| next.group == range.group);
            return Some(if nested {
                RangePosition::EndNested
            } else {
                RangePosition::End
            });
        }
        Some(RangePosition::Middle)
    }

    pub fn range_color_for(&self, position: u64) -> Option<String> {
        self.inner().range_at(position, None).map(|r| r.color.clone())
    }

    pub fn range_id_for(&self, position: u64) -> Option<u64> {
        self.inner().range_at(position, None).map(|r| r.id)
    }

    // Chart settings

    pub fn state(&self) -> TimeState {
        self.inner().state
    }

    pub fn cursor(&self) -> ZoomCursor {
        self.inner().cursor
    }

    pub fn set_zoom_offsets(&self, left: f64, right: f64) {
        let cursor = ZoomCursor {
            left: left.max(0.0),
            right: right.max(0.0),
        };
        self.inner().cursor = cursor;
        self.events.publish(TimestampEvent::Zoom(cursor));
    }

    pub fn mode(&self) -> ChartMode {
        self.inner().mode
    }

    pub fn set_mode(&self, mode: ChartMode) {
        self.inner().mode = mode;
        self.events.publish(TimestampEvent::Mode(mode));
        self.events.publish(TimestampEvent::Export);
    }

    pub fn defaults(&self) -> DateDefaults {
        self.inner().defaults
    }

    pub fn set_defaults(&self, defaults: DateDefaults) {
        self.inner().defaults = defaults;
        self.events.publish(TimestampEvent::Defaults(defaults));
        self.events.publish(TimestampEvent::Export);
    }
}

impl Importable for TimestampController {
    fn importer_id(&self) -> &'static str {
        "timestamps_and_formats"
    }

    fn export(&self) -> Option<serde_json::Value> {
        let inner = self.inner();
        if inner.formats.is_empty() {
            return None;
        }
        let state = ExportedState {
            formats: inner
                .formats
                .iter()
                .map(|f| ExportedFormat {
                    format: f.format.clone(),
                    regexp: f.regex.as_str().to_string(),
                    flags: f.flags.clone(),
                })
                .collect(),
            ranges: inner.ranges.clone(),
            mode: inner.mode,
            defaults: inner.defaults,
            sequences: inner.sequences,
        };
        serde_json::to_value(state).ok()
    }

    fn import(&self, data: serde_json::Value) -> Result<(), serde_json::Error> {
        let state: ExportedState = serde_json::from_value(data)?;
        let formats = state
            .formats
            .into_iter()
            .filter_map(|f| {
                let descriptor = FormatDescriptor {
                    format: f.format,
                    regex: f.regexp,
                    flags: f.flags,
                };
                Format::compile(&descriptor)
                    .inspect_err(|err| warn!(error = %err, "dropping imported format"))
                    .ok()
            })
            .collect();
        let mut inner = self.inner();
        inner.colors.clear();
        for range in &state.ranges {
            inner.colors.reserve(&range.color);
        }
        inner.formats = formats;
        inner.ranges = state.ranges;
        inner.open = None;
        inner.mode = state.mode;
        inner.defaults = state.defaults;
        inner.sequences = state.sequences;
        let (mode, defaults) = (inner.mode, inner.defaults);
        self.commit(inner, false);
        self.publish_all(vec![
            TimestampEvent::Formats,
            TimestampEvent::Mode(mode),
            TimestampEvent::Defaults(defaults),
        ]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Request;
    use crate::transport::testing::MemoryTransport;

    fn controller() -> (Arc<MemoryTransport>, TimestampController) {
        let transport = Arc::new(MemoryTransport::with_lines(0));
        let ipc = Ipc::new(transport.clone(), Arc::from("s1"));
        (transport, TimestampController::new(ipc, 64))
    }

    async fn detected() -> (Arc<MemoryTransport>, TimestampController) {
        let (transport, controller) = controller();
        controller.discover(false).await.unwrap();
        (transport, controller)
    }

    fn extractions(transport: &MemoryTransport) -> usize {
        transport
            .requests()
            .iter()
            .filter(|r| matches!(r, Request::TimestampExtract { .. }))
            .count()
    }

    fn pair(from: (u64, &str), to: (u64, &str)) -> AddRange {
        AddRange {
            from: TimedRow::new(from.0, from.1),
            to: TimedRow::new(to.0, to.1),
            options: RangeOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_no_formats_means_no_timestamp() {
        let (transport, controller) = controller();
        assert_eq!(controller.get_timestamp("ts=5").await.unwrap(), None);
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_discover_and_extract() {
        let (_, controller) = detected().await;
        assert!(controller.is_detected());
        assert_eq!(controller.get_match("at ts=500 ok").as_deref(), Some("ts=500"));
        assert_eq!(controller.get_timestamp("at ts=500 ok").await.unwrap(), Some(500));
        assert_eq!(controller.get_timestamp("nothing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_discover_keeps_known_formats() {
        let (transport, controller) = detected().await;
        controller.discover(false).await.unwrap();
        assert_eq!(transport.request_count(), 1);
        controller.discover(true).await.unwrap();
        assert_eq!(transport.request_count(), 2);
        assert_eq!(controller.formats().len(), 1);
    }

    #[tokio::test]
    async fn test_discover_failure() {
        let (transport, controller) = controller();
        transport.fail_next("nothing looks like a date");
        let err = controller.discover(false).await.unwrap_err();
        assert!(matches!(err, TimestampError::FormatNotDetected));
        assert!(!controller.is_detected());
    }

    #[tokio::test]
    async fn test_validate() {
        let (_, controller) = controller();
        let regex = controller.validate("%s").await.unwrap();
        assert!(regex.is_match("ts=12"));
        let err = controller.validate("bad").await.unwrap_err();
        assert!(matches!(err, TimestampError::Transport(TransportError::Rejected(_))));
    }

    #[test]
    fn test_format_flags_and_duplicates() {
        let (_, controller) = controller();
        let format = Format::compile(&FormatDescriptor {
            format: "upper".to_string(),
            regex: "TS=\\d+".to_string(),
            flags: vec!["gi".to_string()],
        })
        .unwrap();
        assert!(format.regex.is_match("ts=1"));
        assert!(controller.add_format(format.clone()));
        assert!(!controller.add_format(format));
        assert!(controller.remove_format("upper"));
        assert!(!controller.remove_format("upper"));

        let err = Format::compile(&FormatDescriptor {
            format: "broken".to_string(),
            regex: "(".to_string(),
            flags: Vec::new(),
        })
        .unwrap_err();
        assert!(matches!(err, TimestampError::InvalidRegex { .. }));
    }

    #[tokio::test]
    async fn test_close_orders_by_timestamp() {
        let (_, controller) = detected().await;
        assert!(controller.open(TimedRow::new(10, "ts=500"), false).await.unwrap());
        assert_eq!(controller.position_state(10), Some(RangePosition::Open));

        let range = controller.close(TimedRow::new(20, "ts=200")).await.unwrap().unwrap();
        assert_eq!(range.start.timestamp, Some(200));
        assert_eq!(range.start.position, 20);
        assert_eq!(range.end.as_ref().unwrap().timestamp, Some(500));
        assert_eq!(range.duration, 300);
        assert!(controller.open_row().is_none());
        assert_eq!(
            controller.state(),
            TimeState {
                min: Some(200),
                max: Some(500),
                duration: 300
            }
        );
    }

    #[tokio::test]
    async fn test_close_tie_orders_by_position() {
        let (_, controller) = detected().await;
        controller.open(TimedRow::new(30, "ts=100"), false).await.unwrap();
        let range = controller.close(TimedRow::new(5, "ts=100")).await.unwrap().unwrap();
        assert_eq!(range.start.position, 5);
        assert_eq!(range.duration, 0);
    }

    #[tokio::test]
    async fn test_idle_and_pending_transitions() {
        let (_, controller) = detected().await;
        let err = controller.close(TimedRow::new(1, "ts=1")).await.unwrap_err();
        assert!(matches!(err, TimestampError::NoOpenPoint));

        assert!(!controller.open(TimedRow::new(1, "no time here"), false).await.unwrap());
        assert!(controller.open_row().is_none());

        assert!(controller.open(TimedRow::new(1, "ts=1"), false).await.unwrap());
        assert!(!controller.open(TimedRow::new(2, "ts=2"), false).await.unwrap());
        controller.drop_open();
        assert!(controller.open_row().is_none());
        assert!(controller.ranges().is_empty());
    }

    #[tokio::test]
    async fn test_row_click_chains_ranges() {
        let (_, controller) = detected().await;
        assert!(!controller.handle_row_click("ts=1", 1, false).await.unwrap());

        controller.open(TimedRow::new(1, "ts=100"), false).await.unwrap();
        assert!(controller.handle_row_click("ts=200", 2, false).await.unwrap());
        assert_eq!(controller.open_row().map(|r| r.position), Some(2));

        assert!(controller.handle_row_click("ts=300", 3, true).await.unwrap());
        assert!(controller.open_row().is_none());

        let ranges = controller.ranges();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].group, ranges[1].group);
        assert_ne!(ranges[0].color, ranges[1].color);
        assert_eq!(controller.position_state(2), Some(RangePosition::EndNested));
        assert_eq!(controller.position_state(3), Some(RangePosition::End));
    }

    #[tokio::test]
    async fn test_add_range_dedupes_lookups() {
        let (transport, controller) = detected().await;
        let added = controller
            .add_range(vec![
                pair((1, "ts=100"), (5, "ts=900")),
                pair((1, "ts=100"), (7, "ts=50")),
                pair((8, "no time"), (9, "ts=900")),
            ])
            .await
            .unwrap();
        assert_eq!(extractions(&transport), 3);
        assert_eq!(added.len(), 2);
        assert_eq!(added[0].end.as_ref().unwrap().timestamp, Some(900));
        assert_eq!(added[1].start.timestamp, Some(50));
        assert_eq!(added[1].duration, 50);
        assert_ne!(added[0].group, added[1].group);
    }

    #[tokio::test]
    async fn test_add_range_tie_orders_by_position() {
        let (_, controller) = detected().await;
        let added = controller
            .add_range(vec![pair((40, "ts=100 b"), (12, "ts=100 a"))])
            .await
            .unwrap();
        assert_eq!(added[0].start.position, 12);
        assert_eq!(added[0].end.as_ref().unwrap().position, 40);
        assert_eq!(added[0].duration, 0);
        assert_eq!(controller.position_state(12), Some(RangePosition::Begin));
    }

    #[tokio::test]
    async fn test_add_range_options_and_alias_removal() {
        let (_, controller) = detected().await;
        let options = RangeOptions {
            id: Some(77),
            alias: Some("search".to_string()),
            color: Some("#000000".to_string()),
            group: Some(4),
        };
        let mut first = pair((0, "ts=0"), (10, "ts=10"));
        first.options = options.clone();
        let mut second = pair((10, "ts=10"), (20, "ts=20"));
        second.options = RangeOptions {
            id: None,
            ..options
        };
        let added = controller.add_range(vec![first, second]).await.unwrap();
        assert_eq!(added[0].id, 77);
        assert_eq!(added[1].group, 4);

        assert_eq!(controller.position_state(0), Some(RangePosition::Begin));
        assert_eq!(controller.position_state(5), Some(RangePosition::Middle));
        assert_eq!(controller.position_state(10), Some(RangePosition::EndNested));
        assert_eq!(controller.position_state(25), None);
        assert_eq!(controller.range_id_for(5), Some(77));

        controller.set_range_color(&RangeSelector::Alias("search".to_string()), "#000000");
        assert_eq!(controller.range_color_for(5).as_deref(), Some("#000000"));
        assert_eq!(controller.range_color_for(15).as_deref(), Some("#1f1f1f"));

        assert_eq!(controller.remove_range(&RangeSelector::Alias("search".to_string())), 2);
        assert!(controller.ranges().is_empty());
        assert_eq!(controller.state(), TimeState::default());
    }

    #[tokio::test]
    async fn test_clear_keeps_exceptions() {
        let (_, controller) = detected().await;
        let added = controller
            .add_range(vec![pair((0, "ts=0"), (1, "ts=1")), pair((2, "ts=2"), (3, "ts=3"))])
            .await
            .unwrap();
        controller.open(TimedRow::new(9, "ts=9"), false).await.unwrap();
        controller.clear(&[added[1].id]);
        let ranges = controller.ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].id, added[1].id);
        assert!(controller.open_row().is_none());
    }

    #[tokio::test]
    async fn test_zoom_cursor_rescales_and_resets() {
        let (_, controller) = detected().await;
        controller
            .add_range(vec![pair((0, "ts=0"), (1, "ts=1000"))])
            .await
            .unwrap();
        controller.set_zoom_offsets(-5.0, 10.0);
        assert_eq!(controller.cursor(), ZoomCursor { left: 0.0, right: 10.0 });

        controller.set_zoom_offsets(100.0, 200.0);
        controller
            .add_range(vec![pair((2, "ts=1000"), (3, "ts=2000"))])
            .await
            .unwrap();
        assert_eq!(controller.cursor(), ZoomCursor { left: 200.0, right: 400.0 });

        controller.clear(&[]);
        assert_eq!(controller.cursor(), ZoomCursor::default());
    }

    #[tokio::test]
    async fn test_aligned_mode_suppresses_zoom() {
        let (_, controller) = detected().await;
        controller.set_mode(ChartMode::Aligned);
        let mut events = controller.subscribe();
        controller
            .add_range(vec![pair((0, "ts=0"), (1, "ts=10"))])
            .await
            .unwrap();
        assert!(matches!(events.try_recv(), Ok(TimestampEvent::Updated(r)) if r.len() == 1));
        assert!(matches!(events.try_recv(), Ok(TimestampEvent::Export)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_export_import() {
        let (_, controller) = controller();
        assert!(controller.export().is_none());

        controller.discover(false).await.unwrap();
        controller
            .add_range(vec![pair((0, "ts=0"), (4, "ts=40"))])
            .await
            .unwrap();
        controller.set_defaults(DateDefaults {
            year: Some(2024),
            month: None,
            day: None,
        });
        let data = controller.export().unwrap();

        let (_, restored) = self::controller();
        restored.import(data).unwrap();
        assert_eq!(restored.ranges(), controller.ranges());
        assert_eq!(restored.formats()[0].format, "ts");
        assert_eq!(restored.defaults().year, Some(2024));
        assert_eq!(restored.state().duration, 40);
        assert_eq!(restored.next_group(), controller.next_group());
    }
}
