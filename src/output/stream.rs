//! Windowed cache over the raw stream.
//!
//! The view declares a frame, the engine keeps a bounded contiguous window of rows around
//! it and fetches a wider range whenever the frame leaves the window. Fetches are debounced;
//! only the most recently scheduled fetch may merge into the window. A response that loses
//! that race only feeds the placeholder side buffer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::window::{
    PendingFetch, Window, fetch_window, parse_exact, rows_or_placeholders, within_frame,
};
use crate::config::OutputSettings;
use crate::error::{OutputError, TransportError};
use crate::events::{EventHub, StreamEvent, StreamState};
use crate::range::{Range, count_rank};
use crate::row::{ChunkKind, Row, parse_chunk};
use crate::row_api::RowApi;
use crate::transport::{Chunk, Ipc};

#[derive(Debug)]
struct StreamInner {
    window: Window,
    count: u64,
    count_rank: usize,
    frame: Option<Range>,
    /// Rows of the most recent fetch, used to fill placeholders
    last_requested: Vec<Row>,
    pending: Option<PendingFetch>,
    /// Generation of the windowed fetch waiting for the backend
    in_flight: Option<u64>,
    /// Start of the preload currently waiting for the backend
    preload_started: Option<Instant>,
}

impl Default for StreamInner {
    fn default() -> Self {
        Self {
            window: Window::new(),
            count: 0,
            count_rank: 1,
            frame: None,
            last_requested: Vec::new(),
            pending: None,
            in_flight: None,
            preload_started: None,
        }
    }
}

impl StreamInner {
    fn snapshot(&self) -> StreamState {
        StreamState {
            count: self.count,
            count_rank: self.count_rank,
            stored: self.window.stored(),
            frame: self.frame,
            fetch_pending: self.pending.is_some(),
            fetch_in_flight: self.in_flight.is_some(),
        }
    }

    /// Returns the new rank if it changed
    fn set_count(&mut self, count: u64) -> Option<usize> {
        self.count = count;
        let rank = count_rank(count);
        if rank == self.count_rank {
            return None;
        }
        self.count_rank = rank;
        Some(rank)
    }
}

struct Shared {
    session_id: Arc<str>,
    ipc: Ipc,
    settings: OutputSettings,
    row_api: Arc<RowApi>,
    events: EventHub<StreamEvent>,
    /// Bumped by every scheduled fetch and every reset
    generation: AtomicU64,
    /// Bumped by resets only
    epoch: AtomicU64,
    inner: Mutex<StreamInner>,
}

/// Stream output engine of one session
#[derive(Clone)]
pub struct StreamOutput {
    shared: Arc<Shared>,
}

impl StreamOutput {
    pub fn new(
        ipc: Ipc,
        settings: OutputSettings,
        row_api: Arc<RowApi>,
        event_capacity: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                session_id: Arc::clone(ipc.session()),
                ipc,
                settings,
                row_api,
                events: EventHub::new(event_capacity),
                generation: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                inner: Mutex::new(StreamInner::default()),
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, StreamInner> {
        self.shared.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> StreamState {
        self.inner().snapshot()
    }

    pub fn count(&self) -> u64 {
        self.inner().count
    }

    pub fn rank(&self) -> usize {
        self.inner().count_rank
    }

    pub fn frame(&self) -> Option<Range> {
        self.inner().frame
    }

    /// Declare the range the view wants to show.
    ///
    /// Schedules a debounced fetch when the frame is not stored. Does nothing while the
    /// stream is empty.
    pub fn set_frame(&self, frame: Range) -> Result<(), OutputError> {
        frame.validate()?;
        let settings = &self.shared.settings;
        let mut inner = self.inner();
        if inner.count == 0 {
            return Ok(());
        }
        inner.frame = Some(frame);
        if inner.window.covers(&frame) {
            if let Some(pending) = inner.pending.take() {
                pending.cancel();
            }
            return Ok(());
        }
        let Some(request) = fetch_window(
            frame,
            inner.count,
            settings.max_request_count,
            settings.max_stored_count,
        ) else {
            debug!(session = %self.shared.session_id, %frame, count = inner.count, "frame is beyond the stream");
            return Ok(());
        };

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        if let Some(pending) = inner.pending.take() {
            pending.cancel();
        }
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            engine.fetch_frame(generation, epoch, frame, request).await;
        });
        inner.pending = Some(PendingFetch { generation, handle });
        debug!(
            session = %self.shared.session_id,
            start = request.start,
            end = request.end,
            generation,
            "stream fetch scheduled"
        );
        Ok(())
    }

    async fn fetch_frame(self, generation: u64, epoch: u64, frame: Range, request: Range) {
        let delay = self.shared.settings.request_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        {
            let mut inner = self.inner();
            if inner.pending.as_ref().map(|p| p.generation) != Some(generation) {
                return;
            }
            // Fired: the request is no longer cancellable
            inner.pending = None;
            inner.in_flight = Some(generation);
        }
        let result = self.shared.ipc.stream_chunk(request).await;
        self.complete_frame(generation, epoch, frame, request, result);
    }

    fn complete_frame(
        &self,
        generation: u64,
        epoch: u64,
        frame: Range,
        request: Range,
        result: Result<Chunk, TransportError>,
    ) {
        let session = &self.shared.session_id;
        let chunk = match result {
            Ok(chunk) => chunk,
            Err(err) => {
                let mut inner = self.inner();
                if inner.in_flight == Some(generation) {
                    inner.in_flight = None;
                }
                warn!(session = %session, start = request.start, end = request.end, error = %err, "failed to fetch stream chunk");
                return;
            }
        };
        let rows = parse_chunk(&chunk.data, chunk.start, ChunkKind::Stream, session);

        let (rank, loaded, state) = {
            let mut inner = self.inner();
            if inner.in_flight == Some(generation) {
                inner.in_flight = None;
            }
            if self.shared.generation.load(Ordering::SeqCst) != generation {
                if self.shared.epoch.load(Ordering::SeqCst) == epoch {
                    inner.last_requested = within_frame(rows, frame);
                }
                debug!(session = %session, generation, "stale stream chunk, window untouched");
                return;
            }
            if chunk.rows == 0 {
                drop(inner);
                self.clear_stream();
                return;
            }
            let rank = inner.set_count(chunk.rows);
            let max_stored = self.shared.settings.max_stored_count as usize;
            let accepted = inner.window.accept(rows, max_stored);
            inner.last_requested = inner.window.slice(frame);
            debug!(session = %session, generation, ?accepted, stored = ?inner.window.stored(), "stream chunk accepted");
            let loaded = if inner.window.covers(&frame) {
                Some(inner.window.slice(frame))
            } else {
                warn!(session = %session, %frame, %request, "requested frame isn't in scope of stored data");
                None
            };
            (rank, loaded, inner.snapshot())
        };

        if let Some(rank) = rank {
            self.publish_rank(rank);
        }
        if let Some(rows) = loaded {
            self.shared
                .events
                .publish(StreamEvent::RangeLoaded { range: frame, rows });
        }
        self.shared.events.publish(StreamEvent::StateUpdated(state));
    }

    /// Synchronous read of `range`.
    ///
    /// Rows outside the stored window come back as placeholders. Records `range` as the
    /// current frame but never fetches.
    pub fn get_range(&self, range: Range) -> Result<Vec<Row>, OutputError> {
        range.validate()?;
        let (stored, rows) = {
            let inner = self.inner();
            if inner.count == 0 {
                drop(inner);
                self.shared
                    .events
                    .publish(StreamEvent::PositionChanged { start: 0, count: 0 });
                return Ok(Vec::new());
            }
            let rows = rows_or_placeholders(
                range,
                |position| inner.window.get(position).cloned(),
                &inner.last_requested,
                &self.shared.session_id,
            );
            (inner.window.stored(), rows)
        };
        {
            let mut inner = self.inner();
            let now = inner.window.stored();
            if now != stored {
                warn!(session = %self.shared.session_id, was = ?stored, now = ?now, "state changed while reading");
                return Err(OutputError::StateChanged { was: stored, now });
            }
            if rows.len() as u64 != range.len() {
                return Err(OutputError::CountMismatch {
                    expected: range.len(),
                    actual: rows.len() as u64,
                });
            }
            inner.frame = Some(range);
        }
        self.shared.events.publish(StreamEvent::PositionChanged {
            start: range.start,
            count: range.end - range.start,
        });
        Ok(rows)
    }

    /// Fully loaded rows of `range`, served from the window when stored
    pub async fn load_range(&self, range: Range) -> Result<Vec<Row>, OutputError> {
        range.validate()?;
        {
            let inner = self.inner();
            if inner.window.covers(&range) {
                return Ok(inner.window.slice(range));
            }
        }
        let chunk = self.shared.ipc.stream_chunk(range).await.map_err(|err| {
            warn!(session = %self.shared.session_id, %range, error = %err, "failed to load stream range");
            err
        })?;
        let rows = parse_exact(&chunk, ChunkKind::Stream, &self.shared.session_id)?;
        Ok(within_frame(rows, range))
    }

    /// Warm the window ahead of scrolling.
    ///
    /// Returns `None` while another preload is running inside the throttle interval or
    /// when a reset happened meanwhile, otherwise the range that is now stored.
    pub async fn preload(&self, range: Range) -> Result<Option<Range>, OutputError> {
        range.validate()?;
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        {
            let mut inner = self.inner();
            let now = Instant::now();
            if inner
                .preload_started
                .is_some_and(|started| now.duration_since(started) < self.shared.settings.preload_throttle())
            {
                return Ok(None);
            }
            if inner.count == 0 || inner.window.covers(&range) {
                inner.preload_started = None;
                return Ok(Some(range));
            }
            inner.preload_started = Some(now);
        }

        let result = self.shared.ipc.stream_chunk(range).await;
        let (rank, state, loaded) = {
            let mut inner = self.inner();
            inner.preload_started = None;
            let chunk = result.map_err(|err| {
                warn!(session = %self.shared.session_id, %range, error = %err, "failed to preload stream range");
                err
            })?;
            if self.shared.epoch.load(Ordering::SeqCst) != epoch {
                debug!(session = %self.shared.session_id, %range, "stream was reset during preload");
                return Ok(None);
            }
            if chunk.rows == 0 {
                drop(inner);
                self.clear_stream();
                return Ok(None);
            }
            let rows = parse_exact(&chunk, ChunkKind::Stream, &self.shared.session_id)?;
            let rank = inner.set_count(chunk.rows);
            inner
                .window
                .accept(rows, self.shared.settings.max_stored_count as usize);
            (rank, inner.snapshot(), Range::new(chunk.start, chunk.end))
        };
        if let Some(rank) = rank {
            self.publish_rank(rank);
        }
        self.shared.events.publish(StreamEvent::StateUpdated(state));
        Ok(Some(loaded))
    }

    /// Backend reported a new total row count
    pub fn update_stream_state(&self, count: u64) {
        if count == 0 {
            self.clear_stream();
            return;
        }
        let (rank, state) = {
            let mut inner = self.inner();
            (inner.set_count(count), inner.snapshot())
        };
        if let Some(rank) = rank {
            self.publish_rank(rank);
        }
        self.shared.events.publish(StreamEvent::StateUpdated(state));
    }

    /// Drop everything; in-flight responses are ignored once they arrive
    pub fn clear_stream(&self) {
        let rank_changed = {
            let mut inner = self.inner();
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            if let Some(pending) = inner.pending.take() {
                pending.cancel();
            }
            let rank_changed = inner.count_rank != 1;
            *inner = StreamInner::default();
            rank_changed
        };
        debug!(session = %self.shared.session_id, "stream cleared");
        self.shared.events.publish(StreamEvent::Reset);
        if rank_changed {
            self.publish_rank(1);
        }
    }

    pub fn scroll_to(&self, position: u64) {
        self.shared.events.publish(StreamEvent::ScrollTo(position));
    }

    /// Cached row at an absolute stream position
    pub fn row_by_position(&self, position: u64) -> Option<Row> {
        self.inner().window.find_by_source(position).cloned()
    }

    /// Stop a scheduled fetch that has not fired yet
    pub fn destroy(&self) {
        if let Some(pending) = self.inner().pending.take() {
            pending.cancel();
        }
    }

    fn publish_rank(&self, rank: usize) {
        self.shared.events.publish(StreamEvent::RankChanged(rank));
        self.shared.row_api.set_rank(rank);
    }
}
