//! Windowed cache over search results with bookmarks spliced in.
//!
//! The window holds search hits only. Every mutation re-derives the spliced view, in which
//! bookmarked rows sit between the hits surrounding their stream position with
//! `position_in_view == None`. The view count is `original_count + bookmarks_count`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::window::{
    PendingFetch, Window, fetch_window, parse_exact, rows_or_placeholders, within_frame,
};
use crate::bookmarks::{Bookmark, BookmarkStore};
use crate::config::OutputSettings;
use crate::error::{OutputError, TransportError};
use crate::events::{EventHub, SearchEvent, SearchState};
use crate::range::Range;
use crate::row::{ChunkKind, Row, parse_chunk};
use crate::transport::{Chunk, Ipc};

#[derive(Debug, Default)]
struct SearchInner {
    window: Window,
    /// Window rows with bookmarks interleaved
    spliced: Vec<Row>,
    original_count: u64,
    bookmarks_count: u64,
    frame: Option<Range>,
    last_requested: Vec<Row>,
    pending: Option<PendingFetch>,
    in_flight: Option<u64>,
    preload_started: Option<Instant>,
}

impl SearchInner {
    fn count(&self) -> u64 {
        self.original_count + self.bookmarks_count
    }

    fn snapshot(&self) -> SearchState {
        SearchState {
            original_count: self.original_count,
            bookmarks_count: self.bookmarks_count,
            count: self.count(),
            stored: self.window.stored(),
            frame: self.frame,
            fetch_pending: self.pending.is_some(),
            fetch_in_flight: self.in_flight.is_some(),
        }
    }

    fn resplice(&mut self, bookmarks: &[Bookmark], session_id: &Arc<str>) {
        let (spliced, inserted) = splice_bookmarks(
            self.window.rows(),
            bookmarks,
            self.original_count,
            session_id,
        );
        self.spliced = spliced;
        self.bookmarks_count = inserted;
    }

    /// Rows at view positions of `range`, indexing the spliced view from the first stored hit
    fn view_rows(&self, range: Range, session_id: &Arc<str>) -> Vec<Row> {
        let offset = self.window.stored().map_or(0, |stored| stored.start);
        rows_or_placeholders(
            range,
            |position| {
                position
                    .checked_sub(offset)
                    .and_then(|index| self.spliced.get(index as usize))
                    .cloned()
            },
            &self.last_requested,
            session_id,
        )
    }

    /// `range` with its end pulled inside the hits, `None` if nothing is left
    fn clamp(&self, range: Range) -> Option<Range> {
        let last = self.original_count.checked_sub(1)?;
        let clamped = Range::new(range.start, range.end.min(last));
        (clamped.start <= clamped.end).then_some(clamped)
    }
}

fn bookmark_row(bookmark: &Bookmark, session_id: &Arc<str>) -> Row {
    Row {
        content: Some(bookmark.content.clone()),
        position_in_source: bookmark.position,
        position_in_view: None,
        source_id: bookmark.source_id,
        session_id: Arc::clone(session_id),
    }
}

/// Interleave `bookmarks` (sorted by position) into a run of search hits.
///
/// Bookmarks go between two neighbouring hits whose stream positions enclose them. Bookmarks
/// before the first hit are only spliced when the run starts at hit 0, bookmarks after the
/// last hit only when the run ends at the last hit. A bookmark on a hit's own position is not
/// repeated. An empty run shows every bookmark. Returns the view and the number spliced.
fn splice_bookmarks(
    rows: &[Row],
    bookmarks: &[Bookmark],
    original_count: u64,
    session_id: &Arc<str>,
) -> (Vec<Row>, u64) {
    if bookmarks.is_empty() {
        return (rows.to_vec(), 0);
    }
    let mut spliced = Vec::with_capacity(rows.len() + bookmarks.len());
    let mut inserted = 0u64;
    let mut between = |target: &mut Vec<Row>, after: Option<u64>, before: Option<u64>| {
        let from = after.map_or(0, |after| bookmarks.partition_point(|b| b.position <= after));
        let to = before.map_or(bookmarks.len(), |before| {
            bookmarks.partition_point(|b| b.position < before)
        });
        if from < to {
            target.extend(bookmarks[from..to].iter().map(|b| bookmark_row(b, session_id)));
            inserted += (to - from) as u64;
        }
    };

    if rows.is_empty() {
        between(&mut spliced, None, None);
        return (spliced, inserted);
    }
    let last_hit = original_count.checked_sub(1);
    for (i, row) in rows.iter().enumerate() {
        let source = row.position_in_source;
        if i == 0 && row.position_in_view == Some(0) {
            between(&mut spliced, None, Some(source));
        }
        spliced.push(row.clone());
        match rows.get(i + 1) {
            Some(next) => between(&mut spliced, Some(source), Some(next.position_in_source)),
            None if row.position_in_view.is_some() && row.position_in_view == last_hit => {
                between(&mut spliced, Some(source), None)
            }
            None => {}
        }
    }
    (spliced, inserted)
}

struct Shared {
    session_id: Arc<str>,
    ipc: Ipc,
    settings: OutputSettings,
    bookmarks: Arc<BookmarkStore>,
    events: EventHub<SearchEvent>,
    generation: AtomicU64,
    epoch: AtomicU64,
    inner: Mutex<SearchInner>,
}

/// Search output engine of one session
#[derive(Clone)]
pub struct SearchOutput {
    shared: Arc<Shared>,
}

impl SearchOutput {
    pub fn new(
        ipc: Ipc,
        settings: OutputSettings,
        bookmarks: Arc<BookmarkStore>,
        event_capacity: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                session_id: Arc::clone(ipc.session()),
                ipc,
                settings,
                bookmarks,
                events: EventHub::new(event_capacity),
                generation: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                inner: Mutex::new(SearchInner::default()),
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, SearchInner> {
        self.shared.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SearchEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> SearchState {
        self.inner().snapshot()
    }

    pub fn count(&self) -> u64 {
        self.inner().count()
    }

    pub fn frame(&self) -> Option<Range> {
        self.inner().frame
    }

    pub fn set_frame(&self, frame: Range) -> Result<(), OutputError> {
        frame.validate()?;
        let settings = &self.shared.settings;
        let mut inner = self.inner();
        if inner.original_count == 0 {
            return Ok(());
        }
        let Some(frame) = inner.clamp(frame) else {
            return Ok(());
        };
        inner.frame = Some(frame);
        if inner.window.covers(&frame) {
            if let Some(pending) = inner.pending.take() {
                pending.cancel();
            }
            return Ok(());
        }
        let Some(request) = fetch_window(
            frame,
            inner.original_count,
            settings.max_request_count,
            settings.max_stored_count,
        ) else {
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
            "search fetch scheduled"
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
            inner.pending = None;
            inner.in_flight = Some(generation);
        }
        let result = self.shared.ipc.search_chunk(request).await;
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
        let bookmarks = self.shared.bookmarks.sorted();
        let mut inner = self.inner();
        if inner.in_flight == Some(generation) {
            inner.in_flight = None;
        }
        let chunk = match result {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(session = %session, start = request.start, end = request.end, error = %err, "failed to fetch search chunk");
                return;
            }
        };
        if self.shared.generation.load(Ordering::SeqCst) != generation {
            if self.shared.epoch.load(Ordering::SeqCst) == epoch {
                let rows = parse_chunk(&chunk.data, chunk.start, ChunkKind::Search, session);
                inner.last_requested = within_frame(rows, frame);
            }
            debug!(session = %session, generation, "stale search chunk, window untouched");
            return;
        }
        if chunk.rows == 0 {
            drop(inner);
            debug!(session = %session, "search was dropped while fetching");
            self.update_stream_state(0);
            return;
        }
        let rows = match parse_exact(&chunk, ChunkKind::Search, session) {
            Ok(rows) => rows,
            Err(err) => {
                warn!(session = %session, %request, error = %err, "search chunk doesn't match its range, update abandoned");
                return;
            }
        };
        inner.original_count = chunk.rows;
        let accepted = inner
            .window
            .accept(rows, self.shared.settings.max_stored_count as usize);
        inner.resplice(&bookmarks, session);
        inner.last_requested = inner.window.slice(frame);
        debug!(session = %session, generation, ?accepted, stored = ?inner.window.stored(), "search chunk accepted");
        let loaded = if inner.window.covers(&frame) {
            Some(inner.view_rows(frame, session))
        } else {
            warn!(session = %session, %frame, %request, "requested frame isn't in scope of stored data");
            None
        };
        let state = inner.snapshot();
        drop(inner);

        if let Some(rows) = loaded {
            self.shared
                .events
                .publish(SearchEvent::RangeLoaded { range: frame, rows });
        }
        self.shared.events.publish(SearchEvent::StateUpdated {
            state,
            bookmark_injection: false,
        });
    }

    /// Synchronous read of view positions `range`, bookmarks included
    pub fn get_range(&self, range: Range) -> Result<Vec<Row>, OutputError> {
        range.validate()?;
        let session = &self.shared.session_id;
        let (stored, rows) = {
            let inner = self.inner();
            if inner.count() == 0 {
                return Ok(Vec::new());
            }
            (inner.window.stored(), inner.view_rows(range, session))
        };
        let mut inner = self.inner();
        let now = inner.window.stored();
        if now != stored {
            warn!(session = %session, was = ?stored, now = ?now, "state changed while reading");
            return Err(OutputError::StateChanged { was: stored, now });
        }
        if rows.len() as u64 != range.len() {
            return Err(OutputError::CountMismatch {
                expected: range.len(),
                actual: rows.len() as u64,
            });
        }
        if let Some(frame) = inner.clamp(range) {
            inner.frame = Some(frame);
        }
        Ok(rows)
    }

    /// Fetch search hits `range` from the backend, bypassing the window
    pub async fn load_range(&self, range: Range) -> Result<Vec<Row>, OutputError> {
        range.validate()?;
        let chunk = self.shared.ipc.search_chunk(range).await.map_err(|err| {
            warn!(session = %self.shared.session_id, %range, error = %err, "failed to load search range");
            err
        })?;
        let rows = parse_exact(&chunk, ChunkKind::Search, &self.shared.session_id)?;
        Ok(within_frame(rows, range))
    }

    pub async fn preload(&self, range: Range) -> Result<Option<Range>, OutputError> {
        range.validate()?;
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        let range = {
            let mut inner = self.inner();
            let now = Instant::now();
            if inner.preload_started.is_some_and(|started| {
                now.duration_since(started) < self.shared.settings.preload_throttle()
            }) {
                return Ok(None);
            }
            let range = match inner.clamp(range) {
                Some(range) if !inner.window.covers(&range) => range,
                _ => {
                    inner.preload_started = None;
                    return Ok(Some(range));
                }
            };
            inner.preload_started = Some(now);
            range
        };

        let result = self.shared.ipc.search_chunk(range).await;
        let bookmarks = self.shared.bookmarks.sorted();
        let (state, loaded) = {
            let mut inner = self.inner();
            inner.preload_started = None;
            let chunk = result.map_err(|err| {
                warn!(session = %self.shared.session_id, %range, error = %err, "failed to preload search range");
                err
            })?;
            if self.shared.epoch.load(Ordering::SeqCst) != epoch {
                return Ok(None);
            }
            if chunk.rows == 0 {
                drop(inner);
                self.update_stream_state(0);
                return Ok(None);
            }
            let rows = parse_exact(&chunk, ChunkKind::Search, &self.shared.session_id)?;
            inner.original_count = chunk.rows;
            inner
                .window
                .accept(rows, self.shared.settings.max_stored_count as usize);
            inner.resplice(&bookmarks, &self.shared.session_id);
            (inner.snapshot(), Range::new(chunk.start, chunk.end))
        };
        self.shared.events.publish(SearchEvent::StateUpdated {
            state,
            bookmark_injection: false,
        });
        Ok(Some(loaded))
    }

    /// Backend reported a new number of search hits.
    ///
    /// A count of zero clears the cache but keeps bookmarks visible.
    pub fn update_stream_state(&self, original_count: u64) {
        if original_count == 0 {
            self.clear_stream();
        }
        let bookmarks = self.shared.bookmarks.sorted();
        let state = {
            let mut inner = self.inner();
            inner.original_count = original_count;
            inner.resplice(&bookmarks, &self.shared.session_id);
            inner.snapshot()
        };
        self.shared.events.publish(SearchEvent::StateUpdated {
            state,
            bookmark_injection: false,
        });
    }

    pub fn clear_stream(&self) {
        {
            let mut inner = self.inner();
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            if let Some(pending) = inner.pending.take() {
                pending.cancel();
            }
            *inner = SearchInner::default();
        }
        debug!(session = %self.shared.session_id, "search output cleared");
        self.shared.events.publish(SearchEvent::Reset);
    }

    /// Re-splice after the bookmark set changed. `added` is true for an addition.
    pub fn on_bookmarks_changed(&self, added: bool) {
        let bookmarks = self.shared.bookmarks.sorted();
        let (changed, state) = {
            let mut inner = self.inner();
            let before = inner.count();
            inner.resplice(&bookmarks, &self.shared.session_id);
            (inner.count() != before, inner.snapshot())
        };
        if state.count == 0 && changed {
            self.clear_stream();
        } else if changed {
            self.shared.events.publish(SearchEvent::StateUpdated {
                state,
                bookmark_injection: true,
            });
        }
        if added {
            self.shared.events.publish(SearchEvent::BookmarksChanged);
        }
    }

    /// First and last rows of a "select all search results" action.
    ///
    /// Spans from the first to the last hit, widened by bookmarks lying outside. Without
    /// hits the span runs from the first to the last bookmark.
    pub async fn select_all_bounds(&self) -> Result<Option<(Row, Row)>, OutputError> {
        let bookmarks = self.shared.bookmarks.sorted();
        let session = &self.shared.session_id;
        let count = self.inner().original_count;
        if count == 0 {
            return Ok(bookmarks
                .first()
                .zip(bookmarks.last())
                .map(|(first, last)| (bookmark_row(first, session), bookmark_row(last, session))));
        }
        let (first_hit, last_hit) = tokio::try_join!(
            self.load_range(Range::new(0, 0)),
            self.load_range(Range::new(count - 1, count - 1))
        )?;
        let (Some(mut begin), Some(mut end)) =
            (first_hit.into_iter().next(), last_hit.into_iter().next())
        else {
            warn!(session = %session, "first or last search hit wasn't found");
            return Ok(None);
        };
        if let (Some(first), Some(last)) = (bookmarks.first(), bookmarks.last()) {
            if first.position < begin.position_in_source {
                begin = bookmark_row(first, session);
            }
            if last.position > end.position_in_source {
                end = bookmark_row(last, session);
            }
        }
        Ok(Some((begin, end)))
    }

    pub fn scroll_to(&self, position: u64) {
        self.shared.events.publish(SearchEvent::ScrollTo(position));
    }

    /// Cached row (hit or spliced bookmark) at an absolute stream position
    pub fn row_by_position(&self, position: u64) -> Option<Row> {
        self.inner()
            .spliced
            .iter()
            .find(|row| row.position_in_source == position)
            .cloned()
    }

    pub fn destroy(&self) {
        if let Some(pending) = self.inner().pending.take() {
            pending.cancel();
        }
    }
}
