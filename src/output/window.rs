//! Contiguous in-memory window over a remote collection.
//!
//! The window never represents a range with a hole: packets that do not touch the
//! stored range replace it instead of being stitched across a gap.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::error::OutputError;
use crate::range::Range;
use crate::row::{ChunkKind, Row, parse_chunk};
use crate::transport::Chunk;

/// Outcome of merging a packet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Accepted {
    /// Cache was empty
    Adopted,
    /// Packet started right after the stored end
    Appended,
    /// Packet did not touch the stored range, old rows were dropped
    Replaced,
    Prepended,
    Extended,
    /// Packet held nothing new
    Ignored,
}

#[derive(Debug, Default)]
pub(crate) struct Window {
    rows: Vec<Row>,
    stored: Option<Range>,
}

fn view_position(row: &Row) -> u64 {
    row.position_in_view.unwrap_or(row.position_in_source)
}

impl Window {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn stored(&self) -> Option<Range> {
        self.stored
    }

    pub(crate) fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.rows.clear();
        self.stored = None;
    }

    pub(crate) fn covers(&self, range: &Range) -> bool {
        self.stored.is_some_and(|stored| stored.covers(range))
    }

    /// Row at a view position, if stored
    pub(crate) fn get(&self, position: u64) -> Option<&Row> {
        let stored = self.stored?;
        if !stored.contains(position) {
            return None;
        }
        self.rows.get((position - stored.start) as usize)
    }

    /// Stored rows within `range`
    pub(crate) fn slice(&self, range: Range) -> Vec<Row> {
        let Some(stored) = self.stored else {
            return Vec::new();
        };
        let from = range.start.max(stored.start);
        let to = range.end.min(stored.end);
        if from > to {
            return Vec::new();
        }
        let offset = stored.start;
        self.rows[(from - offset) as usize..=(to - offset) as usize].to_vec()
    }

    pub(crate) fn find_by_source(&self, position: u64) -> Option<&Row> {
        self.rows
            .iter()
            .find(|row| row.position_in_source == position)
    }

    /// Merge contiguous `packets` into the window, keeping at most `max_stored` rows.
    ///
    /// `stored` is recomputed from the rows actually retained.
    pub(crate) fn accept(&mut self, packets: Vec<Row>, max_stored: usize) -> Accepted {
        let max_stored = max_stored.max(1);
        let (Some(first), Some(last)) = (packets.first(), packets.last()) else {
            return Accepted::Ignored;
        };
        let packet = Range::new(view_position(first), view_position(last));

        let accepted = match self.stored {
            None => {
                self.rows = packets;
                self.rows.truncate(max_stored);
                Accepted::Adopted
            }
            Some(stored) if packet.start == stored.end + 1 => {
                self.rows.extend(packets);
                self.crop_front(max_stored);
                Accepted::Appended
            }
            Some(stored) if packet.start > stored.end || packet.end < stored.start => {
                self.rows = packets;
                self.rows.truncate(max_stored);
                Accepted::Replaced
            }
            Some(stored) if packet.start < stored.start => {
                let take = (stored.start - packet.start) as usize;
                let mut merged: Vec<Row> = packets.into_iter().take(take).collect();
                merged.append(&mut self.rows);
                self.rows = merged;
                self.rows.truncate(max_stored);
                Accepted::Prepended
            }
            Some(stored) if packet.end > stored.end => {
                let take = (packet.end - stored.end) as usize;
                let skip = packets.len().saturating_sub(take);
                self.rows.extend(packets.into_iter().skip(skip));
                self.crop_front(max_stored);
                Accepted::Extended
            }
            Some(_) => Accepted::Ignored,
        };

        self.stored = match (self.rows.first(), self.rows.last()) {
            (Some(first), Some(last)) => Some(Range::new(view_position(first), view_position(last))),
            _ => None,
        };
        accepted
    }

    fn crop_front(&mut self, max_stored: usize) {
        if self.rows.len() > max_stored {
            let excess = self.rows.len() - max_stored;
            self.rows.drain(..excess);
        }
    }
}

/// Range to request so that one fetch covers `frame` plus slack on both sides.
///
/// The start backs off half the request budget from `frame.start`, the end runs half the
/// budget past `frame.end`; near an edge the bound snaps to that edge. The result is then
/// capped to the smaller of the request and retention budgets, sliding forward when the cap
/// would cut into `frame`. A frame longer than the budget is requested as is.
pub(crate) fn fetch_window(
    frame: Range,
    count: u64,
    max_request_count: u64,
    max_stored_count: u64,
) -> Option<Range> {
    if count == 0 || frame.start > frame.end {
        return None;
    }
    let last = count - 1;
    if frame.start > last {
        return None;
    }
    let frame = Range::new(frame.start, frame.end.min(last));
    let half = max_request_count / 2;
    let to_start = frame.start;
    let to_end = count - frame.end;
    let start = if to_start > half { to_start - half } else { 0 };
    let end = if to_end > half { frame.end + half } else { last };
    let budget = max_request_count.min(max_stored_count).max(1);
    if frame.len() >= budget {
        return Some(frame);
    }
    let capped = end.min(start + budget - 1);
    if capped >= frame.end {
        return Some(Range::new(start, capped));
    }
    let start = start.max(frame.end + 1 - budget);
    Some(Range::new(start, frame.end))
}

/// Rows for `range`: stored rows where available, placeholders elsewhere.
///
/// Placeholders borrow content from `side` (rows of the most recent fetch) when it holds
/// the same view position.
pub(crate) fn rows_or_placeholders(
    range: Range,
    lookup: impl Fn(u64) -> Option<Row>,
    side: &[Row],
    session_id: &Arc<str>,
) -> Vec<Row> {
    range
        .positions()
        .map(|position| {
            lookup(position).unwrap_or_else(|| placeholder(position, side, session_id))
        })
        .collect()
}

pub(crate) fn placeholder(position: u64, side: &[Row], session_id: &Arc<str>) -> Row {
    let found = side
        .binary_search_by_key(&position, view_position)
        .ok()
        .and_then(|index| side.get(index));
    match found {
        Some(row) => Row {
            content: row.content.clone(),
            position_in_source: row.position_in_source,
            position_in_view: Some(position),
            source_id: row.source_id,
            session_id: Arc::clone(session_id),
        },
        None => Row::placeholder(position, Arc::clone(session_id)),
    }
}

/// A debounced fetch that has not issued its request yet
#[derive(Debug)]
pub(crate) struct PendingFetch {
    pub(crate) generation: u64,
    pub(crate) handle: JoinHandle<()>,
}

impl PendingFetch {
    pub(crate) fn cancel(self) {
        self.handle.abort();
    }
}

/// Rows of `rows` whose view position lies inside `frame`
pub(crate) fn within_frame(rows: Vec<Row>, frame: Range) -> Vec<Row> {
    rows.into_iter()
        .filter(|row| frame.contains(view_position(row)))
        .collect()
}

/// Parse a chunk and insist that every position it claims to hold produced a row
pub(crate) fn parse_exact(
    chunk: &Chunk,
    kind: ChunkKind,
    session_id: &Arc<str>,
) -> Result<Vec<Row>, OutputError> {
    if chunk.data.is_empty() {
        return Ok(Vec::new());
    }
    let rows = parse_chunk(&chunk.data, chunk.start, kind, session_id);
    let expected = Range::new(chunk.start, chunk.end).len();
    if rows.len() as u64 != expected {
        return Err(OutputError::CountMismatch {
            expected,
            actual: rows.len() as u64,
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rows(start: u64, end: u64) -> Vec<Row> {
        let session: Arc<str> = Arc::from("s");
        (start..=end)
            .map(|p| Row {
                content: Some(format!("row {p}")),
                position_in_source: p,
                position_in_view: Some(p),
                source_id: Some(1),
                session_id: Arc::clone(&session),
            })
            .collect()
    }

    fn assert_contiguous(window: &Window) {
        let positions: Vec<u64> = window.rows().iter().map(view_position).collect();
        for pair in positions.windows(2) {
            assert_eq!(pair[1], pair[0] + 1, "gap or duplicate in {positions:?}");
        }
        match window.stored() {
            None => assert!(positions.is_empty()),
            Some(stored) => {
                assert_eq!(stored.start, positions[0]);
                assert_eq!(stored.end, *positions.last().unwrap());
            }
        }
    }

    #[test]
    fn test_adopt_into_empty() {
        let mut window = Window::new();
        assert_eq!(window.accept(rows(10, 19), 100), Accepted::Adopted);
        assert_eq!(window.stored(), Some(Range::new(10, 19)));
    }

    #[test]
    fn test_exact_append_crops_front() {
        let mut window = Window::new();
        window.accept(rows(0, 9), 15);
        assert_eq!(window.accept(rows(10, 19), 15), Accepted::Appended);
        assert_eq!(window.stored(), Some(Range::new(5, 19)));
        assert_contiguous(&window);
    }

    #[test]
    fn test_disjoint_jump_discards_old_rows() {
        let mut window = Window::new();
        window.accept(rows(0, 9), 100);
        assert_eq!(window.accept(rows(500, 509), 100), Accepted::Replaced);
        assert_eq!(window.stored(), Some(Range::new(500, 509)));
        assert_eq!(window.accept(rows(100, 104), 100), Accepted::Replaced);
        assert_eq!(window.stored(), Some(Range::new(100, 104)));
    }

    #[test]
    fn test_backward_extension_crops_back() {
        let mut window = Window::new();
        window.accept(rows(50, 59), 15);
        assert_eq!(window.accept(rows(40, 55), 15), Accepted::Prepended);
        assert_eq!(window.stored(), Some(Range::new(40, 54)));
        assert_contiguous(&window);
    }

    #[test]
    fn test_forward_extension_splices_suffix() {
        let mut window = Window::new();
        window.accept(rows(50, 59), 100);
        assert_eq!(window.accept(rows(55, 70), 100), Accepted::Extended);
        assert_eq!(window.stored(), Some(Range::new(50, 70)));
        assert_eq!(window.get(60).unwrap().content.as_deref(), Some("row 60"));
        assert_contiguous(&window);
    }

    #[test]
    fn test_inner_packet_is_ignored() {
        let mut window = Window::new();
        window.accept(rows(0, 99), 100);
        assert_eq!(window.accept(rows(10, 20), 100), Accepted::Ignored);
        assert_eq!(window.stored(), Some(Range::new(0, 99)));
    }

    #[test]
    fn test_adopt_respects_bound() {
        let mut window = Window::new();
        window.accept(rows(0, 2010), 2000);
        assert_eq!(window.stored(), Some(Range::new(0, 1999)));
    }

    #[test]
    fn test_slice_and_get() {
        let mut window = Window::new();
        window.accept(rows(100, 199), 1000);
        let slice = window.slice(Range::new(90, 105));
        assert_eq!(slice.len(), 6);
        assert_eq!(slice[0].position_in_view, Some(100));
        assert!(window.get(99).is_none());
        assert!(window.get(200).is_none());
        assert_eq!(window.find_by_source(150).unwrap().position_in_view, Some(150));
    }

    #[test]
    fn test_fetch_window_centered() {
        let window = fetch_window(Range::new(5000, 5010), 10_000, 2000, 2000).unwrap();
        assert_eq!(window, Range::new(4000, 5999));
        assert!(window.covers(&Range::new(5000, 5010)));
    }

    #[test]
    fn test_fetch_window_near_edges() {
        assert_eq!(
            fetch_window(Range::new(0, 30), 10_000, 2000, 2000),
            Some(Range::new(0, 1030))
        );
        assert_eq!(
            fetch_window(Range::new(9_990, 9_999), 10_000, 2000, 2000),
            Some(Range::new(8_990, 9_999))
        );
        assert_eq!(
            fetch_window(Range::new(10, 20), 50, 2000, 2000),
            Some(Range::new(0, 49))
        );
    }

    #[test]
    fn test_fetch_window_covers_frame_longer_than_half_budget() {
        let window = fetch_window(Range::new(500, 560), 10_000, 100, 2000).unwrap();
        assert_eq!(window, Range::new(461, 560));
        assert!(window.covers(&Range::new(500, 560)));

        let window = fetch_window(Range::new(5000, 6200), 10_000, 2000, 2000).unwrap();
        assert_eq!(window, Range::new(4201, 6200));
    }

    #[test]
    fn test_fetch_window_frame_over_budget_is_requested_as_is() {
        assert_eq!(
            fetch_window(Range::new(100, 400), 1000, 100, 2000),
            Some(Range::new(100, 400))
        );
        assert_eq!(
            fetch_window(Range::new(900, 1200), 1000, 100, 2000),
            Some(Range::new(900, 999))
        );
    }

    #[test]
    fn test_fetch_window_empty_or_out_of_bounds() {
        assert_eq!(fetch_window(Range::new(0, 10), 0, 2000, 2000), None);
        assert_eq!(fetch_window(Range::new(20_000, 20_010), 100, 2000, 2000), None);
    }

    #[test]
    fn test_placeholders_borrow_side_buffer() {
        let session: Arc<str> = Arc::from("s");
        let side = rows(10, 12);
        let result = rows_or_placeholders(Range::new(9, 13), |_| None, &side, &session);
        assert_eq!(result.len(), 5);
        assert_eq!(result[0].content, None);
        assert_eq!(result[1].content.as_deref(), Some("row 10"));
        assert_eq!(result[3].content.as_deref(), Some("row 12"));
        assert_eq!(result[4].content, None);
        assert_eq!(result[4].position_in_view, Some(13));
    }

    #[test]
    fn test_parse_exact_detects_dropped_rows() {
        let session: Arc<str> = Arc::from("s");
        let chunk = Chunk {
            data: format!("{}\nuntagged", crate::row::tag_row("a", 3, 1)),
            start: 0,
            end: 1,
            rows: 2,
        };
        assert!(parse_exact(&chunk, ChunkKind::Stream, &session).is_ok());
        assert!(matches!(
            parse_exact(&chunk, ChunkKind::Search, &session),
            Err(OutputError::CountMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_within_frame() {
        let kept = within_frame(rows(0, 20), Range::new(5, 7));
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].position_in_view, Some(5));
    }

    proptest! {
        #[test]
        fn fetch_window_always_covers_frame(
            count in 1u64..20_000,
            start in 0u64..20_000,
            len in 1u64..3000,
            max_request in 1u64..3000,
            max_stored in 1u64..3000,
        ) {
            prop_assume!(start < count);
            let frame = Range::new(start, (start + len - 1).min(count - 1));
            let window = fetch_window(frame, count, max_request, max_stored).unwrap();
            prop_assert!(window.covers(&frame), "{window} misses {frame}");
            prop_assert!(window.end < count);
            let budget = max_request.min(max_stored).max(1);
            prop_assert!(window.len() <= budget.max(frame.len()));
        }

        #[test]
        fn accept_keeps_window_contiguous_and_bounded(
            max in 1usize..64,
            packets in proptest::collection::vec((0u64..200, 1u64..40), 1..30)
        ) {
            let mut window = Window::new();
            for (start, len) in packets {
                window.accept(rows(start, start + len - 1), max);
                assert_contiguous(&window);
                if let Some(stored) = window.stored() {
                    prop_assert!(stored.start <= stored.end);
                    prop_assert!(stored.len() as usize <= max);
                    prop_assert_eq!(stored.len() as usize, window.rows().len());
                }
            }
        }
    }
}
