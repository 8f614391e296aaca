//! Search hit markers laid over the whole stream.
//!
//! The backend pushes a position-to-filters map as a search progresses. Points are kept per
//! session so a scrollbar-style overview can draw them against the stream row count, and a
//! stream row can be resolved to the nearest hit.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::events::EventHub;
use crate::range::Range;

/// One search hit on the map
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapPoint {
    /// Stream position of the hit
    pub position: u64,
    /// Colour of the first matching filter, if one was assigned
    pub color: Option<String>,
    /// Every matching filter, comma separated
    pub description: String,
    /// Matching filters in backend order
    pub filters: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MapState {
    /// Stream rows reported by the backend
    pub count: u64,
    /// First stream row in view
    pub position: u64,
    pub rows_in_view: u64,
    pub points: Vec<MapPoint>,
}

#[derive(Clone, Debug)]
pub enum MapEvent {
    StateUpdated(MapState),
    PositionUpdated { position: u64, rows_in_view: u64 },
    /// A filter colour changed; points matching it were recoloured
    Restyled { filter: String },
}

#[derive(Default)]
struct MapInner {
    state: MapState,
    colors: HashMap<String, String>,
    /// Set between a dropped search and the next one starting
    locked: bool,
}

impl MapInner {
    fn point(&self, position: u64, filters: Vec<String>) -> MapPoint {
        MapPoint {
            position,
            color: filters.first().and_then(|f| self.colors.get(f)).cloned(),
            description: filters.join(", "),
            filters,
        }
    }
}

pub struct MapController {
    session_id: String,
    events: EventHub<MapEvent>,
    inner: Mutex<MapInner>,
}

impl MapController {
    pub fn new(session_id: impl Into<String>, event_capacity: usize) -> Self {
        Self {
            session_id: session_id.into(),
            events: EventHub::new(event_capacity),
            inner: Mutex::new(MapInner::default()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, MapInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MapEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> MapState {
        self.inner().state.clone()
    }

    pub fn points(&self) -> Vec<MapPoint> {
        self.inner().state.points.clone()
    }

    /// Overview columns to draw: one for all matches, none without points
    pub fn columns_count(&self) -> usize {
        usize::from(!self.inner().state.points.is_empty())
    }

    /// Apply a pushed result map. Without `append` the previous points are replaced.
    ///
    /// Returns false while updates are locked by a dropped search.
    pub fn apply_result_map(&self, map: &BTreeMap<u64, Vec<String>>, append: bool) -> bool {
        let mut inner = self.inner();
        if inner.locked {
            debug!(session = %self.session_id, "search dropped, ignoring result map");
            return false;
        }
        if !append {
            inner.state.points.clear();
        }
        let points: Vec<MapPoint> = map
            .iter()
            .filter(|(_, filters)| !filters.is_empty())
            .map(|(position, filters)| inner.point(*position, filters.clone()))
            .collect();
        inner.state.points.extend(points);
        debug!(
            session = %self.session_id,
            append,
            points = inner.state.points.len(),
            "search map updated"
        );
        self.publish_state(inner);
        true
    }

    pub fn update_count(&self, rows: u64) {
        let mut inner = self.inner();
        inner.state.count = rows;
        self.publish_state(inner);
    }

    /// Track the stream frame shown by the view
    pub fn set_position(&self, frame: Range) {
        let mut inner = self.inner();
        inner.state.position = frame.start;
        inner.state.rows_in_view = frame.len();
        drop(inner);
        self.events.publish(MapEvent::PositionUpdated {
            position: frame.start,
            rows_in_view: frame.len(),
        });
    }

    /// Drop all points and ignore result maps until the next search starts
    pub fn search_dropped(&self) {
        let mut inner = self.inner();
        inner.locked = true;
        inner.state.points.clear();
        self.publish_state(inner);
    }

    pub fn search_started(&self) {
        self.inner().locked = false;
    }

    /// Assign a colour to a filter and recolour points whose first match is that filter
    pub fn set_filter_color(&self, filter: &str, color: Option<&str>) {
        let mut inner = self.inner();
        match color {
            Some(color) => inner.colors.insert(filter.to_string(), color.to_string()),
            None => inner.colors.remove(filter),
        };
        let color = color.map(str::to_string);
        for point in inner
            .state
            .points
            .iter_mut()
            .filter(|p| p.filters.first().is_some_and(|f| f == filter))
        {
            point.color = color.clone();
        }
        drop(inner);
        self.events.publish(MapEvent::Restyled {
            filter: filter.to_string(),
        });
    }

    /// Nearest hit to a stream row as `(index in points, stream position)`.
    ///
    /// The earliest point wins a tie.
    pub fn closest_match(&self, row: u64) -> Option<(usize, u64)> {
        let inner = self.inner();
        let points = &inner.state.points;
        let first = points.first()?;
        if row >= inner.state.count && inner.state.count > 0 {
            warn!(session = %self.session_id, row, count = inner.state.count, "target row is beyond the stream");
        }
        let mut best = (0, first.position);
        let mut distance = row.abs_diff(first.position);
        for (index, point) in points.iter().enumerate().skip(1) {
            let candidate = row.abs_diff(point.position);
            if candidate < distance {
                distance = candidate;
                best = (index, point.position);
            }
        }
        Some(best)
    }

    fn publish_state(&self, inner: MutexGuard<'_, MapInner>) {
        let state = inner.state.clone();
        drop(inner);
        self.events.publish(MapEvent::StateUpdated(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Filters are comma separated
    fn hits(entries: &[(u64, &str)]) -> BTreeMap<u64, Vec<String>> {
        entries
            .iter()
            .map(|(position, filters)| {
                (*position, filters.split(',').map(str::to_string).collect())
            })
            .collect()
    }

    fn positions(map: &MapController) -> Vec<u64> {
        map.points().iter().map(|p| p.position).collect()
    }

    #[test]
    fn test_replace_and_append() {
        let map = MapController::new("s1", 16);
        assert_eq!(map.columns_count(), 0);

        assert!(map.apply_result_map(&hits(&[(10, "error"), (40, "error,disk")]), false));
        assert_eq!(positions(&map), vec![10, 40]);
        assert_eq!(map.points()[1].description, "error, disk");
        assert_eq!(map.columns_count(), 1);

        map.apply_result_map(&hits(&[(90, "error")]), true);
        assert_eq!(positions(&map), vec![10, 40, 90]);

        map.apply_result_map(&hits(&[(5, "warn")]), false);
        assert_eq!(positions(&map), vec![5]);
    }

    #[test]
    fn test_closest_match() {
        let map = MapController::new("s1", 16);
        assert_eq!(map.closest_match(3), None);

        map.update_count(1000);
        map.apply_result_map(&hits(&[(100, "a"), (200, "a"), (500, "a")]), false);
        assert_eq!(map.closest_match(0), Some((0, 100)));
        assert_eq!(map.closest_match(180), Some((1, 200)));
        assert_eq!(map.closest_match(150), Some((0, 100)));
        assert_eq!(map.closest_match(999), Some((2, 500)));
    }

    #[test]
    fn test_dropped_search_locks_updates() {
        let map = MapController::new("s1", 16);
        map.apply_result_map(&hits(&[(1, "a")]), false);
        map.search_dropped();
        assert!(map.points().is_empty());

        assert!(!map.apply_result_map(&hits(&[(2, "a")]), true));
        assert!(map.points().is_empty());

        map.search_started();
        assert!(map.apply_result_map(&hits(&[(3, "b")]), false));
        assert_eq!(positions(&map), vec![3]);
    }

    #[test]
    fn test_filter_colors() {
        let map = MapController::new("s1", 16);
        map.set_filter_color("error", Some("#e74c3c"));
        map.apply_result_map(&hits(&[(1, "error"), (2, "warn,error")]), false);
        let points = map.points();
        assert_eq!(points[0].color.as_deref(), Some("#e74c3c"));
        assert_eq!(points[1].color, None);

        let mut rx = map.subscribe();
        map.set_filter_color("warn", Some("#f1c40f"));
        assert_eq!(map.points()[1].color.as_deref(), Some("#f1c40f"));
        assert!(matches!(rx.try_recv(), Ok(MapEvent::Restyled { filter }) if filter == "warn"));
    }

    #[test]
    fn test_count_and_position() {
        let map = MapController::new("s1", 16);
        let mut rx = map.subscribe();
        map.update_count(250);
        map.set_position(Range::new(20, 39));
        let state = map.state();
        assert_eq!((state.count, state.position, state.rows_in_view), (250, 20, 20));
        assert!(matches!(rx.try_recv(), Ok(MapEvent::StateUpdated(s)) if s.count == 250));
        assert!(matches!(
            rx.try_recv(),
            Ok(MapEvent::PositionUpdated {
                position: 20,
                rows_in_view: 20
            })
        ));
    }
}
