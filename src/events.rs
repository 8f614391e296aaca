//! Typed publish/subscribe hubs.
//!
//! Every engine owns one `EventHub` per event enum. Subscribers get a
//! `broadcast::Receiver`; a slow subscriber lags instead of blocking the publisher.

use tokio::sync::broadcast;

use crate::range::Range;
use crate::row::Row;

/// Bounded broadcast hub for one event type
#[derive(Debug)]
pub struct EventHub<E: Clone> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventHub<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event, returning how many subscribers received it
    pub fn publish(&self, event: E) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Where the user acted on a row
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowOrigin {
    Stream,
    Search,
    Bookmark,
}

/// Snapshot of the stream engine state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamState {
    /// Total rows reported by the backend
    pub count: u64,
    /// Digit width of `count`
    pub count_rank: usize,
    /// Range held in memory
    pub stored: Option<Range>,
    /// Range the view asked for last
    pub frame: Option<Range>,
    /// A debounced fetch is scheduled but not fired
    pub fetch_pending: bool,
    /// A fetch is waiting for the backend
    pub fetch_in_flight: bool,
}

/// Snapshot of the search engine state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchState {
    /// Search hits reported by the backend
    pub original_count: u64,
    /// Bookmarks spliced into the current view
    pub bookmarks_count: u64,
    /// `original_count + bookmarks_count`
    pub count: u64,
    pub stored: Option<Range>,
    pub frame: Option<Range>,
    pub fetch_pending: bool,
    pub fetch_in_flight: bool,
}

#[derive(Clone, Debug)]
pub enum StreamEvent {
    StateUpdated(StreamState),
    RangeLoaded { range: Range, rows: Vec<Row> },
    /// The view must discard everything and request again
    Reset,
    RankChanged(usize),
    PositionChanged { start: u64, count: u64 },
    ScrollTo(u64),
}

#[derive(Clone, Debug)]
pub enum SearchEvent {
    StateUpdated {
        state: SearchState,
        bookmark_injection: bool,
    },
    RangeLoaded { range: Range, rows: Vec<Row> },
    Reset,
    BookmarksChanged,
    ScrollTo(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let hub: EventHub<StreamEvent> = EventHub::new(8);
        assert_eq!(hub.publish(StreamEvent::Reset), 0);
    }

    #[tokio::test]
    async fn test_fanout() {
        let hub: EventHub<StreamEvent> = EventHub::new(8);
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        assert_eq!(hub.publish(StreamEvent::RankChanged(3)), 2);
        assert!(matches!(first.recv().await, Ok(StreamEvent::RankChanged(3))));
        assert!(matches!(second.recv().await, Ok(StreamEvent::RankChanged(3))));
    }
}
