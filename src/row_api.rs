//! Broadcast hub for rendered row widgets.
//!
//! Widgets register once and react to session-wide signals instead of polling engine state.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::trace;

use crate::events::EventHub;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowSignal {
    /// Redraw everything visible
    Repaint,
    /// Content may have changed, re-read rows
    Refresh,
    /// Digit width of the row count changed
    RankChanged(usize),
    BookmarkSet(u64),
    BookmarkRemoved(u64),
    /// Pointer is over the row at this stream position
    Hover(u64),
}

pub struct RowApi {
    session_id: Arc<str>,
    events: EventHub<RowSignal>,
    rank: AtomicUsize,
}

impl RowApi {
    pub fn new(session_id: Arc<str>, event_capacity: usize) -> Self {
        Self {
            session_id,
            events: EventHub::new(event_capacity),
            rank: AtomicUsize::new(1),
        }
    }

    pub fn session_id(&self) -> &Arc<str> {
        &self.session_id
    }

    pub fn register(&self) -> RowSubscription {
        RowSubscription {
            rx: self.events.subscribe(),
        }
    }

    /// Current rank, for widgets created after the last change
    pub fn rank(&self) -> usize {
        self.rank.load(Ordering::Relaxed)
    }

    pub fn repaint(&self) {
        self.send(RowSignal::Repaint);
    }

    pub fn refresh(&self) {
        self.send(RowSignal::Refresh);
    }

    pub fn set_rank(&self, rank: usize) {
        if self.rank.swap(rank, Ordering::Relaxed) != rank {
            self.send(RowSignal::RankChanged(rank));
        }
    }

    pub fn bookmark_set(&self, position: u64) {
        self.send(RowSignal::BookmarkSet(position));
    }

    pub fn bookmark_removed(&self, position: u64) {
        self.send(RowSignal::BookmarkRemoved(position));
    }

    pub fn hover(&self, position: u64) {
        self.send(RowSignal::Hover(position));
    }

    fn send(&self, signal: RowSignal) {
        let receivers = self.events.publish(signal);
        trace!(session = %self.session_id, ?signal, receivers, "row signal");
    }
}

/// A registered widget's view of the hub
pub struct RowSubscription {
    rx: broadcast::Receiver<RowSignal>,
}

impl RowSubscription {
    /// Next signal, skipping over any the widget lagged behind on. `None` once the hub is gone.
    pub async fn next(&mut self) -> Option<RowSignal> {
        loop {
            match self.rx.recv().await {
                Ok(signal) => return Some(signal),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_next(&mut self) -> Option<RowSignal> {
        loop {
            match self.rx.try_recv() {
                Ok(signal) => return Some(signal),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

/// Render-relevant state of one row widget
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowWidgetState {
    pub position: u64,
    pub rank: usize,
    pub bookmarked: bool,
    pub hovered: bool,
}

impl RowWidgetState {
    pub fn new(position: u64, rank: usize, bookmarked: bool) -> Self {
        Self {
            position,
            rank,
            bookmarked,
            hovered: false,
        }
    }

    /// Apply a signal, returning true if the widget must re-render
    pub fn apply(&mut self, signal: RowSignal) -> bool {
        match signal {
            RowSignal::Repaint | RowSignal::Refresh => true,
            RowSignal::RankChanged(rank) => replace(&mut self.rank, rank),
            RowSignal::BookmarkSet(position) if position == self.position => {
                replace(&mut self.bookmarked, true)
            }
            RowSignal::BookmarkRemoved(position) if position == self.position => {
                replace(&mut self.bookmarked, false)
            }
            RowSignal::BookmarkSet(_) | RowSignal::BookmarkRemoved(_) => false,
            RowSignal::Hover(position) => replace(&mut self.hovered, position == self.position),
        }
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}
