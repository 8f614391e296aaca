//! Pinned rows of a session.
//!
//! Bookmarks are keyed by absolute stream position and are never evicted by the output
//! caches. The search engine reads them to splice pinned rows into its view.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::events::EventHub;
use crate::importer::Importable;

/// A pinned row
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub content: String,
    /// Absolute position in the stream
    pub position: u64,
    pub source_id: Option<u32>,
    #[serde(default)]
    pub rank: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BookmarkEvent {
    Added(Bookmark),
    Removed(u64),
    Selected(u64),
}

/// Keyboard shortcuts routed to a session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HotkeyAction {
    NextBookmark,
    PrevBookmark,
    SelectAllSearchResults,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HotkeyEvent {
    /// Session that was active when the key was pressed
    pub session: String,
    pub action: HotkeyAction,
}

#[derive(Debug, Default)]
struct BookmarkInner {
    bookmarks: BTreeMap<u64, Bookmark>,
    /// Last position selected through navigation
    cursor: Option<u64>,
}

pub struct BookmarkStore {
    session_id: Arc<str>,
    inner: Mutex<BookmarkInner>,
    events: EventHub<BookmarkEvent>,
}

impl BookmarkStore {
    pub fn new(session_id: Arc<str>, event_capacity: usize) -> Self {
        Self {
            session_id,
            inner: Mutex::new(BookmarkInner::default()),
            events: EventHub::new(event_capacity),
        }
    }

    fn inner(&self) -> MutexGuard<'_, BookmarkInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BookmarkEvent> {
        self.events.subscribe()
    }

    /// Pin a row. Returns false if that position is already pinned.
    pub fn add(&self, bookmark: Bookmark) -> bool {
        {
            let mut inner = self.inner();
            if inner.bookmarks.contains_key(&bookmark.position) {
                return false;
            }
            inner.bookmarks.insert(bookmark.position, bookmark.clone());
        }
        debug!(session = %self.session_id, position = bookmark.position, "bookmark added");
        self.events.publish(BookmarkEvent::Added(bookmark));
        true
    }

    /// Unpin a position. Returns false if it was not pinned.
    pub fn remove(&self, position: u64) -> bool {
        if self.inner().bookmarks.remove(&position).is_none() {
            return false;
        }
        debug!(session = %self.session_id, position, "bookmark removed");
        self.events.publish(BookmarkEvent::Removed(position));
        true
    }

    /// Remove every bookmark one at a time, returning the removed positions
    pub fn reset(&self) -> Vec<u64> {
        let positions: Vec<u64> = self.inner().bookmarks.keys().copied().collect();
        positions
            .into_iter()
            .filter(|&position| self.remove(position))
            .collect()
    }

    pub fn is_bookmarked(&self, position: u64) -> bool {
        self.inner().bookmarks.contains_key(&position)
    }

    pub fn get(&self, position: u64) -> Option<Bookmark> {
        self.inner().bookmarks.get(&position).cloned()
    }

    /// All bookmarks ordered by position
    pub fn sorted(&self) -> Vec<Bookmark> {
        self.inner().bookmarks.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner().bookmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Select the first bookmark after the cursor, wrapping to the first one
    pub fn select_next(&self) -> Option<u64> {
        let selected = {
            let mut inner = self.inner();
            let next = match inner.cursor {
                Some(cursor) => inner
                    .bookmarks
                    .range(cursor + 1..)
                    .next()
                    .map(|(&p, _)| p),
                None => None,
            };
            let selected = next.or_else(|| inner.bookmarks.keys().next().copied())?;
            inner.cursor = Some(selected);
            selected
        };
        self.events.publish(BookmarkEvent::Selected(selected));
        Some(selected)
    }

    /// Select the last bookmark before the cursor, wrapping to the last one
    pub fn select_prev(&self) -> Option<u64> {
        let selected = {
            let mut inner = self.inner();
            let prev = match inner.cursor {
                Some(cursor) => inner.bookmarks.range(..cursor).next_back().map(|(&p, _)| p),
                None => None,
            };
            let selected = prev.or_else(|| inner.bookmarks.keys().next_back().copied())?;
            inner.cursor = Some(selected);
            selected
        };
        self.events.publish(BookmarkEvent::Selected(selected));
        Some(selected)
    }

    /// Navigate on a hotkey addressed to this session
    pub fn handle_hotkey(&self, event: &HotkeyEvent) -> Option<u64> {
        if event.session != *self.session_id {
            return None;
        }
        match event.action {
            HotkeyAction::NextBookmark => self.select_next(),
            HotkeyAction::PrevBookmark => self.select_prev(),
            HotkeyAction::SelectAllSearchResults => None,
        }
    }
}

impl Importable for BookmarkStore {
    fn importer_id(&self) -> &'static str {
        "bookmarks"
    }

    fn export(&self) -> Option<serde_json::Value> {
        let bookmarks = self.sorted();
        if bookmarks.is_empty() {
            return None;
        }
        serde_json::to_value(bookmarks).ok()
    }

    fn import(&self, data: serde_json::Value) -> Result<(), serde_json::Error> {
        let bookmarks: Vec<Bookmark> = serde_json::from_value(data)?;
        self.reset();
        for bookmark in bookmarks {
            self.add(bookmark);
        }
        Ok(())
    }
}
