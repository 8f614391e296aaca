//! One open log session: both output engines plus the controllers that share their rows.
//!
//! Everything a subsystem needs is handed to it here. There is no global registry; the
//! session is the only owner and drives them from backend notifications and hotkeys.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bookmarks::{Bookmark, BookmarkStore, HotkeyAction, HotkeyEvent};
use crate::config::Config;
use crate::error::{ImportError, OutputError};
use crate::events::RowOrigin;
use crate::importer::{ExportLedger, Importable, ImportedData, export_all, import_all};
use crate::map::MapController;
use crate::output::{SearchOutput, StreamOutput};
use crate::range::Range;
use crate::row::Row;
use crate::row_api::RowApi;
use crate::timestamps::TimestampController;
use crate::transport::{Ipc, Notification, Transport};

/// Result of a hotkey routed to this session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HotkeyOutcome {
    /// Both views were scrolled to the bookmark at this position
    Selected(u64),
    /// First and last rows of every search result
    SearchSelection(Row, Row),
}

pub struct Session {
    id: Arc<str>,
    row_api: Arc<RowApi>,
    bookmarks: Arc<BookmarkStore>,
    stream: StreamOutput,
    search: SearchOutput,
    timestamps: Arc<TimestampController>,
    map: Arc<MapController>,
    ledger: Mutex<ExportLedger>,
}

impl Session {
    pub fn new(id: impl Into<Arc<str>>, transport: Arc<dyn Transport>, config: &Config) -> Self {
        let id = id.into();
        let capacity = config.event_capacity();
        let ipc = Ipc::new(transport, Arc::clone(&id));
        let row_api = Arc::new(RowApi::new(Arc::clone(&id), capacity));
        let bookmarks = Arc::new(BookmarkStore::new(Arc::clone(&id), capacity));
        let stream = StreamOutput::new(
            ipc.clone(),
            config.stream.clone(),
            Arc::clone(&row_api),
            capacity,
        );
        let search = SearchOutput::new(
            ipc.clone(),
            config.search.clone(),
            Arc::clone(&bookmarks),
            capacity,
        );
        let timestamps = Arc::new(TimestampController::new(ipc, capacity));
        let map = Arc::new(MapController::new(id.to_string(), capacity));
        info!(session = %id, "session created");
        Self {
            id,
            row_api,
            bookmarks,
            stream,
            search,
            timestamps,
            map,
            ledger: Mutex::new(ExportLedger::default()),
        }
    }

    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    pub fn stream(&self) -> &StreamOutput {
        &self.stream
    }

    pub fn search(&self) -> &SearchOutput {
        &self.search
    }

    pub fn bookmarks(&self) -> &Arc<BookmarkStore> {
        &self.bookmarks
    }

    pub fn row_api(&self) -> &Arc<RowApi> {
        &self.row_api
    }

    pub fn timestamps(&self) -> &Arc<TimestampController> {
        &self.timestamps
    }

    pub fn map(&self) -> &Arc<MapController> {
        &self.map
    }

    /// Apply a backend push. Returns false if it belongs to another session.
    pub fn handle_notification(&self, notification: &Notification) -> bool {
        if notification.session() != &*self.id {
            return false;
        }
        match notification {
            Notification::StreamUpdated { rows, .. } => {
                self.stream.update_stream_state(*rows);
                self.map.update_count(*rows);
            }
            Notification::SearchUpdated { rows, .. } => self.search.update_stream_state(*rows),
            Notification::SearchResultMap { map, append, .. } => {
                self.map.apply_result_map(map, *append);
            }
        }
        true
    }

    pub async fn handle_hotkey(
        &self,
        event: &HotkeyEvent,
    ) -> Result<Option<HotkeyOutcome>, OutputError> {
        if event.session != *self.id {
            return Ok(None);
        }
        if event.action == HotkeyAction::SelectAllSearchResults {
            let bounds = self.search.select_all_bounds().await?;
            return Ok(bounds.map(|(first, last)| HotkeyOutcome::SearchSelection(first, last)));
        }
        let Some(position) = self.bookmarks.handle_hotkey(event) else {
            return Ok(None);
        };
        self.stream.scroll_to(position);
        self.search.scroll_to(position);
        Ok(Some(HotkeyOutcome::Selected(position)))
    }

    /// Pin a loaded row. Returns false for placeholders and rows already pinned.
    pub fn add_bookmark(&self, row: &Row) -> bool {
        let Some(content) = row.content.clone() else {
            return false;
        };
        let position = row.position_in_source;
        let added = self.bookmarks.add(Bookmark {
            content,
            position,
            source_id: row.source_id,
            rank: self.row_api.rank(),
        });
        if added {
            self.search.on_bookmarks_changed(true);
            self.row_api.bookmark_set(position);
        }
        added
    }

    pub fn remove_bookmark(&self, position: u64) -> bool {
        let removed = self.bookmarks.remove(position);
        if removed {
            self.search.on_bookmarks_changed(false);
            self.row_api.bookmark_removed(position);
        }
        removed
    }

    /// Returns true if the row is bookmarked afterwards
    pub fn toggle_bookmark(&self, row: &Row) -> bool {
        if self.bookmarks.is_bookmarked(row.position_in_source) {
            self.remove_bookmark(row.position_in_source);
            false
        } else {
            self.add_bookmark(row)
        }
    }

    pub fn reset_bookmarks(&self) {
        let removed = self.bookmarks.reset();
        if removed.is_empty() {
            return;
        }
        self.search.on_bookmarks_changed(false);
        for position in removed {
            self.row_api.bookmark_removed(position);
        }
    }

    /// Declare the stream frame in view and track it on the hit map
    pub fn set_stream_frame(&self, frame: Range) -> Result<(), OutputError> {
        self.stream.set_frame(frame)?;
        self.map.set_position(frame);
        Ok(())
    }

    /// Scroll the views that did not originate the selection.
    ///
    /// A stream selection scrolls search output to the nearest hit.
    pub fn select_row(&self, origin: RowOrigin, position: u64) {
        debug!(session = %self.id, ?origin, position, "row selected");
        match origin {
            RowOrigin::Stream => {
                let target = self.map.closest_match(position).map_or(position, |(_, hit)| hit);
                self.search.scroll_to(target);
            }
            RowOrigin::Search => self.stream.scroll_to(position),
            RowOrigin::Bookmark => {
                self.stream.scroll_to(position);
                self.search.scroll_to(position);
            }
        }
    }

    /// Drive the session until both channels close
    pub async fn run(
        &self,
        mut notifications: mpsc::Receiver<Notification>,
        mut hotkeys: mpsc::Receiver<HotkeyEvent>,
    ) {
        let mut notifications_open = true;
        let mut hotkeys_open = true;
        while notifications_open || hotkeys_open {
            tokio::select! {
                notification = notifications.recv(), if notifications_open => match notification {
                    Some(notification) => {
                        self.handle_notification(&notification);
                    }
                    None => notifications_open = false,
                },
                hotkey = hotkeys.recv(), if hotkeys_open => match hotkey {
                    Some(hotkey) => {
                        if let Err(err) = self.handle_hotkey(&hotkey).await {
                            warn!(session = %self.id, error = %err, "hotkey failed");
                        }
                    }
                    None => hotkeys_open = false,
                },
            }
        }
        debug!(session = %self.id, "session loop finished");
    }

    fn importables(&self) -> [&dyn Importable; 2] {
        [self.bookmarks.as_ref(), self.timestamps.as_ref()]
    }

    /// Records worth saving, or `None` if nothing changed since the last export
    pub fn export(&self) -> Option<Vec<ImportedData>> {
        let records = export_all(&self.importables());
        if records.is_empty() {
            return None;
        }
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        ledger.is_actual(&records).then_some(records)
    }

    pub fn import(&self, records: &[ImportedData]) -> Result<(), ImportError> {
        let result = import_all(&self.importables(), records);
        self.search.on_bookmarks_changed(false);
        self.row_api.refresh();
        result
    }

    /// Stop pending fetches of both engines
    pub fn destroy(&self) {
        self.stream.destroy();
        self.search.destroy();
        info!(session = %self.id, "session destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{SearchEvent, StreamEvent};
    use crate::row_api::RowSignal;
    use crate::transport::testing::MemoryTransport;

    fn session() -> (Arc<MemoryTransport>, Session) {
        let transport = Arc::new(MemoryTransport::with_lines(100));
        transport.set_hits(vec![10, 20]);
        let session = Session::new("s1", transport.clone(), &Config::default());
        (transport, session)
    }

    fn row(position: u64) -> Row {
        Row {
            content: Some(format!("line {position}")),
            position_in_source: position,
            position_in_view: Some(position),
            source_id: Some(1),
            session_id: Arc::from("s1"),
        }
    }

    fn hotkey(session: &str, action: HotkeyAction) -> HotkeyEvent {
        HotkeyEvent {
            session: session.to_string(),
            action,
        }
    }

    #[tokio::test]
    async fn test_notifications_for_other_sessions_are_ignored() {
        let (_, session) = session();
        let other = Notification::StreamUpdated {
            session: "s2".to_string(),
            rows: 50,
        };
        assert!(!session.handle_notification(&other));
        assert_eq!(session.stream().count(), 0);

        let own = Notification::StreamUpdated {
            session: "s1".to_string(),
            rows: 100,
        };
        assert!(session.handle_notification(&own));
        assert_eq!(session.stream().count(), 100);
    }

    #[tokio::test]
    async fn test_toggle_bookmark_resplices_and_signals_rows() {
        let (_, session) = session();
        session.handle_notification(&Notification::SearchUpdated {
            session: "s1".to_string(),
            rows: 2,
        });
        assert_eq!(session.search().count(), 2);
        let mut rows = session.row_api().register();

        assert!(session.toggle_bookmark(&row(15)));
        assert_eq!(session.search().count(), 3);
        assert_eq!(rows.try_next(), Some(RowSignal::BookmarkSet(15)));

        assert!(!session.toggle_bookmark(&row(15)));
        assert_eq!(session.search().count(), 2);
        assert_eq!(rows.try_next(), Some(RowSignal::BookmarkRemoved(15)));

        let mut placeholder = row(3);
        placeholder.content = None;
        assert!(!session.add_bookmark(&placeholder));
    }

    #[tokio::test]
    async fn test_reset_bookmarks_signals_each_row() {
        let (_, session) = session();
        session.add_bookmark(&row(1));
        session.add_bookmark(&row(2));
        let mut rows = session.row_api().register();
        session.reset_bookmarks();
        assert_eq!(rows.try_next(), Some(RowSignal::BookmarkRemoved(1)));
        assert_eq!(rows.try_next(), Some(RowSignal::BookmarkRemoved(2)));
        assert!(session.bookmarks().is_empty());
    }

    #[tokio::test]
    async fn test_bookmark_hotkey_scrolls_both_views() {
        let (_, session) = session();
        session.add_bookmark(&row(5));
        session.add_bookmark(&row(9));
        let mut stream_events = session.stream().subscribe();
        let mut search_events = session.search().subscribe();

        let ignored = session
            .handle_hotkey(&hotkey("s2", HotkeyAction::NextBookmark))
            .await
            .unwrap();
        assert_eq!(ignored, None);

        let outcome = session
            .handle_hotkey(&hotkey("s1", HotkeyAction::NextBookmark))
            .await
            .unwrap();
        let Some(HotkeyOutcome::Selected(position)) = outcome else {
            panic!("expected a selection, got {outcome:?}");
        };
        assert!(position == 5 || position == 9);
        assert!(matches!(stream_events.try_recv(), Ok(StreamEvent::ScrollTo(p)) if p == position));
        assert!(matches!(search_events.try_recv(), Ok(SearchEvent::ScrollTo(p)) if p == position));
    }

    #[tokio::test]
    async fn test_select_all_hotkey_spans_hits() {
        let (_, session) = session();
        session.handle_notification(&Notification::SearchUpdated {
            session: "s1".to_string(),
            rows: 2,
        });
        let outcome = session
            .handle_hotkey(&hotkey("s1", HotkeyAction::SelectAllSearchResults))
            .await
            .unwrap();
        let Some(HotkeyOutcome::SearchSelection(first, last)) = outcome else {
            panic!("expected bounds, got {outcome:?}");
        };
        assert_eq!(first.position_in_source, 10);
        assert_eq!(last.position_in_source, 20);
    }

    #[tokio::test]
    async fn test_select_row_scrolls_the_other_view() {
        let (_, session) = session();
        let mut stream_events = session.stream().subscribe();
        let mut search_events = session.search().subscribe();
        session.select_row(RowOrigin::Stream, 7);
        assert!(matches!(search_events.try_recv(), Ok(SearchEvent::ScrollTo(7))));
        assert!(stream_events.try_recv().is_err());

        session.select_row(RowOrigin::Search, 8);
        assert!(matches!(stream_events.try_recv(), Ok(StreamEvent::ScrollTo(8))));
    }

    #[tokio::test]
    async fn test_stream_selection_scrolls_search_to_nearest_hit() {
        let (_, session) = session();
        let mut search_events = session.search().subscribe();
        assert!(session.handle_notification(&Notification::SearchResultMap {
            session: "s1".to_string(),
            map: [(10, vec!["line".to_string()]), (20, vec!["line".to_string()])].into(),
            append: false,
        }));
        assert_eq!(session.map().points().len(), 2);

        session.select_row(RowOrigin::Stream, 17);
        assert!(matches!(search_events.try_recv(), Ok(SearchEvent::ScrollTo(20))));
    }

    #[tokio::test]
    async fn test_stream_frame_is_tracked_on_map() {
        let (_, session) = session();
        session.handle_notification(&Notification::StreamUpdated {
            session: "s1".to_string(),
            rows: 100,
        });
        session.set_stream_frame(Range::new(30, 49)).unwrap();
        let state = session.map().state();
        assert_eq!((state.count, state.position, state.rows_in_view), (100, 30, 20));
        assert_eq!(session.stream().frame(), Some(Range::new(30, 49)));
    }

    #[tokio::test]
    async fn test_export_only_when_changed() {
        let (_, session) = session();
        assert!(session.export().is_none());

        session.add_bookmark(&row(42));
        let records = session.export().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].controller, "bookmarks");
        assert!(session.export().is_none());

        let (_, restored) = self::session();
        restored.import(&records).unwrap();
        assert!(restored.bookmarks().is_bookmarked(42));

        let unknown = ImportedData::new("minimap", &serde_json::json!({}));
        let err = restored.import(&[unknown]).unwrap_err();
        assert!(matches!(err, ImportError::UnknownController(id) if id == "minimap"));
    }

    #[tokio::test]
    async fn test_run_until_channels_close() {
        let (_, session) = session();
        let (notify_tx, notify_rx) = mpsc::channel(8);
        let (hotkey_tx, hotkey_rx) = mpsc::channel(8);
        notify_tx
            .send(Notification::StreamUpdated {
                session: "s1".to_string(),
                rows: 64,
            })
            .await
            .unwrap();
        hotkey_tx
            .send(hotkey("s1", HotkeyAction::PrevBookmark))
            .await
            .unwrap();
        drop(notify_tx);
        drop(hotkey_tx);

        session.run(notify_rx, hotkey_rx).await;
        assert_eq!(session.stream().count(), 64);
        session.destroy();
    }
}
