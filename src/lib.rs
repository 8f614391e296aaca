//! Windowed viewing of very large logs that live in a backend.
//!
//! The crate never holds a whole log. Two output engines keep a bounded window of rows
//! around what a scrolling view is looking at:
//! - `output::StreamOutput` over the raw stream
//! - `output::SearchOutput` over search hits, with bookmarks spliced in
//!
//! A `session::Session` wires both engines to a `transport::Transport`, together with
//! bookmarks, the row signal hub, the search hit map and the time-range controller.

pub mod bookmarks;
pub mod colors;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod importer;
pub mod logging;
pub mod map;
pub mod output;
pub mod range;
pub mod row;
pub mod row_api;
pub mod session;
pub mod timestamps;
pub mod transport;

pub use config::Config;
pub use error::{ImportError, OutputError, TimestampError, TransportError};
pub use range::Range;
pub use row::Row;
pub use session::Session;
