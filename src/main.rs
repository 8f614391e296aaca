//! # logframe CLI
//!
//! Opens a log file through the in-process backend and prints windows of it.
//!
//! ```bash
//! # Rows 100..=150 of a file
//! logframe app.log --range 100:150
//!
//! # Search hits and two bookmarks, then the saved session state
//! logframe app.log --search "timeout" --bookmark 12 --bookmark 4000 --export
//!
//! # Keep printing rows as the file grows
//! logframe app.log --follow
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use logframe::config::Config;
use logframe::logging::init_logging;
use logframe::range::{Range, count_rank};
use logframe::row::Row;
use logframe::session::Session;
use logframe::timestamps::{AddRange, RangeOptions, TimedRow};
use logframe::transport::local::LocalBackend;
use logframe::transport::{Notification, NotificationSource};

const SESSION_ID: &str = "cli";

/// Print windows of a large log file
#[derive(Parser)]
#[command(name = "logframe", version, about)]
struct Cli {
    /// Log file to open
    file: PathBuf,

    /// Show search hits for this pattern
    #[arg(short, long)]
    search: Option<String>,

    /// Treat the search pattern as a regex
    #[arg(long, requires = "search")]
    regex: bool,

    /// Rows to print, as START:END (inclusive)
    #[arg(short, long, value_parser = parse_range, default_value = "0:19")]
    range: Range,

    /// Bookmark the row at this position (repeatable)
    #[arg(short, long)]
    bookmark: Vec<u64>,

    /// Detect the timestamp format and print the time span of the printed rows
    #[arg(long)]
    timestamps: bool,

    /// Print the exported session state as JSON
    #[arg(long)]
    export: bool,

    /// Keep printing new rows as the file grows
    #[arg(short, long, conflicts_with_all = ["search", "export"])]
    follow: bool,

    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn parse_range(value: &str) -> Result<Range, String> {
    let (start, end) = value
        .split_once(':')
        .ok_or_else(|| format!("expected START:END, got {value:?}"))?;
    let parse = |s: &str| {
        s.trim()
            .parse::<u64>()
            .map_err(|e| format!("invalid position {s:?}: {e}"))
    };
    let range = Range::new(parse(start)?, parse(end)?);
    range.validate().map_err(|e| e.to_string())?;
    Ok(range)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }
    init_logging(&config.log)?;

    let backend = Arc::new(LocalBackend::new(SESSION_ID));
    let mut notifications = backend.notifications().await;
    let session = Session::new(SESSION_ID, backend.clone(), &config);

    if cli.follow {
        let tail = backend.follow(cli.file.clone());
        follow(&session, &mut notifications).await?;
        tail.abort();
        session.destroy();
        return Ok(());
    }

    backend
        .load(&cli.file)
        .await
        .with_context(|| format!("failed to read {}", cli.file.display()))?;
    if let Some(pattern) = &cli.search {
        backend.set_search(pattern, cli.regex);
    }
    drain(&session, &mut notifications);

    for position in &cli.bookmark {
        let rows = session
            .stream()
            .load_range(Range::new(*position, *position))
            .await?;
        match rows.first() {
            Some(row) => {
                session.add_bookmark(row);
            }
            None => warn!(position, "no row to bookmark"),
        }
    }

    let stream_count = session.stream().count();
    if stream_count == 0 {
        println!("{} is empty", cli.file.display());
    } else {
        let range = clamp(cli.range, stream_count);
        let rows = session.stream().load_range(range).await?;
        println!("-- stream {range} of {stream_count}");
        print_rows(&session, &rows, stream_count);
        if cli.timestamps {
            print_time_span(&session, &rows).await?;
        }
    }

    if cli.search.is_some() {
        let hits = session.search().state().original_count;
        if hits == 0 {
            println!("-- no search hits");
        } else {
            let range = clamp(cli.range, hits);
            let rows = session.search().load_range(range).await?;
            println!("-- search {range} of {hits}");
            print_rows(&session, &rows, stream_count);
        }
    }

    let bookmarks = session.bookmarks().sorted();
    if !bookmarks.is_empty() {
        println!("-- bookmarks");
        for bookmark in bookmarks {
            println!(
                "{:>width$} * {}",
                bookmark.position,
                bookmark.content,
                width = count_rank(stream_count)
            );
        }
    }

    if cli.export {
        let records = session.export().unwrap_or_default();
        println!("{}", serde_json::to_string_pretty(&records)?);
    }

    session.destroy();
    Ok(())
}

/// Apply every notification already queued
fn drain(session: &Session, notifications: &mut mpsc::Receiver<Notification>) {
    while let Ok(notification) = notifications.try_recv() {
        session.handle_notification(&notification);
    }
}

fn clamp(range: Range, count: u64) -> Range {
    let end = range.end.min(count - 1);
    Range::new(range.start.min(end), end)
}

fn print_rows(session: &Session, rows: &[Row], count: u64) {
    let width = count_rank(count);
    for row in rows {
        let marker = if session.bookmarks().is_bookmarked(row.position_in_source) {
            '*'
        } else {
            ' '
        };
        println!(
            "{:>width$} {marker} {}",
            row.position_in_source,
            row.content.as_deref().unwrap_or_default()
        );
    }
}

async fn print_time_span(session: &Session, rows: &[Row]) -> Result<()> {
    let timestamps = session.timestamps();
    if let Err(err) = timestamps.discover(false).await {
        println!("-- timestamps: {err}");
        return Ok(());
    }
    if let Some(format) = timestamps.formats().first() {
        println!("-- timestamp format {}", format.format);
    }
    let timed = |row: &Row| {
        let content = row.content.as_deref()?;
        timestamps
            .get_match(content)
            .map(|_| TimedRow::new(row.position_in_source, content))
    };
    let first = rows.iter().find_map(&timed);
    let last = rows.iter().rev().find_map(&timed);
    let (Some(from), Some(to)) = (first, last) else {
        println!("-- no timestamps in the printed rows");
        return Ok(());
    };
    let added = timestamps
        .add_range(vec![AddRange {
            from,
            to,
            options: RangeOptions::default(),
        }])
        .await?;
    for range in added {
        let end = range.end.as_ref().map_or(range.start.position, |r| r.position);
        println!(
            "-- rows {}..={} span {} ms",
            range.start.position, end, range.duration
        );
    }
    Ok(())
}

/// Print rows as they arrive until Ctrl-C
async fn follow(
    session: &Session,
    notifications: &mut mpsc::Receiver<Notification>,
) -> Result<()> {
    let mut printed = 0u64;
    loop {
        tokio::select! {
            notification = notifications.recv() => {
                let Some(notification) = notification else {
                    return Ok(());
                };
                session.handle_notification(&notification);
                let count = session.stream().count();
                if count > printed {
                    let rows = session
                        .stream()
                        .load_range(Range::new(printed, count - 1))
                        .await?;
                    print_rows(session, &rows, count);
                    printed = count;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
        }
    }
}
