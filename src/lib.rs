//! Tankobon - asynchronous content loading for a manga reader.
//!
//! This library provides:
//! - A background task scheduler with tag-based cancellation and UI-thread
//!   result delivery ([`ContentLoader`])
//! - An in-memory cache of chapter pages and series artwork with preloading
//! - Content source plugins (MangaDex, MangaHere, local directories)
//! - Progress tracker plugins (Kitsu, AniList)

pub mod cache;
pub mod config;
pub mod console;
pub mod error;
pub mod library;
pub mod loader;
pub mod sources;
pub mod trackers;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types
pub use cache::{AssetKind, ChapterPages, EntityCache};
pub use config::{Config, ReaderConfig};
pub use console::{Console, ConsoleSink};
pub use error::{ConfigError, Failure, LibraryError, SourceError, TaskError, TrackerError};
pub use library::{Chapter, ChapterKey, Library, SearchResult, Series, SeriesKey};
pub use loader::{
    ContentLoader, Notification, ResultSink, SeriesUpdate, Tag, TargetKey, Task, TaskHandle,
    TaskKind, TaskState, UiDispatcher, UiQueue, ui_channel,
};
pub use sources::{ContentSource, SourceRegistry};
pub use trackers::{Credentials, ProgressUpdate, SessionState, Tracker, TrackerRegistry};
