//! Console output formatting with ANSI color support.
//!
//! Provides styled terminal output with automatic TTY detection
//! and respect for the NO_COLOR environment variable, plus a
//! [`ResultSink`] that reports loader results on the terminal.

use crate::error::Failure;
use crate::library::{ChapterKey, SearchResult, SeriesKey};
use crate::loader::{Notification, ResultSink, SeriesUpdate, TaskKind};
use crate::trackers::{ProgressUpdate, SessionState};
use bytes::Bytes;
use std::io::{self, IsTerminal};

/// ANSI style codes for terminal formatting.
#[derive(Debug, Clone, Copy)]
pub enum Style {
    Bold,
    Dim,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    Gray,
}

impl Style {
    fn code(self) -> &'static str {
        match self {
            Style::Bold => "1",
            Style::Dim => "2",
            Style::Red => "31",
            Style::Green => "32",
            Style::Yellow => "33",
            Style::Blue => "34",
            Style::Magenta => "35",
            Style::Cyan => "36",
            Style::Gray => "90",
        }
    }
}

const RESET: &str = "\x1b[0m";

/// Console output handler with color support detection.
#[derive(Debug)]
pub struct Console {
    colors_enabled: bool,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Console {
    /// Creates a new Console instance, detecting color support.
    ///
    /// Colors are disabled if:
    /// - The `NO_COLOR` environment variable is set
    /// - stdout is not a terminal (TTY)
    pub fn new() -> Self {
        let colors_enabled = std::env::var("NO_COLOR").is_err() && io::stdout().is_terminal();
        Self { colors_enabled }
    }

    pub fn with_colors(enabled: bool) -> Self {
        Self {
            colors_enabled: enabled,
        }
    }

    /// Applies ANSI styles to text if colors are enabled.
    pub fn style(&self, text: &str, styles: &[Style]) -> String {
        if !self.colors_enabled || styles.is_empty() {
            return text.to_string();
        }

        let codes: Vec<&str> = styles.iter().map(|s| s.code()).collect();
        format!("\x1b[{}m{}{}", codes.join(";"), text, RESET)
    }

    /// Creates a colored label like `[INFO]`.
    pub fn label(&self, label: &str, color: Style) -> String {
        let styled = self.style(label, &[color, Style::Bold]);
        format!("[{}]", styled)
    }

    pub fn info(&self, message: &str) {
        println!("{} {}", self.label("INFO", Style::Blue), message);
    }

    pub fn success(&self, message: &str) {
        println!("{} {}", self.label("OK", Style::Green), message);
    }

    pub fn warning(&self, message: &str) {
        println!("{} {}", self.label("WARN", Style::Yellow), message);
    }

    pub fn error(&self, message: &str) {
        eprintln!("{} {}", self.label("ERROR", Style::Red), message);
    }

    pub fn step(&self, message: &str) {
        println!("{} {}", self.label("STEP", Style::Cyan), message);
    }

    /// Prints a section header in magenta bold.
    pub fn section(&self, message: &str) {
        println!();
        println!("{}", self.style(message, &[Style::Magenta, Style::Bold]));
    }

    /// Returns text styled as muted (dim gray).
    pub fn muted(&self, text: &str) -> String {
        self.style(text, &[Style::Gray, Style::Dim])
    }

    /// Formats a count with styling.
    pub fn count(&self, n: usize) -> String {
        self.style(&n.to_string(), &[Style::Green, Style::Bold])
    }
}

/// Terminal view of loader results.
///
/// Prints each result as it is drained and keeps what the CLI needs to act
/// on afterwards.
#[derive(Debug, Default)]
pub struct ConsoleSink {
    console: Console,
    /// Pages delivered by active loads, in delivery order.
    pub pages: Vec<(usize, Bytes)>,
    pub search_results: Vec<SearchResult>,
    /// Last reload result per series.
    pub series_updates: Vec<(SeriesKey, SeriesUpdate)>,
    /// Last reported session state.
    pub session: Option<SessionState>,
    /// Number of failures reported.
    pub failures: usize,
}

impl ConsoleSink {
    pub fn new(console: Console) -> Self {
        Self {
            console,
            ..Self::default()
        }
    }

    pub fn console(&self) -> &Console {
        &self.console
    }
}

impl ResultSink for ConsoleSink {
    fn page_loaded(&mut self, chapter: &ChapterKey, page: usize, page_count: usize, image: Bytes) {
        self.console.success(&format!(
            "Page {}/{} of {} ({} bytes)",
            page + 1,
            page_count,
            chapter,
            self.console.count(image.len())
        ));
        self.pages.push((page, image));
    }

    fn page_failed(&mut self, chapter: &ChapterKey, page: usize, failure: Failure) {
        self.console
            .error(&format!("Page {} of {}: {}", page + 1, chapter, failure));
        self.failures += 1;
    }

    fn series_reloaded(&mut self, series: &SeriesKey, update: SeriesUpdate) {
        match &update {
            SeriesUpdate::Refreshed { series: fresh, chapters } => self.console.success(&format!(
                "{} ({} chapters)",
                fresh.title,
                self.console.count(chapters.len())
            )),
            SeriesUpdate::MetadataOnly { series: fresh, .. } => self
                .console
                .warning(&format!("{}: chapter listing unavailable", fresh.title)),
            SeriesUpdate::Failed(failure) => {
                self.console.error(&format!("{}: {}", series, failure));
                self.failures += 1;
            }
        }
        self.series_updates.push((series.clone(), update));
    }

    fn banner_loaded(&mut self, series: &SeriesKey, image: Bytes) {
        self.console.info(&self.console.muted(&format!(
            "Banner for {} ({} bytes)",
            series,
            image.len()
        )));
    }

    fn cover_loaded(&mut self, series: &SeriesKey, image: Bytes) {
        self.console.info(&self.console.muted(&format!(
            "Cover for {} ({} bytes)",
            series,
            image.len()
        )));
    }

    fn search_results(&mut self, source: &str, query: &str, results: Vec<SearchResult>) {
        self.console.success(&format!(
            "{} results for \"{}\" on {}",
            self.console.count(results.len()),
            query,
            source
        ));
        for result in &results {
            println!(
                "  {} {}",
                result.title,
                self.console.muted(&format!("[{}]", result.source_key))
            );
        }
        self.search_results = results;
    }

    fn tracker_status(&mut self, tracker: &str, state: SessionState, message: Option<String>) {
        let text = match message {
            Some(message) => format!("{tracker}: {state:?} ({message})"),
            None => format!("{tracker}: {state:?}"),
        };
        match state {
            SessionState::Authenticated => self.console.success(&text),
            SessionState::Failed => self.console.error(&text),
            _ => self.console.step(&text),
        }
        self.session = Some(state);
    }

    fn progress_updated(&mut self, tracker: &str, media_id: &str, update: ProgressUpdate) {
        match update {
            ProgressUpdate::Advanced { from, to } => self.console.success(&format!(
                "{tracker}: {media_id} progress {from} -> {to}"
            )),
            ProgressUpdate::Unchanged { current } => self.console.info(&format!(
                "{tracker}: {media_id} already at {current}, left unchanged"
            )),
        }
    }

    fn unsupported(&mut self, operation: TaskKind, plugin: &str) {
        self.console
            .info(&self.console.muted(&format!("{plugin} cannot {operation}")));
    }

    fn notify(&mut self, notification: Notification) {
        self.console.error(&notification.to_string());
        self.failures += 1;
    }
}
