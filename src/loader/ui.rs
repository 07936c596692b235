//! Hand-off of task results to the UI thread.
//!
//! Workers never touch UI state directly. They post closures through a
//! [`UiDispatcher`]; the thread that owns the [`UiQueue`] drains it and runs
//! each closure against its [`ResultSink`]. A closure posted by a task carries
//! that task's cancellation token and is discarded at drain time if the task
//! was cancelled in the meantime.

use super::{Registration, TaskKind};
use crate::error::Failure;
use crate::library::{Chapter, ChapterKey, SearchResult, Series, SeriesKey};
use crate::trackers::{ProgressUpdate, SessionState};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Closure run on the UI thread.
pub type UiJob = Box<dyn FnOnce(&mut dyn ResultSink) + Send>;

/// Receiver of task results, owned by the UI thread.
///
/// Every method has an empty default so a view only implements what it shows.
#[allow(unused_variables)]
pub trait ResultSink {
    /// An active page load finished.
    fn page_loaded(&mut self, chapter: &ChapterKey, page: usize, page_count: usize, image: Bytes) {}

    /// An active page load failed. No cache slot was written.
    fn page_failed(&mut self, chapter: &ChapterKey, page: usize, failure: Failure) {}

    fn series_reloaded(&mut self, series: &SeriesKey, update: SeriesUpdate) {}

    fn banner_loaded(&mut self, series: &SeriesKey, image: Bytes) {}

    fn cover_loaded(&mut self, series: &SeriesKey, image: Bytes) {}

    fn search_results(&mut self, source: &str, query: &str, results: Vec<SearchResult>) {}

    /// The session state of `tracker` changed.
    fn tracker_status(&mut self, tracker: &str, state: SessionState, message: Option<String>) {}

    fn progress_updated(&mut self, tracker: &str, media_id: &str, update: ProgressUpdate) {}

    /// A plugin lacks the capability `operation` needs; hide or disable it.
    fn unsupported(&mut self, operation: TaskKind, plugin: &str) {}

    /// A dismissible failure notice.
    fn notify(&mut self, notification: Notification) {}
}

/// Result of a series reload.
#[derive(Debug, Clone)]
pub enum SeriesUpdate {
    /// Metadata and chapter listing both refreshed.
    Refreshed { series: Series, chapters: Vec<Chapter> },

    /// Metadata refreshed but the chapter listing failed.
    MetadataOnly { series: Series, failure: Failure },

    /// Nothing could be refreshed.
    Failed(Failure),
}

impl SeriesUpdate {
    /// Merges the refreshed data into `series`; returns the number of newly
    /// discovered chapters.
    pub fn apply_to(self, series: &mut Series) -> usize {
        match self {
            SeriesUpdate::Refreshed {
                series: fresh,
                chapters,
            } => {
                series.merge_metadata(&fresh);
                series.merge_chapters(chapters)
            }
            SeriesUpdate::MetadataOnly { series: fresh, .. } => {
                series.merge_metadata(&fresh);
                0
            }
            SeriesUpdate::Failed(_) => 0,
        }
    }

    pub fn failure(&self) -> Option<Failure> {
        match self {
            SeriesUpdate::Refreshed { .. } => None,
            SeriesUpdate::MetadataOnly { failure, .. } | SeriesUpdate::Failed(failure) => {
                Some(*failure)
            }
        }
    }
}

/// A failure notice naming the operation and the plugin it ran against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub operation: TaskKind,
    pub plugin: String,
    pub failure: Failure,
    pub message: String,
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Could not {} ({}): {}. {}",
            self.operation, self.plugin, self.failure, self.message
        )
    }
}

/// A posted closure with the token of the task that posted it.
pub(super) struct Dispatch {
    token: Option<CancellationToken>,
    // Keeps the task registered (and so cancellable) until the closure is
    // run or discarded.
    _registration: Option<Arc<Registration>>,
    job: UiJob,
}

impl Dispatch {
    pub(super) fn guarded(
        token: CancellationToken,
        registration: Arc<Registration>,
        job: UiJob,
    ) -> Self {
        Self {
            token: Some(token),
            _registration: Some(registration),
            job,
        }
    }

    /// Runs the closure unless its task was cancelled.
    fn run(self, sink: &mut dyn ResultSink) -> bool {
        if self.token.as_ref().is_some_and(|t| t.is_cancelled()) {
            tracing::trace!("Discarded result of cancelled task");
            return false;
        }
        (self.job)(sink);
        true
    }
}

/// Sending half of the UI queue. Cheap to clone and usable from any thread.
#[derive(Clone)]
pub struct UiDispatcher {
    tx: mpsc::UnboundedSender<Dispatch>,
}

impl UiDispatcher {
    /// Posts `job` to run on the UI thread.
    pub fn run_later(&self, job: impl FnOnce(&mut dyn ResultSink) + Send + 'static) {
        self.post(Dispatch {
            token: None,
            _registration: None,
            job: Box::new(job),
        });
    }

    pub(super) fn post(&self, dispatch: Dispatch) {
        if self.tx.send(dispatch).is_err() {
            tracing::debug!("UI queue closed, dropping result");
        }
    }
}

/// Receiving half of the UI queue, owned by the UI thread.
pub struct UiQueue {
    rx: mpsc::UnboundedReceiver<Dispatch>,
}

impl UiQueue {
    /// Runs every closure posted so far without waiting; returns how many ran.
    pub fn drain(&mut self, sink: &mut dyn ResultSink) -> usize {
        let mut ran = 0;
        while let Ok(dispatch) = self.rx.try_recv() {
            if dispatch.run(sink) {
                ran += 1;
            }
        }
        ran
    }

    /// Waits for the next closure that is still live and runs it.
    ///
    /// Returns false once every dispatcher is gone and the queue is empty.
    pub async fn next(&mut self, sink: &mut dyn ResultSink) -> bool {
        while let Some(dispatch) = self.rx.recv().await {
            if dispatch.run(sink) {
                return true;
            }
        }
        false
    }
}

/// Creates a connected dispatcher/queue pair.
pub fn ui_channel() -> (UiDispatcher, UiQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (UiDispatcher { tx }, UiQueue { rx })
}
