//! Background task scheduler ("content loader").
//!
//! Every unit of background work (page loads and preloads, series reloads,
//! artwork, tracker logins and progress updates, searches) is a [`Task`]
//! submitted to the [`ContentLoader`]. Each task runs as its own tokio task,
//! is registered under a coarse [`Tag`] for bulk cancellation, and reports
//! back to the UI thread only through the [`UiDispatcher`].
//!
//! Cancellation is cooperative. Task bodies check their token before each
//! network call and before each cache write, and the runner drops a body at
//! its next await point once the token fires. Results posted by a task are
//! discarded at drain time if the task was cancelled, so no sink call happens
//! after a cancelling call returns.

mod task;
mod ui;

pub use task::{Task, TaskKind};
pub use ui::{Notification, ResultSink, SeriesUpdate, UiDispatcher, UiJob, UiQueue, ui_channel};

use crate::cache::{ChapterPages, EntityCache};
use crate::config::ReaderConfig;
use crate::error::TaskError;
use crate::library::{Chapter, ChapterKey, SeriesKey};
use crate::sources::{ContentSource, SourceRegistry};
use crate::trackers::{Tracker, TrackerRegistry};
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use task::Admission;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use ui::Dispatch;

/// Coarse task category used for bulk cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Active page loads and preloads.
    PageLoad,
    SeriesReload,
    Banner,
    Cover,
    Tracker,
    Search,
}

/// The entity instance a task works on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetKey {
    Page { chapter: ChapterKey, page: usize },
    Series(SeriesKey),
    Tracker {
        tracker: String,
        media: Option<String>,
    },
    Search { source: String, query: String },
}

impl TargetKey {
    /// Whether both keys name the same entity: the same chapter for pages,
    /// the same source for searches, equality otherwise.
    pub fn same_entity(&self, other: &TargetKey) -> bool {
        match (self, other) {
            (TargetKey::Page { chapter: a, .. }, TargetKey::Page { chapter: b, .. }) => a == b,
            (TargetKey::Search { source: a, .. }, TargetKey::Search { source: b, .. }) => a == b,
            _ => self == other,
        }
    }

    pub fn chapter(&self) -> Option<&ChapterKey> {
        match self {
            TargetKey::Page { chapter, .. } => Some(chapter),
            _ => None,
        }
    }

    fn page(&self) -> Option<usize> {
        match self {
            TargetKey::Page { page, .. } => Some(*page),
            _ => None,
        }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKey::Page { chapter, page } => write!(f, "{chapter}#{page}"),
            TargetKey::Series(series) => write!(f, "{series}"),
            TargetKey::Tracker {
                tracker,
                media: Some(media),
            } => write!(f, "{tracker}:{media}"),
            TargetKey::Tracker {
                tracker,
                media: None,
            } => write!(f, "{tracker}"),
            TargetKey::Search { source, query } => write!(f, "{source}?{query}"),
        }
    }
}

pub type TaskId = u64;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Cancelled,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Cancelled | TaskState::Completed | TaskState::Failed
        )
    }
}

/// Handle to a submitted task.
///
/// Coalesced submissions return a clone of the handle of the task they
/// attached to.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    kind: TaskKind,
    token: CancellationToken,
    state: Arc<watch::Sender<TaskState>>,
}

impl TaskHandle {
    fn new(id: TaskId, kind: TaskKind) -> Self {
        Self {
            id,
            kind,
            token: CancellationToken::new(),
            state: Arc::new(watch::Sender::new(TaskState::Pending)),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn tag(&self) -> Tag {
        self.kind.tag()
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Requests cancellation of this task.
    pub fn cancel(&self) {
        self.token.cancel();
        self.transition(TaskState::Cancelled);
    }

    /// Waits until the task reaches a terminal state.
    pub async fn finished(&self) -> TaskState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Moves to `next` unless already terminal; returns whether it moved.
    fn transition(&self, next: TaskState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = next;
            true
        })
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.id, self.kind)
    }
}

/// A registered task.
struct Entry {
    kind: TaskKind,
    target: TargetKey,
    quick: bool,
    handle: TaskHandle,
}

impl Entry {
    /// Whether a new identical submission may attach to this task. A quick
    /// submission is served by a full task, never the reverse.
    fn accepts_attach(&self, quick: bool) -> bool {
        (quick || !self.quick)
            && !self.handle.is_cancelled()
            && matches!(
                self.handle.state(),
                TaskState::Pending | TaskState::Running | TaskState::Completed
            )
    }
}

/// Tag -> registered tasks.
#[derive(Default)]
struct Registry {
    tasks: Mutex<HashMap<Tag, HashMap<TaskId, Entry>>>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<Tag, HashMap<TaskId, Entry>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, tag: Tag, id: TaskId) {
        if let Some(bucket) = self.lock().get_mut(&tag) {
            bucket.remove(&id);
        }
    }

    /// Cancels and unregisters every task under `tag` matching `predicate`.
    fn cancel_matching(&self, tag: Tag, predicate: impl Fn(&Entry) -> bool) -> usize {
        let mut tasks = self.lock();
        let Some(bucket) = tasks.get_mut(&tag) else {
            return 0;
        };
        let mut cancelled = 0;
        bucket.retain(|_, entry| {
            if !predicate(entry) {
                return true;
            }
            entry.handle.cancel();
            cancelled += 1;
            false
        });
        cancelled
    }
}

/// Keeps a task registered while it runs and while any result it posted is
/// still waiting in the UI queue.
pub(crate) struct Registration {
    registry: Arc<Registry>,
    tag: Tag,
    id: TaskId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.tag, self.id);
    }
}

struct Inner {
    sources: Arc<SourceRegistry>,
    trackers: Arc<TrackerRegistry>,
    cache: Arc<EntityCache>,
    reader: RwLock<ReaderConfig>,
    ui: UiDispatcher,
    registry: Arc<Registry>,
    /// Held while a load evaluates its preload window.
    preloading: Mutex<()>,
    next_id: AtomicU64,
    runtime: Handle,
}

/// Schedules, deduplicates and cancels background tasks.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct ContentLoader {
    inner: Arc<Inner>,
}

impl ContentLoader {
    /// Creates a loader that spawns its tasks on `runtime`.
    pub fn new(
        sources: Arc<SourceRegistry>,
        trackers: Arc<TrackerRegistry>,
        cache: Arc<EntityCache>,
        reader: ReaderConfig,
        ui: UiDispatcher,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sources,
                trackers,
                cache,
                reader: RwLock::new(reader),
                ui,
                registry: Arc::new(Registry::default()),
                preloading: Mutex::new(()),
                next_id: AtomicU64::new(1),
                runtime,
            }),
        }
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.inner.sources
    }

    pub fn trackers(&self) -> &TrackerRegistry {
        &self.inner.trackers
    }

    pub fn cache(&self) -> &EntityCache {
        &self.inner.cache
    }

    /// Replaces the preloading policy for windows evaluated from now on.
    pub fn set_reader_config(&self, reader: ReaderConfig) {
        *self.inner.reader.write().unwrap_or_else(|e| e.into_inner()) = reader;
    }

    /// Submits a task. Never rejects.
    ///
    /// If a task of the same kind for the same entity is registered, the
    /// kind's admission rule decides whether the new submission attaches to
    /// it, cancels it, or runs alongside it.
    pub fn submit(&self, task: Task) -> TaskHandle {
        let kind = task.kind();
        let tag = kind.tag();
        let target = task.target();
        let quick = task.is_quick();

        let handle = {
            let mut tasks = self.inner.registry.lock();
            let bucket = tasks.entry(tag).or_default();
            let admission = kind.admission();

            if matches!(admission, Admission::Supersede | Admission::Coalesce)
                && let Some(existing) = bucket
                    .values()
                    .find(|e| e.kind == kind && e.target == target && e.accepts_attach(quick))
            {
                tracing::debug!(task = %existing.handle, %target, "Attached to registered task");
                return existing.handle.clone();
            }

            if matches!(admission, Admission::Supersede | Admission::Replace) {
                bucket.retain(|_, entry| {
                    let stale = entry.kind == kind && entry.target.same_entity(&target);
                    if stale {
                        tracing::debug!(task = %entry.handle, target = %entry.target, "Superseded");
                        entry.handle.cancel();
                    }
                    !stale
                });
            }

            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let handle = TaskHandle::new(id, kind);
            bucket.insert(
                id,
                Entry {
                    kind,
                    target: target.clone(),
                    quick,
                    handle: handle.clone(),
                },
            );
            handle
        };

        tracing::debug!(task = %handle, %target, "Submitted");
        let registration = Arc::new(Registration {
            registry: Arc::clone(&self.inner.registry),
            tag,
            id: handle.id,
        });
        self.inner
            .runtime
            .spawn(run_task(self.clone(), task, handle.clone(), registration));
        handle
    }

    /// Cancels every task under `tag`; returns how many were registered.
    ///
    /// Bodies may still finish an in-flight cache write, but nothing they
    /// posted reaches the sink after this returns.
    pub fn cancel_by_tag(&self, tag: Tag) -> usize {
        let cancelled = self.inner.registry.cancel_matching(tag, |_| true);
        if cancelled > 0 {
            tracing::debug!(?tag, cancelled, "Cancelled by tag");
        }
        cancelled
    }

    /// Cancels the tasks under `tag` working on the same entity as `target`.
    pub fn cancel_target(&self, tag: Tag, target: &TargetKey) -> usize {
        self.inner
            .registry
            .cancel_matching(tag, |entry| entry.target.same_entity(target))
    }

    /// Leaves a chapter: cancels its page loads and preloads and frees its
    /// cached pages. Returns true if the chapter had cached slots.
    pub fn close_chapter(&self, chapter: &ChapterKey) -> bool {
        // Page targets of one chapter are the same entity whatever the page.
        let target = TargetKey::Page {
            chapter: chapter.clone(),
            page: 0,
        };
        let cancelled = self.cancel_target(Tag::PageLoad, &target);
        tracing::debug!(chapter = %chapter, cancelled, "Closing chapter");
        self.inner.cache.close_chapter(chapter)
    }

    /// Logs out of `tracker` and cancels a login in progress.
    pub fn deauthenticate(&self, tracker: &str) {
        self.inner.registry.cancel_matching(Tag::Tracker, |entry| {
            entry.kind == TaskKind::GenerateToken
                && matches!(&entry.target, TargetKey::Tracker { tracker: t, .. } if t == tracker)
        });
        self.inner.trackers.deauthenticate(tracker);
    }

    /// Posts `job` to run on the UI thread.
    pub fn run_later(&self, job: impl FnOnce(&mut dyn ResultSink) + Send + 'static) {
        self.inner.ui.run_later(job);
    }

    /// Number of registered tasks under `tag`.
    pub fn outstanding(&self, tag: Tag) -> usize {
        self.inner.registry.lock().get(&tag).map_or(0, HashMap::len)
    }

    /// Number of preloads for `chapter` that have not finished.
    pub fn preloads_outstanding(&self, chapter: &ChapterKey) -> usize {
        self.inner
            .registry
            .lock()
            .get(&Tag::PageLoad)
            .map_or(0, |bucket| {
                bucket
                    .values()
                    .filter(|e| {
                        e.kind == TaskKind::PreloadPage
                            && e.target.chapter() == Some(chapter)
                            && !e.handle.state().is_terminal()
                    })
                    .count()
            })
    }

    /// Evaluates the preload window after page `current` was shown.
    ///
    /// Preloads of this chapter outside the new window are cancelled and the
    /// window's pages are submitted in ascending order; pages already being
    /// preloaded attach to their running task.
    fn schedule_preloads(&self, chapter: &Chapter, current: usize, pages: &ChapterPages) {
        let limit = self
            .inner
            .reader
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .preload_limit();
        let window = pages.preload_window(current, limit);
        let key = chapter.key();

        let dropped = self
            .inner
            .registry
            .cancel_matching(Tag::PageLoad, |entry| {
                entry.kind == TaskKind::PreloadPage
                    && entry.target.chapter() == Some(&key)
                    && entry.target.page().is_some_and(|page| !window.contains(&page))
            });
        tracing::debug!(chapter = %key, current, ?window, dropped, "Preload window");

        for page in window {
            self.submit(Task::PreloadPage {
                chapter: chapter.clone(),
                page,
            });
        }
    }
}

/// Per-run view of the loader handed to task bodies.
struct TaskContext {
    loader: ContentLoader,
    token: CancellationToken,
    registration: Arc<Registration>,
}

impl TaskContext {
    /// Fails with `Cancelled` once the task's token fired.
    fn checkpoint(&self) -> Result<(), TaskError> {
        if self.token.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        Ok(())
    }

    fn loader(&self) -> &ContentLoader {
        &self.loader
    }

    fn cache(&self) -> &EntityCache {
        &self.loader.inner.cache
    }

    fn trackers(&self) -> &TrackerRegistry {
        &self.loader.inner.trackers
    }

    fn source(&self, id: &str) -> Result<Arc<dyn ContentSource>, TaskError> {
        self.loader
            .inner
            .sources
            .get(id)
            .ok_or_else(|| TaskError::UnknownSource(id.to_string()))
    }

    fn tracker(&self, id: &str) -> Result<Arc<dyn Tracker>, TaskError> {
        self.loader
            .inner
            .trackers
            .get(id)
            .ok_or_else(|| TaskError::UnknownTracker(id.to_string()))
    }

    /// Display name of a source or tracker, falling back to its id.
    fn plugin_name(&self, id: &str) -> String {
        if let Some(source) = self.loader.inner.sources.get(id) {
            return source.name().to_string();
        }
        if let Some(tracker) = self.loader.inner.trackers.get(id) {
            return tracker.name().to_string();
        }
        id.to_string()
    }

    /// Evaluates the preload window after page `current` was shown, unless
    /// this load was superseded.
    ///
    /// Windows are evaluated one at a time and the cancellation check happens
    /// inside, so a superseded load cannot submit preloads after the newer
    /// load has replaced the window.
    fn schedule_preloads(
        &self,
        chapter: &Chapter,
        current: usize,
        pages: &ChapterPages,
    ) -> Result<(), TaskError> {
        let _window = self
            .loader
            .inner
            .preloading
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        self.checkpoint()?;
        self.loader.schedule_preloads(chapter, current, pages);
        Ok(())
    }

    /// Posts `job` to the UI thread, tied to this task's cancellation.
    fn deliver(&self, job: impl FnOnce(&mut dyn ResultSink) + Send + 'static) {
        self.loader.inner.ui.post(Dispatch::guarded(
            self.token.clone(),
            Arc::clone(&self.registration),
            Box::new(job),
        ));
    }
}

async fn run_task(
    loader: ContentLoader,
    task: Task,
    handle: TaskHandle,
    registration: Arc<Registration>,
) {
    if !handle.transition(TaskState::Running) {
        tracing::debug!(task = %handle, "Cancelled before start");
        return;
    }

    let ctx = TaskContext {
        loader,
        token: handle.token.clone(),
        registration,
    };
    let outcome = tokio::select! {
        biased;
        () = handle.token.cancelled() => None,
        result = catch_task_panic(task.run(&ctx)) => Some(result),
    };

    let error = match outcome {
        None | Some(Ok(Err(TaskError::Cancelled))) => {
            handle.transition(TaskState::Cancelled);
            tracing::debug!(task = %handle, "Cancelled");
            return;
        }
        Some(Ok(Ok(()))) => {
            handle.transition(TaskState::Completed);
            tracing::debug!(task = %handle, "Completed");
            return;
        }
        Some(Ok(Err(e))) => e,
        Some(Err(panic)) => {
            tracing::error!(task = %handle, panic = %panic, "Task panicked");
            TaskError::Panicked(panic)
        }
    };

    if task.kind() == TaskKind::PreloadPage {
        tracing::debug!(task = %handle, target = %task.target(), error = %error, "Preload failed");
    } else {
        tracing::warn!(task = %handle, target = %task.target(), error = %error, "Task failed");
    }
    handle.transition(TaskState::Failed);
    if !handle.is_cancelled() {
        task.report_failure(&ctx, &error);
    }
}

/// Runs `future`, turning a panic into an error message.
async fn catch_task_panic<F, T>(future: F) -> Result<T, String>
where
    F: std::future::Future<Output = T>,
{
    AssertUnwindSafe(future).catch_unwind().await.map_err(|panic| {
        if let Some(s) = panic.downcast_ref::<&'static str>() {
            s.to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        }
    })
}
