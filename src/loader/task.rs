//! Task variants and their bodies.

use super::ui::{Notification, SeriesUpdate};
use super::{Tag, TargetKey, TaskContext};
use crate::cache::AssetKind;
use crate::error::{Failure, SourceError, TaskError};
use crate::library::{Chapter, Series, SeriesKey};
use crate::trackers::{Credentials, TrackerRegistry};
use std::fmt;

/// A unit of background work. Each variant carries its inputs.
#[derive(Debug, Clone)]
pub enum Task {
    /// Load a page the reader is showing; the result goes to the sink.
    LoadPage { chapter: Chapter, page: usize },

    /// Fetch a page into the cache ahead of the reader. Silent.
    PreloadPage { chapter: Chapter, page: usize },

    /// Refresh series metadata and its chapter listing.
    ReloadSeries { series: Series, quick: bool },

    LoadBanner { series: Series },

    LoadCover {
        source_id: String,
        source_key: String,
    },

    /// Exchange credentials for a tracker access token.
    GenerateToken {
        tracker: String,
        credentials: Credentials,
    },

    /// Raise the chapters-read count of `media_id` on a tracker.
    UpdateProgress {
        tracker: String,
        media_id: String,
        chapters_read: u32,
    },

    Search { source: String, query: String },
}

/// Operation kind of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    LoadPage,
    PreloadPage,
    ReloadSeries,
    LoadBanner,
    LoadCover,
    GenerateToken,
    UpdateProgress,
    Search,
}

/// What `submit` does when a task of the same kind for the same entity is
/// already registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Admission {
    /// An identical target attaches to the existing task; a different target
    /// on the same entity cancels it.
    Supersede,

    /// Every task on the same entity is cancelled.
    Replace,

    /// An identical target attaches to the existing task.
    Coalesce,

    /// No deduplication.
    Always,
}

impl TaskKind {
    pub fn tag(self) -> Tag {
        match self {
            TaskKind::LoadPage | TaskKind::PreloadPage => Tag::PageLoad,
            TaskKind::ReloadSeries => Tag::SeriesReload,
            TaskKind::LoadBanner => Tag::Banner,
            TaskKind::LoadCover => Tag::Cover,
            TaskKind::GenerateToken | TaskKind::UpdateProgress => Tag::Tracker,
            TaskKind::Search => Tag::Search,
        }
    }

    pub(super) fn admission(self) -> Admission {
        match self {
            TaskKind::LoadPage | TaskKind::Search => Admission::Supersede,
            TaskKind::GenerateToken => Admission::Replace,
            TaskKind::UpdateProgress => Admission::Always,
            TaskKind::PreloadPage
            | TaskKind::ReloadSeries
            | TaskKind::LoadBanner
            | TaskKind::LoadCover => Admission::Coalesce,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TaskKind::LoadPage => "load page",
            TaskKind::PreloadPage => "preload page",
            TaskKind::ReloadSeries => "reload series",
            TaskKind::LoadBanner => "load banner",
            TaskKind::LoadCover => "load cover",
            TaskKind::GenerateToken => "log in",
            TaskKind::UpdateProgress => "update progress",
            TaskKind::Search => "search",
        };
        f.write_str(text)
    }
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::LoadPage { .. } => TaskKind::LoadPage,
            Task::PreloadPage { .. } => TaskKind::PreloadPage,
            Task::ReloadSeries { .. } => TaskKind::ReloadSeries,
            Task::LoadBanner { .. } => TaskKind::LoadBanner,
            Task::LoadCover { .. } => TaskKind::LoadCover,
            Task::GenerateToken { .. } => TaskKind::GenerateToken,
            Task::UpdateProgress { .. } => TaskKind::UpdateProgress,
            Task::Search { .. } => TaskKind::Search,
        }
    }

    pub fn tag(&self) -> Tag {
        self.kind().tag()
    }

    /// The entity instance this task works on.
    pub fn target(&self) -> TargetKey {
        match self {
            Task::LoadPage { chapter, page } | Task::PreloadPage { chapter, page } => {
                TargetKey::Page {
                    chapter: chapter.key(),
                    page: *page,
                }
            }
            Task::ReloadSeries { series, .. } | Task::LoadBanner { series } => {
                TargetKey::Series(series.key())
            }
            Task::LoadCover {
                source_id,
                source_key,
            } => TargetKey::Series(SeriesKey::new(source_id, source_key)),
            Task::GenerateToken { tracker, .. } => TargetKey::Tracker {
                tracker: tracker.clone(),
                media: None,
            },
            Task::UpdateProgress {
                tracker, media_id, ..
            } => TargetKey::Tracker {
                tracker: tracker.clone(),
                media: Some(media_id.clone()),
            },
            Task::Search { source, query } => TargetKey::Search {
                source: source.clone(),
                query: query.clone(),
            },
        }
    }

    /// Whether this is a quick series reload.
    pub(super) fn is_quick(&self) -> bool {
        matches!(self, Task::ReloadSeries { quick: true, .. })
    }

    /// Id of the source or tracker this task calls.
    fn plugin_id(&self) -> &str {
        match self {
            Task::LoadPage { chapter, .. } | Task::PreloadPage { chapter, .. } => {
                &chapter.source_id
            }
            Task::ReloadSeries { series, .. } | Task::LoadBanner { series } => &series.source_id,
            Task::LoadCover { source_id, .. } => source_id,
            Task::GenerateToken { tracker, .. } | Task::UpdateProgress { tracker, .. } => tracker,
            Task::Search { source, .. } => source,
        }
    }

    pub(super) async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        match self {
            Task::LoadPage { chapter, page } => load_page(ctx, chapter, *page).await,
            Task::PreloadPage { chapter, page } => preload_page(ctx, chapter, *page).await,
            Task::ReloadSeries { series, quick } => reload_series(ctx, series, *quick).await,
            Task::LoadBanner { series } => load_banner(ctx, series).await,
            Task::LoadCover {
                source_id,
                source_key,
            } => load_cover(ctx, source_id, source_key).await,
            Task::GenerateToken {
                tracker,
                credentials,
            } => generate_token(ctx, tracker, credentials).await,
            Task::UpdateProgress {
                tracker,
                media_id,
                chapters_read,
            } => update_progress(ctx, tracker, media_id, *chapters_read).await,
            Task::Search { source, query } => search(ctx, source, query).await,
        }
    }

    /// Tells the UI about a failed (not cancelled) task.
    pub(super) fn report_failure(&self, ctx: &TaskContext, error: &TaskError) {
        let failure = error.classify();
        match self {
            // Preloads are speculative; the runner has logged the failure.
            Task::PreloadPage { .. } => {}
            Task::LoadPage { chapter, page } => {
                let key = chapter.key();
                let page = *page;
                ctx.deliver(move |sink| sink.page_failed(&key, page, failure));
            }
            Task::ReloadSeries { series, .. } => {
                let key = series.key();
                ctx.deliver(move |sink| sink.series_reloaded(&key, SeriesUpdate::Failed(failure)));
                self.notify(ctx, failure, error.to_string());
            }
            Task::GenerateToken { tracker, .. } => {
                let state = ctx.trackers().state(tracker);
                let tracker = tracker.clone();
                let message = error.to_string();
                ctx.deliver(move |sink| sink.tracker_status(&tracker, state, Some(message)));
                self.notify(ctx, failure, error.to_string());
            }
            _ => self.notify(ctx, failure, error.to_string()),
        }
    }

    /// Posts a notification, or a capability signal for `Unsupported`.
    fn notify(&self, ctx: &TaskContext, failure: Failure, message: String) {
        let operation = self.kind();
        let plugin = ctx.plugin_name(self.plugin_id());
        if failure.is_user_visible() {
            ctx.deliver(move |sink| {
                sink.notify(Notification {
                    operation,
                    plugin,
                    failure,
                    message,
                })
            });
        } else {
            ctx.deliver(move |sink| sink.unsupported(operation, &plugin));
        }
    }
}

async fn load_page(ctx: &TaskContext, chapter: &Chapter, page: usize) -> Result<(), TaskError> {
    let key = chapter.key();
    let source = ctx.source(&chapter.source_id)?;

    let pages = match ctx.cache().chapter(&key) {
        Some(pages) => pages,
        None => {
            ctx.checkpoint()?;
            let count = source.page_count(chapter).await?;
            ctx.cache().open_chapter(&key, count)
        }
    };
    if page >= pages.len() {
        return Err(SourceError::PageOutOfRange {
            page,
            total: pages.len(),
        }
        .into());
    }

    let image = match pages.get(page) {
        Some(image) => {
            tracing::debug!(chapter = %key, page, "Page served from cache");
            image
        }
        None => {
            ctx.checkpoint()?;
            let image = source.page(chapter, page).await?;
            ctx.checkpoint()?;
            pages.store(page, image.clone());
            // A concurrent preload may have won the slot.
            pages.get(page).unwrap_or(image)
        }
    };

    let page_count = pages.len();
    let sink_key = key.clone();
    ctx.deliver(move |sink| sink.page_loaded(&sink_key, page, page_count, image));

    ctx.schedule_preloads(chapter, page, &pages)
}

async fn preload_page(ctx: &TaskContext, chapter: &Chapter, page: usize) -> Result<(), TaskError> {
    let key = chapter.key();
    // The chapter was closed since this preload was scheduled.
    let Some(pages) = ctx.cache().chapter(&key) else {
        return Ok(());
    };
    if pages.is_cached(page) {
        return Ok(());
    }

    let source = ctx.source(&chapter.source_id)?;
    ctx.checkpoint()?;
    let image = source.page(chapter, page).await?;
    ctx.checkpoint()?;
    if pages.store(page, image) {
        tracing::debug!(chapter = %key, page, "Preloaded page");
    }
    Ok(())
}

async fn reload_series(ctx: &TaskContext, series: &Series, quick: bool) -> Result<(), TaskError> {
    let source = ctx.source(&series.source_id)?;
    ctx.checkpoint()?;
    let fresh = source.series(&series.source_key, quick).await?;

    ctx.checkpoint()?;
    let update = match source.chapters(&fresh).await {
        Ok(chapters) => SeriesUpdate::Refreshed {
            series: fresh.clone(),
            chapters,
        },
        Err(e) => {
            let failure = e.classify();
            tracing::warn!(series = %series.key(), error = %e, "Chapter listing failed");
            let plugin = source.name().to_string();
            let message = e.to_string();
            ctx.deliver(move |sink| {
                sink.notify(Notification {
                    operation: TaskKind::ReloadSeries,
                    plugin,
                    failure,
                    message,
                })
            });
            SeriesUpdate::MetadataOnly {
                series: fresh.clone(),
                failure,
            }
        }
    };

    ctx.checkpoint()?;
    let key = series.key();
    ctx.deliver(move |sink| sink.series_reloaded(&key, update));

    let mut banner_series = series.clone();
    banner_series.merge_metadata(&fresh);
    ctx.loader().submit(Task::LoadBanner {
        series: banner_series,
    });
    Ok(())
}

async fn load_banner(ctx: &TaskContext, series: &Series) -> Result<(), TaskError> {
    let key = series.key();
    let image = match ctx.cache().series_asset(&key, AssetKind::Banner) {
        Some(image) => image,
        None => {
            let source = ctx.source(&series.source_id)?;
            ctx.checkpoint()?;
            let image = source.banner(series).await?;
            ctx.checkpoint()?;
            ctx.cache()
                .store_series_asset(&key, AssetKind::Banner, image.clone());
            image
        }
    };
    ctx.deliver(move |sink| sink.banner_loaded(&key, image));
    Ok(())
}

async fn load_cover(ctx: &TaskContext, source_id: &str, source_key: &str) -> Result<(), TaskError> {
    let key = SeriesKey::new(source_id, source_key);
    let image = match ctx.cache().series_asset(&key, AssetKind::Cover) {
        Some(image) => image,
        None => {
            let source = ctx.source(source_id)?;
            ctx.checkpoint()?;
            let image = source.cover(source_key).await?;
            ctx.checkpoint()?;
            ctx.cache()
                .store_series_asset(&key, AssetKind::Cover, image.clone());
            image
        }
    };
    ctx.deliver(move |sink| sink.cover_loaded(&key, image));
    Ok(())
}

/// An in-progress token exchange. Dropping it unfinished (cancellation or
/// panic) abandons the attempt.
struct AuthAttempt<'a> {
    trackers: &'a TrackerRegistry,
    tracker: &'a str,
    attempt: u64,
    finished: bool,
}

impl<'a> AuthAttempt<'a> {
    fn begin(trackers: &'a TrackerRegistry, tracker: &'a str) -> Self {
        let attempt = trackers.begin_authentication(tracker);
        Self {
            trackers,
            tracker,
            attempt,
            finished: false,
        }
    }

    fn finish(mut self, authenticated: bool) -> crate::trackers::SessionState {
        self.finished = true;
        self.trackers
            .finish_authentication(self.tracker, self.attempt, authenticated)
    }
}

impl Drop for AuthAttempt<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.trackers
                .abandon_authentication(self.tracker, self.attempt);
        }
    }
}

async fn generate_token(
    ctx: &TaskContext,
    tracker_id: &str,
    credentials: &Credentials,
) -> Result<(), TaskError> {
    let tracker = ctx.tracker(tracker_id)?;
    let attempt = AuthAttempt::begin(ctx.trackers(), tracker_id);
    let id = tracker_id.to_string();
    let state = ctx.trackers().state(tracker_id);
    ctx.deliver(move |sink| sink.tracker_status(&id, state, None));

    ctx.checkpoint()?;
    let result = tracker.generate_token(credentials).await;
    ctx.checkpoint()?;
    let state = attempt.finish(result.is_ok());
    result?;

    let message = match tracker.authenticated_user_name().await {
        Ok(name) => Some(format!("Logged in as {name}")),
        Err(e) => {
            tracing::debug!(tracker = tracker_id, error = %e, "Could not fetch user name");
            None
        }
    };
    tracing::info!(tracker = tracker_id, "Tracker authenticated");
    let id = tracker_id.to_string();
    ctx.deliver(move |sink| sink.tracker_status(&id, state, message));
    Ok(())
}

async fn update_progress(
    ctx: &TaskContext,
    tracker_id: &str,
    media_id: &str,
    chapters_read: u32,
) -> Result<(), TaskError> {
    let tracker = ctx.tracker(tracker_id)?;
    ctx.checkpoint()?;
    let update = ctx
        .trackers()
        .update_chapters_read(tracker.as_ref(), media_id, chapters_read)
        .await?;
    tracing::debug!(tracker = tracker_id, media_id, ?update, "Progress update finished");

    let id = tracker_id.to_string();
    let media = media_id.to_string();
    ctx.deliver(move |sink| sink.progress_updated(&id, &media, update));
    Ok(())
}

async fn search(ctx: &TaskContext, source_id: &str, query: &str) -> Result<(), TaskError> {
    let source = ctx.source(source_id)?;
    ctx.checkpoint()?;
    let results = source.search(query).await?;
    ctx.checkpoint()?;

    let source = source_id.to_string();
    let query = query.to_string();
    ctx.deliver(move |sink| sink.search_results(&source, &query, results));
    Ok(())
}
