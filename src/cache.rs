//! In-memory entity cache for page images and series artwork.
//!
//! Worker tasks write into the cache while the UI thread reads from it. Every
//! slot is a write-once cell: the first writer publishes the full buffer in a
//! single step and later writes for the same slot are no-ops, so a reader sees
//! either nothing or the complete image.

use crate::library::{ChapterKey, SeriesKey};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

/// Page slots of one open chapter.
#[derive(Debug)]
pub struct ChapterPages {
    slots: Box<[OnceLock<Bytes>]>,
}

impl ChapterPages {
    fn new(page_count: usize) -> Self {
        Self {
            slots: (0..page_count).map(|_| OnceLock::new()).collect(),
        }
    }

    /// Number of pages in the chapter.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns the cached image for `page`, if populated.
    pub fn get(&self, page: usize) -> Option<Bytes> {
        self.slots.get(page)?.get().cloned()
    }

    pub fn is_cached(&self, page: usize) -> bool {
        self.slots.get(page).is_some_and(|slot| slot.get().is_some())
    }

    /// Publishes `image` into the slot for `page`.
    ///
    /// Returns true if this call populated the slot, false if it was already
    /// populated or `page` is out of range.
    pub fn store(&self, page: usize, image: Bytes) -> bool {
        match self.slots.get(page) {
            Some(slot) => slot.set(image).is_ok(),
            None => false,
        }
    }

    /// Number of populated slots.
    pub fn cached_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.get().is_some()).count()
    }

    /// Pages worth preloading after `current`.
    ///
    /// With no limit this is every uncached page of the chapter other than
    /// `current`; with a limit of `k` it is the next `k` uncached pages after
    /// `current`, ascending.
    pub fn preload_window(&self, current: usize, limit: Option<usize>) -> Vec<usize> {
        match limit {
            None => (0..self.len())
                .filter(|&page| page != current && !self.is_cached(page))
                .collect(),
            Some(k) => (current.saturating_add(1)..self.len())
                .filter(|&page| !self.is_cached(page))
                .take(k)
                .collect(),
        }
    }
}

/// Kind of series-level artwork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Cover,
    Banner,
}

#[derive(Debug, Default)]
struct SeriesAssets {
    cover: OnceLock<Bytes>,
    banner: OnceLock<Bytes>,
}

impl SeriesAssets {
    fn slot(&self, kind: AssetKind) -> &OnceLock<Bytes> {
        match kind {
            AssetKind::Cover => &self.cover,
            AssetKind::Banner => &self.banner,
        }
    }
}

/// Cache of chapter pages and series artwork shared by workers and the UI.
#[derive(Debug, Default)]
pub struct EntityCache {
    chapters: Mutex<HashMap<ChapterKey, Arc<ChapterPages>>>,
    series: Mutex<HashMap<SeriesKey, Arc<SeriesAssets>>>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the slots for `chapter`, creating `page_count` empty ones if
    /// the chapter is not open yet.
    pub fn open_chapter(&self, chapter: &ChapterKey, page_count: usize) -> Arc<ChapterPages> {
        let mut chapters = lock(&self.chapters);
        chapters
            .entry(chapter.clone())
            .or_insert_with(|| {
                tracing::debug!(chapter = %chapter, page_count, "Opening chapter slots");
                Arc::new(ChapterPages::new(page_count))
            })
            .clone()
    }

    /// Returns the slots for `chapter` if it is open.
    pub fn chapter(&self, chapter: &ChapterKey) -> Option<Arc<ChapterPages>> {
        lock(&self.chapters).get(chapter).cloned()
    }

    /// Convenience lookup of a single page.
    pub fn page(&self, chapter: &ChapterKey, page: usize) -> Option<Bytes> {
        self.chapter(chapter)?.get(page)
    }

    /// Frees all slots of `chapter`.
    ///
    /// Workers still holding the old slots write into a detached array that
    /// is dropped with them. Returns true if the chapter was open.
    pub fn close_chapter(&self, chapter: &ChapterKey) -> bool {
        let removed = lock(&self.chapters).remove(chapter).is_some();
        if removed {
            tracing::debug!(chapter = %chapter, "Freed chapter slots");
        }
        removed
    }

    pub fn series_asset(&self, series: &SeriesKey, kind: AssetKind) -> Option<Bytes> {
        lock(&self.series)
            .get(series)
            .and_then(|assets| assets.slot(kind).get().cloned())
    }

    /// Publishes artwork for `series`; returns false if already populated.
    pub fn store_series_asset(&self, series: &SeriesKey, kind: AssetKind, image: Bytes) -> bool {
        let assets = lock(&self.series).entry(series.clone()).or_default().clone();
        assets.slot(kind).set(image).is_ok()
    }

    /// Drops cached artwork for `series`, e.g. when it leaves the library.
    pub fn forget_series(&self, series: &SeriesKey) {
        lock(&self.series).remove(series);
    }
}

/// Locks a cache map, recovering from poisoning.
///
/// The maps only hold `Arc`s to write-once slots, so a panic while the lock
/// was held cannot leave a slot half-written.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ChapterKey {
        ChapterKey::new("test", "ch-1")
    }

    #[test]
    fn test_slots_start_empty() {
        let cache = EntityCache::new();
        let pages = cache.open_chapter(&key(), 4);
        assert_eq!(pages.len(), 4);
        assert_eq!(pages.cached_count(), 0);
        assert!(pages.get(0).is_none());
        assert!(pages.get(99).is_none());
    }

    #[test]
    fn test_first_writer_wins() {
        let cache = EntityCache::new();
        let pages = cache.open_chapter(&key(), 2);

        assert!(pages.store(1, Bytes::from_static(b"first")));
        assert!(!pages.store(1, Bytes::from_static(b"second")));
        assert_eq!(pages.get(1).unwrap(), Bytes::from_static(b"first"));
        assert!(!pages.store(5, Bytes::from_static(b"out of range")));
    }

    #[test]
    fn test_open_returns_existing_slots() {
        let cache = EntityCache::new();
        let first = cache.open_chapter(&key(), 3);
        first.store(0, Bytes::from_static(b"page"));

        let second = cache.open_chapter(&key(), 3);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.page(&key(), 0).unwrap(), Bytes::from_static(b"page"));
    }

    #[test]
    fn test_close_frees_slots() {
        let cache = EntityCache::new();
        let pages = cache.open_chapter(&key(), 3);
        pages.store(0, Bytes::from_static(b"page"));

        assert!(cache.close_chapter(&key()));
        assert!(cache.chapter(&key()).is_none());
        assert!(!cache.close_chapter(&key()));

        // A late write lands in the detached array only.
        pages.store(1, Bytes::from_static(b"late"));
        let reopened = cache.open_chapter(&key(), 3);
        assert_eq!(reopened.cached_count(), 0);
    }

    #[test]
    fn test_restricted_window_skips_cached() {
        let cache = EntityCache::new();
        let pages = cache.open_chapter(&key(), 6);
        pages.store(2, Bytes::from_static(b"x"));

        assert_eq!(pages.preload_window(0, Some(2)), vec![1, 3]);
        assert_eq!(pages.preload_window(4, Some(3)), vec![5]);
        assert!(pages.preload_window(5, Some(2)).is_empty());
    }

    #[test]
    fn test_unrestricted_window_covers_whole_chapter() {
        let cache = EntityCache::new();
        let pages = cache.open_chapter(&key(), 5);
        pages.store(0, Bytes::from_static(b"x"));
        pages.store(3, Bytes::from_static(b"x"));

        assert_eq!(pages.preload_window(2, None), vec![1, 4]);
    }

    #[test]
    fn test_series_assets() {
        let cache = EntityCache::new();
        let series = SeriesKey::new("test", "s1");

        assert!(cache.series_asset(&series, AssetKind::Banner).is_none());
        assert!(cache.store_series_asset(&series, AssetKind::Banner, Bytes::from_static(b"b")));
        assert!(!cache.store_series_asset(&series, AssetKind::Banner, Bytes::from_static(b"c")));
        assert!(cache.series_asset(&series, AssetKind::Cover).is_none());
        assert_eq!(
            cache.series_asset(&series, AssetKind::Banner).unwrap(),
            Bytes::from_static(b"b")
        );

        cache.forget_series(&series);
        assert!(cache.series_asset(&series, AssetKind::Banner).is_none());
    }
}
