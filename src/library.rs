//! Library model: series, chapters, categories, and their JSON document.
//!
//! The document has a top-level `library` array of series (each with nested
//! chapters) and a `categories` tree. The loader never touches the file; it
//! receives and hands back fully materialized [`Series`] and [`Chapter`] values.

use crate::error::LibraryError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Identifies a series within one content source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub source_id: String,
    pub source_key: String,
}

impl SeriesKey {
    pub fn new(source_id: impl Into<String>, source_key: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            source_key: source_key.into(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_id, self.source_key)
    }
}

/// Identifies a chapter within one content source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChapterKey {
    pub source_id: String,
    pub chapter_id: String,
}

impl ChapterKey {
    pub fn new(source_id: impl Into<String>, chapter_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            chapter_id: chapter_id.into(),
        }
    }
}

impl fmt::Display for ChapterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_id, self.chapter_id)
    }
}

/// A search hit returned by a content source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Id of the source that produced this result.
    pub source_id: String,

    /// Key the source uses to resolve the series.
    pub source_key: String,

    pub title: String,

    /// Cover thumbnail URL, if the source lists one.
    pub cover_url: Option<String>,

    pub description: Option<String>,
}

impl SearchResult {
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(&self.source_id, &self.source_key)
    }
}

/// A single chapter of a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    /// Id of the source this chapter is fetched from.
    pub source_id: String,

    /// Source-specific chapter identifier (an id or a relative URL).
    pub id: String,

    pub title: String,

    /// Chapter number as published; fractional for extras (e.g. 10.5).
    pub number: f32,

    pub volume: Option<String>,

    pub language: Option<String>,

    /// Scanlation group or publisher.
    pub group: Option<String>,

    /// Whether the user finished this chapter.
    #[serde(default)]
    pub read: bool,

    /// Last page the reader showed (0-based).
    #[serde(default)]
    pub current_page: usize,

    /// Total pages, once known.
    #[serde(default)]
    pub total_pages: Option<usize>,
}

impl Chapter {
    pub fn new(source_id: impl Into<String>, id: impl Into<String>, number: f32) -> Self {
        Self {
            source_id: source_id.into(),
            id: id.into(),
            title: String::new(),
            number,
            volume: None,
            language: None,
            group: None,
            read: false,
            current_page: 0,
            total_pages: None,
        }
    }

    pub fn key(&self) -> ChapterKey {
        ChapterKey::new(&self.source_id, &self.id)
    }
}

/// A series in the library or freshly resolved from a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub source_id: String,
    pub source_key: String,
    pub title: String,

    #[serde(default)]
    pub alt_titles: Vec<String>,

    pub author: Option<String>,
    pub artist: Option<String>,
    pub status: Option<String>,
    pub description: Option<String>,

    /// Cover image URL as reported by the source.
    pub cover_url: Option<String>,

    /// Tracker id -> tracker-side media id.
    #[serde(default)]
    pub tracker_ids: BTreeMap<String, String>,

    /// Names of user categories this series is filed under.
    #[serde(default)]
    pub categories: Vec<String>,

    #[serde(default)]
    pub chapters: Vec<Chapter>,
}

impl Series {
    pub fn new(
        source_id: impl Into<String>,
        source_key: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            source_key: source_key.into(),
            title: title.into(),
            alt_titles: Vec::new(),
            author: None,
            artist: None,
            status: None,
            description: None,
            cover_url: None,
            tracker_ids: BTreeMap::new(),
            categories: Vec::new(),
            chapters: Vec::new(),
        }
    }

    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(&self.source_id, &self.source_key)
    }

    /// Replaces source-provided metadata, keeping user state.
    ///
    /// Tracker links, categories and chapters are left untouched.
    pub fn merge_metadata(&mut self, fresh: &Series) {
        self.title = fresh.title.clone();
        self.alt_titles = fresh.alt_titles.clone();
        self.author = fresh.author.clone();
        self.artist = fresh.artist.clone();
        self.status = fresh.status.clone();
        self.description = fresh.description.clone();
        self.cover_url = fresh.cover_url.clone();
    }

    /// Merges a freshly fetched chapter listing into this series.
    ///
    /// Chapters are matched by id. Known chapters keep their reading state;
    /// unknown ones are appended. Returns the number of new chapters.
    pub fn merge_chapters(&mut self, fresh: Vec<Chapter>) -> usize {
        let mut added = 0;
        for chapter in fresh {
            match self.chapters.iter_mut().find(|c| c.id == chapter.id) {
                Some(existing) => {
                    existing.title = chapter.title;
                    existing.number = chapter.number;
                    existing.volume = chapter.volume;
                    existing.language = chapter.language;
                    existing.group = chapter.group;
                    if chapter.total_pages.is_some() {
                        existing.total_pages = chapter.total_pages;
                    }
                }
                None => {
                    self.chapters.push(chapter);
                    added += 1;
                }
            }
        }
        added
    }

    /// Highest whole chapter number marked as read, as trackers count it.
    pub fn chapters_read_count(&self) -> u32 {
        self.chapters
            .iter()
            .filter(|c| c.read && c.number.is_finite() && c.number >= 0.0)
            .map(|c| c.number.floor() as u32)
            .max()
            .unwrap_or(0)
    }

    pub fn chapter(&self, id: &str) -> Option<&Chapter> {
        self.chapters.iter().find(|c| c.id == id)
    }

    pub fn chapter_mut(&mut self, id: &str) -> Option<&mut Chapter> {
        self.chapters.iter_mut().find(|c| c.id == id)
    }
}

/// A user category; categories form a tree under the library root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,

    #[serde(default)]
    pub subcategories: Vec<Category>,
}

impl Category {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subcategories: Vec::new(),
        }
    }

    /// Category names must not be empty or whitespace.
    pub fn name_is_valid(name: &str) -> bool {
        !name.trim().is_empty()
    }

    pub fn add_subcategory(&mut self, category: Category) {
        self.subcategories.push(category);
    }

    /// Finds a category in this subtree by case-insensitive name.
    pub fn find(&self, name: &str) -> Option<&Category> {
        if self.name.eq_ignore_ascii_case(name) {
            return Some(self);
        }
        self.subcategories.iter().find_map(|c| c.find(name))
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Category> {
        if self.name.eq_ignore_ascii_case(name) {
            return Some(self);
        }
        self.subcategories.iter_mut().find_map(|c| c.find_mut(name))
    }
}

impl Default for Category {
    fn default() -> Self {
        Self::new("All Series")
    }
}

/// The user's library.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Library {
    #[serde(rename = "library")]
    pub series: Vec<Series>,

    #[serde(rename = "categories")]
    pub root_category: Category,
}

impl Library {
    /// Adds a series, merging into an existing entry with the same key.
    ///
    /// Returns true if the series was not in the library before.
    pub fn add_series(&mut self, series: Series) -> bool {
        match self.find_series_mut(&series.key()) {
            Some(existing) => {
                existing.merge_metadata(&series);
                existing.merge_chapters(series.chapters);
                false
            }
            None => {
                self.series.push(series);
                true
            }
        }
    }

    pub fn remove_series(&mut self, key: &SeriesKey) -> Option<Series> {
        let index = self.series.iter().position(|s| s.key() == *key)?;
        Some(self.series.remove(index))
    }

    pub fn find_series(&self, key: &SeriesKey) -> Option<&Series> {
        self.series.iter().find(|s| s.key() == *key)
    }

    pub fn find_series_mut(&mut self, key: &SeriesKey) -> Option<&mut Series> {
        self.series.iter_mut().find(|s| s.key() == *key)
    }

    /// Loads a library document; a missing file yields an empty library.
    pub fn load_from(path: &Path) -> Result<Self, LibraryError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Writes the library document, replacing the file atomically.
    pub fn save_to(&self, path: &Path) -> Result<(), LibraryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string(self)?;
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}
