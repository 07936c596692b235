//! Local directory source.
//!
//! Layout: `<root>/<series>/<chapter>/<page image>`. A series directory may
//! hold a `cover.*` image. Chapters and pages are ordered by name, with
//! embedded numbers compared numerically.

use super::ContentSource;
use crate::error::SourceError;
use crate::library::{Chapter, SearchResult, Series};
use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use std::cmp::Ordering;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

/// First number in a chapter directory name (`Chapter 12.5 - Title` -> 12.5).
static NUMBER_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").unwrap());

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif", "bmp"];

/// Source that reads series from a local directory tree.
pub struct FilesystemSource {
    root: PathBuf,
    domain: String,
}

impl FilesystemSource {
    pub fn new(root: PathBuf) -> Self {
        let domain = root.display().to_string();
        Self { root, domain }
    }

    /// Joins a relative key onto the root, rejecting keys that escape it.
    fn resolve(&self, key: &str) -> Result<PathBuf, SourceError> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(SourceError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn list(dir: &Path, want_dirs: bool) -> Result<Vec<PathBuf>, SourceError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::Unavailable(dir.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = entry.path();
            if want_dirs && file_type.is_dir() {
                paths.push(path);
            } else if !want_dirs && file_type.is_file() && is_image(&path) {
                paths.push(path);
            }
        }
        paths.sort_by(|a, b| natural_cmp(&file_name(a), &file_name(b)));
        Ok(paths)
    }

    async fn pages(&self, chapter: &Chapter) -> Result<Vec<PathBuf>, SourceError> {
        let dir = self.resolve(&chapter.id)?;
        Self::list(&dir, false).await
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Orders names so that `page2` sorts before `page10`.
fn natural_cmp(a: &str, b: &str) -> Ordering {
    let number = |s: &str| {
        NUMBER_REGEX
            .find(s)
            .and_then(|m| m.as_str().parse::<f64>().ok())
    };
    match (number(a), number(b)) {
        (Some(x), Some(y)) => x
            .partial_cmp(&y)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

#[async_trait]
impl ContentSource for FilesystemSource {
    fn id(&self) -> &'static str {
        "filesystem"
    }

    fn name(&self) -> &'static str {
        "Local Library"
    }

    fn domain(&self) -> &str {
        &self.domain
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, SourceError> {
        let needle = query.to_lowercase();
        Ok(Self::list(&self.root, true)
            .await?
            .iter()
            .map(|p| file_name(p))
            .filter(|name| name.to_lowercase().contains(&needle))
            .map(|name| SearchResult {
                source_id: "filesystem".to_string(),
                source_key: name.clone(),
                title: name,
                cover_url: None,
                description: None,
            })
            .collect())
    }

    async fn series(&self, source_key: &str, _quick: bool) -> Result<Series, SourceError> {
        let dir = self.resolve(source_key)?;
        if !tokio::fs::try_exists(&dir).await? {
            return Err(SourceError::Unavailable(dir.display().to_string()));
        }
        Ok(Series::new("filesystem", source_key, source_key))
    }

    async fn chapters(&self, series: &Series) -> Result<Vec<Chapter>, SourceError> {
        let dir = self.resolve(&series.source_key)?;
        Ok(Self::list(&dir, true)
            .await?
            .iter()
            .map(|path| {
                let name = file_name(path);
                let number = NUMBER_REGEX
                    .find(&name)
                    .and_then(|m| m.as_str().parse::<f32>().ok())
                    .unwrap_or(0.0);
                let mut chapter =
                    Chapter::new("filesystem", format!("{}/{}", series.source_key, name), number);
                chapter.title = name;
                chapter
            })
            .collect())
    }

    async fn cover(&self, source_key: &str) -> Result<Bytes, SourceError> {
        let dir = self.resolve(source_key)?;
        let cover = Self::list(&dir, false)
            .await?
            .into_iter()
            .find(|p| {
                p.file_stem()
                    .is_some_and(|stem| stem.eq_ignore_ascii_case("cover"))
            })
            .ok_or_else(|| SourceError::Unavailable(format!("no cover in {}", dir.display())))?;
        Ok(Bytes::from(tokio::fs::read(cover).await?))
    }

    async fn page_count(&self, chapter: &Chapter) -> Result<usize, SourceError> {
        Ok(self.pages(chapter).await?.len())
    }

    async fn page(&self, chapter: &Chapter, page: usize) -> Result<Bytes, SourceError> {
        let pages = self.pages(chapter).await?;
        let path = pages.get(page).ok_or(SourceError::PageOutOfRange {
            page,
            total: pages.len(),
        })?;
        Ok(Bytes::from(tokio::fs::read(path).await?))
    }
}
