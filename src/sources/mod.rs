//! Content source trait and plugin registry.
//!
//! A content source knows how to search one remote site (or local directory)
//! and fetch series metadata, chapter listings, covers and page images from it.
//! Sources are looked up by their stable [`ContentSource::id`].

mod filesystem;
mod mangadex;
mod mangahere;

pub use filesystem::FilesystemSource;
pub use mangadex::MangaDexSource;
pub use mangahere::MangaHereSource;

use crate::config::{Config, NetworkConfig};
use crate::error::SourceError;
use crate::library::{Chapter, SearchResult, Series};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Trait for content source plugins.
///
/// Operations a plugin does not implement keep the default body and report
/// [`SourceError::Unsupported`].
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Returns the stable identifier stored in the library.
    fn id(&self) -> &'static str;

    /// Returns the human-readable name of this source.
    fn name(&self) -> &'static str;

    /// Returns the domain (or location) this source reads from.
    fn domain(&self) -> &str;

    /// Searches the source for series matching `query`.
    async fn search(&self, _query: &str) -> Result<Vec<SearchResult>, SourceError> {
        Err(SourceError::Unsupported("search"))
    }

    /// Resolves series metadata.
    ///
    /// With `quick` set, the source may skip secondary requests (credits,
    /// alternate titles) and return only what the primary request provides.
    async fn series(&self, source_key: &str, quick: bool) -> Result<Series, SourceError>;

    /// Fetches the chapter listing of `series`.
    async fn chapters(&self, series: &Series) -> Result<Vec<Chapter>, SourceError>;

    /// Fetches the cover image for a series.
    async fn cover(&self, _source_key: &str) -> Result<Bytes, SourceError> {
        Err(SourceError::Unsupported("cover"))
    }

    /// Fetches a wide banner image for a series.
    async fn banner(&self, _series: &Series) -> Result<Bytes, SourceError> {
        Err(SourceError::Unsupported("banner"))
    }

    /// Returns the number of pages in `chapter`.
    async fn page_count(&self, chapter: &Chapter) -> Result<usize, SourceError>;

    /// Fetches the image for page `page` (0-based) of `chapter`.
    async fn page(&self, chapter: &Chapter, page: usize) -> Result<Bytes, SourceError>;
}

/// Registry of available content sources.
///
/// Created once at start-up and read from every task; adding or removing a
/// plugin takes the write lock.
#[derive(Default)]
pub struct SourceRegistry {
    sources: RwLock<Vec<Arc<dyn ContentSource>>>,
}

impl SourceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the bundled sources.
    ///
    /// The filesystem source is only registered when a local library
    /// directory is configured.
    pub fn with_defaults(config: &Config) -> Result<Self, SourceError> {
        let registry = Self::new();
        registry.register(Arc::new(MangaDexSource::new(&config.network)?));
        registry.register(Arc::new(MangaHereSource::new(&config.network)?));
        if let Some(root) = &config.paths.local_library {
            registry.register(Arc::new(FilesystemSource::new(root.clone())));
        }
        Ok(registry)
    }

    /// Adds a source, replacing any source with the same id.
    pub fn register(&self, source: Arc<dyn ContentSource>) {
        let mut sources = self.write();
        sources.retain(|s| s.id() != source.id());
        tracing::debug!(source = source.id(), "Registered content source");
        sources.push(source);
    }

    /// Removes the source with `id`, returning it if present.
    pub fn remove(&self, id: &str) -> Option<Arc<dyn ContentSource>> {
        let mut sources = self.write();
        let index = sources.iter().position(|s| s.id() == id)?;
        Some(sources.remove(index))
    }

    /// Finds the source registered under `id`.
    pub fn get(&self, id: &str) -> Option<Arc<dyn ContentSource>> {
        self.read().iter().find(|s| s.id() == id).cloned()
    }

    /// Returns all registered sources.
    pub fn all(&self) -> Vec<Arc<dyn ContentSource>> {
        self.read().clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<dyn ContentSource>>> {
        self.sources.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<dyn ContentSource>>> {
        self.sources.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Common HTTP client configuration for sources.
pub fn create_http_client(network: &NetworkConfig) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .user_agent(network.user_agent.clone())
        .cookie_store(true);
    if let Some(timeout) = network.request_timeout() {
        builder = builder.timeout(timeout);
    }
    builder.build()
}

/// Applies rate limiting delay.
pub async fn rate_limit(delay_sec: f64) {
    if delay_sec > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(delay_sec)).await;
    }
}

/// Turns a non-success response into a [`SourceError`].
///
/// Statuses that mean the content is gone become `Unavailable`.
pub fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SourceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if matches!(status.as_u16(), 404 | 410 | 451) {
        return Err(SourceError::Unavailable(format!(
            "{} returned {}",
            response.url(),
            status
        )));
    }
    match response.error_for_status() {
        Err(e) => Err(SourceError::HttpError(e)),
        Ok(response) => Ok(response),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockSource;

    #[test]
    fn test_registry_lookup_by_id() {
        let registry = SourceRegistry::new();
        registry.register(Arc::new(MockSource::new("alpha", 3)));
        registry.register(Arc::new(MockSource::new("beta", 3)));

        assert_eq!(registry.get("beta").unwrap().id(), "beta");
        assert!(registry.get("gamma").is_none());
        assert_eq!(registry.all().len(), 2);
    }

    #[test]
    fn test_register_replaces_same_id() {
        let registry = SourceRegistry::new();
        registry.register(Arc::new(MockSource::new("alpha", 3)));
        registry.register(Arc::new(MockSource::new("alpha", 7)));
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn test_remove() {
        let registry = SourceRegistry::new();
        registry.register(Arc::new(MockSource::new("alpha", 3)));
        assert!(registry.remove("alpha").is_some());
        assert!(registry.remove("alpha").is_none());
        assert!(registry.get("alpha").is_none());
    }

    #[test]
    fn test_defaults_without_local_library() {
        let registry = SourceRegistry::with_defaults(&Config::default()).unwrap();
        assert!(registry.get("mangadex").is_some());
        assert!(registry.get("mangahere").is_some());
        assert!(registry.get("filesystem").is_none());
    }

    #[tokio::test]
    async fn test_unsupported_defaults() {
        let source = FilesystemSource::new(std::env::temp_dir());
        let series = Series::new("filesystem", "anything", "Anything");
        let err = source.banner(&series).await.unwrap_err();
        assert_eq!(err.classify(), crate::error::Failure::Unsupported);
    }
}
