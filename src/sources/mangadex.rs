//! MangaDex (api.mangadex.org) source implementation.
//!
//! Uses the public JSON API. Page image URLs come from the at-home server
//! endpoint and are remembered per chapter so page fetches after the first
//! cost a single request.

use super::{ContentSource, check_status, create_http_client, rate_limit};
use crate::config::NetworkConfig;
use crate::error::SourceError;
use crate::library::{Chapter, SearchResult, Series};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;

const API_BASE: &str = "https://api.mangadex.org";
const UPLOADS_BASE: &str = "https://uploads.mangadex.org";

/// Maximum chapters requested per feed call.
const FEED_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
struct MangaListResponse {
    data: Vec<MangaData>,
}

#[derive(Debug, Deserialize)]
struct MangaResponse {
    data: MangaData,
}

#[derive(Debug, Deserialize)]
struct MangaData {
    id: String,
    attributes: MangaAttributes,
    #[serde(default)]
    relationships: Vec<Relationship>,
}

#[derive(Debug, Deserialize)]
struct MangaAttributes {
    title: HashMap<String, String>,
    #[serde(rename = "altTitles", default)]
    alt_titles: Vec<HashMap<String, String>>,
    status: Option<String>,
    description: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct Relationship {
    #[serde(rename = "type")]
    rel_type: String,
    attributes: Option<RelationshipAttributes>,
}

#[derive(Debug, Deserialize)]
struct RelationshipAttributes {
    name: Option<String>,
    #[serde(rename = "fileName")]
    file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeedResponse {
    data: Vec<ChapterData>,
}

#[derive(Debug, Deserialize)]
struct ChapterData {
    id: String,
    attributes: ChapterAttributes,
    #[serde(default)]
    relationships: Vec<Relationship>,
}

#[derive(Debug, Deserialize)]
struct ChapterAttributes {
    chapter: Option<String>,
    title: Option<String>,
    volume: Option<String>,
    pages: usize,
    #[serde(rename = "translatedLanguage")]
    translated_language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtHomeResponse {
    #[serde(rename = "baseUrl")]
    base_url: String,
    chapter: AtHomeChapter,
}

#[derive(Debug, Deserialize)]
struct AtHomeChapter {
    hash: String,
    data: Vec<String>,
}

/// MangaDex source backed by the public REST API.
pub struct MangaDexSource {
    client: reqwest::Client,
    config: NetworkConfig,
    api_base: String,
    uploads_base: String,
    page_urls: Mutex<HashMap<String, Vec<String>>>,
}

impl MangaDexSource {
    /// Creates a MangaDex source with the given network configuration.
    pub fn new(config: &NetworkConfig) -> Result<Self, SourceError> {
        Self::with_base_urls(config, API_BASE, UPLOADS_BASE)
    }

    /// Creates a MangaDex source talking to alternate API/upload hosts.
    pub fn with_base_urls(
        config: &NetworkConfig,
        api_base: &str,
        uploads_base: &str,
    ) -> Result<Self, SourceError> {
        Ok(Self {
            client: create_http_client(config)?,
            config: config.clone(),
            api_base: api_base.trim_end_matches('/').to_string(),
            uploads_base: uploads_base.trim_end_matches('/').to_string(),
            page_urls: Mutex::new(HashMap::new()),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, SourceError> {
        rate_limit(self.config.delay_between_requests_sec).await;
        if self.config.debug {
            tracing::debug!(url, "MangaDex request");
        }

        let response = self.client.get(url).query(query).send().await?;
        let response = check_status(response)?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| SourceError::ParseError(e.to_string()))
    }

    async fn get_bytes(&self, url: &str) -> Result<Bytes, SourceError> {
        rate_limit(self.config.delay_between_requests_sec).await;
        let response = check_status(self.client.get(url).send().await?)?;
        Ok(response.bytes().await?)
    }

    async fn manga(&self, id: &str, quick: bool) -> Result<MangaData, SourceError> {
        let url = format!("{}/manga/{}", self.api_base, id);
        let query: &[(&str, &str)] = if quick {
            &[("includes[]", "cover_art")]
        } else {
            &[
                ("includes[]", "cover_art"),
                ("includes[]", "author"),
                ("includes[]", "artist"),
            ]
        };
        let response: MangaResponse = self.get_json(&url, query).await?;
        Ok(response.data)
    }

    /// Builds the cover URL for a manga from its `cover_art` relationship.
    fn cover_url(&self, manga: &MangaData, thumbnail: bool) -> Option<String> {
        let file_name = manga
            .relationships
            .iter()
            .filter(|r| r.rel_type == "cover_art")
            .find_map(|r| r.attributes.as_ref()?.file_name.clone())?;
        let suffix = if thumbnail { ".256.jpg" } else { "" };
        Some(format!(
            "{}/covers/{}/{}{}",
            self.uploads_base, manga.id, file_name, suffix
        ))
    }

    fn to_series(&self, manga: MangaData) -> Series {
        let cover_url = self.cover_url(&manga, false);
        let credit = |kind: &str| {
            manga
                .relationships
                .iter()
                .filter(|r| r.rel_type == kind)
                .find_map(|r| r.attributes.as_ref()?.name.clone())
        };
        let author = credit("author");
        let artist = credit("artist");

        let mut series = Series::new("mangadex", manga.id.clone(), localized(&manga.attributes.title));
        series.alt_titles = manga
            .attributes
            .alt_titles
            .iter()
            .filter_map(|t| t.values().next().cloned())
            .collect();
        series.author = author;
        series.artist = artist;
        series.status = manga.attributes.status.clone();
        series.description = manga.attributes.description.as_ref().map(localized);
        series.cover_url = cover_url;
        series
    }

    /// Returns the page URLs of a chapter, fetching them on first use.
    async fn page_urls(&self, chapter_id: &str) -> Result<Vec<String>, SourceError> {
        if let Some(urls) = self.lock_page_urls().get(chapter_id) {
            return Ok(urls.clone());
        }

        let url = format!("{}/at-home/server/{}", self.api_base, chapter_id);
        let response: AtHomeResponse = self.get_json(&url, &[]).await?;
        let urls: Vec<String> = response
            .chapter
            .data
            .iter()
            .map(|file| {
                format!(
                    "{}/data/{}/{}",
                    response.base_url.trim_end_matches('/'),
                    response.chapter.hash,
                    file
                )
            })
            .collect();

        self.lock_page_urls()
            .insert(chapter_id.to_string(), urls.clone());
        Ok(urls)
    }

    fn lock_page_urls(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<String>>> {
        self.page_urls.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Picks the English value of a localized map, falling back to any value.
fn localized(values: &HashMap<String, String>) -> String {
    values
        .get("en")
        .or_else(|| values.values().next())
        .cloned()
        .unwrap_or_else(|| "Unknown".to_string())
}

#[async_trait]
impl ContentSource for MangaDexSource {
    fn id(&self) -> &'static str {
        "mangadex"
    }

    fn name(&self) -> &'static str {
        "MangaDex"
    }

    fn domain(&self) -> &str {
        "mangadex.org"
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, SourceError> {
        let url = format!("{}/manga", self.api_base);
        let response: MangaListResponse = self
            .get_json(
                &url,
                &[("title", query), ("limit", "20"), ("includes[]", "cover_art")],
            )
            .await?;

        Ok(response
            .data
            .into_iter()
            .map(|manga| SearchResult {
                source_id: "mangadex".to_string(),
                cover_url: self.cover_url(&manga, true),
                title: localized(&manga.attributes.title),
                description: manga.attributes.description.as_ref().map(localized),
                source_key: manga.id,
            })
            .collect())
    }

    async fn series(&self, source_key: &str, quick: bool) -> Result<Series, SourceError> {
        let manga = self.manga(source_key, quick).await?;
        Ok(self.to_series(manga))
    }

    async fn chapters(&self, series: &Series) -> Result<Vec<Chapter>, SourceError> {
        let url = format!("{}/manga/{}/feed", self.api_base, series.source_key);
        let limit = FEED_LIMIT.to_string();
        let response: FeedResponse = self
            .get_json(
                &url,
                &[
                    ("translatedLanguage[]", "en"),
                    ("order[chapter]", "asc"),
                    ("includes[]", "scanlation_group"),
                    ("limit", &limit),
                ],
            )
            .await?;

        Ok(response
            .data
            .into_iter()
            .filter(|c| c.attributes.pages > 0)
            .map(|c| {
                let group = c
                    .relationships
                    .iter()
                    .filter(|r| r.rel_type == "scanlation_group")
                    .find_map(|r| r.attributes.as_ref()?.name.clone());
                let number = c
                    .attributes
                    .chapter
                    .as_deref()
                    .and_then(|n| n.parse::<f32>().ok())
                    .unwrap_or(0.0);
                let mut chapter = Chapter::new("mangadex", c.id, number);
                chapter.title = c.attributes.title.unwrap_or_default();
                chapter.volume = c.attributes.volume;
                chapter.language = c.attributes.translated_language;
                chapter.group = group;
                chapter.total_pages = Some(c.attributes.pages);
                chapter
            })
            .collect())
    }

    async fn cover(&self, source_key: &str) -> Result<Bytes, SourceError> {
        let manga = self.manga(source_key, true).await?;
        let url = self
            .cover_url(&manga, true)
            .ok_or_else(|| SourceError::Unavailable(format!("no cover for {source_key}")))?;
        self.get_bytes(&url).await
    }

    async fn page_count(&self, chapter: &Chapter) -> Result<usize, SourceError> {
        Ok(self.page_urls(&chapter.id).await?.len())
    }

    async fn page(&self, chapter: &Chapter, page: usize) -> Result<Bytes, SourceError> {
        let urls = self.page_urls(&chapter.id).await?;
        let url = urls.get(page).ok_or(SourceError::PageOutOfRange {
            page,
            total: urls.len(),
        })?;
        self.get_bytes(url).await
    }
}
