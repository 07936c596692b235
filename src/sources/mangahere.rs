//! MangaHere (www.mangahere.cc) source implementation.
//!
//! HTML scraping source. Chapter ids are site-relative chapter directories
//! such as `/manga/some_title/c012/`; page `n` of a chapter lives at
//! `<chapter dir>/<n + 1>.html` and embeds its image as `img#image`.

use super::{ContentSource, check_status, create_http_client, rate_limit};
use crate::config::NetworkConfig;
use crate::error::SourceError;
use crate::library::{Chapter, SearchResult, Series};
use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use scraper::{Html, Selector};
use std::sync::LazyLock;

const BASE_URL: &str = "https://www.mangahere.cc";

/// Extracts the chapter number from a chapter path (`/c012.5/`).
static CHAPTER_NUMBER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/c(\d+(?:\.\d+)?)/").unwrap());

/// Extracts the page count embedded in reader pages.
static IMAGE_COUNT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"var\s+imagecount\s*=\s*(\d+)").unwrap());

/// Extracts the series slug from a series path.
static SLUG_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/manga/([^/]+)/").unwrap());

/// CSS selectors used for parsing.
struct Selectors {
    search_item: Selector,
    search_title: Selector,
    search_cover: Selector,
    search_description: Selector,
    title: Selector,
    author: Selector,
    status: Selector,
    description: Selector,
    cover: Selector,
    chapter_link: Selector,
    chapter_title: Selector,
    page_image: Selector,
}

impl Selectors {
    fn new() -> Self {
        Self {
            search_item: Selector::parse(".manga-list-4-list > li").unwrap(),
            search_title: Selector::parse("p.manga-list-4-item-title > a").unwrap(),
            search_cover: Selector::parse("img.manga-list-4-cover").unwrap(),
            search_description: Selector::parse("p.manga-list-4-item-tip").unwrap(),
            title: Selector::parse("span.detail-info-right-title-font").unwrap(),
            author: Selector::parse("p.detail-info-right-say > a").unwrap(),
            status: Selector::parse("span.detail-info-right-title-tip").unwrap(),
            description: Selector::parse("p.fullcontent").unwrap(),
            cover: Selector::parse("img.detail-info-cover-img").unwrap(),
            chapter_link: Selector::parse("ul.detail-main-list > li > a").unwrap(),
            chapter_title: Selector::parse("p.title3").unwrap(),
            page_image: Selector::parse("img#image").unwrap(),
        }
    }
}

/// MangaHere scraper.
pub struct MangaHereSource {
    client: reqwest::Client,
    config: NetworkConfig,
    base_url: String,
    selectors: Selectors,
}

impl MangaHereSource {
    /// Creates a MangaHere source with the given network configuration.
    pub fn new(config: &NetworkConfig) -> Result<Self, SourceError> {
        Self::with_base_url(config, BASE_URL)
    }

    /// Creates a MangaHere source against an alternate host.
    pub fn with_base_url(config: &NetworkConfig, base_url: &str) -> Result<Self, SourceError> {
        Ok(Self {
            client: create_http_client(config)?,
            config: config.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            selectors: Selectors::new(),
        })
    }

    /// Fetches a page and returns the HTML document.
    async fn fetch_document(&self, path: &str) -> Result<Html, SourceError> {
        let text = self.fetch_text(path).await?;
        Ok(Html::parse_document(&text))
    }

    async fn fetch_text(&self, path: &str) -> Result<String, SourceError> {
        rate_limit(self.config.delay_between_requests_sec).await;
        let url = self.resolve_url(path);
        if self.config.debug {
            tracing::debug!(url = %url, "MangaHere request");
        }

        // isAdult cookie skips the age gate on mature series
        let response = self
            .client
            .get(&url)
            .header("Cookie", "isAdult=1")
            .send()
            .await?;
        Ok(check_status(response)?.text().await?)
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Bytes, SourceError> {
        rate_limit(self.config.delay_between_requests_sec).await;
        let response = self
            .client
            .get(self.resolve_url(url))
            .header("Referer", format!("{}/", self.base_url))
            .send()
            .await?;
        Ok(check_status(response)?.bytes().await?)
    }

    /// Resolves a site-relative or protocol-relative URL.
    fn resolve_url(&self, href: &str) -> String {
        if href.starts_with("http://") || href.starts_with("https://") {
            href.to_string()
        } else if let Some(rest) = href.strip_prefix("//") {
            format!("https://{rest}")
        } else {
            format!("{}/{}", self.base_url, href.trim_start_matches('/'))
        }
    }

    /// Series path for a source key (the slug).
    fn series_path(source_key: &str) -> String {
        format!("/manga/{}/", source_key)
    }

    fn text_of(doc: &Html, selector: &Selector) -> Option<String> {
        doc.select(selector)
            .next()
            .map(|e| e.text().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn parse_search(&self, doc: &Html) -> Vec<SearchResult> {
        doc.select(&self.selectors.search_item)
            .filter_map(|item| {
                let link = item.select(&self.selectors.search_title).next()?;
                let href = link.value().attr("href")?;
                let slug = SLUG_REGEX.captures(href)?.get(1)?.as_str().to_string();
                let title = link
                    .value()
                    .attr("title")
                    .map(str::to_string)
                    .unwrap_or_else(|| link.text().collect::<String>().trim().to_string());
                let cover_url = item
                    .select(&self.selectors.search_cover)
                    .next()
                    .and_then(|img| img.value().attr("src"))
                    .map(|src| self.resolve_url(src));
                let description = item
                    .select(&self.selectors.search_description)
                    .last()
                    .map(|p| p.text().collect::<String>().trim().to_string())
                    .filter(|s| !s.is_empty());

                Some(SearchResult {
                    source_id: "mangahere".to_string(),
                    source_key: slug,
                    title,
                    cover_url,
                    description,
                })
            })
            .collect()
    }

    fn parse_series(&self, doc: &Html, source_key: &str) -> Result<Series, SourceError> {
        let title = Self::text_of(doc, &self.selectors.title)
            .ok_or_else(|| SourceError::ElementNotFound("series title".to_string()))?;

        let mut series = Series::new("mangahere", source_key, title);
        series.author = Self::text_of(doc, &self.selectors.author);
        series.status = Self::text_of(doc, &self.selectors.status);
        series.description = Self::text_of(doc, &self.selectors.description);
        series.cover_url = doc
            .select(&self.selectors.cover)
            .next()
            .and_then(|img| img.value().attr("src"))
            .map(|src| self.resolve_url(src));
        Ok(series)
    }

    fn parse_chapters(&self, doc: &Html) -> Vec<Chapter> {
        let mut chapters: Vec<Chapter> = doc
            .select(&self.selectors.chapter_link)
            .filter_map(|link| {
                let href = link.value().attr("href")?;
                // Chapter links point at page 1; the id is the chapter directory.
                let dir = &href[..href.rfind('/')? + 1];
                let number = CHAPTER_NUMBER_REGEX
                    .captures(dir)
                    .and_then(|caps| caps.get(1))
                    .and_then(|m| m.as_str().parse::<f32>().ok())
                    .unwrap_or(0.0);
                let title = link
                    .select(&self.selectors.chapter_title)
                    .next()
                    .map(|t| t.text().collect::<String>().trim().to_string())
                    .unwrap_or_default();

                let mut chapter = Chapter::new("mangahere", dir, number);
                chapter.title = title;
                chapter.language = Some("en".to_string());
                Some(chapter)
            })
            .collect();

        // The site lists newest first.
        chapters.reverse();
        chapters
    }

    fn page_path(chapter: &Chapter, page: usize) -> String {
        format!("{}{}.html", chapter.id, page + 1)
    }
}

#[async_trait]
impl ContentSource for MangaHereSource {
    fn id(&self) -> &'static str {
        "mangahere"
    }

    fn name(&self) -> &'static str {
        "MangaHere"
    }

    fn domain(&self) -> &str {
        "mangahere.cc"
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, SourceError> {
        let mut url = url::Url::parse(&format!("{}/search", self.base_url))
            .map_err(|e| SourceError::InvalidKey(e.to_string()))?;
        url.query_pairs_mut().append_pair("title", query);
        let doc = self.fetch_document(url.as_str()).await?;
        Ok(self.parse_search(&doc))
    }

    async fn series(&self, source_key: &str, _quick: bool) -> Result<Series, SourceError> {
        let doc = self.fetch_document(&Self::series_path(source_key)).await?;
        self.parse_series(&doc, source_key)
    }

    async fn chapters(&self, series: &Series) -> Result<Vec<Chapter>, SourceError> {
        let doc = self
            .fetch_document(&Self::series_path(&series.source_key))
            .await?;
        Ok(self.parse_chapters(&doc))
    }

    async fn cover(&self, source_key: &str) -> Result<Bytes, SourceError> {
        let series = self.series(source_key, true).await?;
        let url = series
            .cover_url
            .ok_or_else(|| SourceError::ElementNotFound("cover image".to_string()))?;
        self.fetch_bytes(&url).await
    }

    async fn page_count(&self, chapter: &Chapter) -> Result<usize, SourceError> {
        let text = self.fetch_text(&Self::page_path(chapter, 0)).await?;
        IMAGE_COUNT_REGEX
            .captures(&text)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(|| SourceError::ElementNotFound("imagecount".to_string()))
    }

    async fn page(&self, chapter: &Chapter, page: usize) -> Result<Bytes, SourceError> {
        let src = {
            let doc = self.fetch_document(&Self::page_path(chapter, page)).await?;
            let src = doc
                .select(&self.selectors.page_image)
                .next()
                .and_then(|img| img.value().attr("src"))
                .map(str::to_string);
            src.ok_or_else(|| SourceError::ElementNotFound("page image".to_string()))?
        };
        self.fetch_bytes(&src).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SERIES_HTML: &str = r#"
        <html><body>
          <img class="detail-info-cover-img" src="//fmcdn.example/cover.jpg">
          <span class="detail-info-right-title-font">Some Title</span>
          <span class="detail-info-right-title-tip">Ongoing</span>
          <p class="detail-info-right-say">Author: <a href="/search/author/x/">Some Author</a></p>
          <p class="fullcontent">Long description.</p>
          <ul class="detail-main-list">
            <li><a href="/manga/some_title/c002/1.html"><p class="title3">Ch.002 - Second</p></a></li>
            <li><a href="/manga/some_title/c001.5/1.html"><p class="title3">Ch.001.5 - Extra</p></a></li>
            <li><a href="/manga/some_title/c001/1.html"><p class="title3">Ch.001 - First</p></a></li>
          </ul>
        </body></html>
    "#;

    fn source() -> MangaHereSource {
        MangaHereSource::new(&NetworkConfig::default()).unwrap()
    }

    #[test]
    fn test_parse_series() {
        let doc = Html::parse_document(SERIES_HTML);
        let series = source().parse_series(&doc, "some_title").unwrap();
        assert_eq!(series.title, "Some Title");
        assert_eq!(series.author.as_deref(), Some("Some Author"));
        assert_eq!(series.status.as_deref(), Some("Ongoing"));
        assert_eq!(series.cover_url.as_deref(), Some("https://fmcdn.example/cover.jpg"));
    }

    #[test]
    fn test_parse_chapters_oldest_first() {
        let doc = Html::parse_document(SERIES_HTML);
        let chapters = source().parse_chapters(&doc);
        assert_eq!(chapters.len(), 3);
        assert_eq!(chapters[0].id, "/manga/some_title/c001/");
        assert_eq!(chapters[1].number, 1.5);
        assert_eq!(chapters[2].title, "Ch.002 - Second");
    }

    #[test]
    fn test_parse_search() {
        let html = r#"
            <ul class="manga-list-4-list">
              <li>
                <img class="manga-list-4-cover" src="https://cdn.example/a.jpg">
                <p class="manga-list-4-item-title"><a href="/manga/alpha/" title="Alpha">Alpha</a></p>
                <p class="manga-list-4-item-tip">Author</p>
                <p class="manga-list-4-item-tip">An alpha story</p>
              </li>
              <li><p>malformed</p></li>
            </ul>
        "#;
        let results = source().parse_search(&Html::parse_document(html));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source_key, "alpha");
        assert_eq!(results[0].description.as_deref(), Some("An alpha story"));
    }

    #[test]
    fn test_missing_title_is_error() {
        let doc = Html::parse_document("<html></html>");
        assert!(matches!(
            source().parse_series(&doc, "x"),
            Err(SourceError::ElementNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_page_fetch() {
        let server = MockServer::start().await;
        let chapter = Chapter::new("mangahere", "/manga/alpha/c001/", 1.0);
        Mock::given(method("GET"))
            .and(path("/manga/alpha/c001/1.html"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "<script>var imagecount = 12;</script><img id=\"image\" src=\"{}/img/1.jpg\">",
                server.uri()
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/img/1.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg".to_vec()))
            .mount(&server)
            .await;

        let source = MangaHereSource::with_base_url(&NetworkConfig::default(), &server.uri()).unwrap();
        assert_eq!(source.page_count(&chapter).await.unwrap(), 12);
        assert_eq!(&source.page(&chapter, 0).await.unwrap()[..], b"jpeg");
    }
}
