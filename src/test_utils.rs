//! In-memory plugins for unit tests.

use crate::error::{SourceError, TrackerError};
use crate::library::{Chapter, SearchResult, Series};
use crate::sources::ContentSource;
use crate::trackers::{Credentials, Tracker};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Content source serving `pages` synthetic pages per chapter.
///
/// Page bytes are `"<chapter id>:<page>"`. A gated source holds each page
/// fetch until that page is released or the gate is opened.
pub struct MockSource {
    id: &'static str,
    pages: usize,
    gate: Option<Mutex<Gate>>,
    unavailable: HashSet<usize>,
    panicking: HashSet<usize>,
    fail_chapters: bool,
    fetched: Mutex<Vec<usize>>,
    page_count_calls: AtomicUsize,
    in_flight: AtomicUsize,
}

impl MockSource {
    pub fn new(id: &'static str, pages: usize) -> Self {
        Self {
            id,
            pages,
            gate: None,
            unavailable: HashSet::new(),
            panicking: HashSet::new(),
            fail_chapters: false,
            fetched: Mutex::new(Vec::new()),
            page_count_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Holds page fetches until released.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Mutex::new(Gate::default()));
        self
    }

    /// Makes `page` report the content as gone.
    pub fn with_unavailable_page(mut self, page: usize) -> Self {
        self.unavailable.insert(page);
        self
    }

    /// Makes fetching `page` panic.
    pub fn with_panicking_page(mut self, page: usize) -> Self {
        self.panicking.insert(page);
        self
    }

    /// Makes the chapter listing fail.
    pub fn with_failing_chapters(mut self) -> Self {
        self.fail_chapters = true;
        self
    }

    /// Lets one fetch of `page` through the gate.
    pub fn release_page(&self, page: usize) {
        if let Some(gate) = &self.gate {
            gate.lock().unwrap().semaphore(page).add_permits(1);
        }
    }

    /// Lets every current and future fetch through.
    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            let mut gate = gate.lock().unwrap();
            gate.open = true;
            for semaphore in gate.pages.values() {
                semaphore.add_permits(1024);
            }
        }
    }

    async fn pass_gate(&self, page: usize) -> Result<(), SourceError> {
        let semaphore = match &self.gate {
            Some(gate) => {
                let mut gate = gate.lock().unwrap();
                if gate.open {
                    return Ok(());
                }
                gate.semaphore(page)
            }
            None => return Ok(()),
        };
        semaphore
            .acquire()
            .await
            .map_err(|e| SourceError::ParseError(e.to_string()))?
            .forget();
        Ok(())
    }

    /// Pages fetched so far, in order of completion.
    pub fn fetched(&self) -> Vec<usize> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn fetch_count(&self, page: usize) -> usize {
        self.fetched().iter().filter(|&&p| p == page).count()
    }

    pub fn page_count_calls(&self) -> usize {
        self.page_count_calls.load(Ordering::SeqCst)
    }

    /// Page fetches currently waiting at the gate or running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn chapter(&self, id: &str) -> Chapter {
        Chapter::new(self.id, id, 1.0)
    }
}

#[derive(Default)]
struct Gate {
    open: bool,
    pages: HashMap<usize, Arc<Semaphore>>,
}

impl Gate {
    fn semaphore(&mut self, page: usize) -> Arc<Semaphore> {
        Arc::clone(
            self.pages
                .entry(page)
                .or_insert_with(|| Arc::new(Semaphore::new(0))),
        )
    }
}

/// Decrements the in-flight counter when a fetch ends or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContentSource for MockSource {
    fn id(&self) -> &'static str {
        self.id
    }

    fn name(&self) -> &'static str {
        "Mock"
    }

    fn domain(&self) -> &str {
        "mock.invalid"
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, SourceError> {
        Ok(vec![SearchResult {
            source_id: self.id.to_string(),
            source_key: query.to_lowercase(),
            title: format!("Result for {query}"),
            cover_url: None,
            description: None,
        }])
    }

    async fn series(&self, source_key: &str, quick: bool) -> Result<Series, SourceError> {
        if source_key == "gone" {
            return Err(SourceError::Unavailable(source_key.to_string()));
        }
        let mut series = Series::new(self.id, source_key, &format!("Series {source_key}"));
        if !quick {
            series.author = Some("Author".to_string());
        }
        Ok(series)
    }

    async fn chapters(&self, series: &Series) -> Result<Vec<Chapter>, SourceError> {
        if self.fail_chapters {
            return Err(SourceError::ParseError("broken listing".to_string()));
        }
        Ok((1..=3)
            .map(|n| Chapter::new(self.id, format!("{}-c{n}", series.source_key), n as f32))
            .collect())
    }

    async fn cover(&self, source_key: &str) -> Result<Bytes, SourceError> {
        Ok(Bytes::from(format!("cover:{source_key}")))
    }

    async fn page_count(&self, _chapter: &Chapter) -> Result<usize, SourceError> {
        self.page_count_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.pages)
    }

    async fn page(&self, chapter: &Chapter, page: usize) -> Result<Bytes, SourceError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        self.pass_gate(page).await?;
        if self.panicking.contains(&page) {
            panic!("mock source exploded on page {page}");
        }

        self.fetched.lock().unwrap().push(page);
        if self.unavailable.contains(&page) {
            return Err(SourceError::Unavailable(format!("page {page}")));
        }
        if page >= self.pages {
            return Err(SourceError::PageOutOfRange {
                page,
                total: self.pages,
            });
        }
        Ok(Bytes::from(format!("{}:{page}", chapter.id)))
    }
}

/// Tracker keeping progress in memory.
///
/// Any password or code equal to `"wrong"` is rejected.
pub struct MockTracker {
    id: &'static str,
    token: Mutex<Option<String>>,
    progress: Mutex<HashMap<String, u32>>,
    network_calls: AtomicUsize,
    hold_login: AtomicBool,
    login_gate: Semaphore,
    latency: Duration,
}

impl MockTracker {
    pub fn new(id: &'static str) -> Self {
        Self {
            id,
            token: Mutex::new(None),
            progress: Mutex::new(HashMap::new()),
            network_calls: AtomicUsize::new(0),
            hold_login: AtomicBool::new(false),
            login_gate: Semaphore::new(0),
            latency: Duration::ZERO,
        }
    }

    pub fn authenticated(id: &'static str) -> Self {
        Self::with_token(id, "restored")
    }

    /// Holds a token the tracker no longer accepts.
    pub fn expired(id: &'static str) -> Self {
        Self::with_token(id, "expired")
    }

    fn with_token(id: &'static str, token: &str) -> Self {
        let tracker = Self::new(id);
        *tracker.token.lock().unwrap() = Some(token.to_string());
        tracker
    }

    /// Makes token exchanges wait for [`MockTracker::release_login`].
    pub fn holding_login(self) -> Self {
        self.hold_login.store(true, Ordering::SeqCst);
        self
    }

    /// Delays every progress read and write by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn release_login(&self) {
        self.login_gate.add_permits(1);
    }

    pub fn network_calls(&self) -> usize {
        self.network_calls.load(Ordering::SeqCst)
    }

    async fn remote_delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    pub fn remote_progress(&self, media_id: &str) -> u32 {
        self.progress
            .lock()
            .unwrap()
            .get(media_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Tracker for MockTracker {
    fn id(&self) -> &'static str {
        self.id
    }

    fn name(&self) -> &'static str {
        "Mock Tracker"
    }

    fn is_authenticated(&self) -> bool {
        self.token.lock().unwrap().is_some()
    }

    async fn verify_authenticated(&self) -> Result<(), TrackerError> {
        self.network_calls.fetch_add(1, Ordering::SeqCst);
        let mut token = self.token.lock().unwrap();
        match token.as_deref() {
            Some("expired") => {
                *token = None;
                Err(TrackerError::Unauthenticated)
            }
            Some(_) => Ok(()),
            None => Err(TrackerError::Unauthenticated),
        }
    }

    async fn generate_token(&self, credentials: &Credentials) -> Result<(), TrackerError> {
        self.network_calls.fetch_add(1, Ordering::SeqCst);
        if self.hold_login.load(Ordering::SeqCst) {
            self.login_gate
                .acquire()
                .await
                .map_err(|e| TrackerError::ApiError(e.to_string()))?
                .forget();
        }

        let secret = match credentials {
            Credentials::Code(code) => code,
            Credentials::Password { password, .. } => password,
        };
        if secret == "wrong" {
            return Err(TrackerError::ApiError("invalid credentials".to_string()));
        }
        *self.token.lock().unwrap() = Some("mock-token".to_string());
        Ok(())
    }

    async fn authenticated_user_name(&self) -> Result<String, TrackerError> {
        self.network_calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_authenticated() {
            return Err(TrackerError::Unauthenticated);
        }
        Ok("mock-user".to_string())
    }

    async fn chapters_read(&self, media_id: &str) -> Result<u32, TrackerError> {
        self.network_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.remote_progress(media_id);
        self.remote_delay().await;
        Ok(current)
    }

    async fn set_chapters_read(&self, media_id: &str, count: u32) -> Result<(), TrackerError> {
        self.network_calls.fetch_add(1, Ordering::SeqCst);
        self.remote_delay().await;
        self.progress
            .lock()
            .unwrap()
            .insert(media_id.to_string(), count);
        Ok(())
    }

    fn access_token(&self) -> Option<String> {
        self.token.lock().unwrap().clone()
    }

    fn deauthenticate(&self) {
        *self.token.lock().unwrap() = None;
    }
}
