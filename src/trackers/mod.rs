//! Tracker trait, session state, and plugin registry.
//!
//! A tracker is a website where users keep lists of the series they read and
//! record how many chapters of each they have finished. Tankobon links library
//! series to tracker media ids and pushes reading progress forward.

mod anilist;
mod kitsu;

pub use anilist::AniList;
pub use kitsu::Kitsu;

use crate::config::Config;
use crate::error::TrackerError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Credentials exchanged for an access token.
#[derive(Clone)]
pub enum Credentials {
    /// Authorization code pasted back by the user after visiting
    /// [`Tracker::authorization_url`].
    Code(String),

    /// Direct username/password exchange.
    Password { username: String, password: String },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Code(_) => f.write_str("Credentials::Code(..)"),
            Credentials::Password { username, .. } => f
                .debug_struct("Credentials::Password")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

/// Outcome of a progress update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressUpdate {
    /// The remote count was raised.
    Advanced { from: u32, to: u32 },

    /// The remote count was already at or above the requested value.
    Unchanged { current: u32 },
}

/// Authentication state of a tracker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Failed,
}

/// Trait for tracker plugins.
///
/// Implementations keep their token behind interior mutability so one shared
/// instance serves every task.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Returns the stable identifier used in series tracker links.
    fn id(&self) -> &'static str;

    /// Returns the human-readable name of this tracker.
    fn name(&self) -> &'static str;

    /// Whether a token is held. Never touches the network.
    fn is_authenticated(&self) -> bool;

    /// Checks the held token against the server, dropping it if rejected.
    async fn verify_authenticated(&self) -> Result<(), TrackerError> {
        Err(TrackerError::Unsupported("verify_authenticated"))
    }

    /// URL the user visits to obtain an authorization code, for trackers
    /// using the code flow.
    fn authorization_url(&self) -> Option<String> {
        None
    }

    /// Exchanges credentials for an access token and keeps it.
    async fn generate_token(&self, credentials: &Credentials) -> Result<(), TrackerError>;

    /// Name of the authenticated user.
    async fn authenticated_user_name(&self) -> Result<String, TrackerError>;

    /// Chapters read recorded on the tracker for `media_id` (0 if unlisted).
    async fn chapters_read(&self, media_id: &str) -> Result<u32, TrackerError>;

    /// Writes the chapters-read count unconditionally.
    async fn set_chapters_read(&self, media_id: &str, count: u32) -> Result<(), TrackerError>;

    /// The current access token, for persisting between runs.
    fn access_token(&self) -> Option<String>;

    /// Forgets the access token.
    fn deauthenticate(&self);

    /// Raises the chapters-read count to `count`; never lowers it.
    async fn update_chapters_read(
        &self,
        media_id: &str,
        count: u32,
    ) -> Result<ProgressUpdate, TrackerError> {
        if !self.is_authenticated() {
            return Err(TrackerError::Unauthenticated);
        }

        let current = self.chapters_read(media_id).await?;
        if count <= current {
            return Ok(ProgressUpdate::Unchanged { current });
        }

        self.set_chapters_read(media_id, count).await?;
        Ok(ProgressUpdate::Advanced {
            from: current,
            to: count,
        })
    }
}

/// Session of one tracker.
#[derive(Debug, Clone, Copy)]
struct Session {
    state: SessionState,
    /// Incremented by every token exchange so a stale exchange cannot
    /// overwrite the outcome of a newer one.
    attempt: u64,
}

/// Registry of trackers and their session states.
#[derive(Default)]
pub struct TrackerRegistry {
    trackers: RwLock<Vec<Arc<dyn Tracker>>>,
    sessions: Mutex<HashMap<&'static str, Session>>,
    /// One lock per `(tracker, media id)` with a progress update in flight.
    progress: Mutex<HashMap<(&'static str, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl TrackerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the bundled trackers, restoring saved tokens.
    pub fn with_defaults(config: &Config) -> Result<Self, TrackerError> {
        let registry = Self::new();
        registry.register(Arc::new(Kitsu::new(&config.network, &config.trackers.kitsu)?));
        registry.register(Arc::new(AniList::new(
            &config.network,
            &config.trackers.anilist,
        )?));
        Ok(registry)
    }

    /// Adds a tracker, replacing any tracker with the same id.
    ///
    /// A tracker that already holds a token starts out `Authenticated`.
    pub fn register(&self, tracker: Arc<dyn Tracker>) {
        let state = resting_state(tracker.as_ref());
        self.lock_sessions()
            .insert(tracker.id(), Session { state, attempt: 0 });

        let mut trackers = self.trackers.write().unwrap_or_else(|e| e.into_inner());
        trackers.retain(|t| t.id() != tracker.id());
        tracing::debug!(tracker = tracker.id(), ?state, "Registered tracker");
        trackers.push(tracker);
    }

    /// Removes the tracker with `id`.
    pub fn remove(&self, id: &str) -> Option<Arc<dyn Tracker>> {
        let mut trackers = self.trackers.write().unwrap_or_else(|e| e.into_inner());
        let index = trackers.iter().position(|t| t.id() == id)?;
        self.lock_sessions().remove(id);
        Some(trackers.remove(index))
    }

    /// Finds the tracker registered under `id`.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Tracker>> {
        self.trackers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|t| t.id() == id)
            .cloned()
    }

    /// Returns all registered trackers.
    pub fn all(&self) -> Vec<Arc<dyn Tracker>> {
        self.trackers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Current session state of tracker `id`.
    pub fn state(&self, id: &str) -> SessionState {
        self.lock_sessions()
            .get(id)
            .map_or(SessionState::Unauthenticated, |s| s.state)
    }

    /// Marks a token exchange as started and returns its attempt number.
    pub(crate) fn begin_authentication(&self, id: &str) -> u64 {
        let mut sessions = self.lock_sessions();
        let Some(session) = sessions.get_mut(id) else {
            return 0;
        };
        session.attempt += 1;
        log_transition(id, session.state, SessionState::Authenticating);
        session.state = SessionState::Authenticating;
        session.attempt
    }

    /// Records the outcome of token exchange `attempt`.
    ///
    /// Ignored unless that attempt is still the one in progress, so a
    /// de-authentication or a newer exchange wins.
    pub(crate) fn finish_authentication(
        &self,
        id: &str,
        attempt: u64,
        authenticated: bool,
    ) -> SessionState {
        let next = if authenticated {
            SessionState::Authenticated
        } else {
            SessionState::Failed
        };
        self.settle(id, attempt, |_| next)
    }

    /// Ends token exchange `attempt` without an outcome, e.g. when it was
    /// cancelled. The session falls back to what the held token implies.
    pub(crate) fn abandon_authentication(&self, id: &str, attempt: u64) -> SessionState {
        self.settle(id, attempt, |tracker| match tracker {
            Some(tracker) => resting_state(tracker.as_ref()),
            None => SessionState::Unauthenticated,
        })
    }

    /// Drops the tracker's token and returns the session to `Unauthenticated`.
    pub fn deauthenticate(&self, id: &str) {
        if let Some(tracker) = self.get(id) {
            tracker.deauthenticate();
        }
        if let Some(session) = self.lock_sessions().get_mut(id) {
            log_transition(id, session.state, SessionState::Unauthenticated);
            session.state = SessionState::Unauthenticated;
        }
    }

    /// Checks every restored token against its tracker.
    ///
    /// Rejected tokens end their session. Trackers that cannot verify, or
    /// that fail for another reason, keep their session as is.
    pub async fn verify_sessions(&self) {
        for tracker in self.all() {
            if !tracker.is_authenticated() {
                continue;
            }
            match tracker.verify_authenticated().await {
                Ok(()) => tracing::debug!(tracker = tracker.id(), "Restored token verified"),
                Err(TrackerError::Unauthenticated) => {
                    tracing::info!(tracker = tracker.id(), "Restored token rejected");
                    self.deauthenticate(tracker.id());
                }
                Err(e) => {
                    tracing::debug!(tracker = tracker.id(), error = %e, "Could not verify token")
                }
            }
        }
    }

    /// Raises the chapters-read count of `media_id` on `tracker`.
    ///
    /// Updates of the same title run one at a time, so the read and the write
    /// of one update never interleave with another's.
    pub async fn update_chapters_read(
        &self,
        tracker: &dyn Tracker,
        media_id: &str,
        count: u32,
    ) -> Result<ProgressUpdate, TrackerError> {
        let lock = self.progress_lock(tracker.id(), media_id);
        let _serial = lock.lock().await;
        tracker.update_chapters_read(media_id, count).await
    }

    fn progress_lock(
        &self,
        tracker_id: &'static str,
        media_id: &str,
    ) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry((tracker_id, media_id.to_string()))
            .or_default()
            .clone()
    }

    fn settle(
        &self,
        id: &str,
        attempt: u64,
        next: impl FnOnce(Option<Arc<dyn Tracker>>) -> SessionState,
    ) -> SessionState {
        let tracker = self.get(id);
        let mut sessions = self.lock_sessions();
        let Some(session) = sessions.get_mut(id) else {
            return SessionState::Unauthenticated;
        };
        if session.state == SessionState::Authenticating && session.attempt == attempt {
            let next = next(tracker);
            log_transition(id, session.state, next);
            session.state = next;
        }
        session.state
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<&'static str, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn log_transition(id: &str, from: SessionState, to: SessionState) {
    tracing::debug!(tracker = id, ?from, ?to, "Tracker session transition");
}

fn resting_state(tracker: &dyn Tracker) -> SessionState {
    if tracker.is_authenticated() {
        SessionState::Authenticated
    } else {
        SessionState::Unauthenticated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockTracker;
    use std::time::Duration;

    #[test]
    fn test_session_lifecycle() {
        let registry = TrackerRegistry::new();
        registry.register(Arc::new(MockTracker::new("mock")));
        assert_eq!(registry.state("mock"), SessionState::Unauthenticated);

        let attempt = registry.begin_authentication("mock");
        assert_eq!(registry.state("mock"), SessionState::Authenticating);
        assert_eq!(
            registry.finish_authentication("mock", attempt, true),
            SessionState::Authenticated
        );

        registry.deauthenticate("mock");
        assert_eq!(registry.state("mock"), SessionState::Unauthenticated);
    }

    #[test]
    fn test_failed_authentication() {
        let registry = TrackerRegistry::new();
        registry.register(Arc::new(MockTracker::new("mock")));
        let attempt = registry.begin_authentication("mock");
        assert_eq!(
            registry.finish_authentication("mock", attempt, false),
            SessionState::Failed
        );
    }

    #[test]
    fn test_deauthentication_during_exchange_wins() {
        let registry = TrackerRegistry::new();
        registry.register(Arc::new(MockTracker::new("mock")));
        let attempt = registry.begin_authentication("mock");
        registry.deauthenticate("mock");
        assert_eq!(
            registry.finish_authentication("mock", attempt, true),
            SessionState::Unauthenticated
        );
    }

    #[test]
    fn test_stale_attempt_is_ignored() {
        let registry = TrackerRegistry::new();
        registry.register(Arc::new(MockTracker::new("mock")));
        let first = registry.begin_authentication("mock");
        let second = registry.begin_authentication("mock");

        assert_eq!(
            registry.abandon_authentication("mock", first),
            SessionState::Authenticating
        );
        assert_eq!(
            registry.finish_authentication("mock", second, true),
            SessionState::Authenticated
        );
    }

    #[test]
    fn test_abandon_restores_held_token_state() {
        let registry = TrackerRegistry::new();
        registry.register(Arc::new(MockTracker::authenticated("mock")));
        let attempt = registry.begin_authentication("mock");
        assert_eq!(
            registry.abandon_authentication("mock", attempt),
            SessionState::Authenticated
        );
    }

    #[test]
    fn test_restored_token_starts_authenticated() {
        let registry = TrackerRegistry::new();
        registry.register(Arc::new(MockTracker::authenticated("mock")));
        assert_eq!(registry.state("mock"), SessionState::Authenticated);
        assert_eq!(registry.state("unknown"), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_verify_sessions_drops_rejected_tokens() {
        let registry = TrackerRegistry::new();
        let valid = Arc::new(MockTracker::authenticated("valid"));
        let expired = Arc::new(MockTracker::expired("expired"));
        let idle = Arc::new(MockTracker::new("idle"));
        registry.register(valid.clone());
        registry.register(expired.clone());
        registry.register(idle.clone());
        assert_eq!(registry.state("expired"), SessionState::Authenticated);

        registry.verify_sessions().await;
        assert_eq!(registry.state("valid"), SessionState::Authenticated);
        assert_eq!(registry.state("expired"), SessionState::Unauthenticated);
        assert!(!expired.is_authenticated());
        assert_eq!(idle.network_calls(), 0);
    }

    #[tokio::test]
    async fn test_progress_ratchet() {
        let tracker = MockTracker::authenticated("mock");
        assert_eq!(
            tracker.update_chapters_read("m1", 5).await.unwrap(),
            ProgressUpdate::Advanced { from: 0, to: 5 }
        );
        assert_eq!(
            tracker.update_chapters_read("m1", 3).await.unwrap(),
            ProgressUpdate::Unchanged { current: 5 }
        );
        assert_eq!(tracker.chapters_read("m1").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_concurrent_progress_updates_never_decrease() {
        let registry = TrackerRegistry::new();
        let tracker =
            Arc::new(MockTracker::authenticated("mock").with_latency(Duration::from_millis(20)));
        registry.register(tracker.clone());

        let (high, low, other) = tokio::join!(
            registry.update_chapters_read(tracker.as_ref(), "m1", 5),
            registry.update_chapters_read(tracker.as_ref(), "m1", 3),
            registry.update_chapters_read(tracker.as_ref(), "m2", 1),
        );
        assert_eq!(high.unwrap(), ProgressUpdate::Advanced { from: 0, to: 5 });
        assert_eq!(low.unwrap(), ProgressUpdate::Unchanged { current: 5 });
        assert_eq!(other.unwrap(), ProgressUpdate::Advanced { from: 0, to: 1 });
        assert_eq!(tracker.remote_progress("m1"), 5);
    }

    #[tokio::test]
    async fn test_progress_requires_session() {
        let tracker = MockTracker::new("mock");
        assert!(matches!(
            tracker.update_chapters_read("m1", 1).await,
            Err(TrackerError::Unauthenticated)
        ));
    }

    #[test]
    fn test_credentials_debug_hides_secrets() {
        let creds = Credentials::Password {
            username: "reader".to_string(),
            password: "hunter2".to_string(),
        };
        let shown = format!("{creds:?}");
        assert!(shown.contains("reader"));
        assert!(!shown.contains("hunter2"));
    }
}
