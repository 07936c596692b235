//! Error types for Tankobon.
//!
//! Collaborator failures are structured with `thiserror` and every one of them
//! classifies into the user-facing [`Failure`] taxonomy, which is what task
//! bodies hand to the UI.

use std::fmt;
use thiserror::Error;

/// Classification of a failed operation as presented to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Failure {
    /// The remote content is confirmed gone or blocked.
    Unavailable,

    /// The plugin does not implement this capability.
    Unsupported,

    /// A tracker operation needs a valid session.
    Unauthenticated,

    /// Network or parse failure; the user may re-trigger the action.
    TransientIo,
}

impl Failure {
    /// Returns true if this failure should be shown as a notification.
    ///
    /// `Unsupported` only hides or disables a feature.
    pub fn is_user_visible(self) -> bool {
        !matches!(self, Failure::Unsupported)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Failure::Unavailable => "content unavailable",
            Failure::Unsupported => "not supported by this plugin",
            Failure::Unauthenticated => "not authenticated",
            Failure::TransientIo => "network or parse failure",
        };
        f.write_str(text)
    }
}

/// Error type for content source operations.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The series, chapter or page was removed or blocked upstream.
    #[error("Content unavailable: {0}")]
    Unavailable(String),

    /// The plugin does not implement this operation.
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Failed to parse a response body
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// The required element isn't found in HTML
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    /// A source key could not be resolved by this plugin
    #[error("Invalid source key: {0}")]
    InvalidKey(String),

    /// The requested page index is outside the chapter
    #[error("Page {page} out of range (chapter has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    /// Local filesystem access failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    /// Maps this error onto the user-facing taxonomy.
    pub fn classify(&self) -> Failure {
        match self {
            SourceError::Unavailable(_) | SourceError::PageOutOfRange { .. } => {
                Failure::Unavailable
            }
            SourceError::Unsupported(_) => Failure::Unsupported,
            SourceError::HttpError(e) if is_gone(e.status()) => Failure::Unavailable,
            SourceError::HttpError(_)
            | SourceError::ParseError(_)
            | SourceError::ElementNotFound(_)
            | SourceError::InvalidKey(_)
            | SourceError::Io(_) => Failure::TransientIo,
        }
    }
}

/// Error type for tracker operations.
#[derive(Error, Debug)]
pub enum TrackerError {
    /// The tracker does not implement this operation.
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    /// No valid session for the tracker.
    #[error("Not authenticated with tracker")]
    Unauthenticated,

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The tracker API returned an error response
    #[error("API error: {0}")]
    ApiError(String),

    /// Failed to parse API response
    #[error("Failed to parse API response: {0}")]
    ParseError(String),
}

impl TrackerError {
    /// Maps this error onto the user-facing taxonomy.
    pub fn classify(&self) -> Failure {
        match self {
            TrackerError::Unsupported(_) => Failure::Unsupported,
            TrackerError::Unauthenticated => Failure::Unauthenticated,
            TrackerError::HttpError(e)
                if e.status() == Some(reqwest::StatusCode::UNAUTHORIZED) =>
            {
                Failure::Unauthenticated
            }
            TrackerError::HttpError(_) | TrackerError::ApiError(_) | TrackerError::ParseError(_) => {
                Failure::TransientIo
            }
        }
    }
}

/// Error produced by a task body.
#[derive(Error, Debug)]
pub enum TaskError {
    /// A content source call failed
    #[error(transparent)]
    Source(#[from] SourceError),

    /// A tracker call failed
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    /// No content source is registered under this id
    #[error("Unknown content source: {0}")]
    UnknownSource(String),

    /// No tracker is registered under this id
    #[error("Unknown tracker: {0}")]
    UnknownTracker(String),

    /// The task observed its cancellation token
    #[error("Task cancelled")]
    Cancelled,

    /// The task body panicked
    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Maps this error onto the user-facing taxonomy.
    pub fn classify(&self) -> Failure {
        match self {
            TaskError::Source(e) => e.classify(),
            TaskError::Tracker(e) => e.classify(),
            TaskError::UnknownSource(_) | TaskError::UnknownTracker(_) => Failure::Unsupported,
            TaskError::Cancelled | TaskError::Panicked(_) => Failure::TransientIo,
        }
    }
}

/// Error type for configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse config file
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    /// Invalid configuration value
    #[error("Invalid config value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Config directory not found
    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Error type for library persistence.
#[derive(Error, Debug)]
pub enum LibraryError {
    /// Failed to read or write the library file
    #[error("Failed to access library file: {0}")]
    Io(#[from] std::io::Error),

    /// Library document is not valid JSON
    #[error("Failed to parse library: {0}")]
    Json(#[from] serde_json::Error),

    /// Data directory not found
    #[error("Could not determine data directory")]
    NoDataDir,
}

fn is_gone(status: Option<reqwest::StatusCode>) -> bool {
    matches!(
        status.map(|s| s.as_u16()),
        Some(404) | Some(410) | Some(451)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_classification() {
        assert_eq!(
            SourceError::Unavailable("removed by publisher".into()).classify(),
            Failure::Unavailable
        );
        assert_eq!(
            SourceError::Unsupported("search").classify(),
            Failure::Unsupported
        );
        assert_eq!(
            SourceError::ParseError("bad json".into()).classify(),
            Failure::TransientIo
        );
        assert_eq!(
            SourceError::PageOutOfRange { page: 9, total: 3 }.classify(),
            Failure::Unavailable
        );
    }

    #[test]
    fn test_tracker_error_classification() {
        assert_eq!(
            TrackerError::Unauthenticated.classify(),
            Failure::Unauthenticated
        );
        assert_eq!(
            TrackerError::Unsupported("verify").classify(),
            Failure::Unsupported
        );
        assert_eq!(
            TrackerError::ApiError("500".into()).classify(),
            Failure::TransientIo
        );
    }

    #[test]
    fn test_task_error_delegates() {
        let err: TaskError = SourceError::Unsupported("cover").into();
        assert_eq!(err.classify(), Failure::Unsupported);
        let err: TaskError = TrackerError::Unauthenticated.into();
        assert_eq!(err.classify(), Failure::Unauthenticated);
        assert_eq!(
            TaskError::UnknownSource("nope".into()).classify(),
            Failure::Unsupported
        );
    }

    #[test]
    fn test_unsupported_is_not_user_visible() {
        assert!(!Failure::Unsupported.is_user_visible());
        assert!(Failure::Unavailable.is_user_visible());
        assert!(Failure::TransientIo.is_user_visible());
    }
}
