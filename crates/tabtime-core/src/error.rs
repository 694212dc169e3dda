//! TabTime error types.

use thiserror::Error;

/// Errors raised by the scheduler and its collaborators.
#[derive(Debug, Error)]
pub enum TabTimeError {
    /// Every attempt to take a named storage lock failed.
    #[error("unable to acquire lock '{0}'")]
    LockTimeout(String),

    /// The tab was closed or never existed.
    #[error("tab {0} not found")]
    TabNotFound(i64),

    /// An alarm fired with nothing left to act on.
    #[error("orphaned alarm '{0}'")]
    OrphanedAlarm(String),

    /// A wall-clock string that is not a valid "HH:MM".
    #[error("malformed time string '{0}'")]
    MalformedTime(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TabTimeError {
    /// Whether the error means the target tab is already gone.
    pub fn is_tab_not_found(&self) -> bool {
        matches!(self, TabTimeError::TabNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, TabTimeError>;
