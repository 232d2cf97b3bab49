//! Error types for skynet-core

use thiserror::Error;

/// Main error type for the skynet-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error (fatal at startup)
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem watcher error
    #[error("watch error: {0}")]
    Watch(String),

    /// Delivery to a subscriber channel failed
    #[error("delivery to {channel} failed: {message}")]
    Delivery {
        channel: String,
        message: String,
        retryable: bool,
    },

    /// Session not found
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The store connection mutex was poisoned by a panicking holder
    #[error("store lock poisoned")]
    LockPoisoned,

    /// A bounded queue had no room
    #[error("{0} queue is full")]
    QueueFull(&'static str),

    /// A queue was closed because the pipeline is shutting down
    #[error("pipeline is shutting down")]
    Shutdown,
}

impl Error {
    /// Whether retrying the failed operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Delivery { retryable, .. } => *retryable,
            Error::Io(_) => true,
            _ => false,
        }
    }
}

impl From<notify_debouncer_mini::notify::Error> for Error {
    fn from(e: notify_debouncer_mini::notify::Error) -> Self {
        Error::Watch(e.to_string())
    }
}

/// Result type alias for skynet-core
pub type Result<T> = std::result::Result<T, Error>;
