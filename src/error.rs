//! Error types for luabot.

use thiserror::Error;

/// Common error type for luabot.
#[derive(Error, Debug)]
pub enum BotError {
    /// Database error.
    ///
    /// Errors from sqlx are converted into this variant automatically.
    #[error("database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Script load or execution error.
    #[error("script error: {0}")]
    Script(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Validation error for caller-supplied input.
    #[error("validation error: {0}")]
    Validation(String),

    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(String),

    /// File watcher error.
    #[error("watch error: {0}")]
    Watch(String),
}

impl From<sqlx::Error> for BotError {
    fn from(e: sqlx::Error) -> Self {
        BotError::Database(e.to_string())
    }
}

impl From<mlua::Error> for BotError {
    fn from(e: mlua::Error) -> Self {
        BotError::Script(e.to_string())
    }
}

/// Result type alias for luabot operations.
pub type Result<T> = std::result::Result<T, BotError>;
