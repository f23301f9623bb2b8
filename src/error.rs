//! Error types for relay-storage

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Content-Length header required")]
    LengthRequired,

    #[error("Upload exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("Content is blacklisted")]
    Blacklisted,

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Whether the error was caused by the request rather than by storage.
    ///
    /// Client errors are answered with a 4xx status and never trigger
    /// more than local cleanup of the request's own artifacts.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RelayError::NotFound(_)
                | RelayError::InvalidHandle(_)
                | RelayError::BadRequest(_)
                | RelayError::LengthRequired
                | RelayError::TooLarge { .. }
                | RelayError::Blacklisted
        )
    }
}

impl From<sled::Error> for RelayError {
    fn from(e: sled::Error) -> Self {
        RelayError::Database(e.to_string())
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(e: rusqlite::Error) -> Self {
        RelayError::Database(e.to_string())
    }
}
