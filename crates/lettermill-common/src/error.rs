//! Error types for lettermill

use thiserror::Error;

/// Main error type for lettermill
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Messenger error: {0}")]
    Messenger(String),

    #[error("SMTP error: {0}")]
    Smtp(String),

    #[error("POP3 error: {0}")]
    Pop3(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for lettermill
pub type Result<T> = std::result::Result<T, Error>;
