use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BacksmithError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Broken backup ancestry: a cycle or a parent that does not exist.
    #[error("Backup chain integrity error: {0}")]
    IntegrityError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Error: {0}")]
    Error(String),
}

/// Rejection produced before anything is executed. Each variant maps onto
/// one wire status code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Precondition(String),

    #[error("{0}")]
    Internal(String),
}

impl CommandError {
    pub fn code(&self) -> u16 {
        match self {
            CommandError::Validation(_) => 400,
            CommandError::NotFound(_) => 404,
            CommandError::Conflict(_) => 409,
            CommandError::Precondition(_) => 503,
            CommandError::Internal(_) => 500,
        }
    }
}
