//! Error types for the ingestion pipeline
//!
//! The variants mirror how a failure is handled: validation and parsing errors
//! are recovered locally and counted, transient store errors are retried,
//! integrity errors are reported with the record identity, and configuration
//! errors stop a run before any file is touched.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for ingestion operations
pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// Pipeline error taxonomy
#[derive(Error, Debug)]
pub enum IngestError {
    /// A single record is malformed; it is dropped and the run continues
    #[error("Validation error: {0}")]
    Validation(String),

    /// One source file could not be read or parsed; sibling files are unaffected
    #[error("Parsing error in '{file}': {message}")]
    Parsing { file: String, message: String },

    /// Connection drop, lock contention, or timeout at the store boundary
    #[error("Transient store error: {0}")]
    StoreTransient(String),

    /// Constraint violation or malformed value; never retried
    #[error("Store integrity error{}: {message}", record_suffix(.key))]
    StoreIntegrity { key: Option<String>, message: String },

    /// Missing or invalid source registration; fatal at run start
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid run state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] medref_common::MedrefError),
}

fn record_suffix(key: &Option<String>) -> String {
    key.as_deref()
        .map(|k| format!(" for record '{}'", k))
        .unwrap_or_default()
}

impl IngestError {
    pub fn parsing(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parsing {
            file: file.into(),
            message: message.into(),
        }
    }

    pub fn integrity(key: Option<&str>, message: impl Into<String>) -> Self {
        Self::StoreIntegrity {
            key: key.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::StoreTransient(_))
    }

    /// Report category for the error collector
    pub fn category(&self) -> ErrorCategory {
        match self {
            IngestError::Validation(_) | IngestError::Json(_) => ErrorCategory::Validation,
            IngestError::Common(medref_common::MedrefError::InvalidSourceType(_)) => {
                ErrorCategory::Configuration
            },
            IngestError::Parsing { .. } | IngestError::Io(_) | IngestError::Common(_) => {
                ErrorCategory::Parsing
            },
            IngestError::StoreTransient(_) => ErrorCategory::StoreTransient,
            IngestError::StoreIntegrity { .. } => ErrorCategory::StoreIntegrity,
            IngestError::Configuration(_) | IngestError::InvalidTransition { .. } => {
                ErrorCategory::Configuration
            },
        }
    }

    /// Classify a database error from the store boundary
    ///
    /// Pool exhaustion, I/O failures and SQLite conditions of the database
    /// file itself are transient; what the database rejects about a record is
    /// an integrity error.
    pub fn from_store(err: sqlx::Error, key: Option<&str>) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Protocol(_) => IngestError::StoreTransient(err.to_string()),
            sqlx::Error::Database(db_err) => {
                let transient = db_err
                    .code()
                    .and_then(|c| c.parse::<i32>().ok())
                    .is_some_and(is_transient_sqlite_code);
                if transient {
                    IngestError::StoreTransient(err.to_string())
                } else {
                    IngestError::integrity(key, err.to_string())
                }
            },
            _ => IngestError::integrity(key, err.to_string()),
        }
    }
}

/// Primary result codes that say nothing about the record being written
///
/// BUSY (5), LOCKED (6), IOERR (10), FULL (13) and CANTOPEN (14). Extended
/// codes carry the primary code in their low byte.
fn is_transient_sqlite_code(code: i32) -> bool {
    matches!(code & 0xff, 5 | 6 | 10 | 13 | 14)
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::from_store(err, None)
    }
}

impl From<sqlx::migrate::MigrateError> for IngestError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        IngestError::Configuration(format!("Schema migration failed: {}", err))
    }
}

/// Error categories surfaced in the run report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Parsing,
    StoreTransient,
    StoreIntegrity,
    Configuration,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Parsing => "parsing",
            ErrorCategory::StoreTransient => "store_transient",
            ErrorCategory::StoreIntegrity => "store_integrity",
            ErrorCategory::Configuration => "configuration",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
