//! Error types for medref

use thiserror::Error;

/// Result type alias for medref operations
pub type Result<T> = std::result::Result<T, MedrefError>;

/// Main error type shared by the medref crates
#[derive(Error, Debug)]
pub enum MedrefError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid source type: {0}")]
    InvalidSourceType(String),
}
