//! Medref Common Library
//!
//! Shared types, utilities, and error handling for the medref workspace.
//!
//! # Overview
//!
//! This crate provides functionality used across all medref workspace members:
//!
//! - **Error Handling**: Custom error types and result types
//! - **Checksums**: Streaming file digests used for change detection
//! - **Logging**: Centralized `tracing` subscriber setup
//! - **Types**: Shared domain types such as [`types::SourceType`]
//!
//! # Example
//!
//! ```no_run
//! use medref_common::checksum::compute_file_digest;
//!
//! fn fingerprint(path: &str) -> medref_common::Result<(String, u64)> {
//!     let digest = compute_file_digest(path)?;
//!     Ok((digest.hex, digest.size_bytes))
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{MedrefError, Result};
