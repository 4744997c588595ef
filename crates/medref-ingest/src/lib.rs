//! Medref Ingest Library
//!
//! Incremental ingestion of large, periodically refreshed medical reference
//! datasets (drug labels, bibliographic records, trial registries, code sets).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use medref_common::types::SourceType;
//! use medref_ingest::db::{connect, DbConfig};
//! use medref_ingest::formats::JsonLinesParser;
//! use medref_ingest::framework::{
//!     DeduplicationStrategy, FingerprintStore, IngestionPipeline, SourceRegistration,
//!     SourceRegistry, SqliteRecordStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = connect(&DbConfig::with_url("sqlite://medref.db")).await?;
//!     let source_type = SourceType::new("trial_registry")?;
//!
//!     let mut registry = SourceRegistry::new();
//!     registry.register(SourceRegistration::new(
//!         source_type.clone(),
//!         Arc::new(JsonLinesParser),
//!         DeduplicationStrategy::new(["nct_id"]),
//!     ))?;
//!
//!     let pipeline = IngestionPipeline::new(
//!         registry,
//!         FingerprintStore::new(pool.clone()),
//!         Arc::new(SqliteRecordStore::new(pool)),
//!     );
//!     let report = pipeline
//!         .run_directory(&source_type, "./data/trials".as_ref(), &[])
//!         .await?;
//!     println!("{}", report.summary_line());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod db;
pub mod error;
pub mod formats;
pub mod framework;

pub use error::{ErrorCategory, IngestError, IngestResult};
