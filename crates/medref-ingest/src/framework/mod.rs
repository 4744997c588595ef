//! Incremental, deduplicating ingestion framework
//!
//! Fingerprints skip unchanged files, a blocking-task pool parses the rest,
//! and every batch is deduplicated by identity key and content hash before it
//! reaches the record store.

pub mod dedup;
pub mod discovery;
pub mod errors;
pub mod filter;
pub mod fingerprint;
pub mod merge;
pub mod parser;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod retry;
pub mod store;
pub mod strategy;
pub mod types;

// Re-export commonly used types
pub use dedup::{deduplicate, DedupOutcome};
pub use errors::{ErrorCollector, ErrorDetail, ErrorSummary};
pub use filter::{filter_existing, FilterOutcome};
pub use fingerprint::{hash_files, CandidateSplit, FingerprintRecord, FingerprintStats, FingerprintStore};
pub use merge::merge_fields;
pub use parser::{FormatParser, ParseOutput, RejectedRecord, SourceRegistration, SourceRegistry};
pub use pipeline::{IngestionPipeline, PipelineConfig, RunReport};
pub use pool::{default_max_workers, parse_all, ParsedFile, ParsedRecords};
pub use progress::{Eta, ProgressSnapshot, ProgressTracker, RunState};
pub use retry::{with_retry, RetryPolicy};
pub use store::{MemoryRecordStore, RecordStore, SqliteRecordStore, StoredRecord, UpsertOutcome};
pub use strategy::{DeduplicationStrategy, FieldMergeRule, MergePolicy};
pub use types::{BatchResult, FieldMap, RawRecord, SourceFile};
