//! Target record store interface
//!
//! The pipeline persists deduplicated records through [`RecordStore`]. A store
//! applies the merge policy itself so that the read-merge-write of one record
//! happens inside the store's own transaction.

mod memory;
mod sqlite;

pub use memory::MemoryRecordStore;
pub use sqlite::SqliteRecordStore;

use async_trait::async_trait;
use medref_common::types::SourceType;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::strategy::MergePolicy;
use super::types::{FieldMap, RawRecord};
use crate::error::IngestResult;

/// Maximum bound parameters per `IN (...)` lookup
pub const KEY_LOOKUP_CHUNK: usize = 500;

/// A persisted reference record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub source_type: String,
    pub identity_key: String,
    /// Content hash of the most recent incoming version
    pub content_hash: String,
    pub fields: FieldMap,
}

/// A record the store rejected for integrity reasons
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRecord {
    pub key: String,
    pub message: String,
}

/// Result of persisting one chunk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub failed: Vec<FailedRecord>,
}

impl UpsertOutcome {
    pub fn absorb(&mut self, other: UpsertOutcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.failed.extend(other.failed);
    }

    pub fn persisted(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Persistent store of deduplicated reference records
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Check the store is reachable
    async fn ping(&self) -> IngestResult<()>;

    /// Which of `keys` are already stored for `source_type`
    async fn existing_keys(
        &self,
        source_type: &SourceType,
        keys: &[String],
    ) -> IngestResult<HashSet<String>>;

    /// Insert new records and merge known ones under `policy`
    ///
    /// The chunk is applied atomically. Records rejected for integrity reasons
    /// are isolated and returned in [`UpsertOutcome::failed`]; the others are
    /// still persisted. An `Err` is a transient failure; merging is idempotent,
    /// so the whole chunk may be retried.
    async fn upsert_batch(
        &self,
        source_type: &SourceType,
        records: &[RawRecord],
        policy: &MergePolicy,
    ) -> IngestResult<UpsertOutcome>;

    async fn count(&self, source_type: &SourceType) -> IngestResult<u64>;

    async fn get(&self, source_type: &SourceType, key: &str) -> IngestResult<Option<StoredRecord>>;
}
