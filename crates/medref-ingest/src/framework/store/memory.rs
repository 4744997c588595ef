//! In-memory record store for tests and dry runs
//!
//! Supports fault injection so retry and isolation paths can be exercised
//! without a real database.

use async_trait::async_trait;
use medref_common::types::SourceType;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

use super::{FailedRecord, RecordStore, StoredRecord, UpsertOutcome};
use crate::error::{IngestError, IngestResult};
use crate::framework::merge::merge_fields;
use crate::framework::strategy::MergePolicy;
use crate::framework::types::RawRecord;

type RecordKey = (String, String);

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<RecordKey, StoredRecord>>,
    rejected_keys: HashSet<String>,
    transient_failures: AtomicUsize,
    unreachable: AtomicBool,
    upsert_calls: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject records with this store key as integrity violations
    pub fn with_rejected_key(mut self, key: impl Into<String>) -> Self {
        self.rejected_keys.insert(key.into());
        self
    }

    /// Fail the next `count` store calls with a transient error
    pub fn fail_next(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Make every call fail as if the store were down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of `upsert_batch` calls, including failed attempts
    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> IngestResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(IngestError::StoreTransient("store unreachable".to_string()));
        }

        let injected = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(IngestError::StoreTransient("injected transient failure".to_string()));
        }

        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn ping(&self) -> IngestResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(IngestError::StoreTransient("store unreachable".to_string()));
        }
        Ok(())
    }

    async fn existing_keys(
        &self,
        source_type: &SourceType,
        keys: &[String],
    ) -> IngestResult<HashSet<String>> {
        self.check_available()?;
        let records = self.records.lock().await;
        Ok(keys
            .iter()
            .filter(|key| records.contains_key(&(source_type.to_string(), (*key).clone())))
            .cloned()
            .collect())
    }

    async fn upsert_batch(
        &self,
        source_type: &SourceType,
        records: &[RawRecord],
        policy: &MergePolicy,
    ) -> IngestResult<UpsertOutcome> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let mut stored = self.records.lock().await;
        let mut outcome = UpsertOutcome::default();

        for record in records {
            let key = record.store_key();
            if self.rejected_keys.contains(&key) {
                outcome.failed.push(FailedRecord {
                    message: IngestError::integrity(Some(&key), "constraint violation").to_string(),
                    key,
                });
                continue;
            }

            let slot = (source_type.to_string(), key.clone());
            match stored.get_mut(&slot) {
                Some(existing) => {
                    existing.fields = merge_fields(&existing.fields, &record.fields, policy);
                    existing.content_hash = record.content_hash.clone();
                    outcome.updated += 1;
                },
                None => {
                    stored.insert(
                        slot,
                        StoredRecord {
                            source_type: source_type.to_string(),
                            identity_key: key,
                            content_hash: record.content_hash.clone(),
                            fields: record.fields.clone(),
                        },
                    );
                    outcome.inserted += 1;
                },
            }
        }

        Ok(outcome)
    }

    async fn count(&self, source_type: &SourceType) -> IngestResult<u64> {
        self.check_available()?;
        let records = self.records.lock().await;
        Ok(records.keys().filter(|(st, _)| st == source_type.as_str()).count() as u64)
    }

    async fn get(&self, source_type: &SourceType, key: &str) -> IngestResult<Option<StoredRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .get(&(source_type.to_string(), key.to_string()))
            .cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::framework::strategy::DeduplicationStrategy;
    use serde_json::json;

    fn record(value: serde_json::Value) -> RawRecord {
        DeduplicationStrategy::new(["id"])
            .build_record(value.as_object().cloned().unwrap())
            .unwrap()
    }

    fn source() -> SourceType {
        SourceType::new("code_sets").unwrap()
    }

    #[tokio::test]
    async fn test_fail_next_then_recovers() {
        let store = MemoryRecordStore::new();
        store.fail_next(1);
        let batch = [record(json!({"id": "a"}))];

        assert!(store
            .upsert_batch(&source(), &batch, &MergePolicy::default())
            .await
            .unwrap_err()
            .is_retryable());
        let outcome = store
            .upsert_batch(&source(), &batch, &MergePolicy::default())
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(store.upsert_calls(), 2);
    }

    #[tokio::test]
    async fn test_rejected_key_is_reported() {
        let store = MemoryRecordStore::new().with_rejected_key("bad");
        let outcome = store
            .upsert_batch(
                &source(),
                &[record(json!({"id": "bad"})), record(json!({"id": "ok"}))],
                &MergePolicy::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.failed[0].key, "bad");
        assert_eq!(store.count(&source()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_ping() {
        let store = MemoryRecordStore::new();
        store.set_unreachable(true);
        assert!(store.ping().await.is_err());
    }
}
