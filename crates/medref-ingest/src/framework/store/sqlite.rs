//! SQLite record store backed by the `reference_records` table

use async_trait::async_trait;
use chrono::Utc;
use medref_common::types::SourceType;
use sqlx::sqlite::{Sqlite, SqliteConnection, SqlitePool};
use sqlx::QueryBuilder;
use std::collections::HashSet;
use tracing::{debug, warn};

use super::{FailedRecord, RecordStore, StoredRecord, UpsertOutcome, KEY_LOOKUP_CHUNK};
use crate::error::{IngestError, IngestResult};
use crate::framework::merge::merge_fields;
use crate::framework::strategy::MergePolicy;
use crate::framework::types::{FieldMap, RawRecord};

#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply `records` in one transaction; any failure rolls back all of them
    ///
    /// The write lock is taken up front. A deferred transaction that reads
    /// before writing gets SQLITE_BUSY without waiting on `busy_timeout` when
    /// another writer holds the lock.
    async fn apply_chunk(
        &self,
        source_type: &SourceType,
        records: &[RawRecord],
        policy: &MergePolicy,
    ) -> IngestResult<UpsertOutcome> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let mut outcome = UpsertOutcome::default();

        for record in records {
            let key = record.store_key();
            if apply_record(&mut *tx, source_type.as_str(), record, &key, policy).await? {
                outcome.inserted += 1;
            } else {
                outcome.updated += 1;
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }
}

/// Insert or merge one record; returns true when the record was new
async fn apply_record(
    conn: &mut SqliteConnection,
    source_type: &str,
    record: &RawRecord,
    key: &str,
    policy: &MergePolicy,
) -> IngestResult<bool> {
    let stored: Option<String> = sqlx::query_scalar(
        "SELECT fields FROM reference_records WHERE source_type = ?1 AND identity_key = ?2",
    )
    .bind(source_type)
    .bind(key)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| IngestError::from_store(e, Some(key)))?;

    let now = Utc::now();

    match stored {
        Some(stored_json) => {
            let stored_fields: FieldMap = serde_json::from_str(&stored_json).map_err(|e| {
                IngestError::integrity(Some(key), format!("stored fields are not a JSON object: {}", e))
            })?;
            let merged = merge_fields(&stored_fields, &record.fields, policy);

            sqlx::query(
                r#"
                UPDATE reference_records
                SET fields = ?1, content_hash = ?2, updated_at = ?3
                WHERE source_type = ?4 AND identity_key = ?5
                "#,
            )
            .bind(encode_fields(&merged, key)?)
            .bind(&record.content_hash)
            .bind(now)
            .bind(source_type)
            .bind(key)
            .execute(&mut *conn)
            .await
            .map_err(|e| IngestError::from_store(e, Some(key)))?;

            Ok(false)
        },
        None => {
            sqlx::query(
                r#"
                INSERT INTO reference_records (
                    source_type, identity_key, content_hash, fields, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                "#,
            )
            .bind(source_type)
            .bind(key)
            .bind(&record.content_hash)
            .bind(encode_fields(&record.fields, key)?)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| IngestError::from_store(e, Some(key)))?;

            Ok(true)
        },
    }
}

fn encode_fields(fields: &FieldMap, key: &str) -> IngestResult<String> {
    serde_json::to_string(fields)
        .map_err(|e| IngestError::integrity(Some(key), format!("cannot encode fields: {}", e)))
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn ping(&self) -> IngestResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn existing_keys(
        &self,
        source_type: &SourceType,
        keys: &[String],
    ) -> IngestResult<HashSet<String>> {
        let mut found = HashSet::new();

        for chunk in keys.chunks(KEY_LOOKUP_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT identity_key FROM reference_records WHERE source_type = ",
            );
            builder.push_bind(source_type.as_str().to_string());
            builder.push(" AND identity_key IN (");
            let mut separated = builder.separated(", ");
            for key in chunk {
                separated.push_bind(key.clone());
            }
            separated.push_unseparated(")");

            let rows: Vec<String> = builder
                .build_query_scalar()
                .fetch_all(&self.pool)
                .await?;
            found.extend(rows);
        }

        debug!(
            source_type = %source_type,
            requested = keys.len(),
            found = found.len(),
            "Looked up existing record keys"
        );

        Ok(found)
    }

    async fn upsert_batch(
        &self,
        source_type: &SourceType,
        records: &[RawRecord],
        policy: &MergePolicy,
    ) -> IngestResult<UpsertOutcome> {
        if records.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        let err = match self.apply_chunk(source_type, records, policy).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => e,
        };

        warn!(
            source_type = %source_type,
            records = records.len(),
            error = %err,
            "Chunk rejected, replaying records individually"
        );

        let mut outcome = UpsertOutcome::default();
        for record in records {
            match self
                .apply_chunk(source_type, std::slice::from_ref(record), policy)
                .await
            {
                Ok(single) => outcome.absorb(single),
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => outcome.failed.push(FailedRecord {
                    key: record.store_key(),
                    message: e.to_string(),
                }),
            }
        }

        Ok(outcome)
    }

    async fn count(&self, source_type: &SourceType) -> IngestResult<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM reference_records WHERE source_type = ?1")
                .bind(source_type.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn get(&self, source_type: &SourceType, key: &str) -> IngestResult<Option<StoredRecord>> {
        let row = sqlx::query_as::<_, StoredRecordRow>(
            r#"
            SELECT source_type, identity_key, content_hash, fields
            FROM reference_records
            WHERE source_type = ?1 AND identity_key = ?2
            "#,
        )
        .bind(source_type.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredRecord::try_from).transpose()
    }
}

// Helper struct for sqlx query_as
#[derive(Debug, sqlx::FromRow)]
struct StoredRecordRow {
    source_type: String,
    identity_key: String,
    content_hash: String,
    fields: String,
}

impl TryFrom<StoredRecordRow> for StoredRecord {
    type Error = IngestError;

    fn try_from(row: StoredRecordRow) -> IngestResult<Self> {
        let fields = serde_json::from_str(&row.fields).map_err(|e| {
            IngestError::integrity(
                Some(&row.identity_key),
                format!("stored fields are not a JSON object: {}", e),
            )
        })?;

        Ok(Self {
            source_type: row.source_type,
            identity_key: row.identity_key,
            content_hash: row.content_hash,
            fields,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::db::{connect, DbConfig};
    use crate::framework::strategy::DeduplicationStrategy;
    use serde_json::json;

    async fn store() -> (tempfile::TempDir, SqlitePool, SqliteRecordStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("records.db").display());
        let pool = connect(&DbConfig::with_url(url)).await.unwrap();
        (dir, pool.clone(), SqliteRecordStore::new(pool))
    }

    fn source() -> SourceType {
        SourceType::new("trial_registry").unwrap()
    }

    fn record(value: serde_json::Value) -> RawRecord {
        DeduplicationStrategy::new(["nct_id"])
            .build_record(value.as_object().cloned().unwrap())
            .unwrap()
    }

    #[tokio::test]
    async fn test_insert_then_merge() {
        let (_dir, _pool, store) = store().await;
        store.ping().await.unwrap();

        let first = store
            .upsert_batch(
                &source(),
                &[record(json!({"nct_id": "NCT1", "title": "Old", "phase": "2"}))],
                &MergePolicy::default(),
            )
            .await
            .unwrap();
        assert_eq!(first.inserted, 1);

        let second = store
            .upsert_batch(
                &source(),
                &[record(json!({"nct_id": "NCT1", "title": "New", "phase": ""}))],
                &MergePolicy::default(),
            )
            .await
            .unwrap();
        assert_eq!(second.updated, 1);
        assert_eq!(second.inserted, 0);

        let stored = store.get(&source(), "nct1").await.unwrap().unwrap();
        assert_eq!(stored.fields["title"], "New");
        assert_eq!(stored.fields["phase"], "2");
        assert_eq!(store.count(&source()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers_wait_for_the_lock() {
        let (_dir, _pool, store) = store().await;
        let store = std::sync::Arc::new(store);

        let writers: Vec<_> = (0..4)
            .map(|writer| {
                let store = std::sync::Arc::clone(&store);
                tokio::spawn(async move {
                    for batch in 0..25 {
                        let records: Vec<RawRecord> = (0..20)
                            .map(|i| {
                                record(json!({
                                    "nct_id": format!("NCT{}-{}-{}", writer, batch, i % 10),
                                    "n": i,
                                }))
                            })
                            .collect();
                        store
                            .upsert_batch(&source(), &records, &MergePolicy::default())
                            .await?;
                    }
                    Ok::<_, IngestError>(())
                })
            })
            .collect();

        for writer in writers {
            writer.await.unwrap().unwrap();
        }
        assert_eq!(store.count(&source()).await.unwrap(), 4 * 25 * 10);
    }

    #[tokio::test]
    async fn test_existing_keys_spans_chunks() {
        let (_dir, _pool, store) = store().await;
        let records: Vec<RawRecord> = (0..1200)
            .map(|i| record(json!({"nct_id": format!("NCT{}", i), "n": i})))
            .collect();
        store
            .upsert_batch(&source(), &records, &MergePolicy::default())
            .await
            .unwrap();

        let mut keys: Vec<String> = (0..1200).step_by(2).map(|i| format!("nct{}", i)).collect();
        keys.push("nct-missing".to_string());
        let found = store.existing_keys(&source(), &keys).await.unwrap();
        assert_eq!(found.len(), 600);
        assert!(!found.contains("nct-missing"));

        let other = SourceType::new("pubmed").unwrap();
        assert!(store.existing_keys(&other, &keys).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_integrity_failure_is_isolated() {
        let (_dir, pool, store) = store().await;
        sqlx::query(
            r#"
            CREATE TRIGGER reject_bad_record BEFORE INSERT ON reference_records
            WHEN NEW.identity_key = 'bad'
            BEGIN
                SELECT RAISE(ABORT, 'record rejected');
            END
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        let outcome = store
            .upsert_batch(
                &source(),
                &[
                    record(json!({"nct_id": "good1", "t": 1})),
                    record(json!({"nct_id": "bad", "t": 2})),
                    record(json!({"nct_id": "good2", "t": 3})),
                ],
                &MergePolicy::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].key, "bad");
        assert!(outcome.failed[0].message.contains("bad"));
        assert_eq!(store.count(&source()).await.unwrap(), 2);
    }
}
