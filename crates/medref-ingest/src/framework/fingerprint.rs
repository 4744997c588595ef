//! File fingerprint store
//!
//! Remembers the content hash and size of every successfully processed file so
//! that unchanged files are skipped on the next run. Rows are keyed by
//! `(file_name, source_type)` and overwritten when a file is reprocessed.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use medref_common::types::SourceType;
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::types::SourceFile;
use crate::error::{IngestError, IngestResult};

/// Stored fingerprint of a processed file
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct FingerprintRecord {
    pub file_name: String,
    pub source_type: String,
    pub file_path: String,
    pub file_hash: String,
    pub file_size: i64,
    pub records_found: i64,
    pub records_processed: i64,
    pub processing_time_seconds: f64,
    pub processed_at: DateTime<Utc>,
}

/// Candidates split by whether their fingerprint changed
#[derive(Debug, Clone, Default)]
pub struct CandidateSplit {
    pub to_process: Vec<SourceFile>,
    pub skip: Vec<SourceFile>,
}

/// Files hashed concurrently, with the paths that could not be read
#[derive(Debug, Default)]
pub struct HashedFiles {
    /// Sorted by path
    pub files: Vec<SourceFile>,
    pub failures: Vec<(PathBuf, IngestError)>,
}

/// Aggregates for one source type
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FingerprintStats {
    pub source_type: String,
    pub files_tracked: i64,
    pub records_found: i64,
    pub records_processed: i64,
    pub last_processed_at: Option<DateTime<Utc>>,
}

/// Hash `paths` on the blocking pool, at most `concurrency` at a time
pub async fn hash_files(
    paths: Vec<PathBuf>,
    source_type: &SourceType,
    concurrency: usize,
) -> HashedFiles {
    let results: Vec<(PathBuf, IngestResult<SourceFile>)> = stream::iter(paths)
        .map(|path| {
            let source_type = source_type.clone();
            async move {
                let task_path = path.clone();
                let result = tokio::task::spawn_blocking(move || {
                    SourceFile::from_path(&task_path, source_type)
                })
                .await
                .unwrap_or_else(|e| {
                    Err(IngestError::parsing(
                        path.display().to_string(),
                        format!("hashing task failed: {}", e),
                    ))
                });
                (path, result)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut hashed = HashedFiles::default();
    for (path, result) in results {
        match result {
            Ok(file) => hashed.files.push(file),
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Failed to hash file");
                hashed.failures.push((path, e));
            },
        }
    }
    hashed.files.sort_by(|a, b| a.path.cmp(&b.path));
    hashed
}

/// SQLite-backed fingerprint store
#[derive(Debug, Clone)]
pub struct FingerprintStore {
    pool: SqlitePool,
}

impl FingerprintStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(
        &self,
        file_name: &str,
        source_type: &SourceType,
    ) -> IngestResult<Option<FingerprintRecord>> {
        let record = sqlx::query_as::<_, FingerprintRecord>(
            r#"
            SELECT file_name, source_type, file_path, file_hash, file_size, records_found,
                   records_processed, processing_time_seconds, processed_at
            FROM file_fingerprints
            WHERE file_name = ?1 AND source_type = ?2
            "#,
        )
        .bind(file_name)
        .bind(source_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Hash `path` and compare it against the stored fingerprint
    pub async fn is_unchanged(&self, path: &Path, source_type: &SourceType) -> IngestResult<bool> {
        let owned_path = path.to_path_buf();
        let owned_type = source_type.clone();
        let file = tokio::task::spawn_blocking(move || SourceFile::from_path(owned_path, owned_type))
            .await
            .map_err(|e| {
                IngestError::parsing(path.display().to_string(), format!("hashing task failed: {}", e))
            })??;

        self.is_unchanged_file(&file).await
    }

    /// True iff a fingerprint exists with the same hash and size
    pub async fn is_unchanged_file(&self, file: &SourceFile) -> IngestResult<bool> {
        let stored = self.get(&file.file_name(), &file.source_type).await?;
        Ok(stored.is_some_and(|s| matches_fingerprint(file, &s.file_hash, s.file_size)))
    }

    /// Upsert the fingerprint of a successfully processed file
    pub async fn record_outcome(
        &self,
        file: &SourceFile,
        records_found: u64,
        records_processed: u64,
        duration_seconds: f64,
    ) -> IngestResult<()> {
        let file_name = file.file_name();

        sqlx::query(
            r#"
            INSERT INTO file_fingerprints (
                file_name, source_type, file_path, file_hash, file_size, records_found,
                records_processed, processing_time_seconds, processed_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(file_name, source_type) DO UPDATE SET
                file_path = excluded.file_path,
                file_hash = excluded.file_hash,
                file_size = excluded.file_size,
                records_found = excluded.records_found,
                records_processed = excluded.records_processed,
                processing_time_seconds = excluded.processing_time_seconds,
                processed_at = excluded.processed_at
            "#,
        )
        .bind(&file_name)
        .bind(file.source_type.as_str())
        .bind(file.path.to_string_lossy().to_string())
        .bind(&file.content_hash)
        .bind(to_i64(file.size_bytes))
        .bind(to_i64(records_found))
        .bind(to_i64(records_processed))
        .bind(duration_seconds)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        debug!(
            file = %file_name,
            source_type = %file.source_type,
            records_found,
            records_processed,
            "Recorded file fingerprint"
        );

        Ok(())
    }

    /// Split candidates into files to process and unchanged files to skip
    ///
    /// Fingerprints are loaded with one query per source type present in
    /// `candidates`. With `force` every candidate is processed.
    pub async fn filter_candidates(
        &self,
        candidates: Vec<SourceFile>,
        force: bool,
    ) -> IngestResult<CandidateSplit> {
        if force {
            info!(files = candidates.len(), "Force reprocess requested, skipping fingerprint check");
            return Ok(CandidateSplit {
                to_process: candidates,
                skip: Vec::new(),
            });
        }

        let mut known: HashMap<SourceType, HashMap<String, (String, i64)>> = HashMap::new();
        for file in &candidates {
            if !known.contains_key(&file.source_type) {
                let rows = self.load_fingerprints(&file.source_type).await?;
                known.insert(file.source_type.clone(), rows);
            }
        }

        let mut split = CandidateSplit::default();
        for file in candidates {
            let unchanged = known
                .get(&file.source_type)
                .and_then(|rows| rows.get(&file.file_name()))
                .is_some_and(|(hash, size)| matches_fingerprint(&file, hash, *size));

            if unchanged {
                split.skip.push(file);
            } else {
                split.to_process.push(file);
            }
        }

        info!(
            to_process = split.to_process.len(),
            skipped = split.skip.len(),
            "Filtered candidate files by fingerprint"
        );

        Ok(split)
    }

    async fn load_fingerprints(
        &self,
        source_type: &SourceType,
    ) -> IngestResult<HashMap<String, (String, i64)>> {
        let rows = sqlx::query(
            "SELECT file_name, file_hash, file_size FROM file_fingerprints WHERE source_type = ?1",
        )
        .bind(source_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let name: String = row.get("file_name");
                let hash: String = row.get("file_hash");
                let size: i64 = row.get("file_size");
                (name, (hash, size))
            })
            .collect())
    }

    /// Forget fingerprints for a source type, or for one file of it
    pub async fn reset(&self, source_type: &SourceType, file_name: Option<&str>) -> IngestResult<u64> {
        let result = match file_name {
            Some(name) => {
                sqlx::query("DELETE FROM file_fingerprints WHERE source_type = ?1 AND file_name = ?2")
                    .bind(source_type.as_str())
                    .bind(name)
                    .execute(&self.pool)
                    .await?
            },
            None => {
                sqlx::query("DELETE FROM file_fingerprints WHERE source_type = ?1")
                    .bind(source_type.as_str())
                    .execute(&self.pool)
                    .await?
            },
        };

        info!(
            source_type = %source_type,
            file = file_name.unwrap_or("*"),
            rows = result.rows_affected(),
            "Reset file fingerprints"
        );

        Ok(result.rows_affected())
    }

    /// Delete fingerprints last processed more than `days_old` days ago
    pub async fn cleanup(&self, days_old: u32) -> IngestResult<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days_old));
        self.cleanup_before(cutoff).await
    }

    pub async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> IngestResult<u64> {
        let result =
            sqlx::query("DELETE FROM file_fingerprints WHERE julianday(processed_at) < julianday(?1)")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;

        info!(
            cutoff = %cutoff,
            rows = result.rows_affected(),
            "Cleaned up old file fingerprints"
        );

        Ok(result.rows_affected())
    }

    /// Per-source aggregates, for every source type when `source_type` is `None`
    pub async fn stats(&self, source_type: Option<&SourceType>) -> IngestResult<Vec<FingerprintStats>> {
        let rows = sqlx::query(
            r#"
            SELECT source_type,
                   COUNT(*) AS files_tracked,
                   COALESCE(SUM(records_found), 0) AS records_found,
                   COALESCE(SUM(records_processed), 0) AS records_processed,
                   MAX(processed_at) AS last_processed_at
            FROM file_fingerprints
            WHERE ?1 IS NULL OR source_type = ?1
            GROUP BY source_type
            ORDER BY source_type
            "#,
        )
        .bind(source_type.map(SourceType::as_str))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let last: Option<String> = row.get("last_processed_at");
                FingerprintStats {
                    source_type: row.get("source_type"),
                    files_tracked: row.get("files_tracked"),
                    records_found: row.get("records_found"),
                    records_processed: row.get("records_processed"),
                    last_processed_at: last
                        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                        .map(|dt| dt.with_timezone(&Utc)),
                }
            })
            .collect())
    }
}

fn matches_fingerprint(file: &SourceFile, hash: &str, size: i64) -> bool {
    file.content_hash.eq_ignore_ascii_case(hash) && to_i64(file.size_bytes) == size
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::db::{connect, DbConfig};
    use std::io::Write;

    async fn store(dir: &Path) -> FingerprintStore {
        let url = format!("sqlite://{}", dir.join("fp.db").display());
        FingerprintStore::new(connect(&DbConfig::with_url(url)).await.unwrap())
    }

    fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::File::create(&path).unwrap().write_all(content).unwrap();
        path
    }

    fn labels() -> SourceType {
        SourceType::new("drug_labels").unwrap()
    }

    #[tokio::test]
    async fn test_unknown_file_is_changed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let path = write_file(dir.path(), "a.jsonl", b"{}\n");

        assert!(!store.is_unchanged(&path, &labels()).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_outcome_then_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let path = write_file(dir.path(), "a.jsonl", b"{\"id\": 1}\n");
        let file = SourceFile::from_path(&path, labels()).unwrap();

        store.record_outcome(&file, 10, 4, 0.5).await.unwrap();
        assert!(store.is_unchanged(&path, &labels()).await.unwrap());

        let stored = store.get("a.jsonl", &labels()).await.unwrap().unwrap();
        assert_eq!(stored.records_found, 10);
        assert_eq!(stored.records_processed, 4);
        assert_eq!(stored.file_hash, file.content_hash);

        // Same name, different source type is a different fingerprint
        let other = SourceType::new("pubmed").unwrap();
        assert!(!store.is_unchanged(&path, &other).await.unwrap());
    }

    #[tokio::test]
    async fn test_modified_file_is_changed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let path = write_file(dir.path(), "a.jsonl", b"one\n");
        let file = SourceFile::from_path(&path, labels()).unwrap();
        store.record_outcome(&file, 1, 1, 0.1).await.unwrap();

        write_file(dir.path(), "a.jsonl", b"two\n");
        assert!(!store.is_unchanged(&path, &labels()).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_outcome_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let path = write_file(dir.path(), "a.jsonl", b"one\n");
        let file = SourceFile::from_path(&path, labels()).unwrap();

        store.record_outcome(&file, 1, 1, 0.1).await.unwrap();
        store.record_outcome(&file, 7, 3, 0.2).await.unwrap();

        let stats = store.stats(Some(&labels())).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].files_tracked, 1);
        assert_eq!(stats[0].records_found, 7);
        assert!(stats[0].last_processed_at.is_some());
    }

    #[tokio::test]
    async fn test_filter_candidates_and_force() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let a = SourceFile::from_path(write_file(dir.path(), "a.jsonl", b"a"), labels()).unwrap();
        let b = SourceFile::from_path(write_file(dir.path(), "b.jsonl", b"b"), labels()).unwrap();
        store.record_outcome(&a, 1, 1, 0.0).await.unwrap();

        let split = store
            .filter_candidates(vec![a.clone(), b.clone()], false)
            .await
            .unwrap();
        assert_eq!(split.skip, vec![a.clone()]);
        assert_eq!(split.to_process, vec![b.clone()]);

        let forced = store.filter_candidates(vec![a, b], true).await.unwrap();
        assert_eq!(forced.to_process.len(), 2);
        assert!(forced.skip.is_empty());
    }

    #[tokio::test]
    async fn test_reset_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let a = SourceFile::from_path(write_file(dir.path(), "a.jsonl", b"a"), labels()).unwrap();
        let b = SourceFile::from_path(write_file(dir.path(), "b.jsonl", b"b"), labels()).unwrap();
        store.record_outcome(&a, 1, 1, 0.0).await.unwrap();
        store.record_outcome(&b, 1, 1, 0.0).await.unwrap();

        assert_eq!(store.reset(&labels(), Some("a.jsonl")).await.unwrap(), 1);
        assert!(store.get("a.jsonl", &labels()).await.unwrap().is_none());

        assert_eq!(store.cleanup(30).await.unwrap(), 0);
        let removed = store
            .cleanup_before(Utc::now() + ChronoDuration::days(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.stats(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hash_files_collects_failures() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_file(dir.path(), "good.jsonl", b"x");
        let missing = dir.path().join("missing.jsonl");

        let hashed = hash_files(vec![missing.clone(), good.clone()], &labels(), 4).await;
        assert_eq!(hashed.files.len(), 1);
        assert_eq!(hashed.files[0].path, good);
        assert_eq!(hashed.failures.len(), 1);
        assert_eq!(hashed.failures[0].0, missing);
    }
}
