//! Core types for the ingestion framework

use medref_common::checksum::compute_file_digest;
use medref_common::types::SourceType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::IngestResult;

/// Field map produced by a format parser
pub type FieldMap = serde_json::Map<String, serde_json::Value>;

/// A hashed source file; identity is `(file_name, source_type)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: PathBuf,
    pub source_type: SourceType,
    pub size_bytes: u64,
    /// SHA-256 hex digest of the file contents
    pub content_hash: String,
}

impl SourceFile {
    /// Hash `path` by streaming it in fixed-size chunks
    pub fn from_path(path: impl AsRef<Path>, source_type: SourceType) -> IngestResult<Self> {
        let path = path.as_ref();
        let digest = compute_file_digest(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            source_type,
            size_bytes: digest.size_bytes,
            content_hash: digest.hex,
        })
    }

    pub fn file_name(&self) -> String {
        file_name_of(&self.path)
    }
}

/// Final path component used as the fingerprint key
pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// One parsed source record, keyed and hashed by its source's strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub fields: FieldMap,
    /// Natural key, e.g. a trial registration number; absent when the source
    /// row does not carry one
    pub identity_key: Option<String>,
    /// SHA-256 of the canonical serialization of the content fields
    pub content_hash: String,
    /// Value of the strategy's revision field, used to pick the newest duplicate
    pub revision: Option<serde_json::Value>,
}

impl RawRecord {
    /// Key the record is stored under
    ///
    /// Keyless records are stored under their content hash so that re-runs
    /// still converge on one row.
    pub fn store_key(&self) -> String {
        match &self.identity_key {
            Some(key) => key.clone(),
            None => format!("content:{}", self.content_hash),
        }
    }
}

/// Per-file (or per logical batch) statistics consumed by the progress tracker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub source_type: String,
    pub file_name: String,
    pub total_input_records: usize,
    pub new_records: usize,
    pub updated_records: usize,
    pub duplicates_removed: usize,
    pub content_duplicates_removed: usize,
    /// Records dropped because their key already exists in the store
    pub existing_filtered: usize,
    /// Records the parser or strategy rejected as invalid
    pub rejected_records: usize,
    pub failed_records: usize,
    #[serde(with = "duration_secs")]
    pub processing_time: Duration,
}

impl BatchResult {
    /// Records that reached the store
    pub fn persisted(&self) -> usize {
        self.new_records + self.updated_records
    }
}

/// Serialize durations as fractional seconds
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::try_from_secs_f64(secs).unwrap_or_default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_source_file_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels-0001.jsonl");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"hello world").unwrap();

        let source = SourceFile::from_path(&path, SourceType::new("drug_labels").unwrap()).unwrap();
        assert_eq!(source.size_bytes, 11);
        assert_eq!(
            source.content_hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(source.file_name(), "labels-0001.jsonl");
    }

    #[test]
    fn test_store_key_falls_back_to_content_hash() {
        let record = RawRecord {
            fields: FieldMap::new(),
            identity_key: None,
            content_hash: "abc".to_string(),
            revision: None,
        };
        assert_eq!(record.store_key(), "content:abc");
    }

    #[test]
    fn test_batch_result_serializes_seconds() {
        let batch = BatchResult {
            processing_time: Duration::from_millis(1500),
            new_records: 2,
            updated_records: 1,
            ..Default::default()
        };
        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(json["processing_time"], 1.5);
        assert_eq!(batch.persisted(), 3);
    }
}
