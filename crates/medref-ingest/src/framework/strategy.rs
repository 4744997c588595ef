//! Per-source deduplication strategy and merge policy
//!
//! A strategy decides which fields identify a record, which fields feed the
//! content hash, which field orders revisions of the same record, and how the
//! upsert merger combines an incoming record with the stored one.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write;

use super::types::{FieldMap, RawRecord};
use crate::error::{IngestError, IngestResult};

/// Separator between the parts of a composite identity key
pub const KEY_SEPARATOR: char = '|';

/// How one source type is keyed, hashed, and merged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeduplicationStrategy {
    /// Fields forming the identity key, in order
    pub identity_fields: Vec<String>,

    /// Lowercase and trim key parts so `NCT001` and `nct001 ` collide
    #[serde(default = "default_true")]
    pub normalize_keys: bool,

    /// Reject records without an identity key instead of passing them to
    /// content-hash deduplication
    #[serde(default)]
    pub require_identity: bool,

    /// Explicit content-hash input; `None` means every field except the
    /// identity fields and `content_exclude`
    #[serde(default)]
    pub content_fields: Option<Vec<String>>,

    /// Volatile fields (timestamps, feed ids) ignored by the content hash
    #[serde(default)]
    pub content_exclude: Vec<String>,

    /// Field whose greatest value wins among records sharing an identity key
    #[serde(default)]
    pub revision_field: Option<String>,

    #[serde(default)]
    pub merge: MergePolicy,
}

fn default_true() -> bool {
    true
}

impl DeduplicationStrategy {
    pub fn new<I, S>(identity_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            identity_fields: identity_fields.into_iter().map(Into::into).collect(),
            normalize_keys: true,
            require_identity: false,
            content_fields: None,
            content_exclude: Vec::new(),
            revision_field: None,
            merge: MergePolicy::default(),
        }
    }

    pub fn with_content_exclude<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.content_exclude = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_content_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.content_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_revision_field(mut self, field: impl Into<String>) -> Self {
        self.revision_field = Some(field.into());
        self
    }

    pub fn with_merge_policy(mut self, merge: MergePolicy) -> Self {
        self.merge = merge;
        self
    }

    pub fn requiring_identity(mut self) -> Self {
        self.require_identity = true;
        self
    }

    /// Reject strategies that cannot key or hash records
    pub fn validate(&self) -> IngestResult<()> {
        if self.identity_fields.is_empty() {
            return Err(IngestError::config("identity_fields must name at least one field"));
        }

        if self.identity_fields.iter().any(|f| f.trim().is_empty()) {
            return Err(IngestError::config("identity_fields contains an empty field name"));
        }

        if let Some(fields) = &self.content_fields {
            if fields.is_empty() {
                return Err(IngestError::config(
                    "content_fields must not be empty when given; omit it to hash all fields",
                ));
            }
        }

        if matches!(&self.revision_field, Some(f) if f.trim().is_empty()) {
            return Err(IngestError::config("revision_field must not be empty"));
        }

        Ok(())
    }

    /// Composite identity key, or `None` when any identity field is empty
    ///
    /// Parts of a composite key escape `\` and the separator, so distinct
    /// field values never join to the same key.
    pub fn identity_key(&self, fields: &FieldMap) -> Option<String> {
        let composite = self.identity_fields.len() > 1;
        let mut parts = Vec::with_capacity(self.identity_fields.len());

        for name in &self.identity_fields {
            let part = key_part(fields.get(name)?)?;
            let part = if self.normalize_keys {
                part.trim().to_lowercase()
            } else {
                part
            };
            if part.is_empty() {
                return None;
            }
            parts.push(if composite { escape_key_part(&part) } else { part });
        }

        Some(parts.join(&KEY_SEPARATOR.to_string()))
    }

    /// SHA-256 over the canonical serialization of the content fields
    pub fn content_hash(&self, fields: &FieldMap) -> IngestResult<String> {
        let selected: BTreeMap<&str, &Value> = match &self.content_fields {
            Some(include) => include
                .iter()
                .filter_map(|name| fields.get(name).map(|v| (name.as_str(), v)))
                .collect(),
            None => fields
                .iter()
                .filter(|(name, _)| {
                    !self.identity_fields.contains(name) && !self.content_exclude.contains(name)
                })
                .map(|(name, v)| (name.as_str(), v))
                .collect(),
        };

        let mut writer = DigestWriter(Sha256::new());
        writer.write_all(b"{")?;
        for (i, (name, value)) in selected.iter().enumerate() {
            if i > 0 {
                writer.write_all(b",")?;
            }
            serde_json::to_writer(&mut writer, name)?;
            writer.write_all(b":")?;
            write_canonical(&mut writer, value)?;
        }
        writer.write_all(b"}")?;

        Ok(hex::encode(writer.0.finalize()))
    }

    pub fn revision(&self, fields: &FieldMap) -> Option<Value> {
        let field = self.revision_field.as_ref()?;
        fields.get(field).filter(|v| !is_empty_value(v)).cloned()
    }

    /// Key and hash a parsed field map
    pub fn build_record(&self, fields: FieldMap) -> IngestResult<RawRecord> {
        let identity_key = self.identity_key(&fields);
        if identity_key.is_none() && self.require_identity {
            return Err(IngestError::Validation(format!(
                "record has no value for identity field(s) {}",
                self.identity_fields.join(", ")
            )));
        }

        let content_hash = self.content_hash(&fields)?;
        let revision = self.revision(&fields);

        Ok(RawRecord {
            fields,
            identity_key,
            content_hash,
            revision,
        })
    }
}

fn key_part(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Serialize `value` with object keys sorted at every depth
fn write_canonical<W: Write>(writer: &mut W, value: &Value) -> IngestResult<()> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            writer.write_all(b"{")?;
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    writer.write_all(b",")?;
                }
                serde_json::to_writer(&mut *writer, k)?;
                writer.write_all(b":")?;
                write_canonical(writer, v)?;
            }
            writer.write_all(b"}")?;
        },
        Value::Array(items) => {
            writer.write_all(b"[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    writer.write_all(b",")?;
                }
                write_canonical(writer, item)?;
            }
            writer.write_all(b"]")?;
        },
        scalar => serde_json::to_writer(&mut *writer, scalar)?,
    }
    Ok(())
}

struct DigestWriter(Sha256);

impl Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn escape_key_part(part: &str) -> String {
    if !part.contains(['\\', KEY_SEPARATOR]) {
        return part.to_string();
    }
    let mut escaped = String::with_capacity(part.len() + 2);
    for c in part.chars() {
        if c == '\\' || c == KEY_SEPARATOR {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// `null`, `""`, and empty arrays or objects carry no data
///
/// A whitespace-only string is data and replaces a stored value.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// How an incoming field value combines with the stored one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldMergeRule {
    /// Incoming value wins unless it is empty
    #[default]
    NonEmptyWins,
    /// Stored value wins once present
    KeepExisting,
    /// Larger number wins
    Max,
    /// Smaller number wins
    Min,
    /// Arrays are concatenated without duplicates, stored order first
    Union,
}

/// Field-level merge rules applied by the upsert merger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MergePolicy {
    #[serde(default)]
    pub field_rules: BTreeMap<String, FieldMergeRule>,
}

impl MergePolicy {
    pub fn with_rule(mut self, field: impl Into<String>, rule: FieldMergeRule) -> Self {
        self.field_rules.insert(field.into(), rule);
        self
    }

    pub fn rule_for(&self, field: &str) -> FieldMergeRule {
        self.field_rules.get(field).copied().unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> FieldMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_identity_key_normalized() {
        let strategy = DeduplicationStrategy::new(["nct_id"]);
        let key = strategy.identity_key(&fields(json!({"nct_id": " NCT0001 "})));
        assert_eq!(key.as_deref(), Some("nct0001"));
    }

    #[test]
    fn test_identity_key_composite_and_missing() {
        let strategy = DeduplicationStrategy::new(["system", "code"]);
        let key = strategy.identity_key(&fields(json!({"system": "ICD10", "code": 42})));
        assert_eq!(key.as_deref(), Some("icd10|42"));

        assert!(strategy.identity_key(&fields(json!({"system": "ICD10"}))).is_none());
        assert!(strategy
            .identity_key(&fields(json!({"system": "ICD10", "code": ""})))
            .is_none());
    }

    #[test]
    fn test_composite_key_parts_are_escaped() {
        let strategy = DeduplicationStrategy::new(["a", "b"]);
        let left = strategy.identity_key(&fields(json!({"a": "x|y", "b": "z"})));
        let right = strategy.identity_key(&fields(json!({"a": "x", "b": "y|z"})));
        assert_eq!(left.as_deref(), Some("x\\|y|z"));
        assert_eq!(right.as_deref(), Some("x|y\\|z"));
        assert_ne!(left, right);

        let slash = strategy.identity_key(&fields(json!({"a": "x\\", "b": "y"})));
        let pipe = strategy.identity_key(&fields(json!({"a": "x", "b": "\\y"})));
        assert_ne!(slash, pipe);

        // Single-field keys are stored as-is
        let single = DeduplicationStrategy::new(["a"]);
        assert_eq!(
            single.identity_key(&fields(json!({"a": "x|y"}))).as_deref(),
            Some("x|y")
        );
    }

    #[test]
    fn test_content_hash_ignores_key_order_and_identity() {
        let strategy = DeduplicationStrategy::new(["id"]);
        let a = fields(json!({"id": "a", "title": "Aspirin", "meta": {"x": 1, "y": [1, 2]}}));
        let b = fields(json!({"meta": {"y": [1, 2], "x": 1}, "title": "Aspirin", "id": "b"}));
        assert_eq!(strategy.content_hash(&a).unwrap(), strategy.content_hash(&b).unwrap());

        let c = fields(json!({"id": "a", "title": "Ibuprofen", "meta": {"x": 1, "y": [1, 2]}}));
        assert_ne!(strategy.content_hash(&a).unwrap(), strategy.content_hash(&c).unwrap());
    }

    #[test]
    fn test_content_hash_respects_exclude_and_include() {
        let strategy = DeduplicationStrategy::new(["id"]).with_content_exclude(["fetched_at"]);
        let a = fields(json!({"id": "a", "title": "T", "fetched_at": "2024-01-01"}));
        let b = fields(json!({"id": "b", "title": "T", "fetched_at": "2024-06-01"}));
        assert_eq!(strategy.content_hash(&a).unwrap(), strategy.content_hash(&b).unwrap());

        let only_title = DeduplicationStrategy::new(["id"]).with_content_fields(["title"]);
        let c = fields(json!({"id": "c", "title": "T", "extra": 1}));
        assert_eq!(
            only_title.content_hash(&a).unwrap(),
            only_title.content_hash(&c).unwrap()
        );
    }

    #[test]
    fn test_build_record_requires_identity_when_configured() {
        let strategy = DeduplicationStrategy::new(["pmid"]).requiring_identity();
        let err = strategy.build_record(fields(json!({"title": "x"}))).unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));

        let lenient = DeduplicationStrategy::new(["pmid"]);
        let record = lenient.build_record(fields(json!({"title": "x"}))).unwrap();
        assert!(record.identity_key.is_none());
    }

    #[test]
    fn test_validate() {
        assert!(DeduplicationStrategy::new(Vec::<String>::new()).validate().is_err());
        assert!(DeduplicationStrategy::new([""]).validate().is_err());
        let mut strategy = DeduplicationStrategy::new(["id"]);
        strategy.content_fields = Some(Vec::new());
        assert!(strategy.validate().is_err());
        assert!(DeduplicationStrategy::new(["id"]).validate().is_ok());
    }

    #[test]
    fn test_is_empty_value() {
        assert!(is_empty_value(&json!(null)));
        assert!(is_empty_value(&json!("")));
        assert!(!is_empty_value(&json!("  ")));
        assert!(is_empty_value(&json!([])));
        assert!(is_empty_value(&json!({})));
        assert!(!is_empty_value(&json!(0)));
        assert!(!is_empty_value(&json!(false)));
        assert!(!is_empty_value(&json!("x")));
    }

    #[test]
    fn test_strategy_deserializes_with_defaults() {
        let strategy: DeduplicationStrategy = serde_json::from_value(json!({
            "identity_fields": ["set_id"],
            "revision_field": "effective_time",
            "merge": {"field_rules": {"versions": "union"}}
        }))
        .unwrap();
        assert!(strategy.normalize_keys);
        assert_eq!(strategy.merge.rule_for("versions"), FieldMergeRule::Union);
        assert_eq!(strategy.merge.rule_for("title"), FieldMergeRule::NonEmptyWins);
    }
}
