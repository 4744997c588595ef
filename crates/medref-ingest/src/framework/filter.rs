//! Existing-key filter
//!
//! Drops deduplicated records whose store key is already persisted, so the
//! upsert merger only sees records the store has never held. The key set is
//! fetched in bulk once per parse group.

use std::collections::HashSet;

use super::types::RawRecord;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterOutcome {
    pub new: Vec<RawRecord>,
    /// Records whose key is already stored
    pub existing: Vec<RawRecord>,
}

/// Partition `records` by membership of their store key in `existing_keys`
pub fn filter_existing(records: Vec<RawRecord>, existing_keys: &HashSet<String>) -> FilterOutcome {
    let (existing, new) = records
        .into_iter()
        .partition(|record| existing_keys.contains(&record.store_key()));

    FilterOutcome { new, existing }
}

/// Distinct store keys of `records`, in first-seen order
pub fn store_keys<'a, I>(records: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a RawRecord>,
{
    let mut seen = HashSet::new();
    records
        .into_iter()
        .map(RawRecord::store_key)
        .filter(|key| seen.insert(key.clone()))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::framework::types::FieldMap;

    fn record(key: Option<&str>, hash: &str) -> RawRecord {
        RawRecord {
            fields: FieldMap::new(),
            identity_key: key.map(str::to_string),
            content_hash: hash.to_string(),
            revision: None,
        }
    }

    #[test]
    fn test_filter_existing_partitions() {
        let existing: HashSet<String> = ["a".to_string(), "content:h3".to_string()].into();
        let outcome = filter_existing(
            vec![
                record(Some("a"), "h1"),
                record(Some("b"), "h2"),
                record(None, "h3"),
            ],
            &existing,
        );

        assert_eq!(outcome.new.len(), 1);
        assert_eq!(outcome.new[0].store_key(), "b");
        assert_eq!(outcome.existing.len(), 2);
    }

    #[test]
    fn test_empty_key_set_passes_everything() {
        let outcome = filter_existing(vec![record(Some("a"), "h1")], &HashSet::new());
        assert_eq!(outcome.new.len(), 1);
        assert!(outcome.existing.is_empty());
    }

    #[test]
    fn test_store_keys_are_distinct() {
        let records = vec![record(Some("a"), "1"), record(Some("a"), "2"), record(None, "3")];
        assert_eq!(store_keys(&records), vec!["a", "content:3"]);
    }
}
