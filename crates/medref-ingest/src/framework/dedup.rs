//! Batch deduplication
//!
//! Two linear passes over a batch. The identity pass keeps one record per
//! identity key; the content pass then keeps the first record per content hash
//! among the identity survivors. Both passes always run.

use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::strategy::DeduplicationStrategy;
use super::types::RawRecord;

/// Survivors of a batch with removal counts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupOutcome {
    pub records: Vec<RawRecord>,
    pub total_input: usize,
    /// Removed by the identity-key pass
    pub duplicates_removed: usize,
    /// Removed by the content-hash pass
    pub content_duplicates_removed: usize,
}

/// Collapse duplicates within one batch
///
/// Among records sharing an identity key the one with the greatest revision
/// wins when the strategy names a revision field; otherwise, and for equal
/// revisions, the record encountered last wins. Survivors keep the position
/// of their key's first occurrence.
pub fn deduplicate(records: Vec<RawRecord>, strategy: &DeduplicationStrategy) -> DedupOutcome {
    let total_input = records.len();
    let use_revision = strategy.revision_field.is_some();

    let mut slots: Vec<RawRecord> = Vec::with_capacity(records.len());
    let mut slot_by_key: HashMap<String, usize> = HashMap::with_capacity(records.len());

    for record in records {
        let Some(key) = record.identity_key.clone() else {
            slots.push(record);
            continue;
        };

        match slot_by_key.get(&key) {
            Some(&slot) => {
                let replace = !use_revision
                    || compare_revisions(record.revision.as_ref(), slots[slot].revision.as_ref())
                        != Ordering::Less;
                if replace {
                    slots[slot] = record;
                }
            },
            None => {
                slot_by_key.insert(key, slots.len());
                slots.push(record);
            },
        }
    }

    let duplicates_removed = total_input - slots.len();

    let mut seen_hashes: HashSet<String> = HashSet::with_capacity(slots.len());
    let survivors: Vec<RawRecord> = slots
        .into_iter()
        .filter(|record| seen_hashes.insert(record.content_hash.clone()))
        .collect();

    let content_duplicates_removed = total_input - duplicates_removed - survivors.len();

    debug!(
        total_input,
        survivors = survivors.len(),
        duplicates_removed,
        content_duplicates_removed,
        "Deduplicated batch"
    );

    DedupOutcome {
        records: survivors,
        total_input,
        duplicates_removed,
        content_duplicates_removed,
    }
}

/// Order two revision values; a missing revision sorts first
///
/// Numbers compare numerically and strings lexicographically, which orders
/// ISO-8601 dates and zero-padded versions correctly. Values of different
/// kinds compare equal so iteration order decides.
pub fn compare_revisions(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn build(strategy: &DeduplicationStrategy, value: Value) -> RawRecord {
        strategy
            .build_record(value.as_object().cloned().unwrap())
            .unwrap()
    }

    #[test]
    fn test_identity_pass_keeps_last_occurrence() {
        let strategy = DeduplicationStrategy::new(["id"]);
        let records = vec![
            build(&strategy, json!({"id": "a", "v": 1})),
            build(&strategy, json!({"id": "b", "v": 1})),
            build(&strategy, json!({"id": "a", "v": 2})),
        ];

        let outcome = deduplicate(records, &strategy);
        assert_eq!(outcome.duplicates_removed, 1);
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].fields["v"], 2);
        assert_eq!(outcome.records[0].store_key(), "a");
    }

    #[test]
    fn test_revision_field_beats_iteration_order() {
        let strategy = DeduplicationStrategy::new(["set_id"]).with_revision_field("version");
        let records = vec![
            build(&strategy, json!({"set_id": "x", "version": 3, "title": "newest"})),
            build(&strategy, json!({"set_id": "x", "version": 1, "title": "oldest"})),
            build(&strategy, json!({"set_id": "x", "version": 2, "title": "middle"})),
        ];

        let outcome = deduplicate(records, &strategy);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].fields["title"], "newest");
    }

    #[test]
    fn test_equal_revisions_fall_back_to_last() {
        let strategy =
            DeduplicationStrategy::new(["set_id"]).with_revision_field("effective_time");
        let records = vec![
            build(&strategy, json!({"set_id": "x", "effective_time": "2024-01-01", "t": "a"})),
            build(&strategy, json!({"set_id": "x", "effective_time": "2024-01-01", "t": "b"})),
        ];

        let outcome = deduplicate(records, &strategy);
        assert_eq!(outcome.records[0].fields["t"], "b");
    }

    #[test]
    fn test_content_pass_collapses_across_keys_and_keyless() {
        let strategy = DeduplicationStrategy::new(["id"]);
        let records = vec![
            build(&strategy, json!({"id": "a", "title": "same"})),
            build(&strategy, json!({"id": "b", "title": "same"})),
            build(&strategy, json!({"title": "same"})),
            build(&strategy, json!({"title": "other"})),
        ];

        let outcome = deduplicate(records, &strategy);
        assert_eq!(outcome.duplicates_removed, 0);
        assert_eq!(outcome.content_duplicates_removed, 2);
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].store_key(), "a");
    }

    #[test]
    fn test_counts_add_up() {
        let strategy = DeduplicationStrategy::new(["id"]);
        let mut records = Vec::new();
        for i in 0..300 {
            records.push(build(&strategy, json!({"id": format!("k{}", i % 3), "n": i % 3})));
        }

        let outcome = deduplicate(records, &strategy);
        assert_eq!(outcome.total_input, 300);
        assert_eq!(outcome.records.len(), 3);
        assert_eq!(outcome.duplicates_removed, 297);
        assert_eq!(outcome.content_duplicates_removed, 0);
    }

    #[test]
    fn test_compare_revisions() {
        assert_eq!(compare_revisions(None, Some(&json!(1))), Ordering::Less);
        assert_eq!(
            compare_revisions(Some(&json!(10)), Some(&json!(9.5))),
            Ordering::Greater
        );
        assert_eq!(
            compare_revisions(Some(&json!("2023-12-31")), Some(&json!("2024-01-01"))),
            Ordering::Less
        );
        assert_eq!(
            compare_revisions(Some(&json!("3")), Some(&json!(3))),
            Ordering::Equal
        );
    }
}
