//! Field-level merge of an incoming record into its stored version
//!
//! By default an incoming value replaces the stored one only when it carries
//! data, so a sparse refresh never erases fields a fuller earlier load filled.
//! `null`, `""` and empty collections are empty; whitespace is not.

use serde_json::Value;

use super::strategy::{is_empty_value, FieldMergeRule, MergePolicy};
use super::types::FieldMap;

/// Merge `incoming` over `stored` under `policy`
///
/// Fields present on either side appear in the result.
pub fn merge_fields(stored: &FieldMap, incoming: &FieldMap, policy: &MergePolicy) -> FieldMap {
    let mut merged = stored.clone();

    for (name, new_value) in incoming {
        let value = match stored.get(name) {
            Some(old_value) => merge_value(old_value, new_value, policy.rule_for(name)),
            None => new_value.clone(),
        };
        merged.insert(name.clone(), value);
    }

    merged
}

/// Combine one stored and one incoming value
pub fn merge_value(stored: &Value, incoming: &Value, rule: FieldMergeRule) -> Value {
    match rule {
        FieldMergeRule::NonEmptyWins => prefer_non_empty(stored, incoming),
        FieldMergeRule::KeepExisting => {
            if is_empty_value(stored) {
                incoming.clone()
            } else {
                stored.clone()
            }
        },
        FieldMergeRule::Max | FieldMergeRule::Min => match (stored.as_f64(), incoming.as_f64()) {
            (Some(a), Some(b)) => {
                let take_incoming = if rule == FieldMergeRule::Max { b > a } else { b < a };
                if take_incoming {
                    incoming.clone()
                } else {
                    stored.clone()
                }
            },
            _ => prefer_non_empty(stored, incoming),
        },
        FieldMergeRule::Union => match (stored, incoming) {
            (Value::Array(old), Value::Array(new)) => {
                let mut items = old.clone();
                for item in new {
                    if !items.contains(item) {
                        items.push(item.clone());
                    }
                }
                Value::Array(items)
            },
            _ => prefer_non_empty(stored, incoming),
        },
    }
}

fn prefer_non_empty(stored: &Value, incoming: &Value) -> Value {
    if is_empty_value(incoming) {
        stored.clone()
    } else {
        incoming.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> FieldMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_non_empty_incoming_wins() {
        let stored = map(json!({"title": "Old", "abstract": "kept", "journal": "J"}));
        let incoming = map(json!({"title": "New", "abstract": "", "journal": null, "doi": "10.1/x"}));

        let merged = merge_fields(&stored, &incoming, &MergePolicy::default());
        assert_eq!(merged["title"], "New");
        assert_eq!(merged["abstract"], "kept");
        assert_eq!(merged["journal"], "J");
        assert_eq!(merged["doi"], "10.1/x");
    }

    #[test]
    fn test_whitespace_is_a_value() {
        let stored = map(json!({"note": "draft"}));
        let incoming = map(json!({"note": " "}));
        let merged = merge_fields(&stored, &incoming, &MergePolicy::default());
        assert_eq!(merged["note"], " ");
    }

    #[test]
    fn test_stored_only_fields_survive() {
        let stored = map(json!({"a": 1, "b": 2}));
        let incoming = map(json!({"a": 3}));
        let merged = merge_fields(&stored, &incoming, &MergePolicy::default());
        assert_eq!(merged, map(json!({"a": 3, "b": 2})));
    }

    #[test]
    fn test_field_rules() {
        let policy = MergePolicy::default()
            .with_rule("first_seen", FieldMergeRule::KeepExisting)
            .with_rule("max_phase", FieldMergeRule::Max)
            .with_rule("earliest", FieldMergeRule::Min)
            .with_rule("synonyms", FieldMergeRule::Union);

        let stored = map(json!({
            "first_seen": "2020-01-01",
            "max_phase": 2,
            "earliest": 1999,
            "synonyms": ["aspirin", "ASA"]
        }));
        let incoming = map(json!({
            "first_seen": "2024-01-01",
            "max_phase": 3,
            "earliest": 2005,
            "synonyms": ["ASA", "acetylsalicylic acid"]
        }));

        let merged = merge_fields(&stored, &incoming, &policy);
        assert_eq!(merged["first_seen"], "2020-01-01");
        assert_eq!(merged["max_phase"], 3);
        assert_eq!(merged["earliest"], 1999);
        assert_eq!(
            merged["synonyms"],
            json!(["aspirin", "ASA", "acetylsalicylic acid"])
        );
    }

    #[test]
    fn test_numeric_rules_fall_back_for_non_numbers() {
        assert_eq!(
            merge_value(&json!("n/a"), &json!(4), FieldMergeRule::Max),
            json!(4)
        );
        assert_eq!(
            merge_value(&json!(5), &json!(null), FieldMergeRule::Min),
            json!(5)
        );
    }
}
