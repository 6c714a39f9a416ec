//! Record-side rule conditions.
//!
//! An `openehrCondition` narrows the flat record a rule is expanded against.
//! The condition's `targetRoot` is matched against the record keys; every
//! concrete occurrence found is tested and the occurrences that fail are cut
//! out of the record together with everything below them.
//!
//! Occurrences that pass, and keys outside any occurrence, are kept. When the
//! root matches nothing the record is returned unchanged.

use crate::constants::{OPERATOR_EMPTY, OPERATOR_ONE_OF};
use crate::mapping::Condition;
use crate::paths::{matching_keys, to_record_path};
use indexmap::IndexSet;
use openehr::FlatRecord;

/// Returns the part of `record` a rule restricted by `condition` may see.
///
/// `root` is the template root id substituted for the archetype placeholder.
pub fn split_by_condition(
    record: &FlatRecord,
    condition: Option<&Condition>,
    root: &str,
) -> FlatRecord {
    let Some(condition) = condition else {
        return record.clone();
    };

    let occurrences = occurrences(record, condition, root);
    if occurrences.is_empty() {
        return record.clone();
    }

    let operator = condition.operator.as_deref().unwrap_or_default();
    let excluded: Vec<&String> = match operator {
        OPERATOR_ONE_OF => occurrences
            .iter()
            .filter(|occurrence| !one_of_holds(record, condition, occurrence))
            .collect(),
        OPERATOR_EMPTY => occurrences
            .iter()
            .filter(|occurrence| !empty_holds(record, condition, occurrence))
            .collect(),
        other => {
            tracing::debug!(operator = %other, "record condition operator does not split");
            return record.clone();
        }
    };

    if excluded.is_empty() {
        return record.clone();
    }
    record.filtered(|key| !excluded.iter().any(|occurrence| is_below(key, occurrence)))
}

/// `key` is the occurrence itself or lies underneath it.
fn is_below(key: &str, occurrence: &str) -> bool {
    key.strip_prefix(occurrence)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/') || rest.starts_with('|'))
}

/// Distinct concrete occurrences of the condition root, in record order.
fn occurrences(record: &FlatRecord, condition: &Condition, root: &str) -> IndexSet<String> {
    let path = to_record_path(&condition.target_root, root);
    matching_keys(&path, record.keys()).into_iter().collect()
}

fn attribute_key(occurrence: &str, attribute: &str) -> String {
    format!("{occurrence}/{}", to_record_path(attribute, ""))
}

fn one_of_holds(record: &FlatRecord, condition: &Condition, occurrence: &str) -> bool {
    let criteria = condition.criteria.as_deref().unwrap_or_default();
    let holds = condition.attributes().iter().any(|attribute| {
        let key = attribute_key(occurrence, attribute);
        let value = record.get_text(&key).unwrap_or_default();
        !value.is_empty() && criteria.contains(&value)
    });
    if !holds {
        tracing::info!(
            occurrence = %occurrence,
            criteria = %criteria,
            "record condition not met, excluding occurrence from mapping"
        );
    }
    holds
}

fn empty_holds(record: &FlatRecord, condition: &Condition, occurrence: &str) -> bool {
    let holds = condition.attributes().iter().any(|attribute| {
        let key = attribute_key(occurrence, attribute);
        matching_keys(&key, record.keys()).is_empty()
    });
    if !holds {
        tracing::info!(
            occurrence = %occurrence,
            "record condition requires emptiness, excluding occurrence"
        );
    }
    holds
}
