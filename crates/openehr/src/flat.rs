//! Flat composition format.
//!
//! A flat record maps `/`-delimited paths to primitive values:
//!
//! ```text
//! blood_pressure/any_event:0/systolic|magnitude = 120.0
//! blood_pressure/any_event:0/systolic|unit      = "mm[Hg]"
//! ```
//!
//! Keys keep their insertion order so output mirrors the order values were
//! produced in.

use crate::{schema_mismatch, OpenehrResult};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlatRecord {
    entries: IndexMap<String, Value>,
}

impl FlatRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a flat JSON object. Nested objects and arrays are rejected.
    pub fn from_json(text: &str) -> OpenehrResult<Self> {
        let mut de = serde_json::Deserializer::from_str(text);
        let record: FlatRecord = serde_path_to_error::deserialize(&mut de)
            .map_err(|e| schema_mismatch("flat record", e))?;
        if let Some((key, _)) = record
            .entries
            .iter()
            .find(|(_, v)| v.is_object() || v.is_array())
        {
            return Err(crate::OpenehrError::Translation(format!(
                "flat record value at {key} must be a primitive"
            )));
        }
        Ok(record)
    }

    pub fn to_json_string(&self) -> OpenehrResult<String> {
        Ok(serde_json::to_string_pretty(&self.entries)?)
    }

    pub fn to_json_value(&self) -> Value {
        Value::Object(self.entries.clone().into_iter().collect())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Value at `key` rendered as text. Numbers keep their JSON spelling.
    pub fn get_text(&self, key: &str) -> Option<String> {
        match self.entries.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Inserts a value, replacing any previous value under `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    /// Inserts a text value; empty text is ignored.
    pub fn insert_text(&mut self, key: impl Into<String>, value: &str) {
        if value.is_empty() {
            return;
        }
        self.entries.insert(key.into(), Value::String(value.to_owned()));
    }

    /// Copy containing only entries whose key satisfies `keep`.
    pub fn filtered(&self, mut keep: impl FnMut(&str) -> bool) -> FlatRecord {
        FlatRecord {
            entries: self
                .entries
                .iter()
                .filter(|(k, _)| keep(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn extend(&mut self, other: FlatRecord) {
        self.entries.extend(other.entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn preserves_order_and_renders_numbers() {
        let record = FlatRecord::from_json(
            r#"{
                "bp/any_event:0/systolic|magnitude": 120.0,
                "bp/any_event:0/systolic|unit": "mm[Hg]",
                "bp/flag": true
            }"#,
        )
        .expect("valid flat");
        let keys: Vec<&str> = record.keys().collect();
        assert_eq!(keys[0], "bp/any_event:0/systolic|magnitude");
        assert_eq!(record.get_text("bp/any_event:0/systolic|magnitude").as_deref(), Some("120.0"));
        assert_eq!(record.get_text("bp/flag").as_deref(), Some("true"));
    }

    #[test]
    fn nested_values_are_rejected() {
        let err = FlatRecord::from_json(r#"{"bp/x": {"nested": 1}}"#).expect_err("nested");
        match err {
            crate::OpenehrError::Translation(msg) => assert!(msg.contains("bp/x")),
            other => panic!("expected Translation, got {other:?}"),
        }
    }

    #[test]
    fn non_object_reports_root_path() {
        let err = FlatRecord::from_json("[1, 2]").expect_err("array");
        match err {
            crate::OpenehrError::Translation(msg) => assert!(msg.contains("<root>")),
            other => panic!("expected Translation, got {other:?}"),
        }
    }

    #[test]
    fn insert_text_skips_empty_and_filtered_keeps_matches() {
        let mut record = FlatRecord::new();
        record.insert_text("a/b", "");
        record.insert_text("a/c", "x");
        record.insert("d/e", json!(1));
        assert_eq!(record.len(), 2);

        let only_a = record.filtered(|k| k.starts_with("a/"));
        assert_eq!(only_a.len(), 1);
        assert!(only_a.contains_key("a/c"));
    }
}
