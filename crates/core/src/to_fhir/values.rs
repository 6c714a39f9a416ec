//! Extraction of typed data points from a flat record.

use crate::constants::OPENEHR_ARCHETYPE;
use crate::paths::last_index;
use crate::values::{data_kind, kind, CodingValue, DataValue, Number};
use indexmap::IndexMap;
use openehr::FlatRecord;

const UCUM_SYSTEM: &str = "http://unitsofmeasure.org";

/// One value read from the record, with the occurrence it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub value: DataValue,
    /// Right-most occurrence index of `path`, -1 for values that apply to
    /// every built resource.
    pub index: i64,
    /// Concrete flat path the value was read from.
    pub path: String,
}

impl DataPoint {
    /// A literal from a rule, applied to every built resource.
    pub fn literal(value: &str) -> Self {
        Self {
            value: DataValue::Text(value.to_owned()),
            index: -1,
            path: OPENEHR_ARCHETYPE.to_owned(),
        }
    }

    pub fn is_literal(&self) -> bool {
        self.path == OPENEHR_ARCHETYPE
    }
}

/// Groups matched keys by the element they address: `x|magnitude` and
/// `x|unit` both belong to `x`. A bare key replaces whatever was grouped
/// under it before.
pub fn group_keys(keys: Vec<String>) -> IndexMap<String, Vec<String>> {
    let mut groups: IndexMap<String, Vec<String>> = IndexMap::new();
    for key in keys {
        match key.split_once('|') {
            None => {
                groups.insert(key.clone(), vec![key]);
            }
            Some((root, _)) => groups.entry(root.to_owned()).or_default().push(key),
        }
    }
    groups
}

/// Reads one element of the given RM type or mapping kind.
///
/// `keys` are the concrete keys grouped under `root`. With `can_be_null`
/// unset an element without value still yields an empty text point, which
/// condition-only rules need to know an occurrence exists.
pub fn value_to_data_point(
    root: &str,
    keys: &[String],
    rm_type: &str,
    record: &FlatRecord,
    can_be_null: bool,
) -> Option<DataPoint> {
    let primary = keys.first()?;
    let index = last_index(root);
    let text_at = |key: &str| record.get_text(key);
    let suffixed = |name: &str| {
        keys.iter()
            .find(|k| k.rsplit_once('|').is_some_and(|(_, suffix)| suffix == name))
            .and_then(|k| text_at(k))
    };

    let value = match data_kind(rm_type) {
        kind::PROPORTION => {
            let percent = text_at(&format!("{root}|denominator"))
                .and_then(|d| d.trim().parse::<f64>().ok())
                .is_some_and(|d| d == 100.0);
            DataValue::Quantity {
                value: text_at(&format!("{root}|numerator")).and_then(|n| Number::parse(&n)),
                unit: percent.then(|| "percent".to_owned()),
                system: percent.then(|| UCUM_SYSTEM.to_owned()),
                code: percent.then(|| "%".to_owned()),
            }
        }
        kind::QUANTITY => {
            let magnitude = suffixed("magnitude");
            let ordinal = suffixed("ordinal");
            let unit = suffixed("unit");
            let value = suffixed("value");
            let code = suffixed("code");
            let number = match (&magnitude, &ordinal, &unit, &value, &code) {
                (Some(m), _, _, _, _) => Number::parse(m),
                (None, Some(o), _, _, _) => Number::parse(o),
                (None, None, None, None, None) => text_at(primary).and_then(|v| Number::parse(&v)),
                _ => None,
            };
            DataValue::Quantity {
                value: number,
                unit: value.or(unit),
                system: None,
                code,
            }
        }
        kind::DATETIME => DataValue::DateTime(text_at(primary)?),
        kind::DATE => DataValue::Date(text_at(primary)?),
        kind::TIME => DataValue::Time(text_at(primary)?),
        kind::BOOL => DataValue::Boolean(text_at(primary)?.eq_ignore_ascii_case("true")),
        kind::CODEABLECONCEPT => {
            let text = suffixed("value");
            DataValue::CodeableConcept {
                coding: CodingValue {
                    system: suffixed("terminology"),
                    code: suffixed("code"),
                    display: text.clone(),
                },
                text,
            }
        }
        kind::CODING => DataValue::Coding(CodingValue {
            system: suffixed("terminology"),
            code: suffixed("code"),
            display: suffixed("value"),
        }),
        kind::MEDIA => DataValue::Attachment {
            content_type: text_at(&format!("{root}|mediatype")),
            size: text_at(&format!("{root}|size")).and_then(|s| s.trim().parse().ok()),
            url: text_at(&format!("{root}|url")),
            data: text_at(&format!("{root}|data")),
        },
        kind::IDENTIFIER => {
            DataValue::Identifier(suffixed("id").or_else(|| text_at(&format!("{root}|id")))?)
        }
        _ => match text_at(primary).filter(|v| !v.is_empty()) {
            Some(text) => DataValue::Text(text),
            None if can_be_null => return None,
            None => DataValue::Text(String::new()),
        },
    };

    Some(DataPoint {
        value,
        index,
        path: root.to_owned(),
    })
}
