//! Writes values selected from resources into flat record entries, shaped
//! by the RM type of the target element.

use crate::constants::{DATE_FORMAT, DATE_TIME_FORMAT, TIME_FORMAT};
use base64::Engine as _;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use fhir::{NodeId, Primitive, ResourceGraph, TypeDescriptor, Value};
use openehr::{rm, FlatRecord};
use serde_json::Value as Json;

pub struct Emitter<'a> {
    pub graph: &'a ResourceGraph,
    pub types: &'a dyn TypeDescriptor,
}

/// A date/time value as FHIR spells it.
#[derive(Debug, Clone, PartialEq)]
enum Moment {
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    /// Partial dates (`2020`, `2020-03`) and anything else left as written.
    Verbatim(String),
}

impl Moment {
    fn parse(text: &str) -> Self {
        if let Ok(moment) = DateTime::parse_from_rfc3339(text) {
            return Moment::DateTime(moment.naive_local());
        }
        if let Ok(moment) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
            return Moment::DateTime(moment);
        }
        if let Ok(date) = NaiveDate::parse_from_str(text, DATE_FORMAT) {
            return Moment::Date(date);
        }
        if let Ok(time) = NaiveTime::parse_from_str(text, "%H:%M:%S%.f") {
            return Moment::Time(time);
        }
        Moment::Verbatim(text.to_owned())
    }
}

impl Emitter<'_> {
    /// Writes `value` under `path`. Without a type the value's text form is
    /// written.
    pub fn emit(&self, path: &str, value: &Value, rm_type: Option<&str>, record: &mut FlatRecord) {
        let Some(rm_type) = rm_type else {
            self.emit_text(path, value, record);
            return;
        };
        if rm_type == rm::TYPE_NONE {
            tracing::debug!(path = %path, "type is NONE, nothing written");
            return;
        }
        let written = match value {
            Value::Node(node) => self.emit_node(path, *node, rm_type, record),
            other => self.emit_atom(path, other, rm_type, record),
        };
        if !written {
            tracing::warn!(
                path = %path,
                rm_type = %rm_type,
                found = %self.type_of(value),
                "value does not fit the record type, writing its text"
            );
            self.emit_text(path, value, record);
        }
    }

    fn emit_node(&self, path: &str, node: NodeId, rm_type: &str, record: &mut FlatRecord) -> bool {
        let type_name = self.graph.type_name(node);
        let is = |wanted: &str| self.types.is_a(type_name, wanted);

        match rm_type {
            rm::DV_MULTIMEDIA if is("Attachment") => {
                let data = self.graph.child_text(node, "data");
                let size = match self.number(node, "size") {
                    Some(size) if size != 0.0 => size as i64,
                    _ => data
                        .as_deref()
                        .and_then(|d| base64::engine::general_purpose::STANDARD.decode(d).ok())
                        .map(|bytes| bytes.len() as i64)
                        .unwrap_or_default(),
                };
                record.insert(format!("{path}|size"), Json::from(size));
                self.copy_text(node, "contentType", &format!("{path}|mediatype"), record);
                match self.graph.child_text(node, "url").filter(|u| !u.is_empty()) {
                    Some(url) => record.insert_text(format!("{path}|url"), &url),
                    None => {
                        let data = data.as_deref().unwrap_or_default();
                        record.insert_text(format!("{path}|data"), data)
                    }
                }
                true
            }
            rm::DV_QUANTITY if is("Ratio") => match self.graph.first_child(node, "numerator") {
                Some(numerator) => self.emit_node(path, numerator, rm_type, record),
                None => true,
            },
            rm::DV_QUANTITY if is("Quantity") => {
                if let Some(value) = self.number(node, "value") {
                    insert_number(record, format!("{path}|magnitude"), value);
                }
                self.copy_text(node, "unit", &format!("{path}|unit"), record);
                true
            }
            rm::DV_ORDINAL if is("Quantity") => {
                if let Some(value) = self.number(node, "value") {
                    insert_number(record, format!("{path}|ordinal"), value);
                }
                self.copy_text(node, "unit", &format!("{path}|value"), record);
                self.copy_text(node, "code", &format!("{path}|code"), record);
                true
            }
            rm::DV_PROPORTION if is("Quantity") => {
                if self.graph.child_text(node, "code").as_deref() == Some("%") {
                    insert_number(record, format!("{path}|denominator"), 100.0);
                }
                if let Some(value) = self.number(node, "value") {
                    insert_number(record, format!("{path}|numerator"), value);
                }
                record.insert(format!("{path}|type"), Json::from(2));
                true
            }
            rm::DV_COUNT if is("Quantity") => {
                if let Some(value) = self.number(node, "value") {
                    record.insert(path, Json::from(value.trunc() as i64));
                }
                true
            }
            rm::DV_COUNT => match self.graph.value(node) {
                Some(Primitive::Integer(count)) => {
                    record.insert(path, Json::from(*count));
                    true
                }
                _ => false,
            },
            rm::DV_DATE_TIME | rm::DV_DATE | rm::DV_TIME => match self.graph.value(node) {
                Some(Primitive::Text(text)) => self.emit_moment(path, text, rm_type, record),
                _ => false,
            },
            rm::DV_CODED_TEXT if is("CodeableConcept") => {
                let coding = self.graph.first_child(node, "coding");
                if let Some(coding) = coding {
                    self.copy_text(coding, "code", &format!("{path}|code"), record);
                    self.copy_text(coding, "system", &format!("{path}|terminology"), record);
                }
                let text = self
                    .graph
                    .child_text(node, "text")
                    .or_else(|| coding.and_then(|c| self.graph.child_text(c, "display")));
                record.insert_text(format!("{path}|value"), text.as_deref().unwrap_or_default());
                true
            }
            rm::DV_CODED_TEXT if is("Coding") => {
                self.copy_text(node, "code", &format!("{path}|code"), record);
                self.copy_text(node, "system", &format!("{path}|terminology"), record);
                self.copy_text(node, "display", &format!("{path}|value"), record);
                true
            }
            rm::DV_IDENTIFIER if is("Identifier") => {
                self.copy_text(node, "value", &format!("{path}|id"), record);
                true
            }
            rm::CODE_PHRASE if is("Coding") => {
                self.copy_text(node, "code", &format!("{path}|code"), record);
                self.copy_text(node, "system", &format!("{path}|terminology"), record);
                true
            }
            rm::CODE_PHRASE if is("Extension") => match self.graph.first_child(node, "value") {
                Some(value) => self.emit_node(path, value, rm_type, record),
                None => true,
            },
            rm::CODE_PHRASE if is("CodeableConcept") => {
                match self.graph.first_child(node, "coding") {
                    Some(coding) => self.emit_node(path, coding, rm_type, record),
                    None => true,
                }
            }
            rm::CODE_PHRASE if type_name == "code" => {
                let code = self.graph.value(node).map(Primitive::as_text).unwrap_or_default();
                record.insert_text(format!("{path}|code"), &code);
                true
            }
            rm::DV_BOOL => match self.graph.value(node) {
                Some(Primitive::Boolean(flag)) => {
                    record.insert(path, Json::Bool(*flag));
                    true
                }
                Some(Primitive::Text(text)) => {
                    record.insert(path, Json::Bool(text.eq_ignore_ascii_case("true")));
                    true
                }
                _ => false,
            },
            rm::DV_MULTIMEDIA
            | rm::DV_QUANTITY
            | rm::DV_ORDINAL
            | rm::DV_PROPORTION
            | rm::DV_CODED_TEXT
            | rm::DV_IDENTIFIER
            | rm::CODE_PHRASE => false,
            _ => {
                self.emit_node_text(path, node, record);
                true
            }
        }
    }

    /// Values computed by the evaluator rather than found in the graph.
    fn emit_atom(&self, path: &str, value: &Value, rm_type: &str, record: &mut FlatRecord) -> bool {
        match (rm_type, value) {
            (rm::DV_BOOL, Value::Boolean(flag)) => {
                record.insert(path, Json::Bool(*flag));
                true
            }
            (rm::DV_BOOL, Value::String(text)) => {
                record.insert(path, Json::Bool(text.eq_ignore_ascii_case("true")));
                true
            }
            (rm::DV_COUNT, Value::Integer(count)) => {
                record.insert(path, Json::from(*count));
                true
            }
            (rm::DV_DATE_TIME | rm::DV_DATE | rm::DV_TIME, Value::String(text)) => {
                self.emit_moment(path, text, rm_type, record)
            }
            (rm::DV_TEXT, _) => {
                self.emit_text(path, value, record);
                true
            }
            _ => false,
        }
    }

    fn emit_moment(&self, path: &str, text: &str, rm_type: &str, record: &mut FlatRecord) -> bool {
        let formatted = match (rm_type, Moment::parse(text)) {
            (_, Moment::Verbatim(text)) => text,
            (rm::DV_DATE_TIME, Moment::DateTime(moment)) => {
                moment.format(DATE_TIME_FORMAT).to_string()
            }
            (rm::DV_DATE_TIME | rm::DV_DATE, Moment::Date(date)) => {
                date.format(DATE_FORMAT).to_string()
            }
            (rm::DV_DATE_TIME | rm::DV_TIME, Moment::Time(time)) => {
                time.format(TIME_FORMAT).to_string()
            }
            (rm::DV_DATE, Moment::DateTime(moment)) => {
                moment.date().format(DATE_FORMAT).to_string()
            }
            (rm::DV_TIME, Moment::DateTime(moment)) => {
                moment.time().format(TIME_FORMAT).to_string()
            }
            _ => return false,
        };
        record.insert_text(path, &formatted);
        true
    }

    /// Text rendering used for untyped and text targets.
    fn emit_text(&self, path: &str, value: &Value, record: &mut FlatRecord) {
        match value {
            Value::Node(node) => self.emit_node_text(path, *node, record),
            Value::Boolean(flag) => record.insert_text(path, &flag.to_string()),
            Value::String(text) => record.insert_text(path, text),
            Value::Integer(number) => record.insert_text(path, &number.to_string()),
            Value::Decimal(number) => record.insert_text(path, &fhir::format_decimal(*number)),
        }
    }

    fn emit_node_text(&self, path: &str, node: NodeId, record: &mut FlatRecord) {
        if let Some(text) = self.node_text(node) {
            record.insert_text(path, &text);
        } else {
            tracing::error!(
                path = %path,
                found = %self.graph.type_name(node),
                "no text form for value"
            );
        }
    }

    fn node_text(&self, node: NodeId) -> Option<String> {
        if let Some(primitive) = self.graph.value(node) {
            return Some(primitive.as_text());
        }
        let type_name = self.graph.type_name(node);
        let is = |wanted: &str| self.types.is_a(type_name, wanted);
        if is("Quantity") {
            self.graph.child_text(node, "value")
        } else if is("Coding") {
            self.graph.child_text(node, "code")
        } else if is("Annotation") || is("Address") {
            self.graph.child_text(node, "text")
        } else if is("HumanName") {
            self.human_name(node)
        } else if is("Extension") {
            self.graph
                .first_child(node, "value")
                .and_then(|value| self.graph.value(value))
                .map(Primitive::as_text)
        } else {
            None
        }
    }

    /// Given names followed by the family name.
    fn human_name(&self, node: NodeId) -> Option<String> {
        let mut parts: Vec<String> = self
            .graph
            .children(node, "given")
            .iter()
            .filter_map(|given| self.graph.value(*given).map(Primitive::as_text))
            .collect();
        parts.extend(self.graph.child_text(node, "family"));
        if parts.is_empty() {
            self.graph.child_text(node, "text")
        } else {
            Some(parts.join(" "))
        }
    }

    fn number(&self, node: NodeId, field: &str) -> Option<f64> {
        match self.graph.first_child(node, field).and_then(|n| self.graph.value(n)) {
            Some(Primitive::Decimal(value)) => Some(*value),
            Some(Primitive::Integer(value)) => Some(*value as f64),
            Some(Primitive::Text(text)) => text.trim().parse().ok(),
            _ => None,
        }
    }

    fn copy_text(&self, node: NodeId, field: &str, key: &str, record: &mut FlatRecord) {
        if let Some(text) = self.graph.child_text(node, field) {
            record.insert_text(key, &text);
        }
    }

    fn type_of(&self, value: &Value) -> String {
        match value {
            Value::Node(node) => self.graph.type_name(*node).to_owned(),
            Value::Boolean(_) => "boolean".to_owned(),
            Value::String(_) => "string".to_owned(),
            Value::Integer(_) => "integer".to_owned(),
            Value::Decimal(_) => "decimal".to_owned(),
        }
    }
}

/// Whole numbers are written as integers, everything else as decimals.
fn insert_number(record: &mut FlatRecord, key: String, value: f64) {
    let json = if value.fract() == 0.0 && value.abs() < 1e15 {
        Json::from(value as i64)
    } else {
        serde_json::Number::from_f64(value).map(Json::Number).unwrap_or(Json::Null)
    };
    if !json.is_null() {
        record.insert(key, json);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhir::{parse_resource, r4, FhirPath, PathEvaluator};

    fn emit(resource: &str, expression: &str, path: &str, rm_type: Option<&str>) -> FlatRecord {
        let types = r4().expect("registry");
        let parsed = parse_resource(resource, types).expect("resource");
        let found = FhirPath::new(types)
            .evaluate_node(&parsed.graph, parsed.root, expression)
            .expect("evaluates");
        let emitter = Emitter {
            graph: &parsed.graph,
            types,
        };
        let mut record = FlatRecord::new();
        for value in &found {
            emitter.emit(path, value, rm_type, &mut record);
        }
        record
    }

    const OBSERVATION: &str = r#"{
        "resourceType": "Observation",
        "status": "final",
        "code": {
            "coding": [{ "system": "http://loinc.org", "code": "8480-6", "display": "Systolic" }],
            "text": "Systolic BP"
        },
        "effectiveDateTime": "2022-02-03T04:05:06+01:00",
        "valueQuantity": {
            "value": 120,
            "unit": "mm[Hg]",
            "system": "http://unitsofmeasure.org",
            "code": "mm[Hg]"
        }
    }"#;

    #[test]
    fn quantity_is_written_as_magnitude_and_unit() {
        let record = emit(OBSERVATION, "Observation.value", "v/bp/systolic", Some(rm::DV_QUANTITY));
        assert_eq!(record.get("v/bp/systolic|magnitude"), Some(&Json::from(120)));
        assert_eq!(record.get_text("v/bp/systolic|unit").as_deref(), Some("mm[Hg]"));
    }

    #[test]
    fn coded_text_takes_the_first_coding() {
        let record = emit(OBSERVATION, "Observation.code", "v/bp/code", Some(rm::DV_CODED_TEXT));
        assert_eq!(record.get_text("v/bp/code|code").as_deref(), Some("8480-6"));
        assert_eq!(record.get_text("v/bp/code|terminology").as_deref(), Some("http://loinc.org"));
        assert_eq!(record.get_text("v/bp/code|value").as_deref(), Some("Systolic BP"));
    }

    #[test]
    fn date_time_keeps_the_wall_clock() {
        let record =
            emit(OBSERVATION, "Observation.effective", "v/bp/time", Some(rm::DV_DATE_TIME));
        assert_eq!(record.get_text("v/bp/time").as_deref(), Some("2022-02-03T04:05:06"));
        let record = emit(OBSERVATION, "Observation.effective", "v/bp/day", Some(rm::DV_DATE));
        assert_eq!(record.get_text("v/bp/day").as_deref(), Some("2022-02-03"));
    }

    #[test]
    fn mismatched_types_fall_back_to_text() {
        let record = emit(OBSERVATION, "Observation.status", "v/bp/status", Some(rm::DV_QUANTITY));
        assert_eq!(record.get_text("v/bp/status").as_deref(), Some("final"));
    }

    #[test]
    fn untyped_coding_writes_its_code() {
        let record = emit(OBSERVATION, "Observation.code.coding", "v/bp/code", None);
        assert_eq!(record.get_text("v/bp/code").as_deref(), Some("8480-6"));
    }

    #[test]
    fn percent_quantity_becomes_proportion() {
        let resource = r#"{
            "resourceType": "Observation",
            "status": "final",
            "code": { "text": "SpO2" },
            "valueQuantity": { "value": 97.5, "code": "%" }
        }"#;
        let record = emit(resource, "Observation.value", "v/spo2", Some(rm::DV_PROPORTION));
        assert_eq!(record.get("v/spo2|denominator"), Some(&Json::from(100)));
        assert_eq!(record.get_text("v/spo2|numerator").as_deref(), Some("97.5"));
        assert_eq!(record.get("v/spo2|type"), Some(&Json::from(2)));
    }

    #[test]
    fn names_join_given_and_family() {
        let resource = r#"{
            "resourceType": "Patient",
            "name": [{ "family": "Doe", "given": ["Jane", "Q"] }]
        }"#;
        let record = emit(resource, "Patient.name", "v/patient/name", Some(rm::DV_TEXT));
        assert_eq!(record.get_text("v/patient/name").as_deref(), Some("Jane Q Doe"));
    }

    #[test]
    fn partial_dates_are_kept_verbatim() {
        assert_eq!(Moment::parse("2020-03"), Moment::Verbatim("2020-03".into()));
        assert!(matches!(Moment::parse("2020-03-01"), Moment::Date(_)));
        assert!(matches!(Moment::parse("10:30:00"), Moment::Time(_)));
    }
}
