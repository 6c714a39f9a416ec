//! Writes extracted record values into resource elements.
//!
//! What gets written depends on both sides: a quantity lands in a
//! `Quantity` as is, in a `Ratio` as its numerator and in an integer as its
//! truncated value. Combinations that make no sense are logged and skipped.

use crate::constructor::Built;
use crate::values::{CodingValue, DataValue, Number};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Local;
use fhir::{NodeId, Primitive, ResourceGraph, TypeDescriptor};

pub struct Populator<'t> {
    types: &'t dyn TypeDescriptor,
}

impl<'t> Populator<'t> {
    pub fn new(types: &'t dyn TypeDescriptor) -> Self {
        Self { types }
    }

    /// Populates `target`. For a repeating target the last element is
    /// filled while it is still empty, otherwise a new element is appended.
    pub fn populate(&self, graph: &mut ResourceGraph, target: &Built, data: &DataValue) {
        match target {
            Built::Single(node) => self.populate_node(graph, *node, data),
            Built::Many { owner, field } => match graph.last_child(*owner, field) {
                Some(last) if graph.is_empty(last) => self.populate_node(graph, last, data),
                _ => {
                    if let Some(element) = self.append_typed(graph, *owner, field, data) {
                        self.populate_node(graph, element, data);
                    }
                }
            },
        }
    }

    pub fn populate_node(&self, graph: &mut ResourceGraph, node: NodeId, data: &DataValue) {
        let target = graph.type_name(node).to_owned();
        if target == "Extension" {
            let Some(value) = self.create_child(graph, node, "value", Some(data.fhir_type())) else {
                return;
            };
            self.populate_node(graph, value, data);
            return;
        }

        let written = match data {
            DataValue::Quantity { value, unit, system, code } => {
                if self.types.is_a(&target, "Quantity") {
                    self.write_quantity(graph, node, *value, unit, system, code);
                    true
                } else if target == "Ratio" {
                    match self.create_child(graph, node, "numerator", None) {
                        Some(numerator) => {
                            self.write_quantity(graph, numerator, *value, unit, system, code);
                            true
                        }
                        None => false,
                    }
                } else if self.types.is_a(&target, "integer") {
                    if let Some(value) = value {
                        graph.set_value(node, Primitive::Integer(value.as_i64()));
                    }
                    true
                } else if target == "decimal" {
                    if let Some(value) = value {
                        graph.set_value(node, Primitive::Decimal(value.as_f64()));
                    }
                    true
                } else {
                    false
                }
            }
            DataValue::DateTime(text) => {
                self.write_temporal(graph, node, &target, &["dateTime", "instant"], text)
            }
            DataValue::Date(text) => {
                self.write_temporal(graph, node, &target, &["date", "dateTime"], text)
            }
            DataValue::Time(text) => {
                if target == "time" {
                    graph.set_value(node, Primitive::Text(text.clone()));
                    true
                } else if target == "dateTime" {
                    let today = Local::now().date_naive().format(crate::constants::DATE_FORMAT);
                    graph.set_value(node, Primitive::Text(format!("{today}T{text}")));
                    true
                } else {
                    false
                }
            }
            DataValue::Boolean(flag) => {
                if target == "boolean" {
                    graph.set_value(node, Primitive::Boolean(*flag));
                    true
                } else if self.types.is_a(&target, "string") {
                    graph.set_value(node, Primitive::Text(flag.to_string()));
                    true
                } else {
                    false
                }
            }
            DataValue::CodeableConcept { text, coding } => match target.as_str() {
                "CodeableConcept" => {
                    self.set_text(graph, node, "text", text.as_deref());
                    if let Some(element) = self.create_child(graph, node, "coding", None) {
                        self.write_coding(graph, element, coding);
                    }
                    true
                }
                "Coding" => {
                    self.write_coding(graph, node, coding);
                    true
                }
                _ => self.write_code(graph, node, &target, coding),
            },
            DataValue::Coding(coding) => match target.as_str() {
                "Coding" => {
                    self.write_coding(graph, node, coding);
                    true
                }
                "CodeableConcept" => {
                    if let Some(element) = self.create_child(graph, node, "coding", None) {
                        self.write_coding(graph, element, coding);
                    }
                    true
                }
                _ => self.write_code(graph, node, &target, coding),
            },
            DataValue::Attachment { content_type, size, url, data } => {
                if target == "Attachment" {
                    self.set_text(graph, node, "contentType", content_type.as_deref());
                    if let Some(size) = size {
                        self.set_primitive(graph, node, "size", Primitive::Integer(*size));
                    }
                    self.set_text(graph, node, "url", url.as_deref());
                    if let Some(data) = data {
                        let encoded = Primitive::Text(BASE64.encode(data.as_bytes()));
                        self.set_primitive(graph, node, "data", encoded);
                    }
                    true
                } else {
                    false
                }
            }
            DataValue::Identifier(value) => {
                if target == "Identifier" {
                    self.set_text(graph, node, "value", Some(value));
                    true
                } else {
                    false
                }
            }
            DataValue::Text(text) => {
                if self.types.is_primitive(&target) {
                    self.write_text(graph, node, &target, text)
                } else {
                    false
                }
            }
        };

        if !written {
            tracing::warn!(
                target_type = %target,
                value = data.kind_name(),
                "value does not fit the target element, skipping"
            );
        }
    }

    fn write_quantity(
        &self,
        graph: &mut ResourceGraph,
        node: NodeId,
        value: Option<Number>,
        unit: &Option<String>,
        system: &Option<String>,
        code: &Option<String>,
    ) {
        if let Some(value) = value {
            let primitive = match value {
                Number::Integer(i) => Primitive::Integer(i),
                Number::Decimal(d) => Primitive::Decimal(d),
            };
            self.set_primitive(graph, node, "value", primitive);
        }
        self.set_text(graph, node, "unit", unit.as_deref());
        self.set_text(graph, node, "system", system.as_deref());
        self.set_text(graph, node, "code", code.as_deref());
    }

    fn write_temporal(
        &self,
        graph: &mut ResourceGraph,
        node: NodeId,
        target: &str,
        accepted: &[&str],
        text: &str,
    ) -> bool {
        if !accepted.contains(&target) {
            return false;
        }
        graph.set_value(node, Primitive::Text(text.to_owned()));
        true
    }

    fn write_coding(&self, graph: &mut ResourceGraph, node: NodeId, coding: &CodingValue) {
        self.set_text(graph, node, "system", coding.system.as_deref());
        self.set_text(graph, node, "code", coding.code.as_deref());
        self.set_text(graph, node, "display", coding.display.as_deref());
    }

    /// A coded value written into a `code` or other string primitive keeps
    /// only its code.
    fn write_code(
        &self,
        graph: &mut ResourceGraph,
        node: NodeId,
        target: &str,
        coding: &CodingValue,
    ) -> bool {
        if !self.types.is_a(target, "string") {
            return false;
        }
        if let Some(code) = &coding.code {
            graph.set_value(node, Primitive::Text(code.clone()));
        }
        true
    }

    fn write_text(
        &self,
        graph: &mut ResourceGraph,
        node: NodeId,
        target: &str,
        text: &str,
    ) -> bool {
        if text.is_empty() {
            return true;
        }
        let primitive = if target == "boolean" {
            match text.parse::<bool>() {
                Ok(flag) => Primitive::Boolean(flag),
                Err(_) => return false,
            }
        } else if self.types.is_a(target, "integer") {
            match Number::parse(text) {
                Some(number) => Primitive::Integer(number.as_i64()),
                None => return false,
            }
        } else if target == "decimal" {
            match Number::parse(text) {
                Some(number) => Primitive::Decimal(number.as_f64()),
                None => return false,
            }
        } else {
            Primitive::Text(text.to_owned())
        };
        graph.set_value(node, primitive);
        true
    }

    fn set_text(&self, graph: &mut ResourceGraph, owner: NodeId, field: &str, text: Option<&str>) {
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            self.set_primitive(graph, owner, field, Primitive::Text(text.to_owned()));
        }
    }

    fn set_primitive(
        &self,
        graph: &mut ResourceGraph,
        owner: NodeId,
        field: &str,
        value: Primitive,
    ) {
        let owner_type = graph.type_name(owner).to_owned();
        let Some(type_name) = self
            .types
            .field(&owner_type, field)
            .and_then(|info| info.types.first().cloned())
        else {
            tracing::warn!(type_name = %owner_type, field = %field, "unknown field, value dropped");
            return;
        };
        let child = graph.create_primitive(type_name, value);
        graph.replace(owner, field, child);
    }

    /// Creates a child element in `field`, typed by `preferred` when the
    /// field accepts it.
    fn create_child(
        &self,
        graph: &mut ResourceGraph,
        owner: NodeId,
        field: &str,
        preferred: Option<&str>,
    ) -> Option<NodeId> {
        let owner_type = graph.type_name(owner).to_owned();
        let info = self.types.field(&owner_type, field)?;
        let type_name = preferred
            .and_then(|p| info.types.iter().find(|t| self.types.is_a(p, t) || *t == p))
            .or_else(|| info.types.first())?
            .clone();
        let repeating = info.repeating;
        let child = graph.create(type_name);
        if repeating {
            graph.append(owner, field, child);
        } else {
            graph.replace(owner, field, child);
        }
        Some(child)
    }

    fn append_typed(
        &self,
        graph: &mut ResourceGraph,
        owner: NodeId,
        field: &str,
        data: &DataValue,
    ) -> Option<NodeId> {
        let owner_type = graph.type_name(owner).to_owned();
        let info = self.types.field(&owner_type, field)?;
        let preferred = data.fhir_type();
        let type_name = info
            .types
            .iter()
            .find(|t| self.types.is_a(preferred, t) || *t == preferred)
            .or_else(|| info.types.first())?
            .clone();
        let child = graph.create(type_name);
        graph.append(owner, field, child);
        Some(child)
    }
}
