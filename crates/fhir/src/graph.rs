//! Arena-backed resource graph.
//!
//! Every resource, datatype and primitive produced by the bridge lives in a
//! single [`ResourceGraph`] and is addressed by a [`NodeId`]. Parents own
//! their children through named fields, and `Reference` elements may point at
//! another node through a resolved target.
//!
//! Notes:
//! - Field order is insertion order so rendered JSON is stable.
//! - Nodes are never removed. A node that carries no value, no target and
//!   only empty children is treated as empty.

use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;

/// Handle to an element stored in a [`ResourceGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Primitive payload carried by FHIR primitive elements.
#[derive(Clone, Debug, PartialEq)]
pub enum Primitive {
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    Text(String),
}

impl Primitive {
    /// Plain string rendering, matching how FHIR serialises the value.
    pub fn as_text(&self) -> String {
        match self {
            Primitive::Boolean(b) => b.to_string(),
            Primitive::Integer(i) => i.to_string(),
            Primitive::Decimal(d) => format_decimal(*d),
            Primitive::Text(s) => s.clone(),
        }
    }
}

/// Renders a decimal without scientific notation, keeping one fractional
/// digit for whole numbers (`500.0`).
pub fn format_decimal(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

/// A single FHIR element: resource, complex datatype, backbone or primitive.
#[derive(Clone, Debug)]
pub struct Element {
    type_name: String,
    value: Option<Primitive>,
    fields: IndexMap<String, Vec<NodeId>>,
    target: Option<NodeId>,
}

impl Element {
    fn new(type_name: String) -> Self {
        Self {
            type_name,
            value: None,
            fields: IndexMap::new(),
            target: None,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn value(&self) -> Option<&Primitive> {
        self.value.as_ref()
    }

    pub fn target(&self) -> Option<NodeId> {
        self.target
    }

    /// Field names with at least one child, in insertion order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(_, children)| !children.is_empty())
            .map(|(name, _)| name.as_str())
    }

    pub fn children(&self, field: &str) -> &[NodeId] {
        self.fields.get(field).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Owns every element created while parsing or constructing resources.
#[derive(Clone, Debug, Default)]
pub struct ResourceGraph {
    nodes: Vec<Element>,
    urls: HashMap<String, NodeId>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty_graph(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Creates a detached element of the given FHIR type.
    pub fn create(&mut self, type_name: impl Into<String>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Element::new(type_name.into()));
        id
    }

    /// Creates a detached primitive element holding `value`.
    pub fn create_primitive(&mut self, type_name: impl Into<String>, value: Primitive) -> NodeId {
        let id = self.create(type_name);
        self.nodes[id.0].value = Some(value);
        id
    }

    pub fn element(&self, id: NodeId) -> &Element {
        &self.nodes[id.0]
    }

    pub fn type_name(&self, id: NodeId) -> &str {
        &self.nodes[id.0].type_name
    }

    pub fn value(&self, id: NodeId) -> Option<&Primitive> {
        self.nodes[id.0].value.as_ref()
    }

    pub fn set_value(&mut self, id: NodeId, value: Primitive) {
        self.nodes[id.0].value = Some(value);
    }

    pub fn children(&self, id: NodeId, field: &str) -> &[NodeId] {
        self.nodes[id.0].children(field)
    }

    pub fn first_child(&self, id: NodeId, field: &str) -> Option<NodeId> {
        self.children(id, field).first().copied()
    }

    pub fn last_child(&self, id: NodeId, field: &str) -> Option<NodeId> {
        self.children(id, field).last().copied()
    }

    /// Appends `child` to a repeating field.
    pub fn append(&mut self, parent: NodeId, field: &str, child: NodeId) {
        self.nodes[parent.0]
            .fields
            .entry(field.to_owned())
            .or_default()
            .push(child);
    }

    /// Sets a single-valued field, dropping whatever it held before.
    pub fn replace(&mut self, parent: NodeId, field: &str, child: NodeId) {
        let slot = self.nodes[parent.0].fields.entry(field.to_owned()).or_default();
        slot.clear();
        slot.push(child);
    }

    pub fn target(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].target
    }

    /// Points a `Reference` element at the resource it refers to.
    pub fn set_target(&mut self, reference: NodeId, target: NodeId) {
        self.nodes[reference.0].target = Some(target);
    }

    /// Records that `url` (a bundle fullUrl or `Type/id`) denotes `node`.
    pub fn register_url(&mut self, url: impl Into<String>, node: NodeId) {
        self.urls.insert(url.into(), node);
    }

    pub fn lookup_url(&self, url: &str) -> Option<NodeId> {
        self.urls.get(url).copied()
    }

    /// Text value of a primitive child such as `Coding.code`.
    pub fn child_text(&self, id: NodeId, field: &str) -> Option<String> {
        self.first_child(id, field)
            .and_then(|child| self.value(child))
            .map(Primitive::as_text)
    }

    /// True when the element carries nothing worth serialising.
    pub fn is_empty(&self, id: NodeId) -> bool {
        let element = &self.nodes[id.0];
        if element.value.is_some() || element.target.is_some() {
            return false;
        }
        element
            .fields
            .values()
            .flatten()
            .all(|child| self.is_empty(*child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_element_is_empty_until_it_holds_a_value() {
        let mut graph = ResourceGraph::new();
        let observation = graph.create("Observation");
        let code = graph.create("CodeableConcept");
        graph.replace(observation, "code", code);
        assert!(graph.is_empty(observation));

        let text = graph.create_primitive("string", Primitive::Text("BP".into()));
        graph.replace(code, "text", text);
        assert!(!graph.is_empty(observation));
        assert_eq!(graph.child_text(code, "text").as_deref(), Some("BP"));
    }

    #[test]
    fn replace_overwrites_and_append_accumulates() {
        let mut graph = ResourceGraph::new();
        let parent = graph.create("Observation");
        let a = graph.create("CodeableConcept");
        let b = graph.create("CodeableConcept");
        graph.append(parent, "category", a);
        graph.append(parent, "category", b);
        assert_eq!(graph.children(parent, "category"), &[a, b]);

        graph.replace(parent, "category", b);
        assert_eq!(graph.children(parent, "category"), &[b]);
        assert_eq!(graph.last_child(parent, "category"), Some(b));
    }

    #[test]
    fn decimals_render_without_exponent() {
        assert_eq!(format_decimal(500.0), "500.0");
        assert_eq!(format_decimal(36.6), "36.6");
        assert_eq!(Primitive::Integer(3).as_text(), "3");
    }
}
