//! Object constructor.
//!
//! Walks a resource path from an element and creates whatever is missing
//! along the way, returning the chain of elements it created. Creation is
//! driven by the type registry: each segment names a field, the field's
//! declared types decide what gets created and repeating fields are appended
//! to rather than overwritten.
//!
//! Special segments:
//! - `$this` stands for the element itself
//! - a `where(...)` clause right after a field is not instantiated; it is
//!   carried on the returned path so the caller can key its cache by it
//! - `as(X)` after a field forces the created type
//! - `resolve()` after a reference field creates the referenced resource and
//!   links it through the reference
//!
//! An unknown field abandons the branch with a warning.

use crate::constants::{FHIR_ROOT, RESOLVE, THIS, WHERE};
use crate::paths::{cast_type, extract_filter_clause, split_segments};
use fhir::{FieldInfo, NodeId, ResourceGraph, TypeDescriptor};

/// A value created in (or found in) the graph.
///
/// Repeating fields are held as a live handle on the owning element, so an
/// element appended later is visible through every cached copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Built {
    Single(NodeId),
    Many { owner: NodeId, field: String },
}

impl Built {
    pub fn is_many(&self) -> bool {
        matches!(self, Built::Many { .. })
    }

    /// The element itself, or the most recently appended element.
    pub fn last(&self, graph: &ResourceGraph) -> Option<NodeId> {
        match self {
            Built::Single(node) => Some(*node),
            Built::Many { owner, field } => graph.last_child(*owner, field),
        }
    }

    pub fn elements(&self, graph: &ResourceGraph) -> Vec<NodeId> {
        match self {
            Built::Single(node) => vec![*node],
            Built::Many { owner, field } => graph.children(*owner, field).to_vec(),
        }
    }
}

/// One step of an instantiation chain.
#[derive(Debug, Clone)]
pub struct Instantiated {
    pub returning: Built,
    /// Path of this step relative to its parent, filter clause included.
    pub path: String,
    pub inner: Option<Box<Instantiated>>,
}

impl Instantiated {
    pub fn single(node: NodeId, path: impl Into<String>) -> Self {
        Self {
            returning: Built::Single(node),
            path: path.into(),
            inner: None,
        }
    }

    /// The deepest step, which is what rules populate.
    pub fn leaf(&self) -> &Instantiated {
        let mut current = self;
        while let Some(inner) = current.inner.as_deref() {
            current = inner;
        }
        current
    }
}

/// Creates elements along resource paths.
pub struct ObjectConstructor<'t> {
    types: &'t dyn TypeDescriptor,
    created_resources: Vec<NodeId>,
}

impl<'t> ObjectConstructor<'t> {
    pub fn new(types: &'t dyn TypeDescriptor) -> Self {
        Self {
            types,
            created_resources: Vec::new(),
        }
    }

    pub fn types(&self) -> &'t dyn TypeDescriptor {
        self.types
    }

    /// Marks a resource created outside of [`instantiate`](Self::instantiate)
    /// as an extra output.
    pub fn track_created(&mut self, resource: NodeId) {
        self.created_resources.push(resource);
    }

    /// Resources created behind references since the last call.
    pub fn take_created_resources(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.created_resources)
    }

    /// Creates an empty resource, or `None` when the type is not a resource.
    pub fn create_resource(
        &self,
        graph: &mut ResourceGraph,
        resource_type: &str,
    ) -> Option<NodeId> {
        if !self.types.is_resource(resource_type) {
            tracing::warn!(resource_type = %resource_type, "cannot create unknown resource type");
            return None;
        }
        Some(graph.create(resource_type))
    }

    /// Creates every missing element along `path` below `target`.
    ///
    /// `forcing` narrows the type of the last element (choice fields);
    /// `resolve_type` names the resource a `resolve()` step creates.
    pub fn instantiate(
        &mut self,
        graph: &mut ResourceGraph,
        target: &Built,
        path: &str,
        forcing: Option<&str>,
        resolve_type: Option<&str>,
    ) -> Option<Instantiated> {
        let mut node = match target {
            Built::Single(node) => *node,
            Built::Many { owner, field } => match graph.last_child(*owner, field) {
                Some(last) => last,
                None => self.append_element(graph, *owner, field, None)?,
            },
        };

        if path.trim().is_empty() {
            return Some(Instantiated::single(node, ""));
        }

        let mut path = path.to_owned();
        if graph.type_name(node) == "Reference" {
            if let Some(rest) = path.strip_prefix(RESOLVE) {
                return self.instantiate_resolved(graph, node, rest, forcing, resolve_type);
            }
            if let Some(resolved) = graph.target(node) {
                node = resolved;
            }
            path = path
                .replace(&format!("{RESOLVE}.{FHIR_ROOT}."), "")
                .replace(&format!("{RESOLVE}.{FHIR_ROOT}"), "");
        }

        let path = path.strip_prefix('.').unwrap_or(&path).to_owned();
        let class = graph.type_name(node).to_owned();

        let following_where = where_for_instantiation(&path, &class);
        let path = match &following_where {
            Some(clause) => path.replace(&format!(".{clause}"), "").replace(clause.as_str(), ""),
            None => path,
        };
        let path = strip_class_prefix(&path, &class);
        if path.is_empty() || path == class {
            return Some(Instantiated::single(node, following_where.unwrap_or_default()));
        }

        let segments: Vec<String> = split_segments(&path)
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();
        let (first, rest) = segments.split_first()?;

        if first == THIS {
            return self.instantiate_this(
                graph,
                target,
                node,
                rest,
                following_where,
                forcing,
                resolve_type,
            );
        }

        let Some((field, choice_type)) = self.resolve_field(&class, first) else {
            tracing::warn!(
                path = %path,
                type_name = %class,
                "unknown field {first}, skipping rule branch"
            );
            return None;
        };

        let filter_suffix = following_where.map(|w| format!(".{w}")).unwrap_or_default();
        let next = rest.first().map(String::as_str);
        let resolve_follows = next == Some(RESOLVE);
        let cast = next.filter(|s| s.starts_with("as(")).and_then(cast_type);

        if rest.is_empty() {
            let forced = choice_type.as_deref().or(forcing);
            let class = self
                .find_class(&field, forced)
                .or_else(|| self.find_class(&field, None))?;
            let returning = self.attach(graph, node, &field, &class);
            return Some(Instantiated {
                returning,
                path: format!("{}{filter_suffix}", field_segment(first, &field)),
                inner: None,
            });
        }

        let (next_class, remaining) = if let Some(cast) = &cast {
            let cast = self.types.canonical_name(cast).unwrap_or_else(|| cast.clone());
            (Some(cast), &rest[1..])
        } else if resolve_follows {
            (self.find_class(&field, resolve_type), &rest[1..])
        } else {
            (self.find_class(&field, choice_type.as_deref()), rest)
        };
        let next_class = next_class.or_else(|| self.find_class(&field, None))?;

        let (stored, walked) = self.create_value(graph, &field, &next_class);
        let inner = self.instantiate(
            graph,
            &Built::Single(walked),
            &remaining.join("."),
            forcing,
            resolve_type,
        );
        let returning = self.set_field(graph, node, &field, stored);

        let cast_suffix = next
            .filter(|_| cast.is_some())
            .map(|s| format!(".{s}"))
            .unwrap_or_default();
        Some(Instantiated {
            returning,
            path: format!("{}{cast_suffix}{filter_suffix}", field_segment(first, &field)),
            inner: inner.map(Box::new),
        })
    }

    fn instantiate_resolved(
        &mut self,
        graph: &mut ResourceGraph,
        reference: NodeId,
        rest: &str,
        forcing: Option<&str>,
        resolve_type: Option<&str>,
    ) -> Option<Instantiated> {
        let resource = match graph.target(reference) {
            Some(existing) => existing,
            None => {
                let Some(resource_type) = resolve_type else {
                    tracing::warn!(
                        "resolve() without a resource type to create, skipping rule branch"
                    );
                    return None;
                };
                let resource = self.create_resource(graph, resource_type)?;
                self.created_resources.push(resource);
                graph.set_target(reference, resource);
                resource
            }
        };
        let rest = rest.strip_prefix('.').unwrap_or(rest);
        let rest = rest.strip_prefix(FHIR_ROOT).unwrap_or(rest);
        let inner = self.instantiate(graph, &Built::Single(resource), rest, forcing, resolve_type);
        Some(Instantiated {
            returning: Built::Single(resource),
            path: RESOLVE.to_owned(),
            inner: inner.map(Box::new),
        })
    }

    /// `$this`: the element itself. On a repeating target a fresh element is
    /// appended unless the last one is still empty.
    #[allow(clippy::too_many_arguments)]
    fn instantiate_this(
        &mut self,
        graph: &mut ResourceGraph,
        target: &Built,
        node: NodeId,
        rest: &[String],
        following_where: Option<String>,
        forcing: Option<&str>,
        resolve_type: Option<&str>,
    ) -> Option<Instantiated> {
        if !rest.is_empty() {
            let rest = rest.join(".");
            return self.instantiate(graph, &Built::Single(node), &rest, forcing, resolve_type);
        }
        if let Built::Many { owner, field } = target {
            if !graph.is_empty(node) {
                self.append_element(graph, *owner, field, None)?;
            }
        }
        Some(Instantiated {
            returning: target.clone(),
            path: following_where.unwrap_or_default(),
            inner: None,
        })
    }

    /// Appends a fresh element to a repeating field, typed by the field (or
    /// `forcing` when it fits).
    pub fn append_element(
        &mut self,
        graph: &mut ResourceGraph,
        owner: NodeId,
        field: &str,
        forcing: Option<&str>,
    ) -> Option<NodeId> {
        let owner_type = graph.type_name(owner).to_owned();
        let info = self.types.field(&owner_type, field)?.clone();
        let class = self
            .find_class(&info, forcing)
            .or_else(|| self.find_class(&info, None))?;
        let (stored, walked) = self.create_value(graph, &info, &class);
        graph.append(owner, field, stored);
        Some(walked)
    }

    /// Field named by a path segment, either directly or through a typed
    /// choice name (`valueQuantity`), with the type the choice name selects.
    fn resolve_field(&self, type_name: &str, segment: &str) -> Option<(FieldInfo, Option<String>)> {
        if let Some(field) = self.types.field(type_name, segment) {
            return Some((field.clone(), None));
        }
        self.types
            .choice_field(type_name, segment)
            .map(|(field, chosen)| (field.clone(), Some(chosen)))
    }

    /// Concrete type to create for `field`, honouring `forcing` when given.
    fn find_class(&self, field: &FieldInfo, forcing: Option<&str>) -> Option<String> {
        let Some(forcing) = forcing else {
            return field.types.first().cloned();
        };
        if field.name == "extension" || field.name == "modifierExtension" {
            return Some("Extension".to_owned());
        }
        let forcing = self.types.canonical_name(forcing).unwrap_or_else(|| forcing.to_owned());

        if self.types.is_resource(&forcing) && field.types.iter().any(|t| t == "Reference") {
            let allowed = field.targets.is_empty()
                || field.targets.iter().any(|t| self.types.is_a(&forcing, t));
            return allowed.then_some(forcing);
        }

        field
            .types
            .iter()
            .find(|t| {
                **t == forcing
                    || (forcing == "Coding" && t.as_str() == "code")
                    || self.types.is_a(t, &forcing)
            })
            .cloned()
    }

    /// Creates the value stored in `field`. A resource stored in a reference
    /// field is wrapped in a `Reference`; the second node is the one path
    /// walking continues in.
    fn create_value(
        &mut self,
        graph: &mut ResourceGraph,
        field: &FieldInfo,
        class: &str,
    ) -> (NodeId, NodeId) {
        if self.types.is_resource(class) && field.types.iter().any(|t| t == "Reference") {
            let resource = graph.create(class);
            self.created_resources.push(resource);
            let reference = graph.create("Reference");
            graph.set_target(reference, resource);
            (reference, resource)
        } else {
            let node = graph.create(class);
            (node, node)
        }
    }

    fn attach(
        &mut self,
        graph: &mut ResourceGraph,
        owner: NodeId,
        field: &FieldInfo,
        class: &str,
    ) -> Built {
        let (stored, _) = self.create_value(graph, field, class);
        self.set_field(graph, owner, field, stored)
    }

    fn set_field(
        &self,
        graph: &mut ResourceGraph,
        owner: NodeId,
        field: &FieldInfo,
        value: NodeId,
    ) -> Built {
        if field.repeating {
            graph.append(owner, &field.name, value);
            Built::Many {
                owner,
                field: field.name.clone(),
            }
        } else {
            graph.replace(owner, &field.name, value);
            Built::Single(value)
        }
    }
}

/// The segment as it appears in cache paths: the base field name for typed
/// choice names.
fn field_segment<'a>(segment: &'a str, field: &'a FieldInfo) -> &'a str {
    if segment == field.name {
        segment
    } else {
        &field.name
    }
}

/// A `where(...)` clause directly after the first field (or after the type
/// name and first field).
fn where_for_instantiation(path: &str, class: &str) -> Option<String> {
    let parts: Vec<&str> = path.split('.').collect();
    if parts.len() <= 1 {
        return None;
    }
    let handles = if parts[0] == class && parts.len() > 2 {
        parts[1].starts_with(WHERE) || parts[2].starts_with(WHERE)
    } else {
        parts[1].starts_with(WHERE)
    };
    if handles || path.starts_with(WHERE) {
        extract_filter_clause(path, false)
    } else {
        None
    }
}

fn strip_class_prefix(path: &str, class: &str) -> String {
    match path.strip_prefix(class) {
        Some(rest) if rest.starts_with('.') => rest[1..].to_owned(),
        _ => path.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhir::r4;

    fn setup() -> (ResourceGraph, NodeId, ObjectConstructor<'static>) {
        let types = r4().expect("registry");
        let mut graph = ResourceGraph::new();
        let observation = graph.create("Observation");
        (graph, observation, ObjectConstructor::new(types))
    }

    #[test]
    fn creates_nested_elements_and_reports_the_chain() {
        let (mut graph, observation, mut constructor) = setup();
        let built = constructor
            .instantiate(
                &mut graph,
                &Built::Single(observation),
                "Observation.code.coding.system",
                None,
                None,
            )
            .expect("instantiated");

        assert_eq!(built.path, "code");
        assert!(!built.returning.is_many());
        let coding = built.inner.as_ref().expect("coding step");
        assert_eq!(coding.path, "coding");
        assert!(coding.returning.is_many());
        assert_eq!(built.leaf().path, "system");

        let code = graph.first_child(observation, "code").expect("code");
        assert_eq!(graph.type_name(code), "CodeableConcept");
        assert_eq!(graph.children(code, "coding").len(), 1);
    }

    #[test]
    fn forcing_selects_choice_type() {
        let (mut graph, observation, mut constructor) = setup();
        let built = constructor
            .instantiate(&mut graph, &Built::Single(observation), "value", Some("Quantity"), None)
            .expect("instantiated");
        let value = built.returning.last(&graph).expect("value");
        assert_eq!(graph.type_name(value), "Quantity");
    }

    #[test]
    fn filter_clause_is_carried_on_the_path() {
        let (mut graph, observation, mut constructor) = setup();
        let built = constructor
            .instantiate(
                &mut graph,
                &Built::Single(observation),
                "component.where(code.coding.code.toString().contains('8480-6')).value",
                Some("Quantity"),
                None,
            )
            .expect("instantiated");
        assert_eq!(built.path, "component.where(code.coding.code.toString().contains('8480-6'))");
        assert_eq!(built.leaf().path, "value");
        assert_eq!(graph.children(observation, "component").len(), 1);
    }

    #[test]
    fn repeating_fields_append() {
        let (mut graph, observation, mut constructor) = setup();
        for _ in 0..2 {
            let owner = Built::Single(observation);
            constructor.instantiate(&mut graph, &owner, "category", None, None);
        }
        assert_eq!(graph.children(observation, "category").len(), 2);
    }

    #[test]
    fn resolve_creates_referenced_resource() {
        let (mut graph, observation, mut constructor) = setup();
        let built = constructor
            .instantiate(
                &mut graph,
                &Built::Single(observation),
                "subject.resolve().gender",
                None,
                Some("Patient"),
            )
            .expect("instantiated");

        let reference = graph.first_child(observation, "subject").expect("subject");
        let patient = graph.target(reference).expect("linked patient");
        assert_eq!(graph.type_name(patient), "Patient");
        assert_eq!(built.leaf().path, "gender");
        assert_eq!(constructor.take_created_resources(), vec![patient]);
    }

    #[test]
    fn unknown_field_abandons_branch() {
        let (mut graph, observation, mut constructor) = setup();
        assert!(constructor
            .instantiate(&mut graph, &Built::Single(observation), "noSuchField.value", None, None)
            .is_none());
    }

    #[test]
    fn this_on_a_list_appends_only_when_last_is_used() {
        let (mut graph, observation, mut constructor) = setup();
        let list = Built::Many {
            owner: observation,
            field: "component".into(),
        };
        constructor.instantiate(&mut graph, &list, THIS, None, None);
        assert_eq!(graph.children(observation, "component").len(), 1);
        constructor.instantiate(&mut graph, &list, THIS, None, None);
        assert_eq!(graph.children(observation, "component").len(), 1);
    }
}
