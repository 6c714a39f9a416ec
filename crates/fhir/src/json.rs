//! FHIR JSON conversion.
//!
//! Responsibilities:
//! - Parse a FHIR JSON (or YAML) resource or Bundle into a [`ResourceGraph`].
//! - Render graph resources back to FHIR JSON, wrapping several top-level
//!   resources into a collection Bundle.
//!
//! Notes:
//! - Choice properties (`valueQuantity`) are stored under their base field
//!   name and typed by the concrete child element.
//! - Primitive extension siblings (`_birthDate`) are skipped.
//! - Unknown properties are logged and dropped rather than rejected.
//! - Rendered Bundles use deterministic `urn:uuid:` fullUrls derived from the
//!   resource type and position, so references between output resources are
//!   stable across runs.

use crate::graph::{NodeId, Primitive, ResourceGraph};
use crate::registry::{TypeDescriptor, TypeKind};
use crate::{FhirError, FhirResult};
use serde_json::{Map, Value as Json};
use std::collections::HashMap;
use uuid::Uuid;

/// A parsed resource and the graph holding it.
#[derive(Debug, Clone)]
pub struct ParsedResource {
    pub graph: ResourceGraph,
    pub root: NodeId,
}

/// Parses FHIR JSON text.
pub fn parse_resource(text: &str, types: &dyn TypeDescriptor) -> FhirResult<ParsedResource> {
    let json: Json = serde_json::from_str(text)?;
    from_json_value(&json, types)
}

/// Parses a FHIR resource written as YAML.
pub fn parse_resource_yaml(text: &str, types: &dyn TypeDescriptor) -> FhirResult<ParsedResource> {
    let json: Json = serde_yaml::from_str(text)?;
    from_json_value(&json, types)
}

pub fn from_json_value(json: &Json, types: &dyn TypeDescriptor) -> FhirResult<ParsedResource> {
    let mut graph = ResourceGraph::new();
    let root = {
        let mut reader = Reader {
            graph: &mut graph,
            types,
        };
        reader.resource(json)?
    };
    Ok(ParsedResource { graph, root })
}

struct Reader<'a> {
    graph: &'a mut ResourceGraph,
    types: &'a dyn TypeDescriptor,
}

impl Reader<'_> {
    fn resource(&mut self, json: &Json) -> FhirResult<NodeId> {
        let object = json
            .as_object()
            .ok_or_else(|| FhirError::InvalidInput("resource must be a JSON object".into()))?;
        let resource_type = object
            .get("resourceType")
            .and_then(Json::as_str)
            .ok_or_else(|| FhirError::InvalidInput("missing resourceType".into()))?;
        if !self.types.is_resource(resource_type) {
            return Err(FhirError::UnknownType(resource_type.to_owned()));
        }

        let node = self.graph.create(resource_type);
        self.fields(node, resource_type, object)?;

        if let Some(id) = object.get("id").and_then(Json::as_str) {
            self.graph.register_url(format!("{resource_type}/{id}"), node);
        }
        if resource_type == "Bundle" {
            self.index_entries(node);
        }
        Ok(node)
    }

    fn index_entries(&mut self, bundle: NodeId) {
        let entries = self.graph.children(bundle, "entry").to_vec();
        for entry in entries {
            let full_url = self.graph.child_text(entry, "fullUrl");
            let resource = self.graph.first_child(entry, "resource");
            if let (Some(url), Some(resource)) = (full_url, resource) {
                self.graph.register_url(url, resource);
            }
        }
    }

    fn fields(
        &mut self,
        node: NodeId,
        type_name: &str,
        object: &Map<String, Json>,
    ) -> FhirResult<()> {
        for (key, value) in object {
            if key == "resourceType" || key.starts_with('_') {
                continue;
            }
            let (field, element_type) = match self.types.field(type_name, key) {
                Some(info) if !info.is_choice() => (info.name.clone(), info.types[0].clone()),
                Some(_) => {
                    tracing::warn!(
                        "choice element {type_name}.{key} needs a typed property name; skipping"
                    );
                    continue;
                }
                None => match self.types.choice_field(type_name, key) {
                    Some((info, ty)) => (info.name.clone(), ty),
                    None => {
                        tracing::warn!("unknown element {type_name}.{key}; skipping");
                        continue;
                    }
                },
            };

            let items: Vec<&Json> = match value {
                Json::Array(items) => items.iter().collect(),
                single => vec![single],
            };
            for item in items {
                let child = self.value(&element_type, item)?;
                self.graph.append(node, &field, child);
            }
        }
        Ok(())
    }

    fn value(&mut self, type_name: &str, json: &Json) -> FhirResult<NodeId> {
        match self.types.kind(type_name) {
            Some(TypeKind::Resource) => self.resource(json),
            Some(TypeKind::Primitive) => {
                let primitive = primitive_from_json(type_name, json, self.types).ok_or_else(|| {
                    let message = format!("expected a {type_name} primitive, found {json}");
                    FhirError::InvalidInput(message)
                })?;
                Ok(self.graph.create_primitive(type_name, primitive))
            }
            Some(_) => {
                let object = json.as_object().ok_or_else(|| {
                    FhirError::InvalidInput(format!("expected a {type_name} object, found {json}"))
                })?;
                let node = self.graph.create(type_name);
                self.fields(node, type_name, object)?;
                Ok(node)
            }
            None => Err(FhirError::UnknownType(type_name.to_owned())),
        }
    }
}

fn primitive_from_json(
    type_name: &str,
    json: &Json,
    types: &dyn TypeDescriptor,
) -> Option<Primitive> {
    match json {
        Json::Bool(b) => Some(Primitive::Boolean(*b)),
        Json::Number(n) if types.is_a(type_name, "integer") => n.as_i64().map(Primitive::Integer),
        Json::Number(n) => n.as_f64().map(Primitive::Decimal),
        Json::String(s) => Some(Primitive::Text(s.clone())),
        _ => None,
    }
}

// ============================================================================
// Rendering
// ============================================================================

/// Renders `resources` as a `collection` Bundle.
pub fn render_bundle(
    graph: &ResourceGraph,
    resources: &[NodeId],
    types: &dyn TypeDescriptor,
) -> Json {
    let urls: HashMap<NodeId, String> = resources
        .iter()
        .enumerate()
        .map(|(i, node)| {
            let name = format!("{}/{}", graph.type_name(*node), i);
            let url = format!("urn:uuid:{}", Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()));
            (*node, url)
        })
        .collect();

    let writer = Writer { graph, types, urls: &urls };
    let entries: Vec<Json> = resources
        .iter()
        .map(|node| {
            let mut entry = Map::new();
            if let Some(url) = urls.get(node) {
                entry.insert("fullUrl".into(), Json::String(url.clone()));
            }
            entry.insert("resource".into(), writer.element(*node));
            Json::Object(entry)
        })
        .collect();

    let mut bundle = Map::new();
    bundle.insert("resourceType".into(), Json::String("Bundle".into()));
    bundle.insert("type".into(), Json::String("collection".into()));
    bundle.insert("entry".into(), Json::Array(entries));
    Json::Object(bundle)
}

/// Renders a single resource.
pub fn render_resource(
    graph: &ResourceGraph,
    resource: NodeId,
    types: &dyn TypeDescriptor,
) -> Json {
    let urls = HashMap::new();
    Writer { graph, types, urls: &urls }.element(resource)
}

struct Writer<'a> {
    graph: &'a ResourceGraph,
    types: &'a dyn TypeDescriptor,
    urls: &'a HashMap<NodeId, String>,
}

impl Writer<'_> {
    fn element(&self, node: NodeId) -> Json {
        let element = self.graph.element(node);
        let type_name = element.type_name();

        if let Some(value) = element.value() {
            return primitive_to_json(value);
        }

        let mut object = Map::new();
        if self.types.is_resource(type_name) {
            object.insert("resourceType".into(), Json::String(type_name.to_owned()));
        }

        for field in element.field_names() {
            let children: Vec<NodeId> = element
                .children(field)
                .iter()
                .copied()
                .filter(|c| !self.graph.is_empty(*c))
                .collect();
            let Some(first) = children.first() else {
                continue;
            };
            let info = self.types.field(type_name, field);
            let key = match info {
                Some(info) => info.json_name(self.graph.type_name(*first)),
                None => field.to_owned(),
            };
            let repeating = info.map(|i| i.repeating).unwrap_or(children.len() > 1);
            if repeating {
                let items = children.iter().map(|c| self.element(*c)).collect();
                object.insert(key, Json::Array(items));
            } else {
                object.insert(key, self.element(*first));
            }
        }

        if type_name == "Reference" && !object.contains_key("reference") {
            if let Some(url) = element.target().and_then(|t| self.urls.get(&t)) {
                object.insert("reference".into(), Json::String(url.clone()));
            }
        }
        Json::Object(object)
    }
}

fn primitive_to_json(value: &Primitive) -> Json {
    match value {
        Primitive::Boolean(b) => Json::Bool(*b),
        Primitive::Integer(i) => Json::from(*i),
        Primitive::Decimal(d) => serde_json::Number::from_f64(*d)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Primitive::Text(s) => Json::String(s.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{FhirPath, PathEvaluator};
    use crate::registry::r4;

    const BUNDLE: &str = r#"{
        "resourceType": "Bundle",
        "type": "collection",
        "entry": [
            {
                "fullUrl": "urn:uuid:obs-1",
                "resource": {
                    "resourceType": "Observation",
                    "status": "final",
                    "code": {"coding": [{"system": "http://loinc.org", "code": "85354-9"}]},
                    "subject": {"reference": "urn:uuid:pat-1"},
                    "component": [
                        {
                            "code": {"coding": [{"system": "http://loinc.org", "code": "8480-6"}]},
                            "valueQuantity": {"value": 120, "unit": "mm[Hg]"}
                        }
                    ],
                    "_status": {"extension": []}
                }
            },
            {
                "fullUrl": "urn:uuid:pat-1",
                "resource": {"resourceType": "Patient", "id": "p1", "birthDate": "1970-01-01"}
            }
        ]
    }"#;

    #[test]
    fn parses_bundle_and_indexes_full_urls() {
        let registry = r4().expect("registry");
        let parsed = parse_resource(BUNDLE, registry).expect("bundle parses");
        assert_eq!(parsed.graph.type_name(parsed.root), "Bundle");

        let patient = parsed.graph.lookup_url("urn:uuid:pat-1").expect("fullUrl indexed");
        assert_eq!(parsed.graph.type_name(patient), "Patient");
        assert_eq!(parsed.graph.lookup_url("Patient/p1"), Some(patient));

        let resolved = FhirPath::new(registry)
            .evaluate_nodes(
                &parsed.graph,
                parsed.root,
                "Bundle.entry.resource.ofType(Observation).subject.resolve()",
            )
            .expect("path");
        assert_eq!(resolved, vec![patient]);
    }

    #[test]
    fn choice_properties_are_typed_by_suffix() {
        let registry = r4().expect("registry");
        let parsed = parse_resource(BUNDLE, registry).expect("bundle parses");
        let values = FhirPath::new(registry)
            .evaluate_nodes(
                &parsed.graph,
                parsed.root,
                "Bundle.entry.resource.ofType(Observation).component.value",
            )
            .expect("path");
        assert_eq!(values.len(), 1);
        assert_eq!(parsed.graph.type_name(values[0]), "Quantity");
        let number = parsed.graph.first_child(values[0], "value").expect("value");
        assert_eq!(parsed.graph.value(number), Some(&Primitive::Decimal(120.0)));
    }

    #[test]
    fn missing_resource_type_is_rejected() {
        let registry = r4().expect("registry");
        let err = parse_resource(r#"{"status": "final"}"#, registry).expect_err("should fail");
        match err {
            FhirError::InvalidInput(msg) => assert!(msg.contains("resourceType")),
            other => panic!("expected InvalidInput, got {other:?}"),
        }
    }

    #[test]
    fn render_round_trips_choice_names_and_references() {
        let registry = r4().expect("registry");
        let mut graph = ResourceGraph::new();
        let observation = graph.create("Observation");
        let patient = graph.create("Patient");
        let gender = graph.create_primitive("code", Primitive::Text("female".into()));
        graph.replace(patient, "gender", gender);

        let quantity = graph.create("Quantity");
        let value = graph.create_primitive("decimal", Primitive::Decimal(36.6));
        graph.replace(quantity, "value", value);
        graph.replace(observation, "value", quantity);

        let reference = graph.create("Reference");
        graph.set_target(reference, patient);
        graph.replace(observation, "subject", reference);

        let empty = graph.create("CodeableConcept");
        graph.append(observation, "category", empty);

        let bundle = render_bundle(&graph, &[observation, patient], registry);
        let entries = bundle["entry"].as_array().expect("entries");
        assert_eq!(entries.len(), 2);

        let obs = &entries[0]["resource"];
        assert_eq!(obs["valueQuantity"]["value"], serde_json::json!(36.6));
        assert!(obs.get("category").is_none());
        assert_eq!(obs["subject"]["reference"], entries[1]["fullUrl"]);
        assert!(entries[1]["fullUrl"]
            .as_str()
            .expect("fullUrl")
            .starts_with("urn:uuid:"));
    }

    #[test]
    fn yaml_resources_are_accepted() {
        let registry = r4().expect("registry");
        let yaml = r#"
resourceType: Condition
code:
  text: Asthma
"#;
        let parsed = parse_resource_yaml(yaml, registry).expect("yaml parses");
        let rendered = render_resource(&parsed.graph, parsed.root, registry);
        assert_eq!(rendered["code"]["text"], "Asthma");
        assert_eq!(rendered["resourceType"], "Condition");
    }
}
