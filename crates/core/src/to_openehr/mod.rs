//! Resource to record engine.
//!
//! Resources are always read through a bundle; a single resource is wrapped
//! in one first. Every concept model selecting a bundle entry contributes
//! its extraction tree, and each tree is evaluated once per resource its
//! limiting criteria select. A `multiple` concept gets the resource ordinal
//! as its first occurrence index.

pub mod emit;
pub mod helper;

use crate::constants::{FHIR_ROOT, RECURRING, RESOLVE};
use crate::error::BridgeResult;
use crate::mapping::{MappingContext, MappingRepository};
use crate::paths::{fix_fhir_path_casting, replace_last, unescape_dots};
use emit::Emitter;
use fhir::{NodeId, PathEvaluator, ResourceGraph, TypeDescriptor, Value};
use helper::{fix_child_occurrences, fix_occurrences, with_ordinal, Extraction, Planner};
use indexmap::IndexMap;
use openehr::{FlatRecord, TemplateCatalog};
use std::borrow::Cow;
use std::collections::HashSet;

pub struct ResourceToRecord<'a> {
    repository: &'a MappingRepository,
    types: &'a dyn TypeDescriptor,
    evaluator: &'a dyn PathEvaluator,
}

impl<'a> ResourceToRecord<'a> {
    pub fn new(
        repository: &'a MappingRepository,
        types: &'a dyn TypeDescriptor,
        evaluator: &'a dyn PathEvaluator,
    ) -> Self {
        Self {
            repository,
            types,
            evaluator,
        }
    }

    /// Builds the flat record the given resources map to.
    pub fn translate(
        &self,
        context: &MappingContext,
        graph: &ResourceGraph,
        roots: &[NodeId],
        catalog: &dyn TemplateCatalog,
    ) -> BridgeResult<FlatRecord> {
        let (graph, bundle) = as_bundle(graph, roots);
        let graph: &ResourceGraph = &graph;

        let planner = Planner {
            repository: self.repository,
            template: &context.template_id,
            catalog,
        };
        let mut planned: Vec<Extraction> = Vec::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        for entry in entries(graph, bundle) {
            for mapper in self
                .repository
                .mappers_for_resource(&context.template_id, graph, entry, self.evaluator)
            {
                let key = (mapper.archetype.to_string(), mapper.name().to_owned());
                if seen.insert(key) {
                    planned.extend(planner.plan(&mapper)?);
                }
            }
        }
        if planned.is_empty() {
            tracing::warn!(
                template = %context.template_id,
                "no concept model selects any of the resources"
            );
        }
        fix_occurrences(&mut planned, catalog);

        let mut by_archetype: IndexMap<String, Vec<Extraction>> = IndexMap::new();
        for extraction in planned {
            by_archetype.entry(extraction.archetype.clone()).or_default().push(extraction);
        }

        let walker = Walker {
            graph,
            evaluator: self.evaluator,
            emitter: Emitter {
                graph,
                types: self.types,
            },
        };
        let mut record = FlatRecord::new();
        for (archetype, extractions) in &by_archetype {
            let mut criteria: Vec<&str> = Vec::new();
            for extraction in extractions {
                if !criteria.contains(&extraction.limiting_criteria.as_str()) {
                    criteria.push(&extraction.limiting_criteria);
                }
            }
            for limiting in criteria {
                let selected = walker.select(bundle, limiting);
                if selected.is_empty() {
                    tracing::warn!(criteria = %limiting, "no resources selected");
                    continue;
                }
                tracing::info!(
                    criteria = %limiting,
                    count = selected.len(),
                    archetype = %archetype,
                    "mapping selected resources"
                );
                walker.map_selected(&selected, extractions, &mut record);
            }
        }
        Ok(record)
    }
}

/// The graph to read from and the bundle node wrapping `roots`.
fn as_bundle<'g>(graph: &'g ResourceGraph, roots: &[NodeId]) -> (Cow<'g, ResourceGraph>, NodeId) {
    if let [single] = roots {
        if graph.type_name(*single) == "Bundle" {
            return (Cow::Borrowed(graph), *single);
        }
    }
    let mut wrapped = graph.clone();
    let bundle = wrapped.create("Bundle");
    for root in roots {
        let entry = wrapped.create("Bundle.entry");
        wrapped.append(entry, "resource", *root);
        wrapped.append(bundle, "entry", entry);
    }
    (Cow::Owned(wrapped), bundle)
}

fn entries(graph: &ResourceGraph, bundle: NodeId) -> Vec<NodeId> {
    graph
        .children(bundle, "entry")
        .iter()
        .filter_map(|entry| graph.first_child(*entry, "resource"))
        .collect()
}

struct Walker<'a> {
    graph: &'a ResourceGraph,
    evaluator: &'a dyn PathEvaluator,
    emitter: Emitter<'a>,
}

impl Walker<'_> {
    fn select(&self, bundle: NodeId, limiting: &str) -> Vec<NodeId> {
        self.evaluator
            .evaluate_nodes(self.graph, bundle, limiting)
            .unwrap_or_else(|e| {
                tracing::warn!(criteria = %limiting, error = %e, "limiting criteria not evaluable");
                Vec::new()
            })
    }

    /// Evaluates every extraction of a concept against each selected
    /// resource. The ordinal only advances for resources that contributed.
    fn map_selected(
        &self,
        selected: &[NodeId],
        extractions: &[Extraction],
        record: &mut FlatRecord,
    ) {
        let mut main_multiple: Option<String> = None;
        let mut ordinal = 0;
        for resource in selected {
            let before = record.len();
            for extraction in extractions {
                let mut scoped = extraction.clone();
                let starts_main = main_multiple
                    .as_deref()
                    .map_or(true, |main| extraction.openehr_path.starts_with(main));
                if extraction.multiple && starts_main {
                    let main = extraction.openehr_path.split(RECURRING).next().unwrap_or_default();
                    main_multiple = Some(main.to_owned());
                    let numbered = with_ordinal(&extraction.openehr_path, ordinal);
                    fix_child_occurrences(&mut scoped, &extraction.openehr_path, &numbered);
                    scoped.openehr_path = numbered;
                }
                self.flatten(&scoped, *resource, record);
            }
            if record.len() > before {
                ordinal += 1;
            } else {
                tracing::warn!(
                    resource = %resource,
                    "resource matched but contributed nothing to the record"
                );
            }
        }
    }

    fn flatten(&self, extraction: &Extraction, focus: NodeId, record: &mut FlatRecord) {
        let results = self.evaluate(extraction, focus);
        if results.is_empty() {
            tracing::debug!(
                fhir = %extraction.fhir_path,
                on = %self.graph.type_name(focus),
                "no results for path"
            );
            return;
        }

        let repeating = extraction.openehr_path.contains(RECURRING);
        for (i, result) in results.iter().enumerate() {
            let path = if repeating {
                replace_last(&extraction.openehr_path, RECURRING, &format!(":{i}"))
            } else {
                extraction.openehr_path.clone()
            };
            self.write(&path, result, extraction, record);

            if let Some(node) = result.as_node() {
                for child in &extraction.children {
                    let mut scoped = child.clone();
                    if scoped.openehr_path.starts_with(&extraction.openehr_path) {
                        let fixed =
                            scoped.openehr_path.replacen(&extraction.openehr_path, &path, 1);
                        fix_child_occurrences(&mut scoped, &extraction.openehr_path, &fixed);
                    }
                    self.flatten(&scoped, node, record);
                }
            }

            if !repeating {
                if results.len() > 1 {
                    tracing::warn!(
                        fhir = %extraction.fhir_path,
                        openehr = %path,
                        dropped = results.len() - 1,
                        "several matches for a non-repeating path, keeping the first"
                    );
                }
                break;
            }
        }
    }

    fn evaluate(&self, extraction: &Extraction, focus: NodeId) -> Vec<Value> {
        let path = extraction.fhir_path.as_str();
        if path.is_empty() || path == FHIR_ROOT {
            return vec![Value::Node(focus)];
        }
        let found = self
            .evaluator
            .evaluate_node(self.graph, focus, &fix_fhir_path_casting(path))
            .unwrap_or_else(|e| {
                tracing::warn!(fhir = %path, error = %e, "path not evaluable");
                Vec::new()
            });
        if !found.is_empty() || !path.ends_with(RESOLVE) {
            return found;
        }

        let references = path.replace(&format!(".{RESOLVE}"), "");
        self.evaluator
            .evaluate_nodes(self.graph, focus, &references)
            .unwrap_or_default()
            .into_iter()
            .filter(|node| self.graph.type_name(*node) == "Reference")
            .filter_map(|node| {
                self.graph.target(node).or_else(|| {
                    self.graph
                        .child_text(node, "reference")
                        .and_then(|url| self.graph.lookup_url(&url))
                })
            })
            .map(Value::Node)
            .collect()
    }

    /// Occurrence markers still open after fan-out resolve to the first
    /// occurrence.
    fn write(&self, path: &str, value: &Value, extraction: &Extraction, record: &mut FlatRecord) {
        let path = unescape_dots(&path.replace(RECURRING, ":0"));
        match extraction.literal.as_deref() {
            Some(literal) => record.insert_text(path, literal),
            None => self.emitter.emit(&path, value, extraction.rm_type.as_deref(), record),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhir::{parse_resource, r4, FhirPath};

    #[test]
    fn single_resources_are_wrapped() {
        let types = r4().expect("registry");
        let parsed = parse_resource(r#"{"resourceType": "Observation", "status": "final"}"#, types)
            .expect("parse");
        let (graph, bundle) = as_bundle(&parsed.graph, &[parsed.root]);
        assert_eq!(graph.type_name(bundle), "Bundle");
        assert_eq!(entries(&graph, bundle), vec![parsed.root]);

        let selected = FhirPath::new(types)
            .evaluate_nodes(&graph, bundle, "Bundle.entry.resource.ofType(Observation)")
            .expect("evaluates");
        assert_eq!(selected, vec![parsed.root]);
    }

    #[test]
    fn bundles_are_read_in_place() {
        let types = r4().expect("registry");
        let parsed = parse_resource(
            r#"{
                "resourceType": "Bundle",
                "type": "collection",
                "entry": [{"resource": {"resourceType": "Patient"}}]
            }"#,
            types,
        )
        .expect("parse");
        let (graph, bundle) = as_bundle(&parsed.graph, &[parsed.root]);
        assert!(matches!(graph, Cow::Borrowed(_)));
        assert_eq!(bundle, parsed.root);
        assert_eq!(entries(&graph, bundle).len(), 1);
    }

    #[test]
    fn non_repeating_paths_keep_the_first_match() {
        let types = r4().expect("registry");
        let parsed = parse_resource(
            r#"{
                "resourceType": "Observation",
                "status": "final",
                "note": [{"text": "first"}, {"text": "second"}]
            }"#,
            types,
        )
        .expect("parse");
        let evaluator = FhirPath::new(types);
        let walker = Walker {
            graph: &parsed.graph,
            evaluator: &evaluator,
            emitter: Emitter {
                graph: &parsed.graph,
                types,
            },
        };
        let extraction = Extraction {
            archetype: "openEHR-EHR-OBSERVATION.blood_pressure.v2".into(),
            limiting_criteria: "Bundle.entry.resource.ofType(Observation)".into(),
            fhir_path: "note.text".into(),
            openehr_path: "bp/blood_pressure:0/any_event:0/comment".into(),
            rm_type: Some("DV_TEXT".into()),
            literal: None,
            multiple: false,
            children: Vec::new(),
        };

        let mut record = FlatRecord::new();
        walker.flatten(&extraction, parsed.root, &mut record);
        assert_eq!(record.len(), 1);
        assert_eq!(
            record.get_text("bp/blood_pressure:0/any_event:0/comment").as_deref(),
            Some("first")
        );
    }
}
