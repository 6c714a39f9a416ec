//! Record to resource engine.
//!
//! For every concept listed in the mapping context the model's rules are
//! expanded into helpers (see [`helper`]), then each helper's data points
//! are written into resources:
//! - data points are grouped by occurrence; each occurrence gets its own
//!   resource when the model is `multiple`, otherwise they share one
//! - the element a data point addresses is looked up in the intermediate
//!   cache and only the missing part of its path is created
//! - values without an occurrence (literals, non-repeating elements) are
//!   applied to every resource built so far
//! - the model's limiting criteria are asserted on every resource

pub mod helper;
pub mod values;

use crate::cache::{IntermediateCache, ParentPaths};
use crate::constants::{FHIR_RESOURCE, THIS, WHERE};
use crate::constructor::{Built, Instantiated, ObjectConstructor};
use crate::error::BridgeResult;
use crate::mapping::{Condition, FhirConfig, MappingContext, MappingRepository};
use crate::paths::{
    amend_fhir_path, condition_target_path, criteria_coding, extract_filter_clause,
    fhir_path_with_conditions, fhir_path_without_conditions, first_index, last_index,
};
use crate::populator::Populator;
use crate::translator::ResourceCollection;
use crate::values::DataValue;
use fhir::{NodeId, PathEvaluator, ResourceGraph, TypeDescriptor};
use helper::{Expansion, Helper};
use indexmap::IndexMap;
use openehr::{FlatRecord, TemplateCatalog};
use std::collections::{HashMap, HashSet};
use values::DataPoint;

pub use helper::Helper as ToFhirHelper;

pub struct RecordToResource<'a> {
    repository: &'a MappingRepository,
    types: &'a dyn TypeDescriptor,
    evaluator: &'a dyn PathEvaluator,
}

impl<'a> RecordToResource<'a> {
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

    /// Builds the resources a flat record maps to.
    pub fn translate(
        &self,
        context: &MappingContext,
        record: &FlatRecord,
        catalog: &dyn TemplateCatalog,
    ) -> BridgeResult<ResourceCollection> {
        let template = &context.template_id;
        let expansion = Expansion {
            repository: self.repository,
            template,
            catalog,
            record,
        };

        let mut graph = ResourceGraph::new();
        let mut roots: Vec<NodeId> = Vec::new();
        let mut caches: Vec<IntermediateCache> = Vec::new();
        let mut cache_by_resource: HashMap<String, usize> = HashMap::new();
        let mut reuse_by_resource: HashMap<String, bool> = HashMap::new();
        let mut processed: HashSet<&str> = HashSet::new();

        for archetype in &context.archetypes {
            if !processed.insert(archetype.as_str()) {
                continue;
            }
            let mappers = self.repository.mappers_for(template, archetype);
            if mappers.is_empty() {
                tracing::error!(
                    archetype = %archetype,
                    "no model mappings for archetype, nothing to map"
                );
                continue;
            }
            caches.push(IntermediateCache::new());
            let archetype_cache = caches.len() - 1;

            for mapper in mappers {
                let Some(config) = mapper.fhir_config.clone() else {
                    continue;
                };
                let resource = config.resource().to_owned();
                let helpers = expansion.helpers(&mapper)?;
                if !helpers.iter().any(|h| h.data.iter().any(|d| !d.is_literal())) {
                    tracing::debug!(
                        archetype = %archetype,
                        mapper = %mapper.name(),
                        "no record data for model, skipping"
                    );
                    continue;
                }

                let reuse =
                    reuse_by_resource.get(&resource).copied().unwrap_or(true) && !config.multiple;
                reuse_by_resource.insert(resource.clone(), reuse);
                let shared_cache = *cache_by_resource
                    .entry(resource.clone())
                    .or_insert(archetype_cache);
                let cache_index = if reuse { shared_cache } else { archetype_cache };
                let existing = if reuse {
                    roots.iter().copied().find(|node| graph.type_name(*node) == resource)
                } else {
                    None
                };

                let created = ResourceBuilder {
                    types: self.types,
                    evaluator: self.evaluator,
                    graph: &mut graph,
                    cache: &mut caches[cache_index],
                    constructor: ObjectConstructor::new(self.types),
                    populator: Populator::new(self.types),
                }
                .build(helpers, &config, existing);

                tracing::info!(
                    count = created.len(),
                    archetype = %archetype,
                    "constructed resources for archetype"
                );
                for node in created {
                    if !roots.contains(&node) {
                        roots.push(node);
                    }
                }
            }
        }

        Ok(ResourceCollection::new(graph, roots, context.is_bundle()))
    }
}

/// A cached (or freshly built) element plus the part of the path that
/// still has to be created below it.
struct Found {
    target: Built,
    removed: String,
}

/// Writes the helpers of one model into resources.
struct ResourceBuilder<'e, 'g> {
    types: &'e dyn TypeDescriptor,
    evaluator: &'e dyn PathEvaluator,
    graph: &'g mut ResourceGraph,
    cache: &'g mut IntermediateCache,
    constructor: ObjectConstructor<'e>,
    populator: Populator<'e>,
}

impl ResourceBuilder<'_, '_> {
    fn build(
        mut self,
        helpers: Vec<Helper>,
        config: &FhirConfig,
        existing: Option<NodeId>,
    ) -> Vec<NodeId> {
        let generating = config.resource().to_owned();
        let conditions: Vec<&Condition> = config.condition.iter().collect();
        let conditioning = amend_fhir_path(FHIR_RESOURCE, &conditions, &generating);
        let key = |index: i64| format!("{index}_{conditioning}");

        let mut created: IndexMap<String, NodeId> = IndexMap::new();
        if let Some(existing) = existing {
            created.insert(key(0), existing);
        }

        for mut helper in helpers {
            if helper.data.is_empty() {
                tracing::warn!(openehr = %helper.openehr_path, "no data parsed for path");
            }
            let data = std::mem::take(&mut helper.data);
            let (mut indexed, everywhere): (Vec<DataPoint>, Vec<DataPoint>) =
                data.into_iter().partition(|point| point.index != -1);
            indexed.sort_by_key(|point| last_index(&point.path));

            for point in &indexed {
                let index = if config.multiple { first_index(&point.path) } else { 0 };
                let slot = key(index);
                let instance = match created.get(&slot) {
                    Some(instance) => *instance,
                    None => {
                        tracing::info!(resource = %generating, "creating a new resource instance");
                        match self.constructor.create_resource(self.graph, &generating) {
                            Some(instance) => instance,
                            None => continue,
                        }
                    }
                };
                self.apply(&helper, instance, point);
                created.insert(slot, instance);
            }

            for point in &everywhere {
                let mut instances: Vec<NodeId> = created.values().copied().collect();
                if instances.is_empty() {
                    let Some(instance) = self
                        .constructor
                        .create_resource(self.graph, &helper.target_resource)
                    else {
                        continue;
                    };
                    created.insert(key(0), instance);
                    instances.push(instance);
                }
                for instance in instances {
                    self.apply(&helper, instance, point);
                }
            }
        }

        let mut resources: Vec<NodeId> = created.into_values().collect();
        for resource in &resources {
            self.assert_limiting_criteria(*resource, &config.condition);
        }
        resources.extend(self.constructor.take_created_resources());
        resources
    }

    /// Writes one data point of `helper` into `instance`, then the helper's
    /// own condition.
    fn apply(&mut self, helper: &Helper, instance: NodeId, point: &DataPoint) {
        if !helper.is_structural() {
            let fhir_path = fhir_path_with_conditions(
                &helper.fhir_path,
                helper.condition.as_ref(),
                &helper.target_resource,
                helper.parent_fhir.as_deref(),
            );
            tracing::debug!(
                openehr = %point.path,
                fhir = %fhir_path,
                value = point.value.kind_name(),
                "mapping data point"
            );
            self.write(helper, instance, &fhir_path, point);
        }
        self.apply_condition(helper, instance, &point.path);
    }

    fn write(&mut self, helper: &Helper, instance: NodeId, fhir_path: &str, point: &DataPoint) {
        let Some(found) = self.get_or_instantiate(helper, instance, fhir_path, &point.path) else {
            tracing::warn!(
                fhir = %fhir_path,
                "resource path could not be built, skipping data point"
            );
            return;
        };
        if found.removed.is_empty() {
            self.populator.populate(self.graph, &found.target, &point.value);
            return;
        }

        let mut removed = found.removed;
        self.settle_filtered_list(&found.target, &mut removed);
        let only_filter = extract_filter_clause(&removed, false)
            .is_some_and(|clause| clause == removed || format!(".{clause}") == removed);
        let step = if only_filter { THIS } else { removed.as_str() };

        let Some(mut built) = self.constructor.instantiate(
            self.graph,
            &found.target,
            step,
            helper.forcing(),
            Some(&helper.target_resource),
        ) else {
            tracing::warn!(
                fhir = %fhir_path,
                missing = %removed,
                "resource path could not be built, skipping data point"
            );
            return;
        };
        let generating = self.graph.type_name(instance).to_owned();
        built.path = cached_path(fhir_path, &removed, &generating, only_filter);
        self.cache.store(
            self.graph,
            instance,
            &built,
            &generating,
            &point.path,
            ParentPaths::new(helper.parent_fhir.as_deref(), helper.parent_openehr.as_deref()),
        );
        self.populator.populate(self.graph, &built.leaf().returning, &point.value);
    }

    /// Cached element on `fhir_path`, or a newly built one. A path whose
    /// first segment names another resource type builds a separate resource.
    fn get_or_instantiate(
        &mut self,
        helper: &Helper,
        instance: NodeId,
        fhir_path: &str,
        openehr_path: &str,
    ) -> Option<Found> {
        let lookup = self.cache.lookup(
            instance,
            fhir_path,
            openehr_path,
            helper.followed_by,
            helper.parent_openehr.as_deref(),
        );
        if let Some(target) = lookup.found {
            return Some(Found {
                target,
                removed: lookup.removed,
            });
        }

        let parents =
            ParentPaths::new(helper.parent_fhir.as_deref(), helper.parent_openehr.as_deref());
        let cover = self.graph.type_name(instance).to_owned();
        let first = fhir_path.split('.').next().unwrap_or_default().to_owned();
        let separate_resource =
            !first.is_empty() && first != cover && self.types.is_resource(&first);
        let (built, under) = if separate_resource {
            let separate = self.constructor.create_resource(self.graph, &first)?;
            self.constructor.track_created(separate);
            self.cache.store(
                self.graph,
                instance,
                &Instantiated::single(separate, ""),
                &first,
                openehr_path,
                parents,
            );
            let rest = fhir_path.split_once('.').map(|(_, rest)| rest).unwrap_or_default();
            let built = self.constructor.instantiate(
                self.graph,
                &Built::Single(separate),
                rest,
                helper.forcing(),
                Some(&first),
            )?;
            (built, first)
        } else {
            let built = self.constructor.instantiate(
                self.graph,
                &Built::Single(instance),
                fhir_path,
                helper.forcing(),
                Some(&helper.target_resource),
            )?;
            (built, cover)
        };

        self.cache.store(self.graph, instance, &built, &under, openehr_path, parents);
        Some(Found {
            target: built.leaf().returning.clone(),
            removed: String::new(),
        })
    }

    /// A cached list is about to be narrowed by a filter. When no element
    /// satisfies the filter a fresh element is appended and the filter is
    /// dropped from `removed`, so nothing unrelated gets overwritten.
    fn settle_filtered_list(&mut self, target: &Built, removed: &mut String) {
        let Built::Many { owner, field } = target else {
            return;
        };
        if !(removed.starts_with(".where") || removed.starts_with(WHERE)) {
            return;
        }
        let Some(clause) = extract_filter_clause(removed, false) else {
            return;
        };
        let clause = clause.strip_prefix('.').unwrap_or(&clause).to_owned();
        let elements = target.elements(self.graph);
        let matched = elements.iter().any(|element| {
            self.evaluator
                .evaluate_node(self.graph, *element, &clause)
                .map(|found| !found.is_empty())
                .unwrap_or_else(|e| {
                    tracing::warn!(filter = %clause, error = %e, "filter not evaluable");
                    false
                })
        });
        if matched {
            return;
        }
        let forcing = elements.first().map(|e| self.graph.type_name(*e).to_owned());
        if self
            .constructor
            .append_element(self.graph, *owner, field, forcing.as_deref())
            .is_some()
        {
            *removed = removed.replace(&format!(".{clause}"), "").replace(&clause, "");
        }
    }

    /// Writes the criteria code of the helper's own condition at the
    /// condition's target.
    fn apply_condition(&mut self, helper: &Helper, instance: NodeId, openehr_path: &str) {
        let Some(condition) = helper.condition.as_ref() else {
            return;
        };
        if condition.target_attribute.is_none() {
            return;
        }
        let code = criteria_coding(condition.criteria.as_deref().unwrap_or_default()).code;
        let target = &helper.target_resource;
        let parent_fhir = helper.parent_fhir.as_deref();
        let with_conditions =
            fhir_path_with_conditions(&condition.target_root, Some(condition), target, parent_fhir);
        let condition_path =
            condition_target_path(&helper.fhir_path, condition, target, parent_fhir);
        let parents = ParentPaths::new(parent_fhir, helper.parent_openehr.as_deref());

        let lookup = self.cache.lookup(
            instance,
            &condition_path,
            openehr_path,
            helper.followed_by,
            helper.parent_openehr.as_deref(),
        );
        let built = match lookup.found {
            Some(found) => {
                self.constructor
                    .instantiate(self.graph, &found, &lookup.removed, None, None)
            }
            None => {
                let plain =
                    fhir_path_without_conditions(&condition.target_root, Some(condition), target);
                let built = self
                    .constructor
                    .instantiate(self.graph, &Built::Single(instance), &plain, None, None);
                built.map(|mut built| {
                    built.path = with_conditions.replace(&format!("{target}."), "");
                    let cover = self.graph.type_name(instance).to_owned();
                    self.cache.store(self.graph, instance, &built, &cover, openehr_path, parents);
                    built
                })
            }
        };
        match built {
            Some(built) => {
                let code = DataValue::Text(code);
                self.populator.populate(self.graph, &built.leaf().returning, &code);
            }
            None => {
                tracing::warn!(root = %condition.target_root, "condition target could not be built")
            }
        }
    }

    /// Limiting criteria of the model hold on every built resource.
    fn assert_limiting_criteria(&mut self, resource: NodeId, conditions: &[Condition]) {
        let resource_type = self.graph.type_name(resource).to_owned();
        for condition in conditions {
            let (Some(criteria), Some(attribute)) =
                (condition.criteria.as_deref(), condition.target_attribute.as_deref())
            else {
                continue;
            };
            let check = fhir_path_with_conditions(
                &condition.target_root,
                Some(condition),
                &resource_type,
                None,
            );
            let holds = self
                .evaluator
                .evaluate_node(self.graph, resource, &check)
                .map(|found| !found.is_empty())
                .unwrap_or_else(|e| {
                    tracing::warn!(
                        expression = %check,
                        error = %e,
                        "limiting criteria not evaluable"
                    );
                    false
                });
            if holds {
                tracing::debug!(resource = %resource_type, "limiting criteria already satisfied");
                continue;
            }
            let root = condition.target_root.replace(FHIR_RESOURCE, &resource_type);
            let path = format!("{root}.{attribute}");
            match self
                .constructor
                .instantiate(self.graph, &Built::Single(resource), &path, None, None)
            {
                Some(built) => {
                    let code = criteria_coding(criteria).code;
                    self.populator
                        .populate(self.graph, &built.leaf().returning, &DataValue::Text(code));
                }
                None => tracing::warn!(path = %path, "limiting criteria target could not be built"),
            }
        }
    }
}

/// Path, relative to the resource, under which a chain built for the
/// `removed` tail of `fhir_path` is cached.
fn cached_path(fhir_path: &str, removed: &str, generating: &str, only_filter: bool) -> String {
    let relative = fhir_path.replace(&format!("{generating}."), "");
    if only_filter {
        return relative;
    }
    if removed.starts_with(".as(") {
        let parts: Vec<&str> = removed.split('.').collect();
        let cast = parts.get(1).copied().unwrap_or_default();
        let after = parts.get(2).map(|p| format!(".{p}")).unwrap_or_default();
        return format!("{}.{cast}{after}", relative.replace(removed, ""));
    }

    let mut removed = removed.to_owned();
    if removed.starts_with(".where(") {
        if let Some(clause) = extract_filter_clause(&removed, false) {
            removed = removed.replace(&format!(".{clause}"), "");
        }
    }
    let parts: Vec<&str> = removed.split('.').filter(|p| !p.trim().is_empty()).collect();
    let suffix = parts.first().copied().unwrap_or_default();
    let filter = match parts.get(1) {
        Some(p) if p.starts_with(WHERE) => extract_filter_clause(&removed, false)
            .map(|c| format!(".{c}"))
            .unwrap_or_default(),
        _ => String::new(),
    };
    let cast = match parts.get(1) {
        Some(p) if p.starts_with("as") => format!(".{p}"),
        _ => String::new(),
    };
    format!("{}.{suffix}{filter}{cast}", relative.replace(&removed, ""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_path_rebuilds_the_created_tail() {
        assert_eq!(
            cached_path("Observation.code.coding.system", ".coding.system", "Observation", false),
            "code.coding"
        );
        assert_eq!(
            cached_path(
                "Observation.component.where(code.coding.code.toString().contains('8480-6')).value",
                ".where(code.coding.code.toString().contains('8480-6')).value",
                "Observation",
                false
            ),
            "component.where(code.coding.code.toString().contains('8480-6')).value"
        );
        assert_eq!(
            cached_path(
                "Observation.extension.where(url='x')",
                ".where(url='x')",
                "Observation",
                true
            ),
            "extension.where(url='x')"
        );
    }

    fn component_rule(loinc: &str, element: &str) -> Helper {
        Helper {
            archetype: "openEHR-EHR-OBSERVATION.blood_pressure.v2".into(),
            target_resource: "Observation".into(),
            fhir_path: "Observation.component.value".into(),
            openehr_path: format!("vitals/blood_pressure/any_event/{element}"),
            kind: Some("QUANTITY".into()),
            value_kind: "DV_QUANTITY".into(),
            data: Vec::new(),
            condition: Some(Condition {
                target_root: "$fhirResource.component.code.coding".into(),
                target_attribute: Some("code".into()),
                operator: Some("one of".into()),
                criteria: Some(format!("[$loinc.{loinc}]")),
                ..Condition::default()
            }),
            followed_by: false,
            parent_fhir: None,
            parent_openehr: None,
        }
    }

    fn pressure(element: &str, value: f64) -> DataPoint {
        DataPoint {
            value: DataValue::Quantity {
                value: Some(crate::values::Number::Decimal(value)),
                unit: Some("mm[Hg]".into()),
                system: None,
                code: None,
            },
            index: 0,
            path: format!("vitals/blood_pressure:0/any_event:0/{element}"),
        }
    }

    fn component_code(graph: &ResourceGraph, component: NodeId) -> Option<String> {
        let code = graph.first_child(component, "code")?;
        let coding = graph.first_child(code, "coding")?;
        graph.child_text(coding, "code")
    }

    #[test]
    fn elements_are_built_once_per_owner_path_and_source() {
        let types = fhir::r4().expect("registry");
        let evaluator = fhir::FhirPath::new(types);
        let mut graph = ResourceGraph::new();
        let observation = graph.create("Observation");
        let mut cache = IntermediateCache::new();
        let mut builder = ResourceBuilder {
            types,
            evaluator: &evaluator,
            graph: &mut graph,
            cache: &mut cache,
            constructor: ObjectConstructor::new(types),
            populator: Populator::new(types),
        };

        let systolic = component_rule("8480-6", "systolic");
        builder.apply(&systolic, observation, &pressure("systolic", 120.0));
        builder.apply(&systolic, observation, &pressure("systolic", 125.0));
        let components = builder.graph.children(observation, "component").to_vec();
        assert_eq!(components.len(), 1);
        let value = builder.graph.first_child(components[0], "value").expect("quantity");
        assert_eq!(builder.graph.child_text(value, "value").as_deref(), Some("125.0"));
        assert_eq!(builder.graph.children(components[0], "code").len(), 1);
        assert_eq!(component_code(builder.graph, components[0]).as_deref(), Some("8480-6"));

        let diastolic = component_rule("8462-4", "diastolic");
        builder.apply(&diastolic, observation, &pressure("diastolic", 80.0));
        let components = builder.graph.children(observation, "component").to_vec();
        assert_eq!(components.len(), 2);
        assert_eq!(component_code(builder.graph, components[0]).as_deref(), Some("8480-6"));
        assert_eq!(component_code(builder.graph, components[1]).as_deref(), Some("8462-4"));
    }

    #[test]
    fn cast_tails_keep_the_cast() {
        assert_eq!(
            cached_path(
                "Observation.effective.as(DateTimeType).value",
                ".as(DateTimeType).value",
                "Observation",
                false
            ),
            "effective.as(DateTimeType).value"
        );
    }
}
