//! Translation facade.
//!
//! [`Translator`] is the single entry point the binaries use. Each call looks
//! up the mapping context for the template named in the [`TranslationContext`]
//! and runs one of the two engines with fresh per-call state; nothing mutable
//! outlives a call, so one context can serve concurrent requests.

use crate::error::{BridgeError, BridgeResult};
use crate::mapping::MappingRepository;
use crate::to_fhir::RecordToResource;
use crate::to_openehr::ResourceToRecord;
use bridge_types::TemplateId;
use fhir::{render_bundle, render_resource, NodeId, PathEvaluator, ResourceGraph, TypeDescriptor};
use openehr::{FlatRecord, TemplateCatalog};
use serde_json::Value as Json;

pub const CTX_LANGUAGE: &str = "ctx/language";
pub const CTX_TERRITORY: &str = "ctx/territory";
pub const CTX_COMPOSER_SELF: &str = "ctx/composer_self";

/// Everything a translation call reads: the mapping repository, the resource
/// type system, the path evaluator, the template and the composition defaults.
pub struct TranslationContext<'a> {
    repository: &'a MappingRepository,
    types: &'a dyn TypeDescriptor,
    evaluator: &'a dyn PathEvaluator,
    template_id: TemplateId,
    language: String,
    territory: String,
}

impl<'a> TranslationContext<'a> {
    pub fn new(
        repository: &'a MappingRepository,
        types: &'a dyn TypeDescriptor,
        evaluator: &'a dyn PathEvaluator,
        template_id: TemplateId,
    ) -> Self {
        Self {
            repository,
            types,
            evaluator,
            template_id,
            language: crate::constants::DEFAULT_LANGUAGE.to_owned(),
            territory: crate::constants::DEFAULT_TERRITORY.to_owned(),
        }
    }

    /// Overrides the composition language and territory written as context
    /// defaults.
    pub fn with_defaults(
        mut self,
        language: impl Into<String>,
        territory: impl Into<String>,
    ) -> Self {
        self.language = language.into();
        self.territory = territory.into();
        self
    }

    pub fn template_id(&self) -> &TemplateId {
        &self.template_id
    }

    pub fn types(&self) -> &'a dyn TypeDescriptor {
        self.types
    }
}

/// Resources built by a record to resource translation.
#[derive(Debug, Clone)]
pub struct ResourceCollection {
    pub graph: ResourceGraph,
    pub roots: Vec<NodeId>,
    /// The mapping context targets a Bundle.
    pub bundle: bool,
}

impl ResourceCollection {
    pub fn new(graph: ResourceGraph, roots: Vec<NodeId>, bundle: bool) -> Self {
        Self { graph, roots, bundle }
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Resources of the given type, in creation order.
    pub fn of_type<'s>(&'s self, type_name: &'s str) -> impl Iterator<Item = NodeId> + 's {
        self.roots
            .iter()
            .copied()
            .filter(move |root| self.graph.type_name(*root) == type_name)
    }

    /// Renders a collection Bundle, or the lone resource when the context is
    /// not in bundle mode and exactly one resource was built.
    pub fn to_json(&self, types: &dyn TypeDescriptor) -> Json {
        match self.roots.as_slice() {
            [single] if !self.bundle => render_resource(&self.graph, *single, types),
            roots => render_bundle(&self.graph, roots, types),
        }
    }
}

/// Stateless entry point for both translation directions.
#[derive(Debug, Clone, Copy, Default)]
pub struct Translator;

impl Translator {
    pub fn record_to_resource(
        &self,
        ctx: &TranslationContext<'_>,
        record: &FlatRecord,
        catalog: &dyn TemplateCatalog,
    ) -> BridgeResult<ResourceCollection> {
        let context = ctx.repository.context_for(&ctx.template_id)?;
        tracing::info!(
            template = %ctx.template_id,
            keys = record.len(),
            "translating record to resources"
        );
        RecordToResource::new(ctx.repository, ctx.types, ctx.evaluator)
            .translate(&context, record, catalog)
    }

    pub fn resource_to_record(
        &self,
        ctx: &TranslationContext<'_>,
        graph: &ResourceGraph,
        roots: &[NodeId],
        catalog: &dyn TemplateCatalog,
    ) -> BridgeResult<FlatRecord> {
        if roots.is_empty() {
            return Err(BridgeError::InvalidInput("no resources to translate".into()));
        }
        let context = ctx.repository.context_for(&ctx.template_id)?;
        tracing::info!(
            template = %ctx.template_id,
            resources = roots.len(),
            "translating resources to record"
        );
        let mut record = ResourceToRecord::new(ctx.repository, ctx.types, ctx.evaluator)
            .translate(&context, graph, roots, catalog)?;
        apply_context_defaults(&mut record, &ctx.language, &ctx.territory);
        Ok(record)
    }
}

/// Composition context entries a record must carry, filled in when the
/// mappings did not produce them.
pub fn apply_context_defaults(record: &mut FlatRecord, language: &str, territory: &str) {
    if !record.contains_key(CTX_LANGUAGE) {
        record.insert_text(CTX_LANGUAGE, language);
    }
    if !record.contains_key(CTX_TERRITORY) {
        record.insert_text(CTX_TERRITORY, territory);
    }
    if !record.contains_key(CTX_COMPOSER_SELF) {
        record.insert(CTX_COMPOSER_SELF, Json::Bool(true));
    }
}

/// The template a flat record belongs to: the first segment of its first
/// non-context key.
pub fn infer_template_id(record: &FlatRecord) -> BridgeResult<TemplateId> {
    let key = record
        .keys()
        .find(|key| !key.starts_with("ctx/"))
        .ok_or_else(|| BridgeError::InvalidInput("flat record has no composition paths".into()))?;
    let root = key.split(['/', '|']).next().unwrap_or(key);
    let root = root.split(':').next().unwrap_or(root);
    TemplateId::new(root)
        .map_err(|e| BridgeError::InvalidInput(format!("template id from `{key}`: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhir::{parse_resource, r4};

    #[test]
    fn defaults_do_not_override_present_values() {
        let mut record = FlatRecord::new();
        record.insert_text(CTX_LANGUAGE, "de");
        apply_context_defaults(&mut record, "en", "DE");
        assert_eq!(record.get_text(CTX_LANGUAGE).as_deref(), Some("de"));
        assert_eq!(record.get_text(CTX_TERRITORY).as_deref(), Some("DE"));
        assert_eq!(record.get(CTX_COMPOSER_SELF), Some(&Json::Bool(true)));
    }

    #[test]
    fn template_id_comes_from_first_composition_key() {
        let record = FlatRecord::from_json(
            r#"{
                "ctx/language": "en",
                "blood_pressure/blood_pressure:0/any_event:0/systolic|magnitude": 120
            }"#,
        )
        .expect("flat record");
        assert_eq!(infer_template_id(&record).expect("id").as_str(), "blood_pressure");

        let only_context = FlatRecord::from_json(r#"{"ctx/language": "en"}"#).expect("flat record");
        assert!(infer_template_id(&only_context).is_err());
    }

    #[test]
    fn single_resource_renders_bare_outside_bundle_mode() {
        let types = r4().expect("registry");
        let parsed = parse_resource(r#"{"resourceType": "Observation", "status": "final"}"#, types)
            .expect("parse");

        let bare = ResourceCollection::new(parsed.graph.clone(), vec![parsed.root], false);
        assert_eq!(bare.to_json(types)["resourceType"], "Observation");

        let bundled = ResourceCollection::new(parsed.graph, vec![parsed.root], true);
        let json = bundled.to_json(types);
        assert_eq!(json["resourceType"], "Bundle");
        assert_eq!(json["entry"][0]["resource"]["status"], "final");
        assert_eq!(bundled.of_type("Observation").count(), 1);
    }
}
