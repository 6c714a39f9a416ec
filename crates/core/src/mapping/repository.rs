//! Mapping repository and template store.
//!
//! Both are loaded once at startup and then shared read-only behind `Arc`.
//! The repository hands out deep copies of model mappers because expansion
//! rewrites rules in place.

use crate::constants::FHIR_RESOURCE;
use crate::error::{BridgeError, BridgeResult};
use crate::mapping::model::{MappingContext, MappingDocument, ModelMapper};
use crate::paths::amend_fhir_path;
use bridge_types::TemplateId;
use fhir::{NodeId, PathEvaluator, ResourceGraph, Value};
use openehr::WebTemplate;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Outcome of loading a mapping directory.
#[derive(Debug, Default, Clone)]
pub struct LoadReport {
    pub contexts: usize,
    pub models: usize,
    /// Files skipped because they failed to read or parse, with the reason.
    pub failed: Vec<(PathBuf, String)>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl std::fmt::Display for LoadReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "contexts: {}", self.contexts)?;
        writeln!(f, "models:   {}", self.models)?;
        if self.failed.is_empty() {
            return writeln!(f, "all mapping files loaded");
        }
        writeln!(f, "failed:   {}", self.failed.len())?;
        for (path, reason) in &self.failed {
            writeln!(f, "  {}: {reason}", path.display())?;
        }
        Ok(())
    }
}

/// Context and model mappers indexed by template.
#[derive(Debug, Default)]
pub struct MappingRepository {
    contexts: HashMap<TemplateId, MappingContext>,
    models: Vec<ModelMapper>,
}

impl MappingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every `*.yml`/`*.yaml` file below `dir`.
    ///
    /// Files that fail to parse are logged and listed in the report; only an
    /// unreadable directory is an error.
    pub fn load_dir(dir: &Path) -> BridgeResult<(Self, LoadReport)> {
        let mut files = Vec::new();
        collect_yaml_files(dir, &mut files)?;
        files.sort();

        let mut repository = Self::new();
        let mut report = LoadReport::default();
        for path in files {
            let parsed = std::fs::read_to_string(&path)
                .map_err(|source| BridgeError::FileRead {
                    path: path.clone(),
                    source,
                })
                .and_then(|text| MappingDocument::from_yaml(&text));
            match parsed {
                Ok(document) => {
                    match &document {
                        MappingDocument::Context(_) => report.contexts += 1,
                        MappingDocument::Model(_) => report.models += 1,
                    }
                    repository.add(document);
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "skipping mapping file");
                    report.failed.push((path, e.to_string()));
                }
            }
        }
        tracing::info!(
            contexts = report.contexts,
            models = report.models,
            failed = report.failed.len(),
            dir = %dir.display(),
            "mapping repository loaded"
        );
        Ok((repository, report))
    }

    pub fn add(&mut self, document: MappingDocument) {
        match document {
            MappingDocument::Context(context) => {
                if self.contexts.contains_key(&context.template_id) {
                    tracing::warn!(
                        template = %context.template_id,
                        "replacing earlier context for template"
                    );
                }
                self.contexts.insert(context.template_id.clone(), context);
            }
            MappingDocument::Model(model) => self.models.push(model),
        }
    }

    pub fn template_ids(&self) -> Vec<&TemplateId> {
        let mut ids: Vec<&TemplateId> = self.contexts.keys().collect();
        ids.sort();
        ids
    }

    pub fn context_for(&self, template: &TemplateId) -> BridgeResult<MappingContext> {
        self.contexts
            .get(template)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownTemplate(template.to_string()))
    }

    /// Concept mappers for `archetype`, in load order. Empty when the
    /// template's context does not list the archetype.
    pub fn mappers_for(&self, template: &TemplateId, archetype: &str) -> Vec<ModelMapper> {
        let Some(context) = self.contexts.get(template) else {
            tracing::warn!(template = %template, "no mapping context for template");
            return Vec::new();
        };
        if !context.archetypes.iter().any(|a| a == archetype) {
            return Vec::new();
        }
        self.models
            .iter()
            .filter(|m| !m.is_slot() && m.archetype.as_str() == archetype)
            .cloned()
            .collect()
    }

    /// Slot models for `archetype`. Slot models are not listed in contexts;
    /// they are reachable from any template that refers to them.
    pub fn slot_mappers_for(&self, template: &TemplateId, archetype: &str) -> Vec<ModelMapper> {
        if !self.contexts.contains_key(template) {
            tracing::warn!(template = %template, "no mapping context for template");
            return Vec::new();
        }
        self.models
            .iter()
            .filter(|m| m.is_slot() && m.archetype.as_str() == archetype)
            .cloned()
            .collect()
    }

    /// Concept mappers of `template` whose limiting criteria select the
    /// resource at `node`.
    pub fn mappers_for_resource(
        &self,
        template: &TemplateId,
        graph: &ResourceGraph,
        node: NodeId,
        evaluator: &dyn PathEvaluator,
    ) -> Vec<ModelMapper> {
        let Some(context) = self.contexts.get(template) else {
            return Vec::new();
        };
        let resource_type = graph.type_name(node);
        let mut relevant = Vec::new();
        for archetype in &context.archetypes {
            let models = self
                .models
                .iter()
                .filter(|m| m.archetype.as_str() == archetype.as_str());
            for mapper in models {
                let Some(resource) = mapper.resource() else {
                    continue;
                };
                if resource != resource_type {
                    continue;
                }
                let conditions: Vec<_> = mapper.conditions().iter().collect();
                let expression = amend_fhir_path(FHIR_RESOURCE, &conditions, resource);
                if expression.is_empty() || expression == resource {
                    relevant.push(mapper.clone());
                    continue;
                }
                match evaluator.evaluate_node(graph, node, &expression) {
                    Ok(found) if selects(&found) => {
                        tracing::info!(
                            mapper = %mapper.name(),
                            resource = %resource,
                            "limiting criteria matched"
                        );
                        relevant.push(mapper.clone());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(
                            mapper = %mapper.name(),
                            expression = %expression,
                            error = %e,
                            "limiting criteria not evaluable"
                        );
                    }
                }
            }
        }
        if relevant.len() > 1 {
            tracing::info!(
                count = relevant.len(),
                resource = %resource_type,
                "more than one mapper found for resource"
            );
        }
        relevant
    }
}

/// A non-empty result selects, unless it is a single `false`.
fn selects(found: &[Value]) -> bool {
    match found.first() {
        None => false,
        Some(Value::Boolean(flag)) => *flag,
        Some(_) => true,
    }
}

fn collect_yaml_files(dir: &Path, out: &mut Vec<PathBuf>) -> BridgeResult<()> {
    let entries = std::fs::read_dir(dir).map_err(|source| BridgeError::FileRead {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| BridgeError::FileRead {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            collect_yaml_files(&path, out)?;
        } else if matches!(path.extension().and_then(|e| e.to_str()), Some("yml" | "yaml")) {
            out.push(path);
        }
    }
    Ok(())
}

/// Parsed web templates, loaded from a directory on first use.
///
/// Population is idempotent, so two concurrent misses for the same id both
/// parse and the second insert is harmless.
#[derive(Debug)]
pub struct TemplateStore {
    dir: PathBuf,
    templates: RwLock<HashMap<TemplateId, Arc<WebTemplate>>>,
}

impl TemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            templates: RwLock::new(HashMap::new()),
        }
    }

    /// Adds an already parsed template.
    pub fn insert(&self, template: WebTemplate) -> BridgeResult<Arc<WebTemplate>> {
        let id = TemplateId::new(&template.template_id)
            .map_err(|e| BridgeError::InvalidInput(format!("web template id: {e}")))?;
        let template = Arc::new(template);
        if let Ok(mut guard) = self.templates.write() {
            guard.insert(id, Arc::clone(&template));
        }
        Ok(template)
    }

    pub fn get(&self, id: &TemplateId) -> BridgeResult<Arc<WebTemplate>> {
        if let Some(found) = self.templates.read().ok().and_then(|guard| guard.get(id).cloned()) {
            return Ok(found);
        }
        self.load_all()?;
        self.templates
            .read()
            .ok()
            .and_then(|guard| guard.get(id).cloned())
            .ok_or_else(|| BridgeError::UnknownTemplate(id.to_string()))
    }

    /// Parses every `*.json` web template in the directory. Files that are
    /// not web templates are skipped with a warning.
    fn load_all(&self) -> BridgeResult<()> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| BridgeError::FileRead {
            path: self.dir.clone(),
            source,
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = std::fs::read_to_string(&path).map_err(|source| BridgeError::FileRead {
                path: path.clone(),
                source,
            })?;
            match WebTemplate::from_json(&text) {
                Ok(template) => {
                    tracing::debug!(
                        path = %path.display(),
                        template = %template.template_id,
                        "web template loaded"
                    );
                    self.insert(template)?;
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "not a web template, skipping"
                    )
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhir::{parse_resource, r4, FhirPath};
    use std::fs;

    const CONTEXT: &str = r#"
type: context
context:
  profile: { url: "http://hl7.org/fhir/StructureDefinition/Bundle" }
  template: { id: Blood Pressure }
  archetypes: [openEHR-EHR-OBSERVATION.blood_pressure.v2]
"#;

    const MODEL: &str = r#"
type: model
spec:
  openEhrConfig: { archetype: openEHR-EHR-OBSERVATION.blood_pressure.v2 }
  fhirConfig:
    structureDefinition: http://hl7.org/fhir/StructureDefinition/Observation
    condition:
      - targetRoot: $fhirResource.code.coding
        targetAttribute: code
        operator: one of
        criteria: "[$loinc.85354-9]"
mappings:
  - with: { fhir: $fhirResource.status, openehr: $openEhrArchetype.status, type: STRING }
"#;

    const SLOT: &str = r#"
type: model
spec:
  openEhrConfig: { archetype: openEHR-CLUSTER.device.v1 }
mappings: []
"#;

    fn repository_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("context.yml"), CONTEXT).expect("write");
        fs::create_dir(dir.path().join("models")).expect("mkdir");
        fs::write(dir.path().join("models/bp.model.yml"), MODEL).expect("write");
        fs::write(dir.path().join("models/device.slot.yaml"), SLOT).expect("write");
        fs::write(dir.path().join("broken.yml"), "type: model\nmappings: [").expect("write");
        fs::write(dir.path().join("notes.txt"), "ignored").expect("write");
        dir
    }

    fn template() -> TemplateId {
        TemplateId::new("blood pressure").expect("id")
    }

    #[test]
    fn loads_nested_files_and_reports_failures() {
        let dir = repository_dir();
        let (repository, report) = MappingRepository::load_dir(dir.path()).expect("readable");
        assert_eq!(report.contexts, 1);
        assert_eq!(report.models, 2);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].0.ends_with("broken.yml"));
        assert!(!report.is_clean());

        let blood_pressure = "openEHR-EHR-OBSERVATION.blood_pressure.v2";
        assert_eq!(repository.mappers_for(&template(), blood_pressure).len(), 1);
        assert_eq!(repository.slot_mappers_for(&template(), "openEHR-CLUSTER.device.v1").len(), 1);
        assert!(repository.mappers_for(&template(), "openEHR-CLUSTER.device.v1").is_empty());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let err =
            MappingRepository::load_dir(Path::new("/definitely/not/here")).expect_err("missing");
        assert!(matches!(err, BridgeError::FileRead { .. }));
    }

    #[test]
    fn unknown_template_is_reported() {
        let repository = MappingRepository::new();
        let err = repository.context_for(&template()).expect_err("unknown");
        assert!(matches!(err, BridgeError::UnknownTemplate(id) if id == "blood_pressure"));
    }

    #[test]
    fn copies_are_independent() {
        let dir = repository_dir();
        let (repository, _) = MappingRepository::load_dir(dir.path()).expect("readable");
        let archetype = "openEHR-EHR-OBSERVATION.blood_pressure.v2";
        let mut first = repository.mappers_for(&template(), archetype);
        first[0].mappings.clear();
        assert_eq!(repository.mappers_for(&template(), archetype)[0].mappings.len(), 1);
    }

    #[test]
    fn resource_selection_uses_limiting_criteria() {
        let dir = repository_dir();
        let (repository, _) = MappingRepository::load_dir(dir.path()).expect("readable");
        let types = r4().expect("registry");
        let evaluator = FhirPath::new(types);

        let matching = parse_resource(
            r#"{
                "resourceType": "Observation",
                "code": {"coding": [{"system": "http://loinc.org", "code": "85354-9"}]}
            }"#,
            types,
        )
        .expect("resource");
        let other = parse_resource(
            r#"{"resourceType":"Observation","code":{"coding":[{"code":"29463-7"}]}}"#,
            types,
        )
        .expect("resource");

        assert_eq!(
            repository
                .mappers_for_resource(&template(), &matching.graph, matching.root, &evaluator)
                .len(),
            1
        );
        assert!(repository
            .mappers_for_resource(&template(), &other.graph, other.root, &evaluator)
            .is_empty());
    }
}
