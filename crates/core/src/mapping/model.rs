//! Mapping document model.
//!
//! Three document kinds share one envelope (`grammar`, `type`, `metadata`,
//! `spec`):
//! - `context`: binds a template to the ordered list of concepts it maps
//! - `model`: rules for one archetype and the resource type it becomes
//! - slot models: a `model` without `fhirConfig`, only reachable through a
//!   rule's `slotArchetype`
//!
//! Rules are plain data. The engines rewrite copies of them while expanding
//! nested rules, so every type here is `Clone`.

use crate::constants::STRUCTURE_DEFINITION_PREFIX;
use crate::error::{schema_mismatch, BridgeResult};
use bridge_types::{NonEmptyText, TemplateId};
use indexmap::IndexMap;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Context,
    Model,
}

/// Free-form document metadata. Only `name` and `version` are interpreted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(flatten)]
    pub extra: IndexMap<String, serde_yaml::Value>,
}

/// Which direction a rule is restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Direction {
    #[serde(rename = "openehr->fhir")]
    ToFhir,
    #[serde(rename = "fhir->openehr")]
    ToOpenehr,
}

/// A filter on one side of a rule.
///
/// On the resource side `targetRoot` is a path, `targetAttribute` the field
/// below it that is compared and `criteria` the expected value list. On the
/// record side the same fields address flat paths.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Condition {
    pub target_root: String,
    #[serde(default)]
    pub target_attribute: Option<String>,
    #[serde(default)]
    pub target_attributes: Vec<String>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub criteria: Option<String>,
    #[serde(default)]
    pub identifying: bool,
}

impl Condition {
    /// Attributes the condition inspects; `targetAttribute` and
    /// `targetAttributes` are merged.
    pub fn attributes(&self) -> Vec<&str> {
        self.target_attribute
            .iter()
            .map(String::as_str)
            .chain(self.target_attributes.iter().map(String::as_str))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct With {
    #[serde(default)]
    pub fhir: Option<String>,
    #[serde(default)]
    pub openehr: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FollowedBy {
    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReferenceMapping {
    pub resource_type: String,
    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

/// One mapping rule.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Mapping {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub with: With,
    #[serde(default, alias = "condition")]
    pub fhir_condition: Option<Condition>,
    #[serde(default)]
    pub openehr_condition: Option<Condition>,
    #[serde(default)]
    pub followed_by: Option<FollowedBy>,
    #[serde(default)]
    pub reference: Option<ReferenceMapping>,
    #[serde(default)]
    pub slot_archetype: Option<String>,
    #[serde(default)]
    pub unidirectional: Option<Direction>,
}

impl Mapping {
    /// False when the rule is restricted to the other direction.
    pub fn applies_to(&self, direction: Direction) -> bool {
        self.unidirectional.map_or(true, |d| d == direction)
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OpenEhrConfig {
    pub archetype: String,
    #[serde(default)]
    pub revision: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FhirConfig {
    pub structure_definition: String,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default)]
    pub condition: Vec<Condition>,
}

impl FhirConfig {
    /// Resource type named by the structure definition URL.
    pub fn resource(&self) -> &str {
        self.structure_definition
            .strip_prefix(STRUCTURE_DEFINITION_PREFIX)
            .unwrap_or(&self.structure_definition)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Spec {
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub extension_of: Option<String>,
    #[serde(default)]
    pub open_ehr_config: Option<OpenEhrConfig>,
    #[serde(default)]
    pub fhir_config: Option<FhirConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextTemplate {
    pub id: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextProfile {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextBody {
    pub profile: ContextProfile,
    pub template: ContextTemplate,
    #[serde(default)]
    pub archetypes: Vec<String>,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub start: Option<String>,
}

/// Envelope shared by every mapping document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDocument {
    #[serde(default)]
    grammar: Option<String>,
    #[serde(rename = "type")]
    kind: DocumentKind,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    spec: Spec,
    #[serde(default)]
    context: Option<ContextBody>,
    #[serde(default)]
    mappings: Vec<Mapping>,
}

/// A mapping context: which template, which concepts, bundle or single
/// resource.
#[derive(Debug, Clone)]
pub struct MappingContext {
    pub metadata: Metadata,
    pub template_id: TemplateId,
    pub template_version: Option<String>,
    pub profile_url: String,
    pub archetypes: Vec<String>,
}

impl MappingContext {
    /// Bundle mode: the context profile is the Bundle structure definition.
    pub fn is_bundle(&self) -> bool {
        self.profile_url.ends_with("/Bundle")
    }

    /// Resource type the context profile names.
    pub fn resource_type(&self) -> &str {
        self.profile_url.rsplit('/').next().unwrap_or(&self.profile_url)
    }
}

/// Rules for one archetype.
#[derive(Debug, Clone)]
pub struct ModelMapper {
    pub metadata: Metadata,
    pub archetype: NonEmptyText,
    /// `None` for slot models.
    pub fhir_config: Option<FhirConfig>,
    pub mappings: Vec<Mapping>,
}

impl ModelMapper {
    pub fn is_slot(&self) -> bool {
        self.fhir_config.is_none()
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or(self.archetype.as_str())
    }

    pub fn resource(&self) -> Option<&str> {
        self.fhir_config.as_ref().map(FhirConfig::resource)
    }

    pub fn conditions(&self) -> &[Condition] {
        self.fhir_config.as_ref().map(|c| c.condition.as_slice()).unwrap_or(&[])
    }

    pub fn multiple(&self) -> bool {
        self.fhir_config.as_ref().is_some_and(|c| c.multiple)
    }
}

#[derive(Debug, Clone)]
pub enum MappingDocument {
    Context(MappingContext),
    Model(ModelMapper),
}

impl MappingDocument {
    /// Parses one YAML document.
    pub fn from_yaml(text: &str) -> BridgeResult<Self> {
        let de = serde_yaml::Deserializer::from_str(text);
        let raw: RawDocument =
            serde_path_to_error::deserialize(de).map_err(|e| schema_mismatch("mapping", e))?;
        raw.into_document()
    }
}

impl RawDocument {
    fn into_document(self) -> BridgeResult<MappingDocument> {
        use crate::error::BridgeError;

        if let Some(grammar) = &self.grammar {
            tracing::debug!(grammar = %grammar, "parsing mapping document");
        }
        match self.kind {
            DocumentKind::Context => {
                let body = self.context.ok_or_else(|| {
                    BridgeError::MappingSchema("context document has no `context` section".into())
                })?;
                let template_id = TemplateId::new(&body.template.id)
                    .map_err(|e| BridgeError::MappingSchema(format!("context.template.id: {e}")))?;
                if !body.extensions.is_empty() {
                    let count = body.extensions.len();
                    tracing::debug!(count, "context extensions are ignored");
                }
                Ok(MappingDocument::Context(MappingContext {
                    metadata: self.metadata,
                    template_id,
                    template_version: body.template.version,
                    profile_url: body.profile.url,
                    archetypes: body.archetypes,
                }))
            }
            DocumentKind::Model => {
                let archetype = self
                    .spec
                    .open_ehr_config
                    .map(|c| c.archetype)
                    .ok_or_else(|| {
                        let message = "model document has no spec.openEhrConfig";
                        BridgeError::MappingSchema(message.into())
                    })?;
                let archetype = NonEmptyText::new(archetype).map_err(|e| {
                    BridgeError::MappingSchema(format!("spec.openEhrConfig.archetype: {e}"))
                })?;
                Ok(MappingDocument::Model(ModelMapper {
                    metadata: self.metadata,
                    archetype,
                    fhir_config: self.spec.fhir_config,
                    mappings: self.mappings,
                }))
            }
        }
    }
}
