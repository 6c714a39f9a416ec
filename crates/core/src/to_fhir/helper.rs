//! Expansion of a model's rule tree into flat helpers.
//!
//! Every rule that produces something becomes one [`Helper`] carrying its
//! final resource path, record path and the data points read for it.
//! `followedBy`, `reference` and slot rules are expanded recursively with
//! their paths rewritten against the parent rule.

use super::values::{group_keys, value_to_data_point, DataPoint};
use crate::condition::split_by_condition;
use crate::constants::{FHIR_RESOURCE, OPENEHR_ARCHETYPE, OPENEHR_CONTEXT, RECURRING, REFERENCE};
use crate::error::{BridgeError, BridgeResult};
use crate::mapping::prepare::{forward_slot, prepare_followed_by, prepare_referenced};
use crate::mapping::{Condition, Direction, Mapping, MappingRepository, ModelMapper};
use crate::paths::{amend_fhir_path, fhir_path_with_conditions, matching_keys, to_record_path};
use crate::values::{data_kind, kind};
use bridge_types::TemplateId;
use openehr::{rm, FlatRecord, TemplateCatalog};
use std::borrow::Cow;

/// One expanded rule, ready to be applied to a resource.
#[derive(Debug, Clone)]
pub struct Helper {
    pub archetype: String,
    pub target_resource: String,
    /// Resource path without the rule's own condition.
    pub fhir_path: String,
    pub openehr_path: String,
    /// Declared mapping type, if any.
    pub kind: Option<String>,
    /// Type the values were read as: the declared one or the template's.
    pub value_kind: String,
    pub data: Vec<DataPoint>,
    pub condition: Option<Condition>,
    pub followed_by: bool,
    pub parent_fhir: Option<String>,
    pub parent_openehr: Option<String>,
}

impl Helper {
    pub fn is_structural(&self) -> bool {
        self.kind.as_deref() == Some(rm::TYPE_NONE)
    }

    /// FHIR type the rule forces onto choice fields.
    pub fn forcing(&self) -> Option<&'static str> {
        self.kind
            .as_deref()
            .and_then(crate::values::forcing_type)
            .or_else(|| crate::values::forcing_type(&self.value_kind))
    }
}

/// Where a recursion step sits relative to its parent rule.
#[derive(Debug, Clone, Default)]
struct Scope {
    followed_by: bool,
    parent_fhir: Option<String>,
    parent_openehr: Option<String>,
    slot_context: String,
}

/// Expands the rules of one model against one record.
pub struct Expansion<'a> {
    pub repository: &'a MappingRepository,
    pub template: &'a TemplateId,
    pub catalog: &'a dyn TemplateCatalog,
    pub record: &'a FlatRecord,
}

impl<'a> Expansion<'a> {
    /// Helpers for every rule of `mapper`. A slot chain that leads back to
    /// a model already being expanded is an error.
    pub fn helpers(&self, mapper: &ModelMapper) -> BridgeResult<Vec<Helper>> {
        let Some(resource) = mapper.resource() else {
            return Ok(Vec::new());
        };
        let mut helpers = Vec::new();
        let mut chain = vec![mapper.archetype.as_str().to_owned()];
        let scope = Scope {
            slot_context: self.catalog.root_id().to_owned(),
            ..Scope::default()
        };
        self.expand(mapper, resource, mapper.mappings.clone(), &mut helpers, &scope, &mut chain)?;
        Ok(helpers)
    }

    fn expand(
        &self,
        mapper: &ModelMapper,
        resource_type: &str,
        mappings: Vec<Mapping>,
        helpers: &mut Vec<Helper>,
        scope: &Scope,
        chain: &mut Vec<String>,
    ) -> BridgeResult<()> {
        let root = self.catalog.root_id();
        let mapper_resource = mapper.resource().unwrap_or(resource_type);

        for mut mapping in mappings {
            if !mapping.applies_to(Direction::ToFhir) {
                continue;
            }
            let Some(fhir) = mapping.with.fhir.clone() else {
                continue;
            };
            if mapping.with.openehr.is_none() && mapping.with.value.is_some() {
                mapping.with.openehr = Some(OPENEHR_ARCHETYPE.to_owned());
            }
            let defined = mapping.with.openehr.clone();
            if defined.as_deref().is_some_and(|d| d.starts_with(OPENEHR_CONTEXT)) {
                tracing::debug!(rule = %mapping.name(), "composition context rule, skipping");
                continue;
            }

            let mut openehr = match defined.as_deref().filter(|d| !d.is_empty()) {
                Some(declared) => to_record_path(declared, root),
                None => scope.parent_openehr.clone().unwrap_or_default(),
            };
            let rm_type = match mapping.with.kind.clone() {
                Some(declared) => declared,
                None => self
                    .catalog
                    .resolve(&openehr, None)
                    .rm_type
                    .unwrap_or_else(|| rm::TYPE_NONE.to_owned()),
            };
            let fhir_path = amend_fhir_path(&fhir, &[], mapper_resource);
            let condition = mapping.fhir_condition.clone();
            let with_conditions = fhir_path_with_conditions(
                &fhir,
                condition.as_ref(),
                resource_type,
                scope.parent_fhir.as_deref(),
            );

            if let (Some(declared), Some(reference)) =
                (defined.as_deref(), mapping.reference.take())
            {
                if declared.starts_with(REFERENCE) {
                    let mut referenced = reference.mappings;
                    prepare_referenced(&with_conditions, &openehr, &mut referenced);
                    if condition.is_some() {
                        helpers.push(self.helper(
                            mapper,
                            resource_type,
                            declared.to_owned(),
                            fhir_path.clone(),
                            &mapping,
                            rm_type.clone(),
                            Vec::new(),
                            scope,
                        ));
                    }
                    let inner = Scope {
                        followed_by: false,
                        ..scope.clone()
                    };
                    self.expand(
                        mapper,
                        &reference.resource_type,
                        referenced,
                        helpers,
                        &inner,
                        chain,
                    )?;
                    continue;
                }
                mapping.reference = Some(reference);
            }

            if openehr.ends_with("content/content") && data_kind(&rm_type) == kind::MEDIA {
                openehr.truncate(openehr.len() - "/content".len());
            }
            let openehr = openehr.replace(RECURRING, "");
            let visible = match mapping.openehr_condition.as_ref() {
                Some(own) => Cow::Owned(split_by_condition(self.record, Some(own), root)),
                None => Cow::Borrowed(self.record),
            };
            let groups = group_keys(matching_keys(&openehr, visible.keys()));

            if let Some(slot_archetype) = mapping.slot_archetype.clone() {
                if chain.contains(&slot_archetype) {
                    let mut cycle = chain.clone();
                    cycle.push(slot_archetype);
                    return Err(BridgeError::RecursiveMapping { chain: cycle });
                }
                let slots = self.repository.slot_mappers_for(self.template, &slot_archetype);
                if slots.is_empty() {
                    tracing::warn!(
                        slot = %slot_archetype,
                        rule = %mapping.name(),
                        "no slot model found, skipping rule"
                    );
                }
                chain.push(slot_archetype);
                for mut slot in slots {
                    forward_slot(&mut slot, mapper, &fhir_path, &openehr, true);
                    let slot_mappings = std::mem::take(&mut slot.mappings);
                    let inner = Scope {
                        followed_by: true,
                        parent_fhir: Some(fhir_path.clone()),
                        parent_openehr: Some(openehr.clone()),
                        slot_context: openehr.clone(),
                    };
                    self.expand(&slot, resource_type, slot_mappings, helpers, &inner, chain)?;
                }
                chain.pop();

                if let Some(followed) = mapping.followed_by.take() {
                    let mut children = followed.mappings;
                    prepare_followed_by(&mut children, &fhir_path, &openehr, root);
                    let inner = Scope {
                        followed_by: true,
                        parent_fhir: Some(with_conditions.clone()),
                        parent_openehr: defined.clone(),
                        slot_context: scope.slot_context.clone(),
                    };
                    self.expand(mapper, resource_type, children, helpers, &inner, chain)?;
                }
                continue;
            }

            let structural = mapping.with.kind.as_deref() == Some(rm::TYPE_NONE);
            let literal = mapping.with.value.as_deref().filter(|v| !v.is_empty());
            let data: Vec<DataPoint> = match (structural, literal) {
                (false, Some(value)) => vec![DataPoint::literal(value)],
                (false, None) => groups
                    .iter()
                    .filter_map(|(element, keys)| {
                        value_to_data_point(element, keys, &rm_type, &visible, true)
                    })
                    .collect(),
                (true, _) if condition.is_some() => groups
                    .iter()
                    .filter_map(|(element, keys)| {
                        value_to_data_point(element, keys, &rm_type, &visible, false)
                    })
                    .collect(),
                (true, _) => Vec::new(),
            };

            let helper_path = if !structural {
                Some(openehr.clone())
            } else if condition.is_some() {
                Some(to_record_path(defined.as_deref().unwrap_or_default(), root))
            } else {
                None
            };
            if let Some(path) = helper_path {
                tracing::debug!(
                    rule = %mapping.name(),
                    fhir = %fhir_path,
                    openehr = %path,
                    points = data.len(),
                    "rule expanded"
                );
                helpers.push(self.helper(
                    mapper,
                    resource_type,
                    path,
                    fhir_path.clone(),
                    &mapping,
                    rm_type.clone(),
                    data,
                    scope,
                ));
            }

            if let Some(followed) = mapping.followed_by.take() {
                let mut children = followed.mappings;
                prepare_followed_by(&mut children, &fhir_path, &openehr, &scope.slot_context);
                let inner = Scope {
                    followed_by: true,
                    parent_fhir: Some(with_conditions),
                    parent_openehr: Some(defined.unwrap_or_else(|| root.to_owned())),
                    slot_context: scope.slot_context.clone(),
                };
                self.expand(mapper, resource_type, children, helpers, &inner, chain)?;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn helper(
        &self,
        mapper: &ModelMapper,
        resource_type: &str,
        openehr_path: String,
        fhir_path: String,
        mapping: &Mapping,
        value_kind: String,
        data: Vec<DataPoint>,
        scope: &Scope,
    ) -> Helper {
        let root = self.catalog.root_id();
        Helper {
            archetype: mapper.archetype.as_str().to_owned(),
            target_resource: resource_type.to_owned(),
            fhir_path,
            openehr_path,
            kind: mapping.with.kind.clone(),
            value_kind,
            data,
            condition: mapping.fhir_condition.clone(),
            followed_by: scope.followed_by,
            parent_fhir: scope
                .parent_fhir
                .as_ref()
                .map(|p| p.replace(FHIR_RESOURCE, resource_type)),
            parent_openehr: scope
                .parent_openehr
                .as_ref()
                .map(|p| p.replace(OPENEHR_ARCHETYPE, root)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingDocument;
    use openehr::WebTemplate;

    const CONTEXT: &str = r#"
type: context
context:
  profile: { url: "http://hl7.org/fhir/StructureDefinition/Bundle" }
  template: { id: vitals }
  archetypes: [openEHR-EHR-OBSERVATION.blood_pressure.v2]
"#;

    const TEMPLATE: &str = r#"{
      "templateId": "vitals",
      "defaultLanguage": "en",
      "tree": {
        "id": "vitals", "name": "Vitals", "rmType": "COMPOSITION",
        "min": 1, "max": 1, "aqlPath": "",
        "children": [{
          "id": "blood_pressure", "name": "Blood pressure", "rmType": "OBSERVATION",
          "min": 0, "max": -1, "aqlPath": "",
          "children": [{
            "id": "any_event", "name": "Any event", "rmType": "EVENT",
            "min": 0, "max": -1, "aqlPath": "",
            "children": [
              {"id": "systolic", "name": "Systolic", "rmType": "DV_QUANTITY",
               "min": 0, "max": 1, "aqlPath": "", "children": []},
              {"id": "position", "name": "Position", "rmType": "DV_CODED_TEXT",
               "min": 0, "max": 1, "aqlPath": "", "children": []}
            ]
          }]
        }]
      }
    }"#;

    fn repository(model: &str) -> MappingRepository {
        let mut repository = MappingRepository::new();
        repository.add(MappingDocument::from_yaml(CONTEXT).expect("context"));
        repository.add(MappingDocument::from_yaml(model).expect("model"));
        repository
    }

    fn expand(model: &str, flat: &str) -> BridgeResult<Vec<Helper>> {
        let repository = repository(model);
        let template = TemplateId::new("vitals").expect("id");
        let catalog = WebTemplate::from_json(TEMPLATE).expect("template");
        let record = FlatRecord::from_json(flat).expect("record");
        let mapper = repository
            .mappers_for(&template, "openEHR-EHR-OBSERVATION.blood_pressure.v2")
            .pop()
            .expect("mapper");
        Expansion {
            repository: &repository,
            template: &template,
            catalog: &catalog,
            record: &record,
        }
        .helpers(&mapper)
    }

    #[test]
    fn plain_rule_reads_every_occurrence() {
        let model = r#"
type: model
spec:
  openEhrConfig: { archetype: openEHR-EHR-OBSERVATION.blood_pressure.v2 }
  fhirConfig: { structureDefinition: http://hl7.org/fhir/StructureDefinition/Observation }
mappings:
  - name: systolic
    with:
      fhir: $fhirResource.valueQuantity
      openehr: $openEhrArchetype.blood_pressure.any_event.systolic
"#;
        let helpers = expand(
            model,
            r#"{"vitals/blood_pressure:0/any_event:0/systolic|magnitude": 120,
                "vitals/blood_pressure:0/any_event:1/systolic|magnitude": 118}"#,
        )
        .expect("expanded");
        assert_eq!(helpers.len(), 1);
        let helper = &helpers[0];
        assert_eq!(helper.fhir_path, "Observation.valueQuantity");
        assert_eq!(helper.openehr_path, "vitals/blood_pressure/any_event/systolic");
        assert_eq!(helper.value_kind, "DV_QUANTITY");
        assert_eq!(helper.forcing(), Some("Quantity"));
        assert_eq!(helper.data.len(), 2);
        assert_eq!(helper.data[1].index, 1);
    }

    #[test]
    fn followed_by_rules_inherit_parent_paths() {
        let model = r#"
type: model
spec:
  openEhrConfig: { archetype: openEHR-EHR-OBSERVATION.blood_pressure.v2 }
  fhirConfig: { structureDefinition: http://hl7.org/fhir/StructureDefinition/Observation }
mappings:
  - name: position
    with:
      fhir: $fhirResource.bodySite
      openehr: $openEhrArchetype.blood_pressure.any_event.position
      type: NONE
    followedBy:
      mappings:
        - name: code
          with: { fhir: coding.code, openehr: "|code", type: STRING }
"#;
        let helpers = expand(
            model,
            r#"{"vitals/blood_pressure:0/any_event:0/position|code": "at1001"}"#,
        )
        .expect("expanded");
        assert_eq!(helpers.len(), 1);
        let child = &helpers[0];
        assert!(child.followed_by);
        assert_eq!(child.fhir_path, "Observation.bodySite.coding.code");
        assert_eq!(child.openehr_path, "vitals/blood_pressure/any_event/position|code");
        assert_eq!(child.parent_fhir.as_deref(), Some("Observation.bodySite"));
        assert_eq!(child.data.len(), 1);
    }

    #[test]
    fn literals_need_no_record_data() {
        let model = r#"
type: model
spec:
  openEhrConfig: { archetype: openEHR-EHR-OBSERVATION.blood_pressure.v2 }
  fhirConfig: { structureDefinition: http://hl7.org/fhir/StructureDefinition/Observation }
mappings:
  - name: status
    with: { fhir: $fhirResource.status, value: final }
  - name: hidden
    with: { fhir: $fhirResource.issued, openehr: $openEhrArchetype.x }
    unidirectional: fhir->openehr
"#;
        let helpers = expand(model, "{}").expect("expanded");
        assert_eq!(helpers.len(), 1);
        assert!(helpers[0].data[0].is_literal());
    }

    #[test]
    fn slot_cycles_are_reported() {
        let model = r#"
type: model
spec:
  openEhrConfig: { archetype: openEHR-EHR-OBSERVATION.blood_pressure.v2 }
  fhirConfig: { structureDefinition: http://hl7.org/fhir/StructureDefinition/Observation }
mappings:
  - name: self
    with: { fhir: $fhirResource.component, openehr: $openEhrArchetype.blood_pressure }
    slotArchetype: openEHR-EHR-OBSERVATION.blood_pressure.v2
"#;
        let err = expand(model, "{}").expect_err("cycle");
        let BridgeError::RecursiveMapping { chain } = err else {
            panic!("expected a recursion error");
        };
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0], chain[1]);
    }
}
