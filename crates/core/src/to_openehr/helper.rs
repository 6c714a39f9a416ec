//! Rule trees for the resource-to-record direction.
//!
//! Every rule of a concept model becomes an [`Extraction`]: a resource path
//! evaluated against the resource (or against the element its parent
//! selected) and the record path the results are written to. `followedBy`,
//! `reference` and slot rules are inlined as children or siblings.

use crate::constants::{FHIR_RESOURCE, OPENEHR_CONTEXT, RECURRING, REFERENCE};
use crate::error::{BridgeError, BridgeResult};
use crate::mapping::prepare::{forward_slot, prepare_followed_by_record, prepare_referenced};
use crate::mapping::{Condition, Direction, FhirConfig, Mapping, MappingRepository, ModelMapper};
use crate::paths::{
    amend_fhir_path, child_starts_with_parent, ends_with_rm_attribute, fhir_path_with_conditions,
    replace_last, replace_pattern, to_record_path,
};
use bridge_types::TemplateId;
use openehr::{possible_rm_types, rm, TemplateCatalog};

/// One value to carry from a resource into the record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Extraction {
    /// Concept archetype the rule belongs to.
    pub archetype: String,
    /// Expression selecting, from the bundle, the resources this rule reads.
    pub limiting_criteria: String,
    /// Path relative to the resource, or to the parent's selected element.
    pub fhir_path: String,
    pub openehr_path: String,
    /// Declared type first, then the type resolved from the template.
    pub rm_type: Option<String>,
    /// Fixed value written instead of whatever the path selects.
    pub literal: Option<String>,
    pub multiple: bool,
    pub children: Vec<Extraction>,
}

impl Extraction {
    fn writes(&self) -> bool {
        !matches!(self.rm_type.as_deref(), Some(rm::TYPE_NONE) | Some(rm::TYPE_DOSAGE))
    }
}

/// Builds extraction trees for concept models of one template.
pub struct Planner<'a> {
    pub repository: &'a MappingRepository,
    pub template: &'a TemplateId,
    pub catalog: &'a dyn TemplateCatalog,
}

/// Where a rule list is being expanded.
struct Frame<'m> {
    archetype: &'m str,
    config: &'m FhirConfig,
    /// Record path `$openEhrArchetype` stands for.
    root: String,
    parent_condition: Option<Condition>,
    multiple: bool,
}

impl Planner<'_> {
    /// Extractions of a concept model. Rules reading another resource than
    /// the model's own come last.
    pub fn plan(&self, mapper: &ModelMapper) -> BridgeResult<Vec<Extraction>> {
        let Some(config) = mapper.fhir_config.as_ref() else {
            return Ok(Vec::new());
        };
        let frame = Frame {
            archetype: mapper.archetype.as_str(),
            config,
            root: self.catalog.root_id().to_owned(),
            parent_condition: None,
            multiple: config.multiple,
        };
        let mut own = Vec::new();
        let mut cover = Vec::new();
        let mut chain = vec![mapper.archetype.as_str().to_owned()];
        self.expand(&frame, mapper, mapper.mappings.clone(), &mut own, &mut cover, &mut chain)?;
        own.extend(cover);
        Ok(own)
    }

    fn expand(
        &self,
        frame: &Frame<'_>,
        mapper: &ModelMapper,
        mappings: Vec<Mapping>,
        own: &mut Vec<Extraction>,
        cover: &mut Vec<Extraction>,
        chain: &mut Vec<String>,
    ) -> BridgeResult<()> {
        let resource = frame.config.resource();

        for mapping in mappings {
            if !mapping.applies_to(Direction::ToOpenehr) {
                continue;
            }
            let Some(declared) = mapping.with.openehr.clone() else {
                tracing::debug!(rule = %mapping.name(), "rule without record path, skipping");
                continue;
            };
            if declared.starts_with(OPENEHR_CONTEXT) {
                continue;
            }

            let condition = frame
                .parent_condition
                .clone()
                .or_else(|| mapping.fhir_condition.clone());
            let fhir_path = match mapping.with.fhir.as_deref() {
                Some(fhir) => conditioned_fhir_path(fhir, condition.as_ref(), resource),
                None => String::new(),
            };
            let covering = fhir_path.starts_with(|c: char| c.is_ascii_uppercase())
                && !fhir_path.starts_with(resource);

            if declared.contains(REFERENCE) {
                if let Some(reference) = mapping.reference.as_ref() {
                    let mut referenced = reference.mappings.clone();
                    prepare_referenced(&fhir_path, &declared, &mut referenced);
                    self.expand(frame, mapper, referenced, own, cover, chain)?;
                    continue;
                }
            }

            let mut openehr = to_record_path(&declared, &frame.root);
            let mut extraction = Extraction {
                archetype: frame.archetype.to_owned(),
                limiting_criteria: limiting_criteria(frame.config),
                fhir_path: fhir_path.clone(),
                literal: mapping.with.value.clone(),
                multiple: frame.multiple,
                ..Extraction::default()
            };
            match mapping.with.kind.as_deref() {
                Some(kind) => extraction.rm_type = Some(kind.to_owned()),
                None => {
                    if let Some(attribute) = ends_with_rm_attribute(&openehr) {
                        if openehr.ends_with(&format!("/{attribute}")) {
                            openehr = replace_last(&openehr, "/", "|");
                        }
                    }
                }
            }
            extraction.openehr_path = openehr.replace(&format!("{REFERENCE}/"), "");
            let mut keep = extraction.writes();

            if let Some(followed_by) = mapping.followed_by.as_ref() {
                let mut nested = followed_by.mappings.clone();
                prepare_followed_by_record(&mut nested, &openehr, &frame.root);
                let inner = Frame {
                    parent_condition: None,
                    root: frame.root.clone(),
                    ..*frame
                };
                self.expand(&inner, mapper, nested, &mut extraction.children, cover, chain)?;
                keep = true;
            }

            if let Some(slot_archetype) = mapping.slot_archetype.as_deref() {
                if chain.iter().any(|seen| seen == slot_archetype) {
                    let mut cycle = chain.clone();
                    cycle.push(slot_archetype.to_owned());
                    return Err(BridgeError::RecursiveMapping { chain: cycle });
                }
                let slots = self.repository.slot_mappers_for(self.template, slot_archetype);
                if slots.is_empty() {
                    tracing::warn!(slot = %slot_archetype, "no slot models for archetype");
                }
                let slot_root = openehr.replace(&format!("/{REFERENCE}"), "");
                chain.push(slot_archetype.to_owned());
                for mut slot in slots {
                    forward_slot(&mut slot, mapper, &fhir_path, &slot_root, false);
                    let Some(config) = slot.fhir_config.clone() else {
                        continue;
                    };
                    let inner = Frame {
                        archetype: frame.archetype,
                        config: &config,
                        root: slot_root.clone(),
                        parent_condition: None,
                        multiple: frame.multiple,
                    };
                    let mappings = slot.mappings.clone();
                    self.expand(&inner, &slot, mappings, &mut extraction.children, cover, chain)?;
                }
                chain.pop();
                keep = true;
            }

            if !keep {
                continue;
            }
            focus_limiting_criteria(resource, &mut extraction);
            if covering {
                cover.push(extraction);
            } else {
                own.push(extraction);
            }
        }
        Ok(())
    }
}

/// Resource path of a rule with its condition folded in. A condition on a
/// sibling branch (`component.code` for `component.value`) filters the
/// common prefix; one extending the rule path narrows to its target root.
fn conditioned_fhir_path(fhir: &str, condition: Option<&Condition>, resource: &str) -> String {
    let base = amend_fhir_path(fhir, &[], resource);
    let Some(condition) = condition.filter(|c| c.target_attribute.is_some()) else {
        return base;
    };
    let root = condition.target_root.replace(FHIR_RESOURCE, resource);
    if root.starts_with(&base) && root != base {
        amend_fhir_path(fhir, &[condition], resource)
    } else {
        fhir_path_with_conditions(&base, Some(condition), resource, None)
    }
}

/// Expression selecting the model's resources from a bundle.
pub fn limiting_criteria(config: &FhirConfig) -> String {
    let resource = config.resource();
    let of_type = format!("Bundle.entry.resource.ofType({resource})");
    if config.condition.is_empty() {
        return of_type;
    }
    let conditions: Vec<&Condition> = config.condition.iter().collect();
    let amended = amend_fhir_path(FHIR_RESOURCE, &conditions, resource);
    match amended.strip_prefix(&format!("{resource}.")) {
        Some(filter) => format!("{of_type}.where({filter})"),
        None if amended == resource => of_type,
        None => amended,
    }
}

/// Rules that read another resource type select that type instead.
fn focus_limiting_criteria(resource: &str, extraction: &mut Extraction) {
    let path = &extraction.fhir_path;
    if path.is_empty()
        || path.starts_with(resource)
        || !path.starts_with(|c: char| c.is_ascii_uppercase())
    {
        return;
    }
    let other = path.split('.').next().unwrap_or_default();
    extraction.limiting_criteria = extraction.limiting_criteria.replace(resource, other);
}

/// Completes record paths against the template: occurrence markers are
/// added, types resolved, and rules the template does not know are muted.
pub fn fix_occurrences(extractions: &mut [Extraction], catalog: &dyn TemplateCatalog) {
    for extraction in extractions.iter_mut() {
        let declared = extraction.rm_type.clone();
        let forced = declared.as_deref().map(possible_rm_types);
        let resolved = catalog.resolve(&extraction.openehr_path, forced.as_deref());
        if !resolved.complete {
            tracing::debug!(
                path = %extraction.openehr_path,
                "record path not fully known to the template"
            );
        }
        extraction.openehr_path = resolved.path;
        if declared.as_deref() != Some(rm::TYPE_NONE) {
            extraction.rm_type = resolved.rm_type;
        }
        fix_occurrences(&mut extraction.children, catalog);
    }
}

/// Gives `extraction` and its descendants the concrete indices of `fixed`
/// wherever their paths descend from `parent`.
pub fn fix_child_occurrences(extraction: &mut Extraction, parent: &str, fixed: &str) {
    if child_starts_with_parent(&extraction.openehr_path, parent) {
        extraction.openehr_path = replace_pattern(&extraction.openehr_path, fixed);
    }
    for child in extraction.children.iter_mut() {
        fix_child_occurrences(child, parent, fixed);
    }
}

/// First occurrence marker replaced by the resource ordinal.
pub fn with_ordinal(path: &str, ordinal: usize) -> String {
    path.replacen(RECURRING, &format!(":{ordinal}"), 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingDocument;
    use openehr::WebTemplate;

    const TEMPLATE: &str = r#"{
        "templateId": "vitals",
        "tree": {
            "id": "vitals",
            "rmType": "COMPOSITION",
            "children": [{
                "id": "blood_pressure",
                "rmType": "OBSERVATION",
                "max": -1,
                "children": [{
                    "id": "any_event",
                    "rmType": "EVENT",
                    "max": -1,
                    "children": [
                        { "id": "systolic", "rmType": "DV_QUANTITY" },
                        { "id": "position", "rmType": "DV_CODED_TEXT" }
                    ]
                }]
            }]
        }
    }"#;

    const CONTEXT: &str = r#"
type: context
context:
  profile: { url: http://hl7.org/fhir/StructureDefinition/Bundle }
  template: { id: vitals }
  archetypes: [openEHR-EHR-OBSERVATION.blood_pressure.v2]
"#;

    fn plan(model: &str) -> BridgeResult<Vec<Extraction>> {
        let mut repository = MappingRepository::new();
        repository.add(MappingDocument::from_yaml(CONTEXT)?);
        repository.add(MappingDocument::from_yaml(model)?);
        let template = TemplateId::new("vitals").expect("id");
        let catalog = WebTemplate::from_json(TEMPLATE).expect("template");
        let mapper = repository
            .mappers_for(&template, "openEHR-EHR-OBSERVATION.blood_pressure.v2")
            .pop()
            .expect("mapper");
        let mut planned = Planner {
            repository: &repository,
            template: &template,
            catalog: &catalog,
        }
        .plan(&mapper)?;
        fix_occurrences(&mut planned, &catalog);
        Ok(planned)
    }

    #[test]
    fn rules_get_occurrence_markers_and_types() {
        let model = r#"
type: model
spec:
  openEhrConfig: { archetype: openEHR-EHR-OBSERVATION.blood_pressure.v2 }
  fhirConfig:
    structureDefinition: http://hl7.org/fhir/StructureDefinition/Observation
    multiple: true
    condition:
      - targetRoot: $fhirResource.code
        targetAttribute: coding.code
        operator: one of
        criteria: "[$loinc.85354-9]"
mappings:
  - name: systolic
    with:
      fhir: $fhirResource.component.valueQuantity
      openehr: $openEhrArchetype.blood_pressure.any_event.systolic
      type: QUANTITY
"#;
        let planned = plan(model).expect("plan");
        assert_eq!(planned.len(), 1);
        let systolic = &planned[0];
        assert_eq!(systolic.openehr_path, "vitals/blood_pressure[n]/any_event[n]/systolic");
        assert_eq!(systolic.rm_type.as_deref(), Some("DV_QUANTITY"));
        assert_eq!(
            systolic.limiting_criteria,
            concat!(
                "Bundle.entry.resource.ofType(Observation)",
                ".where(code.where(coding.code.toString().contains('85354-9')))"
            )
        );
        assert!(systolic.multiple);
    }

    #[test]
    fn component_conditions_filter_the_shared_prefix() {
        let model = r#"
type: model
spec:
  openEhrConfig: { archetype: openEHR-EHR-OBSERVATION.blood_pressure.v2 }
  fhirConfig: { structureDefinition: http://hl7.org/fhir/StructureDefinition/Observation }
mappings:
  - name: systolic
    with:
      fhir: $fhirResource.component.value
      openehr: $openEhrArchetype.blood_pressure.any_event.systolic
      type: QUANTITY
    fhirCondition:
      targetRoot: $fhirResource.component.code.coding
      targetAttribute: code
      operator: one of
      criteria: "[$loinc.8480-6]"
"#;
        let planned = plan(model).expect("plan");
        assert_eq!(
            planned[0].fhir_path,
            "Observation.component.where(code.coding.code.toString().contains('8480-6')).value"
        );
    }

    #[test]
    fn conditions_below_the_rule_path_narrow_to_their_root() {
        let cond = Condition {
            target_root: "$fhirResource.code.coding".into(),
            target_attribute: Some("code".into()),
            criteria: Some("[$loinc.85354-9]".into()),
            ..Condition::default()
        };
        assert_eq!(
            conditioned_fhir_path("$fhirResource.code", Some(&cond), "Observation"),
            "Observation.code.coding.where(code.toString().contains('85354-9'))"
        );
        assert_eq!(
            conditioned_fhir_path("$fhirResource.$fhirRoot", None, "Observation"),
            "Observation"
        );
    }

    #[test]
    fn followed_by_rules_become_children() {
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
          with: { fhir: coding.code, openehr: code }
        - name: text
          with: { fhir: text, openehr: "|value" }
"#;
        let planned = plan(model).expect("plan");
        let parent = &planned[0];
        assert_eq!(parent.fhir_path, "Observation.bodySite");
        assert_eq!(parent.rm_type.as_deref(), Some("NONE"));
        assert_eq!(parent.children.len(), 2);
        assert_eq!(parent.children[0].fhir_path, "coding.code");
        assert_eq!(
            parent.children[0].openehr_path,
            "vitals/blood_pressure[n]/any_event[n]/position|code"
        );
        assert_eq!(
            parent.children[1].openehr_path,
            "vitals/blood_pressure[n]/any_event[n]/position|value"
        );
    }

    #[test]
    fn unknown_record_paths_are_muted() {
        let model = r#"
type: model
spec:
  openEhrConfig: { archetype: openEHR-EHR-OBSERVATION.blood_pressure.v2 }
  fhirConfig: { structureDefinition: http://hl7.org/fhir/StructureDefinition/Observation }
mappings:
  - name: missing
    with: { fhir: $fhirResource.note.text, openehr: $openEhrArchetype.blood_pressure.comment }
"#;
        let planned = plan(model).expect("plan");
        assert_eq!(planned[0].rm_type.as_deref(), Some(rm::TYPE_NONE));
    }

    #[test]
    fn other_resource_rules_select_their_own_type() {
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
  - name: subject
    with: { fhir: Patient.gender, openehr: $openEhrArchetype.blood_pressure.any_event.position }
"#;
        let planned = plan(model).expect("plan");
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[1].fhir_path, "Patient.gender");
        assert_eq!(planned[1].limiting_criteria, "Bundle.entry.resource.ofType(Patient)");
    }

    #[test]
    fn ordinals_and_child_indices() {
        assert_eq!(
            with_ordinal("v/bp[n]/any_event[n]/systolic", 2),
            "v/bp:2/any_event[n]/systolic"
        );
        let mut extraction = Extraction {
            openehr_path: "v/bp[n]/any_event[n]/position".into(),
            children: vec![Extraction {
                openehr_path: "v/bp[n]/any_event[n]/position|code".into(),
                ..Extraction::default()
            }],
            ..Extraction::default()
        };
        fix_child_occurrences(
            &mut extraction,
            "v/bp[n]/any_event[n]/position",
            "v/bp:1/any_event[n]/position",
        );
        assert_eq!(extraction.openehr_path, "v/bp:1/any_event[n]/position");
        assert_eq!(extraction.children[0].openehr_path, "v/bp:1/any_event[n]/position|code");
    }
}
