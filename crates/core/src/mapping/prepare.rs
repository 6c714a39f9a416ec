//! Rewrites applied to copies of nested rules before they are expanded.
//!
//! Nested rules (`followedBy`, `reference`, slot models) are written relative
//! to their parent. Before an engine recurses into them their paths are made
//! absolute by prefixing the parent's resource and record paths.

use crate::constants::{FHIR_RESOURCE, FHIR_ROOT, OPENEHR_ARCHETYPE, REFERENCE, RESOLVE};
use crate::mapping::model::{FhirConfig, Mapping, ModelMapper};
use crate::paths::to_record_path;

/// Rules under a `reference` block: their resource paths hop through
/// `resolve()` and their record paths lose the `$reference` marker.
pub fn prepare_referenced(parent_fhir: &str, openehr_path: &str, mappings: &mut [Mapping]) {
    for mapping in mappings.iter_mut() {
        let with = &mut mapping.with;
        with.fhir = Some(match with.fhir.as_deref() {
            Some(fhir) if !fhir.is_empty() => format!("{parent_fhir}.{RESOLVE}.{fhir}"),
            _ => format!("{parent_fhir}.{RESOLVE}"),
        });

        if openehr_path == REFERENCE {
            continue;
        }
        let Some(own) = with.openehr.as_deref() else {
            continue;
        };
        let own = own.replace(OPENEHR_ARCHETYPE, "");
        let rewritten = if openehr_path.starts_with(REFERENCE) {
            let parent = openehr_path
                .replace(&format!("{REFERENCE}/"), "")
                .replace(&format!("{REFERENCE}."), "")
                .replace('/', ".");
            format!("{parent}{own}")
        } else if openehr_path.ends_with(REFERENCE) {
            let parent = openehr_path
                .replace(&format!("/{REFERENCE}"), "")
                .replace(&format!(".{REFERENCE}"), "")
                .replace('/', ".");
            if own.trim().is_empty() {
                parent
            } else {
                format!("{parent}.{own}")
            }
        } else {
            let parent = openehr_path
                .replace(&format!("{REFERENCE}/"), ".")
                .replace(&format!("/{REFERENCE}"), ".")
                .replace(&format!(".{REFERENCE}"), ".")
                .replace(&format!("{REFERENCE}."), ".")
                .replace('/', ".");
            format!("{parent}{own}")
        };
        with.openehr = Some(rewritten);
    }
}

/// `followedBy` rules inherit the parent's resource path, record path and
/// condition root unless they are already absolute.
pub fn prepare_followed_by(
    mappings: &mut [Mapping],
    fhir_path: &str,
    openehr: &str,
    slot_context: &str,
) {
    for mapping in mappings.iter_mut() {
        let with = &mut mapping.with;
        if let Some(fhir) = with.fhir.as_deref() {
            if !fhir.starts_with(FHIR_RESOURCE) {
                with.fhir = Some(format!("{fhir_path}.{fhir}"));
            }
        }

        if let Some(own) = with.openehr.clone() {
            let stripped = |s: &str| {
                s.replace(&format!("{OPENEHR_ARCHETYPE}."), "")
                    .replace(OPENEHR_ARCHETYPE, "")
            };
            let rewritten = if own == OPENEHR_ARCHETYPE {
                openehr.to_owned()
            } else if own.starts_with(OPENEHR_ARCHETYPE) {
                to_record_path(&own, slot_context)
            } else if let Some(rest) = own.strip_prefix(REFERENCE) {
                let middle = if openehr.is_empty() {
                    String::new()
                } else if rest.is_empty() {
                    format!("/{openehr}")
                } else {
                    format!("/{openehr}/")
                };
                format!("{REFERENCE}{middle}{}", stripped(rest))
            } else {
                let delimiter = if own.starts_with('|') { "" } else { "/" };
                format!("{openehr}{delimiter}{}", stripped(&own))
            };
            with.openehr = Some(rewritten);
        }

        if let Some(condition) = mapping.fhir_condition.as_mut() {
            if !condition.target_root.starts_with(FHIR_RESOURCE) {
                condition.target_root = format!("{fhir_path}.{}", condition.target_root);
            }
        }
    }
}

/// Record-side counterpart of [`prepare_followed_by`] for the
/// resource-to-record direction, where resource paths stay relative to the
/// element the parent rule selected.
///
/// `openehr` is the parent's record path, `root` the path
/// `$openEhrArchetype` stands for.
pub fn prepare_followed_by_record(mappings: &mut [Mapping], openehr: &str, root: &str) {
    let parent = openehr.replace(&format!("{REFERENCE}/"), "");
    for mapping in mappings.iter_mut() {
        let Some(own) = mapping.with.openehr.as_deref() else {
            continue;
        };
        let rewritten = if own == OPENEHR_ARCHETYPE {
            openehr.to_owned()
        } else if own.starts_with(OPENEHR_ARCHETYPE) {
            own.replace(&format!("{REFERENCE}."), "")
                .replace(&format!("{OPENEHR_ARCHETYPE}."), &format!("{root}."))
                .replace(OPENEHR_ARCHETYPE, root)
        } else {
            let delimiter = if own.starts_with('|') { "" } else { "/" };
            let own = own
                .replace(&format!("{OPENEHR_ARCHETYPE}."), "")
                .replace(OPENEHR_ARCHETYPE, "");
            format!("{parent}{delimiter}{own}")
        };
        mapping.with.openehr = Some(rewritten);
    }
}

/// Prepares a copy of a slot model for expansion under `parent`.
///
/// The slot takes over the parent's resource and limiting criteria. `$fhirRoot`
/// and `$openEhrArchetype` in its rules point at the slot's position in the
/// parent. With `fhir_prefix` unset the resource paths stay relative, which
/// is what the resource-to-record direction needs, and rules without a
/// record path take the slot's own.
pub fn forward_slot(
    slot: &mut ModelMapper,
    parent: &ModelMapper,
    fhir_path: &str,
    openehr_path: &str,
    fhir_prefix: bool,
) {
    if let Some(config) = parent.fhir_config.as_ref() {
        slot.fhir_config = Some(FhirConfig {
            structure_definition: config.structure_definition.clone(),
            multiple: false,
            condition: config.condition.clone(),
        });
    }
    let dotted = openehr_path.replace('/', ".");
    for mapping in slot.mappings.iter_mut() {
        if let Some(fhir) = mapping.with.fhir.as_deref() {
            mapping.with.fhir = Some(forward_fhir(fhir, fhir_path, fhir_prefix));
        }

        mapping.with.openehr = match mapping.with.openehr.as_deref() {
            None if fhir_prefix => None,
            None => Some(openehr_path.to_owned()),
            Some(own) if own == OPENEHR_ARCHETYPE => Some(dotted.clone()),
            Some(own) if own.starts_with(OPENEHR_ARCHETYPE) => {
                Some(own.replace(OPENEHR_ARCHETYPE, &dotted))
            }
            Some(own) if own.starts_with(REFERENCE) => Some(format!("{own}.{dotted}")),
            Some(own) if own.trim().is_empty() => Some(dotted.clone()),
            Some(own) => Some(format!("{dotted}.{own}")),
        };

        if let Some(condition) = mapping.fhir_condition.as_mut() {
            condition.target_root = forward_fhir(&condition.target_root, fhir_path, fhir_prefix);
        }
    }
}

fn forward_fhir(path: &str, fhir_path: &str, fhir_prefix: bool) -> String {
    if path == FHIR_ROOT {
        return if fhir_prefix { fhir_path.to_owned() } else { String::new() };
    }
    if !path.starts_with(FHIR_ROOT) {
        return path.to_owned();
    }
    let replaced = path.replace(FHIR_ROOT, if fhir_prefix { fhir_path } else { "" });
    match replaced.strip_prefix('.') {
        Some(rest) if !fhir_prefix => rest.to_owned(),
        _ => replaced,
    }
}
