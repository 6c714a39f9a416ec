//! FHIR R4 type registry.
//!
//! Responsibilities:
//! - Answer structural questions about FHIR types by name: which fields a
//!   type has, whether a field repeats, which types a choice field accepts
//!   and which resources a `Reference` field may point at.
//! - Resolve inheritance (`Age` is a `Quantity`, every resource is a
//!   `Resource`).
//!
//! Notes:
//! - The R4 subset is embedded from `r4_types.yaml` and parsed once per
//!   process. The engines only see the [`TypeDescriptor`] trait, so tests can
//!   substitute a smaller registry built with [`R4Registry::from_yaml`].

use crate::{FhirError, FhirResult};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::HashMap;

const R4_TYPES: &str = include_str!("r4_types.yaml");

static R4: Lazy<Result<R4Registry, String>> =
    Lazy::new(|| R4Registry::from_yaml(R4_TYPES).map_err(|e| e.to_string()));

/// Returns the process-wide R4 registry.
pub fn r4() -> FhirResult<&'static R4Registry> {
    R4.as_ref().map_err(|e| FhirError::Registry(e.clone()))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeKind {
    Primitive,
    Complex,
    Backbone,
    Resource,
}

/// Structural description of one field of a FHIR type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    /// Allowed types in declaration order. More than one means a choice field.
    pub types: Vec<String>,
    pub repeating: bool,
    /// Resource types a `Reference` alternative may target.
    pub targets: Vec<String>,
}

impl FieldInfo {
    pub fn is_choice(&self) -> bool {
        self.types.len() > 1
    }

    /// JSON property name for a value of `type_name` stored in this field.
    pub fn json_name(&self, type_name: &str) -> String {
        if self.is_choice() {
            format!("{}{}", self.name, upper_first(type_name))
        } else {
            self.name.clone()
        }
    }
}

/// Structural lookups the mapping engines need from a FHIR model.
pub trait TypeDescriptor: Send + Sync {
    /// Field `field` of `type_name`, inherited fields included.
    fn field(&self, type_name: &str, field: &str) -> Option<&FieldInfo>;

    /// All fields of `type_name`, inherited ones first.
    fn fields(&self, type_name: &str) -> Vec<&FieldInfo>;

    fn kind(&self, type_name: &str) -> Option<TypeKind>;

    /// True when `type_name` is `ancestor` or derives from it.
    fn is_a(&self, type_name: &str, ancestor: &str) -> bool;

    /// Maps loose spellings (`Boolean`, `DateTimeType`, `FHIR.string`) to the
    /// registered type name.
    fn canonical_name(&self, name: &str) -> Option<String>;

    fn is_resource(&self, type_name: &str) -> bool {
        self.kind(type_name) == Some(TypeKind::Resource)
    }

    fn is_primitive(&self, type_name: &str) -> bool {
        self.kind(type_name) == Some(TypeKind::Primitive)
    }

    /// Resolves a typed choice property such as `valueQuantity` to the
    /// choice field and the concrete type it selects.
    fn choice_field(&self, type_name: &str, key: &str) -> Option<(&FieldInfo, String)> {
        self.fields(type_name)
            .into_iter()
            .filter(|f| f.is_choice() && key.len() > f.name.len() && key.starts_with(&f.name))
            .find_map(|f| {
                let suffix = &key[f.name.len()..];
                f.types
                    .iter()
                    .find(|t| upper_first(t) == suffix)
                    .map(|t| (f, t.clone()))
            })
    }
}

pub(crate) fn upper_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn lower_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

// ============================================================================
// Registry file
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistryFile {
    types: IndexMap<String, TypeEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TypeEntry {
    kind: TypeKind,
    #[serde(default)]
    base: Option<String>,
    #[serde(default)]
    fields: IndexMap<String, String>,
}

#[derive(Debug)]
struct TypeDef {
    kind: TypeKind,
    base: Option<String>,
    fields: IndexMap<String, FieldInfo>,
}

/// Registry of FHIR types parsed from the compact YAML notation.
#[derive(Debug)]
pub struct R4Registry {
    types: HashMap<String, TypeDef>,
}

impl R4Registry {
    /// Parses and validates a registry document.
    pub fn from_yaml(text: &str) -> FhirResult<Self> {
        let de = serde_yaml::Deserializer::from_str(text);
        let file: RegistryFile = serde_path_to_error::deserialize(de).map_err(|e| {
            let path = e.path().to_string();
            let path = if path.is_empty() { "<root>" } else { path.as_str() };
            FhirError::Registry(format!(
                "registry schema mismatch at {}: {}",
                path,
                e.inner()
            ))
        })?;

        let mut types = HashMap::with_capacity(file.types.len());
        for (name, entry) in file.types {
            let mut fields = IndexMap::with_capacity(entry.fields.len());
            for (field, spec) in entry.fields {
                let info = parse_field_spec(&field, &spec).ok_or_else(|| {
                    FhirError::Registry(format!("{name}.{field}: bad field spec `{spec}`"))
                })?;
                fields.insert(field, info);
            }
            types.insert(
                name,
                TypeDef {
                    kind: entry.kind,
                    base: entry.base,
                    fields,
                },
            );
        }

        let registry = Self { types };
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> FhirResult<()> {
        for (name, def) in &self.types {
            if let Some(base) = &def.base {
                if !self.types.contains_key(base) {
                    let message = format!("{name} derives from unknown type {base}");
                    return Err(FhirError::Registry(message));
                }
            }
            for field in def.fields.values() {
                for ty in field.types.iter().chain(field.targets.iter()) {
                    if !self.types.contains_key(ty) {
                        return Err(FhirError::Registry(format!(
                            "{name}.{} refers to unknown type {ty}",
                            field.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// The inheritance chain of `type_name`, starting with itself.
    fn chain<'a>(&'a self, type_name: &str) -> Vec<&'a TypeDef> {
        let mut chain = Vec::new();
        let mut current = self.types.get(type_name);
        while let Some(def) = current {
            chain.push(def);
            current = def.base.as_deref().and_then(|b| self.types.get(b));
        }
        chain
    }

    fn base_of(&self, type_name: &str) -> Option<&str> {
        self.types.get(type_name).and_then(|d| d.base.as_deref())
    }
}

impl TypeDescriptor for R4Registry {
    fn field(&self, type_name: &str, field: &str) -> Option<&FieldInfo> {
        self.chain(type_name).into_iter().find_map(|def| def.fields.get(field))
    }

    fn fields(&self, type_name: &str) -> Vec<&FieldInfo> {
        let mut seen = Vec::<&str>::new();
        let mut out = Vec::new();
        for def in self.chain(type_name).into_iter().rev() {
            for field in def.fields.values() {
                if let Some(pos) = seen.iter().position(|n| *n == field.name) {
                    out[pos] = field;
                } else {
                    seen.push(&field.name);
                    out.push(field);
                }
            }
        }
        out
    }

    fn kind(&self, type_name: &str) -> Option<TypeKind> {
        self.types.get(type_name).map(|d| d.kind)
    }

    fn is_a(&self, type_name: &str, ancestor: &str) -> bool {
        let mut current = Some(type_name);
        while let Some(name) = current {
            if name == ancestor {
                return true;
            }
            current = self.base_of(name);
        }
        false
    }

    fn canonical_name(&self, name: &str) -> Option<String> {
        let name = name.trim();
        let name = name.strip_prefix("FHIR.").unwrap_or(name);
        let mut candidates = vec![name.to_owned(), lower_first(name)];
        if let Some(stripped) = name.strip_suffix("Type") {
            candidates.push(stripped.to_owned());
            candidates.push(lower_first(stripped));
        }
        candidates.into_iter().find(|c| self.types.contains_key(c))
    }
}

/// Parses `Type`, `Type*`, `A|B` and `Reference(X|Y)` notations.
fn parse_field_spec(name: &str, spec: &str) -> Option<FieldInfo> {
    let spec = spec.trim();
    let (spec, repeating) = match spec.strip_suffix('*') {
        Some(s) => (s, true),
        None => (spec, false),
    };

    let mut types = Vec::new();
    let mut targets = Vec::new();
    for alternative in split_top_level(spec, '|') {
        let alternative = alternative.trim();
        if alternative.is_empty() {
            return None;
        }
        if let Some(inner) = alternative
            .strip_prefix("Reference(")
            .and_then(|s| s.strip_suffix(')'))
        {
            types.push("Reference".to_owned());
            targets.extend(inner.split('|').map(|t| t.trim().to_owned()));
        } else {
            types.push(alternative.to_owned());
        }
    }

    Some(FieldInfo {
        name: name.to_owned(),
        types,
        repeating,
        targets,
    })
}

fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            c if c == sep && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_registry_loads() {
        let registry = r4().expect("embedded registry should parse");
        assert_eq!(registry.kind("Observation"), Some(TypeKind::Resource));
        assert_eq!(registry.kind("string"), Some(TypeKind::Primitive));
    }

    #[test]
    fn fields_are_inherited_through_the_base_chain() {
        let registry = r4().expect("registry");
        let id = registry.field("Observation", "id").expect("id from Resource");
        assert_eq!(id.types, vec!["id".to_owned()]);
        let ext = registry
            .field("Observation.component", "extension")
            .expect("extension from Element");
        assert!(ext.repeating);
    }

    #[test]
    fn choice_and_reference_notation_is_parsed() {
        let registry = r4().expect("registry");
        let value = registry.field("Observation", "value").expect("value[x]");
        assert!(value.is_choice());
        assert_eq!(value.types[0], "Quantity");
        assert_eq!(value.json_name("Quantity"), "valueQuantity");

        let subject = registry.field("Observation", "subject").expect("subject");
        assert_eq!(subject.types, vec!["Reference".to_owned()]);
        assert!(subject.targets.contains(&"Patient".to_owned()));
    }

    #[test]
    fn choice_property_resolves_to_field_and_type() {
        let registry = r4().expect("registry");
        let (field, ty) = registry
            .choice_field("Observation", "valueCodeableConcept")
            .expect("choice property");
        assert_eq!(field.name, "value");
        assert_eq!(ty, "CodeableConcept");
        assert!(registry.choice_field("Observation", "valueNonsense").is_none());
    }

    #[test]
    fn inheritance_and_canonical_names() {
        let registry = r4().expect("registry");
        assert!(registry.is_a("Age", "Quantity"));
        assert!(registry.is_a("Patient", "Resource"));
        assert!(!registry.is_a("Quantity", "Age"));
        assert_eq!(registry.canonical_name("Boolean").as_deref(), Some("boolean"));
        assert_eq!(registry.canonical_name("DateTimeType").as_deref(), Some("dateTime"));
        assert_eq!(registry.canonical_name("FHIR.Quantity").as_deref(), Some("Quantity"));
        assert_eq!(registry.canonical_name("Nope"), None);
    }

    #[test]
    fn unknown_field_types_are_rejected() {
        let yaml = r#"
types:
  Element:
    kind: complex
    fields:
      thing: Missing
"#;
        let err = R4Registry::from_yaml(yaml).expect_err("should reject unknown type");
        match err {
            FhirError::Registry(msg) => assert!(msg.contains("Missing")),
            other => panic!("expected Registry, got {other:?}"),
        }
    }

    #[test]
    fn unknown_keys_report_their_path() {
        let yaml = r#"
types:
  Element:
    kind: complex
    colour: blue
"#;
        let err = R4Registry::from_yaml(yaml).expect_err("should reject unknown key");
        match err {
            FhirError::Registry(msg) => assert!(msg.contains("types.Element")),
            other => panic!("expected Registry, got {other:?}"),
        }
    }
}
