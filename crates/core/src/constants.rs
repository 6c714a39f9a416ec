//! Constants used throughout the bridge core crate.
//!
//! Placeholder tokens are the markers mapping authors write inside rule
//! paths; the engines substitute them while preparing rules.

/// Replaced by the concept's declared resource type.
pub const FHIR_RESOURCE: &str = "$fhirResource";

/// Stands for "the object currently in scope" inside nested rules.
pub const FHIR_ROOT: &str = "$fhirRoot";

/// Replaced by the template root or the enclosing record path.
pub const OPENEHR_ARCHETYPE: &str = "$openEhrArchetype";

/// Marks record-side context rules, which the engines skip.
pub const OPENEHR_CONTEXT: &str = "$openEhrContext";

/// Marks a rule whose children describe a referenced resource.
pub const REFERENCE: &str = "$reference";

/// Repeating segment marker in record paths.
pub const RECURRING: &str = "[n]";

pub const RESOLVE: &str = "resolve()";
pub const WHERE: &str = "where";
pub const THIS: &str = "$this";

pub const OPERATOR_ONE_OF: &str = "one of";
pub const OPERATOR_EMPTY: &str = "empty";
pub const OPERATOR_NOT_EMPTY: &str = "not empty";

pub const LOINC_SYSTEM: &str = "http://loinc.org";
pub const SNOMED_SYSTEM: &str = "http://snomed.info/sct";

/// Prefix stripped from a concept's structure definition URL to obtain the
/// resource type.
pub const STRUCTURE_DEFINITION_PREFIX: &str = "http://hl7.org/fhir/StructureDefinition/";

/// Default directory searched for mapping YAML files.
pub const DEFAULT_MAPPING_DIR: &str = "mappings";

/// Default directory searched for web template JSON files.
pub const DEFAULT_TEMPLATE_DIR: &str = "templates";

pub const DEFAULT_LANGUAGE: &str = "en";
pub const DEFAULT_TERRITORY: &str = "DE";
pub const DEFAULT_REST_ADDR: &str = "0.0.0.0:3000";

/// Record path formats.
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";
