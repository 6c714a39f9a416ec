//! FHIR R4 resource support for the openEHR bridge.
//!
//! This crate provides the resource-side half of the bridge:
//! - an arena-backed [`ResourceGraph`] holding typed FHIR elements
//! - an embedded R4 type registry answering "which fields does type X have"
//! - a path evaluator implementing the FHIRPath subset used by mapping rules
//! - JSON (and YAML) conversion between wire resources and the graph
//!
//! The graph is deliberately untyped at the Rust level. Resource and datatype
//! structure is looked up through the [`TypeDescriptor`] seam so the mapping
//! engines can walk and grow resources by field name.

pub mod graph;
pub mod json;
pub mod path;
pub mod registry;

pub use graph::{format_decimal, Element, NodeId, Primitive, ResourceGraph};
pub use json::{parse_resource, parse_resource_yaml, render_bundle, render_resource, ParsedResource};
pub use path::{FhirPath, PathEvaluator, Value};
pub use registry::{r4, FieldInfo, R4Registry, TypeDescriptor, TypeKind};

/// Errors returned by the `fhir` crate.
#[derive(Debug, thiserror::Error)]
pub enum FhirError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("invalid YAML: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),

    #[error("type registry error: {0}")]
    Registry(String),

    #[error("unknown FHIR type: {0}")]
    UnknownType(String),

    #[error("invalid path expression `{expression}`: {message}")]
    Path { expression: String, message: String },
}

/// Type alias for Results that can fail with a [`FhirError`].
pub type FhirResult<T> = Result<T, FhirError>;
