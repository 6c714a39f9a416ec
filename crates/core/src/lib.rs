//! # Bridge Core
//!
//! Bidirectional mapping between openEHR flat compositions and FHIR resources,
//! driven by declarative YAML mapping documents.
//!
//! This crate contains the mapping logic only:
//! - path algebra over both path languages ([`paths`])
//! - condition evaluation and the intermediate object cache
//! - the record to resource and resource to record engines
//! - the mapping model, its repository and the translator facade
//!
//! **No transport concerns**: HTTP handling and command-line parsing live in the
//! `bridge-run` and `bridge-cli` binaries. Resource graphs and the FHIRPath
//! evaluator come from the `fhir` crate; flat records and web templates from
//! the `openehr` crate.

pub mod cache;
pub mod condition;
pub mod config;
pub mod constants;
pub mod constructor;
pub mod error;
pub mod mapping;
pub mod paths;
pub mod populator;
pub mod to_fhir;
pub mod to_openehr;
pub mod translator;
pub mod values;

pub use config::{resolve_mapping_dir, resolve_template_dir, BridgeConfig};
pub use error::{BridgeError, BridgeResult};
pub use mapping::{
    LoadReport, MappingContext, MappingDocument, MappingRepository, ModelMapper, TemplateStore,
};
pub use to_fhir::RecordToResource;
pub use to_openehr::ResourceToRecord;
pub use translator::{infer_template_id, ResourceCollection, TranslationContext, Translator};
