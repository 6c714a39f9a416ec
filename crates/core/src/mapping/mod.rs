//! Mapping documents: their model, the repository that indexes them and the
//! rewrites applied when nested rules are expanded.

pub mod model;
pub mod prepare;
pub mod repository;

pub use model::{
    Condition, Direction, FhirConfig, FollowedBy, Mapping, MappingContext, MappingDocument,
    Metadata, ModelMapper, ReferenceMapping, With,
};
pub use repository::{LoadReport, MappingRepository, TemplateStore};
