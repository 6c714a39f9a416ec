//! openEHR boundary support for the bridge.
//!
//! This crate owns the record side of the mapping:
//! - [`FlatRecord`]: the flat key/value composition format keyed by
//!   `/`-delimited paths with `:n` indices and `|attr` suffixes
//! - [`WebTemplate`]: the template node tree used to complete mapping paths
//!   and to infer openEHR data value types
//! - RM data value type names and the mapping type vocabulary
//!
//! Mapping semantics live in `bridge-core`. This crate handles formats and
//! template lookups only.

pub mod flat;
pub mod rm;
pub mod web_template;

pub use flat::FlatRecord;
pub use rm::possible_rm_types;
pub use web_template::{ResolvedPath, TemplateCatalog, WebTemplate, WebTemplateNode};

use thiserror::Error;

/// Errors returned by the `openehr` boundary crate.
#[derive(Debug, Error)]
pub enum OpenehrError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("translation error: {0}")]
    Translation(String),
}

/// Type alias for Results that can fail with an [`OpenehrError`].
pub type OpenehrResult<T> = Result<T, OpenehrError>;

/// Formats a `serde_path_to_error` failure as a schema mismatch message.
pub(crate) fn schema_mismatch(
    what: &str,
    err: serde_path_to_error::Error<serde_json::Error>,
) -> OpenehrError {
    let path = err.path().to_string();
    let source = err.into_inner();
    let path = if path.is_empty() {
        "<root>"
    } else {
        path.as_str()
    };
    OpenehrError::Translation(format!("{what} schema mismatch at {path}: {source}"))
}
