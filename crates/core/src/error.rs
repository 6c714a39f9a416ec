use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("failed to read {path}: {source}", path = path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    MappingSchema(String),

    #[error("no mapping context registered for template {0}")]
    UnknownTemplate(String),

    #[error("slot mappings recurse: {}", chain.join(" -> "))]
    RecursiveMapping { chain: Vec<String> },

    #[error("failed to serialise output: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("FHIR error: {0}")]
    Fhir(#[from] fhir::FhirError),

    #[error("openEHR error: {0}")]
    Openehr(#[from] openehr::OpenehrError),
}

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Formats a `serde_path_to_error` failure the same way for every document kind.
pub(crate) fn schema_mismatch<E: std::fmt::Display>(
    what: &str,
    err: serde_path_to_error::Error<E>,
) -> BridgeError {
    let path = err.path().to_string();
    let path = if path.is_empty() { "<root>".to_owned() } else { path };
    BridgeError::MappingSchema(format!("{what} schema mismatch at {path}: {}", err.inner()))
}
