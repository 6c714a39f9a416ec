//! Validated identifiers shared by the mapping crates.

use serde::{Deserialize, Serialize};

/// Rejection reasons for identifier construction.
#[derive(Debug, thiserror::Error)]
pub enum TextError {
    #[error("identifier is blank")]
    Empty,
}

/// Trimmed text with at least one non-whitespace character.
///
/// Mapping names and archetype ids in mapping documents are carried as
/// `NonEmptyText`, so a blank `name:` fails when the document is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NonEmptyText(String);

impl NonEmptyText {
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        match input.as_ref().trim() {
            "" => Err(TextError::Empty),
            text => Ok(Self(text.to_owned())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NonEmptyText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for NonEmptyText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<NonEmptyText> for String {
    fn from(value: NonEmptyText) -> Self {
        value.0
    }
}

impl TryFrom<String> for NonEmptyText {
    type Error = TextError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Normalised openEHR template identifier.
///
/// Template ids arrive from mapping context files, web templates and request
/// parameters with inconsistent casing and spacing. Two ids name the same
/// template when they are equal after lowercasing and replacing spaces with
/// underscores, so that is the form stored here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TemplateId(String);

impl TemplateId {
    /// Normalises and validates a template id.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let text = NonEmptyText::new(input)?;
        Ok(Self(text.as_str().to_lowercase().replace(' ', "_")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TemplateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TemplateId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<TemplateId> for String {
    fn from(value: TemplateId) -> Self {
        value.0
    }
}

impl TryFrom<String> for TemplateId {
    type Error = TextError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_empty_text_trims_input() {
        let text = NonEmptyText::new("  Blood pressure  ").expect("non-empty");
        assert_eq!(text.as_str(), "Blood pressure");
    }

    #[test]
    fn non_empty_text_rejects_whitespace() {
        let err = NonEmptyText::new("   ").expect_err("should reject blank input");
        assert!(matches!(err, TextError::Empty));
    }

    #[test]
    fn template_ids_compare_after_normalisation() {
        let a = TemplateId::new("Blood Pressure Template").expect("valid id");
        let b = TemplateId::new("blood_pressure_template").expect("valid id");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "blood_pressure_template");
    }

    #[test]
    fn template_id_deserialises_normalised() {
        let id: TemplateId = serde_json::from_str("\"KDS Diagnose\"").expect("valid json");
        assert_eq!(id.as_str(), "kds_diagnose");
    }
}
