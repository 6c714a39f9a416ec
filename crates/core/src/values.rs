//! Typed values moved between the two formats.
//!
//! The record side speaks openEHR RM type names (`DV_QUANTITY`), rules speak
//! a small mapping vocabulary (`QUANTITY`, `CODEABLECONCEPT`) and the
//! resource side speaks FHIR type names. The tables here translate between
//! the three.

use openehr::rm;

/// Numeric payload read from a record. Integers stay integers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Integer(i64),
    Decimal(f64),
}

impl Number {
    /// Parses an integer first, then a decimal.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        text.parse::<i64>()
            .map(Number::Integer)
            .ok()
            .or_else(|| text.parse::<f64>().ok().map(Number::Decimal))
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Number::Integer(i) => i as f64,
            Number::Decimal(d) => d,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Number::Integer(i) => i,
            Number::Decimal(d) => d as i64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodingValue {
    pub system: Option<String>,
    pub code: Option<String>,
    pub display: Option<String>,
}

/// One value extracted from a flat record, ready to be written into a
/// resource element.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Quantity {
        value: Option<Number>,
        unit: Option<String>,
        system: Option<String>,
        code: Option<String>,
    },
    DateTime(String),
    Date(String),
    Time(String),
    Boolean(bool),
    CodeableConcept {
        text: Option<String>,
        coding: CodingValue,
    },
    Coding(CodingValue),
    Attachment {
        content_type: Option<String>,
        size: Option<i64>,
        url: Option<String>,
        data: Option<String>,
    },
    Identifier(String),
    Text(String),
}

impl DataValue {
    /// FHIR type the value naturally becomes when nothing else constrains it.
    pub fn fhir_type(&self) -> &'static str {
        match self {
            DataValue::Quantity { .. } => "Quantity",
            DataValue::DateTime(_) => "dateTime",
            DataValue::Date(_) => "date",
            DataValue::Time(_) => "time",
            DataValue::Boolean(_) => "boolean",
            DataValue::CodeableConcept { .. } => "CodeableConcept",
            DataValue::Coding(_) => "Coding",
            DataValue::Attachment { .. } => "Attachment",
            DataValue::Identifier(_) => "Identifier",
            DataValue::Text(_) => "string",
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            DataValue::Quantity { .. } => "quantity",
            DataValue::DateTime(_) => "date-time",
            DataValue::Date(_) => "date",
            DataValue::Time(_) => "time",
            DataValue::Boolean(_) => "boolean",
            DataValue::CodeableConcept { .. } => "codeable concept",
            DataValue::Coding(_) => "coding",
            DataValue::Attachment { .. } => "attachment",
            DataValue::Identifier(_) => "identifier",
            DataValue::Text(_) => "text",
        }
    }
}

/// Mapping vocabulary names.
pub mod kind {
    pub const QUANTITY: &str = "QUANTITY";
    pub const PROPORTION: &str = "PROPORTION";
    pub const DATETIME: &str = "DATETIME";
    pub const DATE: &str = "DATE";
    pub const TIME: &str = "TIME";
    pub const CODEABLECONCEPT: &str = "CODEABLECONCEPT";
    pub const CODING: &str = "CODING";
    pub const STRING: &str = "STRING";
    pub const BOOL: &str = "BOOL";
    pub const IDENTIFIER: &str = "IDENTIFIER";
    pub const MEDIA: &str = "MEDIA";
    pub const NONE: &str = "NONE";
}

/// Normalises a template RM type to the mapping vocabulary. Names already in
/// the vocabulary (and unknown ones) pass through.
pub fn data_kind(rm_type: &str) -> &str {
    match rm_type {
        rm::DV_QUANTITY | rm::DV_COUNT | rm::DV_ORDINAL => kind::QUANTITY,
        rm::DV_PROPORTION => kind::PROPORTION,
        rm::DV_DATE_TIME => kind::DATETIME,
        rm::DV_DATE => kind::DATE,
        rm::DV_TIME => kind::TIME,
        rm::DV_CODED_TEXT => kind::CODEABLECONCEPT,
        rm::CODE_PHRASE => kind::CODING,
        rm::DV_TEXT => kind::STRING,
        rm::DV_BOOL => kind::BOOL,
        rm::DV_IDENTIFIER => kind::IDENTIFIER,
        rm::DV_MULTIMEDIA => kind::MEDIA,
        other => other,
    }
}

/// FHIR type a rule of the given kind forces onto choice fields.
pub fn forcing_type(kind: &str) -> Option<&'static str> {
    match data_kind(kind) {
        kind::QUANTITY | kind::PROPORTION => Some("Quantity"),
        kind::DATETIME => Some("dateTime"),
        kind::DATE => Some("date"),
        kind::TIME => Some("time"),
        kind::CODEABLECONCEPT => Some("CodeableConcept"),
        kind::CODING => Some("Coding"),
        kind::STRING => Some("string"),
        kind::BOOL => Some("boolean"),
        kind::IDENTIFIER => Some("Identifier"),
        kind::MEDIA => Some("Attachment"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_keep_integers() {
        assert_eq!(Number::parse("120"), Some(Number::Integer(120)));
        assert_eq!(Number::parse("37.5"), Some(Number::Decimal(37.5)));
        assert_eq!(Number::parse(" "), None);
        assert_eq!(Number::parse("abc"), None);
    }

    #[test]
    fn rm_types_normalise_to_kinds() {
        assert_eq!(data_kind("DV_ORDINAL"), kind::QUANTITY);
        assert_eq!(data_kind("DV_CODED_TEXT"), kind::CODEABLECONCEPT);
        assert_eq!(data_kind("QUANTITY"), kind::QUANTITY);
        assert_eq!(data_kind("DV_EHR_URI"), "DV_EHR_URI");
    }

    #[test]
    fn kinds_force_fhir_types() {
        assert_eq!(forcing_type("PROPORTION"), Some("Quantity"));
        assert_eq!(forcing_type("DV_DATE_TIME"), Some("dateTime"));
        assert_eq!(forcing_type("NONE"), None);
    }
}
