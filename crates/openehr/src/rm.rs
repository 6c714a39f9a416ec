//! openEHR RM data value type names and mapping type vocabulary.

pub const DV_MULTIMEDIA: &str = "MULTIMEDIA";
pub const DV_QUANTITY: &str = "DV_QUANTITY";
pub const DV_ORDINAL: &str = "DV_ORDINAL";
pub const DV_PROPORTION: &str = "DV_PROPORTION";
pub const DV_COUNT: &str = "DV_COUNT";
pub const DV_DATE_TIME: &str = "DV_DATE_TIME";
pub const DV_TIME: &str = "DV_TIME";
pub const DV_DATE: &str = "DV_DATE";
pub const DV_CODED_TEXT: &str = "DV_CODED_TEXT";
pub const CODE_PHRASE: &str = "CODE_PHRASE";
pub const DV_TEXT: &str = "DV_TEXT";
pub const DV_BOOL: &str = "BOOLEAN";
pub const DV_IDENTIFIER: &str = "IDENTIFIER";
pub const ELEMENT: &str = "ELEMENT";

/// Marker type: the rule carries structure or conditions but no value.
pub const TYPE_NONE: &str = "NONE";
pub const TYPE_MEDIA: &str = "MEDIA";
pub const TYPE_DOSAGE: &str = "DOSAGE";

/// Value types that may share an ELEMENT without the path naming the
/// concrete `value` child.
pub const CONSISTENT_VALUE_TYPES: &[&str] = &[
    DV_QUANTITY,
    DV_ORDINAL,
    DV_PROPORTION,
    DV_COUNT,
    DV_DATE_TIME,
    DV_TIME,
    DV_DATE,
    DV_CODED_TEXT,
    DV_TEXT,
    DV_BOOL,
    DV_IDENTIFIER,
];

/// RM types a declared mapping type may resolve to, preferred first.
///
/// Unknown declared types map to themselves.
pub fn possible_rm_types(declared: &str) -> Vec<&str> {
    match declared {
        "QUANTITY" => vec![DV_QUANTITY, DV_COUNT, DV_ORDINAL, DV_PROPORTION],
        "DATETIME" => vec![DV_DATE_TIME],
        "TIME" => vec![DV_TIME],
        "DATE" => vec![DV_DATE],
        "CODEABLECONCEPT" => vec![DV_CODED_TEXT],
        "CODING" => vec![CODE_PHRASE],
        "STRING" => vec![DV_TEXT],
        "BOOL" => vec![DV_BOOL],
        "IDENTIFIER" => vec![DV_IDENTIFIER],
        "MEDIA" => vec![DV_MULTIMEDIA],
        "PROPORTION" => vec![DV_PROPORTION],
        other => vec![other],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_prefers_dv_quantity() {
        assert_eq!(possible_rm_types("QUANTITY")[0], DV_QUANTITY);
        assert!(possible_rm_types("QUANTITY").contains(&DV_ORDINAL));
    }

    #[test]
    fn unknown_types_map_to_themselves() {
        assert_eq!(possible_rm_types("DV_EHR_URI"), vec!["DV_EHR_URI"]);
        assert_eq!(possible_rm_types("MEDIA"), vec![DV_MULTIMEDIA]);
    }
}
