//! Path algebra shared by both mapping directions.
//!
//! Rules carry two kinds of paths:
//! - declared record paths, `.`-delimited with placeholders
//!   (`$openEhrArchetype.any_event.systolic`)
//! - resource paths, FHIRPath expressions rooted at a resource type
//!   (`Observation.component.where(...).value`)
//!
//! Record paths in flat form are `/`-delimited, carry `:n` indices and an
//! optional `|attr` suffix, and use `[n]` where an index is still open.
//!
//! Everything here is a pure string transformation. Several functions split
//! on `.` without regard for parentheses because the filter clauses they
//! splice are re-joined verbatim.

use crate::constants::{
    FHIR_RESOURCE, FHIR_ROOT, LOINC_SYSTEM, OPENEHR_ARCHETYPE, RECURRING, RESOLVE, SNOMED_SYSTEM,
    WHERE,
};
use crate::mapping::Condition;
use once_cell::sync::Lazy;
use regex::Regex;

static LAST_INDEX: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r":(\d+)[^:]*$").ok());
static ANY_INDEX: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r":(\d+)").ok());
static CAST_TYPE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"as\(([^()]*)\)").ok());
static NUMBERED_SEGMENT: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^.*:\d+$").ok());
static BRACKETED_SEGMENT: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^.*\[\d*\]$").ok());

/// Attribute suffixes a record path may end with.
const RM_ATTRIBUTES: &[&str] = &["magnitude", "unit", "ordinal", "value", "code", "terminology"];

// ============================================================================
// Record paths
// ============================================================================

/// Converts a declared record path to flat form.
///
/// Unescaped `.` become `/` (escaped `\.` survive for later pattern
/// matching) and the archetype placeholder is replaced by `root`.
pub fn to_record_path(declared: &str, root: &str) -> String {
    let mut out = String::with_capacity(declared.len());
    let mut previous = None;
    for c in declared.chars() {
        if c == '.' && previous != Some('\\') {
            out.push('/');
        } else {
            out.push(c);
        }
        previous = Some(c);
    }
    out.replace(OPENEHR_ARCHETYPE, root)
}

/// Inverse of [`to_record_path`] for paths without escaped dots.
pub fn to_declared_path(record: &str, root: &str) -> String {
    let relative = match record.strip_prefix(root) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') || rest.starts_with('|') => {
            format!("{OPENEHR_ARCHETYPE}{rest}")
        }
        _ => record.to_owned(),
    };
    relative.replace('/', ".")
}

/// Removes the escapes from `\.` once a path is final.
pub fn unescape_dots(path: &str) -> String {
    path.replace("\\.", ".")
}

/// Turns a simplified flat path into a pattern that tolerates indices on
/// every segment and any `|attr` suffix (unless the path names one).
///
/// Segments are not escaped, so `\.` in a path still matches a literal dot.
pub fn wildcard_pattern(path: &str) -> String {
    let parts = java_split(path, '/');
    let last = parts.last().copied().unwrap_or_default();
    if let Some((name, attr)) = last.split_once('|') {
        let leading = &parts[..parts.len() - 1];
        format!(
            "{}(:\\d+)?/{}(:\\d+)?\\|{}",
            leading.join("(:\\d+)?/"),
            name,
            attr.split('|').next().unwrap_or_default()
        )
    } else {
        format!("{}(:\\d+)?(\\|.*)?", parts.join("(:\\d+)?/"))
    }
}

/// Every substring of the given keys matched by the wildcard form of `path`.
///
/// A path that does not form a valid pattern matches nothing.
pub fn matching_keys<'a>(path: &str, keys: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let pattern = wildcard_pattern(path);
    let regex = match Regex::new(&pattern) {
        Ok(regex) => regex,
        Err(err) => {
            tracing::warn!("record path {path} does not form a valid pattern: {err}");
            return Vec::new();
        }
    };
    keys.into_iter()
        .flat_map(|key| regex.find_iter(key).map(|m| m.as_str().to_owned()).collect::<Vec<_>>())
        .collect()
}

/// Index after the right-most `:`, or -1 when the path has none.
pub fn last_index(path: &str) -> i64 {
    LAST_INDEX
        .as_ref()
        .and_then(|re| re.captures(path))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(-1)
}

/// Left-most index in the path, or -1 when the path has none.
pub fn first_index(path: &str) -> i64 {
    ANY_INDEX
        .as_ref()
        .and_then(|re| re.captures(path))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(-1)
}

/// All indices in order of appearance.
pub fn all_indexes(path: &str) -> Vec<i64> {
    ANY_INDEX
        .as_ref()
        .map(|re| {
            re.captures_iter(path)
                .filter_map(|c| c.get(1))
                .filter_map(|m| m.as_str().parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

/// The RM attribute a path ends with, if any.
pub fn ends_with_rm_attribute(path: &str) -> Option<&'static str> {
    RM_ATTRIBUTES.iter().copied().find(|attr| path.ends_with(attr))
}

/// Replaces the last occurrence of `from`; the input is returned unchanged
/// when `from` does not occur.
pub fn replace_last(s: &str, from: &str, to: &str) -> String {
    match s.rfind(from) {
        Some(start) => format!("{}{}{}", &s[..start], to, &s[start + from.len()..]),
        None => s.to_owned(),
    }
}

/// Gives a declared parent path the indices of the concrete path it was
/// matched at.
///
/// `declared_parent` is a `.` or `/` delimited path without indices;
/// `indexed` is a flat path such as `person/personendaten:2/person`.
pub fn index_parent_path(declared_parent: &str, indexed: &str) -> String {
    let declared = declared_parent.replace('/', ".");
    let indexed_parts = java_split(indexed, '/');
    let declared_parts = java_split(&declared, '.');

    let mut j = 0;
    let mut out = Vec::with_capacity(declared_parts.len());
    for part in declared_parts {
        let part = part.strip_suffix(RECURRING).unwrap_or(part);
        if j < indexed_parts.len() && indexed_parts[j].starts_with(part) {
            out.push(indexed_parts[j].to_owned());
            j += 1;
        } else {
            out.push(part.to_owned());
        }
    }
    out.join("/")
}

/// Substitutes the indices fixed in `replacement` into `original`, segment
/// by segment.
///
/// A replacement segment with a concrete `:n` wins; one still ending in a
/// bracket keeps the original; otherwise the replacement is used only when
/// it names the same node as the original.
pub fn replace_pattern(original: &str, replacement: &str) -> String {
    let original_parts = java_split(original, '/');
    let replacement_parts = java_split(replacement, '/');
    let numbered = |s: &str| NUMBERED_SEGMENT.as_ref().is_some_and(|re| re.is_match(s));
    let bracketed = |s: &str| BRACKETED_SEGMENT.as_ref().is_some_and(|re| re.is_match(s));

    let mut out = Vec::with_capacity(original_parts.len());
    for (i, orig) in original_parts.iter().enumerate() {
        let Some(repl) = replacement_parts.get(i) else {
            out.push((*orig).to_owned());
            continue;
        };
        if numbered(repl) {
            out.push((*repl).to_owned());
        } else if bracketed(repl) {
            out.push((*orig).to_owned());
        } else {
            let bare_orig = if orig.contains(RECURRING) {
                replace_last(orig, RECURRING, "")
            } else {
                (*orig).to_owned()
            };
            let bare_repl = if repl.contains(':') {
                let index = last_index(repl);
                repl.replace(':', "").replace(&index.to_string(), "")
            } else {
                (*repl).to_owned()
            };
            if bare_orig.starts_with(&bare_repl) {
                let suffix = match orig.find('|') {
                    Some(pos) if !repl.contains('|') => &orig[pos..],
                    _ => "",
                };
                out.push(format!("{repl}{suffix}"));
            } else {
                out.push((*orig).to_owned());
            }
        }
    }
    out.join("/")
}

/// Whether every segment of `parent` prefixes the matching segment of
/// `child`, ignoring the child's `|attr` suffix.
pub fn child_starts_with_parent(child: &str, parent: &str) -> bool {
    let parent_parts = java_split(parent, '/');
    for (i, child_part) in java_split(child, '/').into_iter().enumerate() {
        let Some(parent_part) = parent_parts.get(i) else {
            return true;
        };
        let child_part = child_part.split('|').next().unwrap_or_default();
        if child_part != *parent_part {
            return false;
        }
    }
    true
}

// ============================================================================
// Resource paths
// ============================================================================

/// Splits a resource path on `.` outside parentheses.
pub fn split_segments(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in path.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            '.' if depth == 0 => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);
    segments
}

/// The first (or last) `where(...)` clause with balanced parentheses.
pub fn extract_filter_clause(path: &str, last: bool) -> Option<String> {
    const START: &str = "where(";
    let start = if last { path.rfind(START) } else { path.find(START) }?;

    let bytes = path.as_bytes();
    let mut depth = 1;
    let mut end = start + START.len();
    while end < bytes.len() {
        match bytes[end] {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            _ => {}
        }
        end += 1;
    }
    if depth != 0 {
        return None;
    }
    Some(path[start..=end].to_owned())
}

/// Type named by the first `as(X)` in the path.
pub fn cast_type(path: &str) -> Option<String> {
    CAST_TYPE
        .as_ref()
        .and_then(|re| re.captures(path))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_owned())
}

/// Normalises cast spellings for evaluation and drops a cast placed
/// directly before `resolve()`.
pub fn fix_fhir_path_casting(path: &str) -> String {
    let replaced = path
        .replace("as(BooleanType)", "as(Boolean)")
        .replace("as(DateTimeType)", "as(DateTime)")
        .replace("as(TimeType)", "as(Time)")
        .replace("as(StringType)", "as(String)");
    let parts = java_split(&replaced, '.');
    let mut out = Vec::with_capacity(parts.len());
    let mut i = 0;
    while i < parts.len() {
        let part = parts[i];
        if i + 1 < parts.len() && part.starts_with("as(") && parts[i + 1] == RESOLVE {
            out.push(parts[i + 1]);
            i += 2;
        } else {
            out.push(part);
            i += 1;
        }
    }
    out.join(".")
}

/// System and code named by a condition's criteria text, e.g.
/// `[$loinc.8480-6]` or `[$snomed.1234, $snomed.5678]` (first item only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriteriaCoding {
    pub system: String,
    pub code: String,
}

pub fn criteria_coding(criteria: &str) -> CriteriaCoding {
    let stripped = criteria.replace(['[', ']'], "");
    let first = stripped.split(',').next().unwrap_or_default().trim();
    let code = first.replace("$loinc.", "").replace("$snomed.", "");
    let system = if criteria.contains("$loinc") {
        LOINC_SYSTEM.to_owned()
    } else if criteria.contains("$snomed") {
        SNOMED_SYSTEM.to_owned()
    } else {
        stripped.split('.').next().unwrap_or_default().to_owned()
    };
    CriteriaCoding { system, code }
}

fn criteria_code(condition: &Condition) -> String {
    condition
        .criteria
        .as_deref()
        .map(|c| criteria_coding(c).code)
        .unwrap_or_default()
}

fn contains_filter(attribute: &str, code: &str) -> String {
    format!("where({attribute}.toString().contains('{code}'))")
}

/// Substitutes placeholders and folds every condition into the path as a
/// filter on its target root. Several conditions are joined with ` and `.
pub fn amend_fhir_path(path: &str, conditions: &[&Condition], resource: &str) -> String {
    let mut fhir_path = path.replace(FHIR_RESOURCE, resource);
    if fhir_path.contains(FHIR_ROOT) {
        fhir_path = fhir_path.replace(&format!(".{FHIR_ROOT}"), "").replace(FHIR_ROOT, "");
    }
    if conditions.is_empty() {
        return fhir_path;
    }

    conditions
        .iter()
        .map(|condition| {
            let root = condition.target_root.replace(FHIR_RESOURCE, resource);
            let attribute = condition.target_attribute.as_deref().unwrap_or_default();
            let base = if root.starts_with(&fhir_path) {
                root.as_str()
            } else {
                fhir_path.as_str()
            };
            base.replace(
                &root,
                &format!("{root}.{}", contains_filter(attribute, &criteria_code(condition))),
            )
            .replace(FHIR_RESOURCE, resource)
        })
        .collect::<Vec<_>>()
        .join(" and ")
}

/// Path to the condition's attribute without any filter.
pub fn fhir_path_without_conditions(
    path: &str,
    condition: Option<&Condition>,
    resource: &str,
) -> String {
    let base = path.replace(FHIR_RESOURCE, resource);
    match condition.and_then(|c| c.target_attribute.as_deref()) {
        Some(attribute) => format!("{base}.{attribute}"),
        None => base,
    }
}

/// Full resource path of a rule: placeholders substituted, the parent's
/// filters carried over, and the rule's own condition folded in.
pub fn fhir_path_with_conditions(
    path: &str,
    condition: Option<&Condition>,
    resource: &str,
    parent: Option<&str>,
) -> String {
    let path = path.replace(FHIR_RESOURCE, resource);
    match condition {
        Some(condition) if condition.target_attribute.is_some() => {
            construct_with_conditions(&path, parent, condition, resource)
        }
        _ => construct_without_conditions(&path, parent),
    }
}

/// Where the criteria code of `condition` is written for a rule on
/// `rule_path`. A condition on a sibling branch of the rule is addressed
/// through the filtered element the rule itself resolves to, so both end up
/// in the same element.
pub fn condition_target_path(
    rule_path: &str,
    condition: &Condition,
    resource: &str,
    parent: Option<&str>,
) -> String {
    let attribute = condition.target_attribute.as_deref().unwrap_or_default();
    let rooted = format!(
        "{}.{attribute}",
        fhir_path_with_conditions(&condition.target_root, Some(condition), resource, parent)
    );
    let rule = rule_path.replace(FHIR_RESOURCE, resource);
    let root = condition.target_root.replace(FHIR_RESOURCE, resource);
    if rule.starts_with(&root) || root.starts_with(&rule) {
        return rooted;
    }
    let common = merge_parent_filters(&rule, Some(&root));
    let Some(inside) = root
        .strip_prefix(&common)
        .map(|rest| rest.trim_start_matches('.'))
        .filter(|rest| !rest.is_empty())
    else {
        return rooted;
    };
    let filter = contains_filter(&format!("{inside}.{attribute}"), &criteria_code(condition));
    let conditioned = fhir_path_with_conditions(rule_path, Some(condition), resource, parent);
    match conditioned.find(&filter) {
        Some(at) => format!("{}.{inside}.{attribute}", &conditioned[..at + filter.len()]),
        None => rooted,
    }
}

fn construct_without_conditions(path: &str, parent: Option<&str>) -> String {
    let Some(parent) = parent.filter(|p| !p.is_empty()) else {
        return path.to_owned();
    };
    let Some(parent_filter) = extract_filter_clause(parent, false) else {
        return path.to_owned();
    };
    if path.contains(parent) {
        return path.to_owned();
    }
    if path.starts_with(&parent.replace(&parent_filter, "")) {
        merge_parent_filters(path, Some(parent))
    } else {
        let remaining = path.replace(&merge_parent_filters(parent, Some(path)), "");
        format!("{}{}", merge_parent_filters(path, Some(parent)), remaining)
    }
}

fn construct_with_conditions(
    path: &str,
    parent: Option<&str>,
    condition: &Condition,
    resource: &str,
) -> String {
    let root = condition.target_root.replace(FHIR_RESOURCE, resource);
    let attribute = condition.target_attribute.as_deref().unwrap_or_default();
    let filter = contains_filter(attribute, &criteria_code(condition));

    let (with_parents, remaining) = if path.starts_with(&root) {
        let mut with_parents = merge_parent_filters(&root, parent);
        let added = parent
            .map(|p| extract_filter_clause(p, true).unwrap_or_default())
            .unwrap_or_default();
        let covered = with_parents.replace(&format!(".{added}"), "");
        let remaining_from_condition = root.replace(&covered, "");
        if with_parents != remaining_from_condition {
            with_parents.push_str(&remaining_from_condition);
        }
        (with_parents, path.replace(&root, ""))
    } else {
        (merge_parent_filters(path, parent), String::new())
    };

    if root.starts_with(resource) && with_parents == path {
        let common = merge_parent_filters(path, Some(&root));
        let inside = root.replace(&format!("{common}."), "").replace(&common, "");
        let inside = if inside.trim().is_empty() { String::new() } else { format!("{inside}.") };
        let tail = path.replace(&common, "");
        format!(
            "{common}.where({inside}{attribute}.toString().contains('{}')){tail}",
            criteria_code(condition)
        )
    } else {
        let tail = if remaining.trim().is_empty() {
            String::new()
        } else if remaining.starts_with('.') {
            remaining
        } else {
            format!(".{remaining}")
        };
        format!("{with_parents}.{filter}{tail}")
    }
}

/// Re-inserts the filters of `parent` at the matching position of `child`.
///
/// Child segments are walked against parent segments; where the parent has
/// a `where(...)` clause at the current position it is spliced in before the
/// child segment continues. Child segments that diverge from the parent at
/// a non-filter position are dropped.
pub fn merge_parent_filters(child: &str, parent: Option<&str>) -> String {
    let Some(parent) = parent.filter(|p| !p.is_empty()) else {
        return child.to_owned();
    };
    let parents = java_split(parent, '.');
    let children = java_split(child, '.');

    let mut out: Vec<String> = Vec::with_capacity(children.len());
    let mut consumed = 0usize;
    let mut index = 0usize;
    for segment in children {
        if index >= parents.len() || segment == parents[index] {
            out.push(segment.to_owned());
            index += 1;
            if index < parents.len() {
                consumed += parents[index].len();
            }
        } else if parents[index].starts_with(WHERE) {
            let from = consumed.saturating_sub(1).min(parent.len());
            let Some(clause) = parent
                .get(from..)
                .and_then(|rest| extract_filter_clause(rest, false))
            else {
                continue;
            };
            index += clause.matches('.').count() + 1;
            out.push(clause);
            out.push(segment.to_owned());
        }
    }
    out.join(".")
}

/// `str::split` without trailing empty pieces, keeping a lone empty piece
/// for empty input.
fn java_split(s: &str, sep: char) -> Vec<&str> {
    let mut parts: Vec<&str> = s.split(sep).collect();
    while parts.len() > 1 && parts.last().is_some_and(|p| p.is_empty()) {
        parts.pop();
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(root: &str, attribute: &str, criteria: &str) -> Condition {
        Condition {
            target_root: root.to_owned(),
            target_attribute: Some(attribute.to_owned()),
            criteria: Some(criteria.to_owned()),
            operator: Some("one of".to_owned()),
            ..Condition::default()
        }
    }

    #[test]
    fn record_path_substitutes_root_and_keeps_escapes() {
        assert_eq!(
            to_record_path("$openEhrArchetype.any_event.systolic", "blood_pressure"),
            "blood_pressure/any_event/systolic"
        );
        assert_eq!(to_record_path("a.b\\.c.d", "x"), "a/b\\.c/d");
    }

    #[test]
    fn record_and_declared_paths_round_trip() {
        let root = "blood_pressure";
        for declared in ["$openEhrArchetype.any_event.systolic|magnitude", "$openEhrArchetype"] {
            let record = to_record_path(declared, root);
            assert_eq!(to_declared_path(&record, root), declared);
        }
        let record = "blood_pressure/any_event/diastolic";
        assert_eq!(to_record_path(&to_declared_path(record, root), root), record);
    }

    #[test]
    fn wildcard_accepts_indices_and_suffixes() {
        let keys = [
            "bp/any_event:0/systolic|magnitude",
            "bp/any_event:1/systolic|unit",
            "bp/any_event:0/diastolic|magnitude",
        ];
        let found = matching_keys("bp/any_event/systolic", keys.iter().copied());
        assert_eq!(found, vec![keys[0].to_owned(), keys[1].to_owned()]);

        let only_unit = matching_keys("bp/any_event/systolic|unit", keys.iter().copied());
        assert_eq!(only_unit, vec![keys[1].to_owned()]);
    }

    #[test]
    fn invalid_pattern_matches_nothing() {
        let keys = ["bp/any_event(/systolic"];
        let found = matching_keys("bp/any_event(/systolic", keys.iter().copied());
        assert!(found.is_empty());
    }

    #[test]
    fn index_extraction() {
        assert_eq!(last_index("a:1/b:1/c/d:3"), 3);
        assert_eq!(last_index("a:1/b:2/c|magnitude"), 2);
        assert_eq!(last_index("a/b/c"), -1);
        assert_eq!(first_index("a:1/b:2/c/d:3"), 1);
        assert_eq!(all_indexes("a:1/b:2/c/d:3"), vec![1, 2, 3]);
    }

    #[test]
    fn filter_clause_extraction_balances_parentheses() {
        let path =
            "Observation.component.where(code.coding.code.toString().contains('8480-6')).value";
        assert_eq!(
            extract_filter_clause(path, false).as_deref(),
            Some("where(code.coding.code.toString().contains('8480-6'))")
        );
        assert_eq!(
            extract_filter_clause("where(a.where(b=='x')=='y').c", false).as_deref(),
            Some("where(a.where(b=='x')=='y')")
        );
        assert_eq!(extract_filter_clause("a.where(b.c(", false), None);
        assert_eq!(extract_filter_clause("a.b", false), None);
    }

    #[test]
    fn amend_folds_condition_into_target_root() {
        let cond = condition("$fhirResource.code.coding", "code", "[$loinc.85354-9]");
        assert_eq!(
            amend_fhir_path("$fhirResource", &[&cond], "Observation"),
            "Observation.code.coding.where(code.toString().contains('85354-9'))"
        );
        assert_eq!(
            amend_fhir_path("$fhirResource.value.$fhirRoot", &[], "Observation"),
            "Observation.value"
        );
    }

    #[test]
    fn condition_on_sibling_branch_is_inserted_at_common_prefix() {
        let cond = condition("$fhirResource.component.code.coding", "code", "[$loinc.8480-6]");
        let path = fhir_path_with_conditions(
            "$fhirResource.component.value",
            Some(&cond),
            "Observation",
            None,
        );
        assert_eq!(
            path,
            "Observation.component.where(code.coding.code.toString().contains('8480-6')).value"
        );
    }

    #[test]
    fn sibling_condition_targets_the_filtered_element() {
        let cond = condition("$fhirResource.component.code.coding", "code", "[$loinc.8480-6]");
        assert_eq!(
            condition_target_path("$fhirResource.component.value", &cond, "Observation", None),
            concat!(
                "Observation.component.where(code.coding.code.toString().contains('8480-6'))",
                ".code.coding.code"
            )
        );

        let below = condition("$fhirResource.code.coding", "system", "[$loinc.x]");
        assert_eq!(
            condition_target_path("$fhirResource.code.coding.code", &below, "Observation", None),
            "Observation.code.coding.where(system.toString().contains('x')).system"
        );
    }

    #[test]
    fn condition_below_the_rule_path_filters_the_rule_itself() {
        let cond = condition("$fhirResource.code.coding", "system", "[$loinc.x]");
        let path = fhir_path_with_conditions(
            "$fhirResource.code.coding.code",
            Some(&cond),
            "Observation",
            None,
        );
        assert_eq!(
            path,
            "Observation.code.coding.where(system.toString().contains('x')).code"
        );
    }

    #[test]
    fn parent_filters_are_carried_into_children() {
        let parent = "Observation.component.where(code.coding.code.toString().contains('8480-6'))";
        let child = "Observation.component.value";
        assert_eq!(
            fhir_path_with_conditions(child, None, "Observation", Some(parent)),
            "Observation.component.where(code.coding.code.toString().contains('8480-6')).value"
        );
        assert_eq!(fhir_path_with_conditions(child, None, "Observation", None), child);
    }

    #[test]
    fn criteria_parsing() {
        assert_eq!(
            criteria_coding("[$loinc.8480-6]"),
            CriteriaCoding {
                system: LOINC_SYSTEM.into(),
                code: "8480-6".into()
            }
        );
        assert_eq!(criteria_coding("[$snomed.1234, $snomed.5678]").code, "1234");
        assert_eq!(criteria_coding("[http://x.org/cs]").system, "http://x");
    }

    #[test]
    fn casting_is_normalised() {
        assert_eq!(
            fix_fhir_path_casting("Observation.value.as(BooleanType)"),
            "Observation.value.as(Boolean)"
        );
        assert_eq!(
            fix_fhir_path_casting("Observation.subject.as(Reference).resolve().name"),
            "Observation.subject.resolve().name"
        );
        assert_eq!(cast_type("value.as(Quantity).value").as_deref(), Some("Quantity"));
    }

    #[test]
    fn parent_indices_are_applied() {
        assert_eq!(
            index_parent_path(
                "person.personendaten.person.geburtsname",
                "person/personendaten:2/person/geburtsname:1/name"
            ),
            "person/personendaten:2/person/geburtsname:1"
        );
        assert_eq!(index_parent_path("a.b[n]", "a/b:3/c"), "a/b:3");
    }

    #[test]
    fn replace_pattern_prefers_concrete_indices() {
        assert_eq!(
            replace_pattern("bp/bp[n]/any_event[n]/systolic", "bp/bp:0/any_event[n]"),
            "bp/bp:0/any_event[n]/systolic"
        );
        assert_eq!(replace_pattern("bp/other[n]/x", "bp/bp:0"), "bp/bp:0/x");
    }

    #[test]
    fn child_prefix_ignores_attribute_suffix() {
        assert!(child_starts_with_parent("a/b|code", "a/b"));
        assert!(child_starts_with_parent("a/b/c", "a/b"));
        assert!(!child_starts_with_parent("a/x/c", "a/b"));
    }

    #[test]
    fn misc_helpers() {
        assert_eq!(replace_last("a[n]/b[n]", "[n]", ":0"), "a[n]/b:0");
        assert_eq!(replace_last("abc", "x", "y"), "abc");
        assert_eq!(ends_with_rm_attribute("a/b/magnitude"), Some("magnitude"));
        assert_eq!(ends_with_rm_attribute("a/b/c"), None);
        assert_eq!(split_segments("a.where(b.c).d"), vec!["a", "where(b.c)", "d"]);
    }
}
