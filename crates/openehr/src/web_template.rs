//! Web template catalog.
//!
//! Responsibilities:
//! - Parse the JSON web template of an operational template.
//! - Complete a simplified mapping path into the template's flat path,
//!   marking repeating nodes with `[n]`.
//! - Infer the RM data value type at the end of a path, optionally narrowed
//!   by the set of types a declared mapping type allows.
//!
//! Notes:
//! - Segments are matched on node ids. A segment that matches no child is
//!   searched for among deeper descendants, so mapping paths may omit purely
//!   structural nodes.
//! - Segments starting with `_` (e.g. `_uncertain`) are carried through
//!   without a node.

use crate::rm;
use crate::{schema_mismatch, OpenehrResult};
use serde::Deserialize;

/// One node of a web template tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebTemplateNode {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub rm_type: String,
    #[serde(default)]
    pub min: i32,
    #[serde(default = "default_max")]
    pub max: i32,
    #[serde(default)]
    pub aql_path: Option<String>,
    #[serde(default)]
    pub children: Vec<WebTemplateNode>,
}

fn default_max() -> i32 {
    1
}

impl WebTemplateNode {
    /// Unbounded or `max > 1` nodes repeat in flat paths.
    pub fn is_multi(&self) -> bool {
        self.max == -1 || self.max > 1
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebTemplate {
    pub template_id: String,
    #[serde(default)]
    pub default_language: Option<String>,
    pub tree: WebTemplateNode,
}

impl WebTemplate {
    pub fn from_json(text: &str) -> OpenehrResult<Self> {
        let mut de = serde_json::Deserializer::from_str(text);
        serde_path_to_error::deserialize(&mut de).map_err(|e| schema_mismatch("web template", e))
    }
}

/// Outcome of completing a mapping path against a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Flat path rooted at the template tree id, `|suffix` preserved.
    pub path: String,
    /// Inferred RM type; [`rm::TYPE_NONE`] when the path did not resolve fully.
    pub rm_type: Option<String>,
    /// Whether every segment of the input matched a template node.
    pub complete: bool,
}

/// Template lookups the record-side engines rely on.
pub trait TemplateCatalog: Send + Sync {
    fn template_id(&self) -> &str;

    /// Id of the tree root, which prefixes every flat path.
    fn root_id(&self) -> &str;

    /// Completes `path`, narrowing the inferred type to `forced` when given.
    fn resolve(&self, path: &str, forced: Option<&[&str]>) -> ResolvedPath;
}

impl TemplateCatalog for WebTemplate {
    fn template_id(&self) -> &str {
        &self.template_id
    }

    fn root_id(&self) -> &str {
        &self.tree.id
    }

    fn resolve(&self, path: &str, forced: Option<&[&str]>) -> ResolvedPath {
        let (flat, suffix) = match path.find('|') {
            Some(pos) => (&path[..pos], &path[pos..]),
            None => (path, ""),
        };
        let without_root = match flat.find('/') {
            Some(pos) => &flat[pos + 1..],
            None => flat,
        };
        let segments: Vec<&str> = without_root.split('/').filter(|s| !s.is_empty()).collect();

        let mut walk = Walk {
            forced,
            constructed: Vec::new(),
            rm_type: None,
        };
        walk.nodes(&self.tree.children, &segments);

        let complete = walk.constructed.len() >= segments.len();
        let mut rm_type = walk.rm_type;
        if !complete && rm_type.as_deref() != Some(rm::DV_MULTIMEDIA) {
            rm_type = Some(rm::TYPE_NONE.to_owned());
        }

        let mut resolved = self.tree.id.clone();
        if !walk.constructed.is_empty() {
            resolved.push('/');
            resolved.push_str(&walk.constructed.join("/"));
        }
        resolved.push_str(suffix);

        ResolvedPath {
            path: resolved,
            rm_type,
            complete,
        }
    }
}

struct Walk<'f> {
    forced: Option<&'f [&'f str]>,
    constructed: Vec<String>,
    rm_type: Option<String>,
}

impl Walk<'_> {
    /// Matches the first segment among `nodes` (or their descendants) and
    /// continues with the rest. Returns false when nothing matched.
    fn nodes(&mut self, nodes: &[WebTemplateNode], segments: &[&str]) -> bool {
        let Some((first, rest)) = segments.split_first() else {
            return true;
        };
        if first.starts_with('_') {
            self.constructed.push((*first).to_owned());
            return self.nodes(nodes, rest);
        }

        let wanted = first.replace("[n]", "");
        let wanted = match wanted.find(':') {
            Some(pos) => &wanted[..pos],
            None => wanted.as_str(),
        };

        match nodes.iter().find(|n| n.id == wanted) {
            Some(node) => {
                self.constructed.push(if node.is_multi() {
                    format!("{}[n]", node.id)
                } else {
                    node.id.clone()
                });
                self.rm_type = Some(match self.forced {
                    Some(forced) if !forced.is_empty() => self.correct_type(forced, node),
                    _ => node.rm_type.clone(),
                });
                self.nodes(&node.children, rest);
                true
            }
            None => nodes
                .iter()
                .any(|n| !n.children.is_empty() && self.nodes(&n.children, segments)),
        }
    }

    fn correct_type(&mut self, forced: &[&str], node: &WebTemplateNode) -> String {
        let children = node.children.len();
        let small = children <= 3 || (children <= 5 && forced.contains(&rm::CODE_PHRASE));
        if forced.len() == 1 && small {
            return forced[0].to_owned();
        }
        if node.rm_type == rm::ELEMENT {
            if let Some(value) = node.children.iter().find(|c| c.id.contains("value")) {
                let consistent = node
                    .children
                    .iter()
                    .all(|c| rm::CONSISTENT_VALUE_TYPES.contains(&c.rm_type.as_str()));
                if value.id != "value" && !consistent {
                    self.constructed.push(value.id.clone());
                }
                return value.rm_type.clone();
            }
        }
        forced
            .iter()
            .find(|t| **t == node.rm_type)
            .unwrap_or(&forced[0])
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = r#"{
        "templateId": "Blood Pressure",
        "defaultLanguage": "en",
        "tree": {
            "id": "blood_pressure",
            "rmType": "COMPOSITION",
            "children": [
                {
                    "id": "blood_pressure",
                    "rmType": "OBSERVATION",
                    "max": -1,
                    "children": [
                        {
                            "id": "any_event",
                            "rmType": "EVENT",
                            "max": -1,
                            "children": [
                                {"id": "systolic", "rmType": "DV_QUANTITY"},
                                {"id": "diastolic", "rmType": "DV_QUANTITY"},
                                {"id": "time", "rmType": "DV_DATE_TIME"}
                            ]
                        },
                        {
                            "id": "cuff_size",
                            "rmType": "ELEMENT",
                            "children": [
                                {"id": "value", "rmType": "DV_CODED_TEXT"},
                                {"id": "value2", "rmType": "DV_TEXT"}
                            ]
                        }
                    ]
                }
            ]
        }
    }"#;

    fn template() -> WebTemplate {
        WebTemplate::from_json(TEMPLATE).expect("template parses")
    }

    #[test]
    fn repeating_nodes_are_marked() {
        let resolved = template().resolve("blood_pressure/blood_pressure/any_event/systolic", None);
        assert_eq!(resolved.path, "blood_pressure/blood_pressure[n]/any_event[n]/systolic");
        assert_eq!(resolved.rm_type.as_deref(), Some("DV_QUANTITY"));
        assert!(resolved.complete);
    }

    #[test]
    fn suffix_is_preserved() {
        let resolved =
            template().resolve("blood_pressure/blood_pressure/any_event/systolic|unit", None);
        assert_eq!(resolved.path, "blood_pressure/blood_pressure[n]/any_event[n]/systolic|unit");
    }

    #[test]
    fn structural_nodes_may_be_skipped() {
        let resolved = template().resolve("blood_pressure/systolic", None);
        assert_eq!(resolved.rm_type.as_deref(), Some("DV_QUANTITY"));
    }

    #[test]
    fn unknown_segments_mark_type_none() {
        let resolved = template().resolve("blood_pressure/blood_pressure/nothing_here", None);
        assert!(!resolved.complete);
        assert_eq!(resolved.rm_type.as_deref(), Some(rm::TYPE_NONE));
    }

    #[test]
    fn forced_type_wins_on_small_nodes() {
        let forced = rm::possible_rm_types("QUANTITY");
        let resolved =
            template().resolve("blood_pressure/blood_pressure/any_event/systolic", Some(&forced));
        assert_eq!(resolved.rm_type.as_deref(), Some("DV_QUANTITY"));
    }

    #[test]
    fn element_picks_value_child() {
        let forced = rm::possible_rm_types("CODEABLECONCEPT");
        let resolved = template().resolve("blood_pressure/blood_pressure/cuff_size", Some(&forced));
        assert_eq!(resolved.rm_type.as_deref(), Some("DV_CODED_TEXT"));
        assert_eq!(resolved.path, "blood_pressure/blood_pressure[n]/cuff_size");
    }

    #[test]
    fn missing_template_id_reports_path() {
        let err = WebTemplate::from_json(r#"{"tree": {"id": "x", "rmType": "COMPOSITION"}}"#)
            .expect_err("missing templateId");
        match err {
            crate::OpenehrError::Translation(msg) => assert!(msg.contains("templateId")),
            other => panic!("expected Translation, got {other:?}"),
        }
    }
}
