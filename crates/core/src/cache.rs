//! Intermediate cache.
//!
//! Remembers which element was created for which (owner, resource path,
//! record path) so rules that share a path prefix build into the same
//! element instead of creating duplicates. Lookups walk the resource path
//! upwards until a cached prefix is found and report the part that still
//! has to be created.
//!
//! Keys are `owner_resourcePath_recordPath`, with `resolve()` and
//! `$fhirRoot` segments dropped from the resource path and open `[n]`
//! indices dropped from the record path.

use crate::constants::{FHIR_ROOT, RECURRING, RESOLVE};
use crate::constructor::{Built, Instantiated};
use crate::paths::{extract_filter_clause, index_parent_path, last_index, split_segments};
use fhir::{NodeId, ResourceGraph};
use std::collections::HashMap;

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub found: Option<Built>,
    /// Trailing part of the resource path not covered by the found entry.
    pub removed: String,
}

/// Where a rule sits inside a followed-by or slot chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParentPaths<'a> {
    pub fhir: Option<&'a str>,
    pub openehr: Option<&'a str>,
}

impl<'a> ParentPaths<'a> {
    pub fn new(fhir: Option<&'a str>, openehr: Option<&'a str>) -> Self {
        Self { fhir, openehr }
    }
}

#[derive(Debug, Default)]
pub struct IntermediateCache {
    entries: HashMap<String, Built>,
}

impl IntermediateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn key(owner: NodeId, fhir_path: &str, openehr_path: &str) -> String {
        let fhir_path = fhir_path
            .replace(&format!(".{RESOLVE}"), "")
            .replace(&format!(".{FHIR_ROOT}"), "")
            .replace(FHIR_ROOT, "");
        let openehr_path = openehr_path.replace(RECURRING, "");
        format!("{owner}_{fhir_path}_{openehr_path}")
    }

    pub fn get(&self, owner: NodeId, fhir_path: &str, openehr_path: &str) -> Option<&Built> {
        self.entries.get(&Self::key(owner, fhir_path, openehr_path))
    }

    pub fn insert(&mut self, owner: NodeId, fhir_path: &str, openehr_path: &str, built: Built) {
        let key = Self::key(owner, fhir_path, openehr_path);
        tracing::trace!(key = %key, "caching built element");
        self.entries.insert(key, built);
    }

    /// Finds the outermost cached element on `fhir_path`.
    ///
    /// Inside a followed-by chain (`followed_by` with a parent record path)
    /// entries are matched by prefix against the parent occurrence, so a
    /// child rule finds the element its parent rule created for the same
    /// occurrence. Entries whose key differs only by a trailing index are
    /// never considered compatible.
    pub fn lookup(
        &self,
        owner: NodeId,
        fhir_path: &str,
        openehr_path: &str,
        followed_by: bool,
        parent_openehr: Option<&str>,
    ) -> Lookup {
        let mut path = fhir_path.to_owned();
        let mut removed = String::new();
        loop {
            if let Some(parent) = parent_openehr.filter(|_| followed_by) {
                let prepared = index_parent_path(parent, openehr_path);
                let scope = if openehr_path.contains(&prepared) { prepared.as_str() } else { "" };
                let wanted = Self::key(owner, &path, scope);
                let best = self
                    .entries
                    .iter()
                    .filter(|(key, _)| compatible(key, &wanted))
                    .min_by_key(|(key, _)| key.len());
                if let Some((_, built)) = best {
                    return Lookup {
                        found: Some(built.clone()),
                        removed,
                    };
                }
            }
            if let Some(built) = self.get(owner, &path, openehr_path) {
                return Lookup {
                    found: Some(built.clone()),
                    removed,
                };
            }

            let Some(cut) = last_segment_start(&path) else {
                return Lookup { found: None, removed };
            };
            let mut removing = format!("{}{removed}", &path[cut..]);
            let mut next = path[..cut].to_owned();
            if removing
                .split('.')
                .filter(|s| !s.trim().is_empty())
                .all(|s| s.starts_with("as("))
            {
                match last_segment_start(&next) {
                    Some(cast_cut) => {
                        removing = format!("{}{removing}", &next[cast_cut..]);
                        next.truncate(cast_cut);
                    }
                    None => return Lookup { found: None, removed },
                }
            }
            path = next;
            removed = removing;
        }
    }

    /// Records every step of an instantiation chain under the paths it was
    /// built for.
    ///
    /// `path` is the resource path of the element the chain was built
    /// below; `openehr_path` is the concrete record path of the data point
    /// being mapped.
    pub fn store(
        &mut self,
        graph: &ResourceGraph,
        owner: NodeId,
        built: &Instantiated,
        path: &str,
        openehr_path: &str,
        parents: ParentPaths<'_>,
    ) {
        let inner = built.inner.as_deref();
        if built.path == RESOLVE {
            if let Some(inner) = inner {
                let resolved = format!("{path}.{RESOLVE}");
                self.store(graph, owner, inner, &resolved, openehr_path, parents);
            }
            return;
        }
        let full = join(path, &built.path);

        if let (Built::Many { .. }, Some(parent_openehr)) = (&built.returning, parents.openehr) {
            let prepared = if ends_with_digit(openehr_path) {
                openehr_path.to_owned()
            } else {
                index_parent_path(parent_openehr, openehr_path)
            };
            if last_index(&prepared) != -1 {
                let list_path = match extract_filter_clause(&built.path, true) {
                    Some(clause) => full.replace(&format!(".{clause}"), ""),
                    None => full.clone(),
                };
                let scope = strip_trailing_index(&prepared);
                self.insert(owner, &list_path, &scope, built.returning.clone());
                if let Some(last) = built.returning.last(graph) {
                    self.insert(owner, &full, &prepared, Built::Single(last));
                }
            } else {
                self.insert(owner, &full, &prepared, built.returning.clone());
            }
            if let Some(inner) = inner {
                self.store(graph, owner, inner, &full, openehr_path, parents);
            }
        } else if parents.fhir.is_some() {
            let returning = match &built.returning {
                Built::Single(node) if graph.type_name(*node) == "Reference" => {
                    Built::Single(graph.target(*node).unwrap_or(*node))
                }
                other => other.clone(),
            };
            let fhir_path = if path == built.path { path.to_owned() } else { full.clone() };
            let scoped = index_parent_path(parents.openehr.unwrap_or_default(), openehr_path);
            self.insert(owner, &fhir_path, &scoped, returning);
            if let Some(inner) = inner {
                self.store(graph, owner, inner, &full, openehr_path, ParentPaths::default());
            }
        } else {
            if built.returning.is_many() {
                let scope = strip_trailing_index(openehr_path);
                self.insert(owner, &full, &scope, built.returning.clone());
                let elements = built.returning.elements(graph);
                let index = last_index(openehr_path);
                if ends_with_digit(openehr_path) && index < elements.len() as i64 {
                    if let Some(last) = elements.last() {
                        self.insert(owner, &full, openehr_path, Built::Single(*last));
                    }
                }
            } else {
                self.insert(owner, &full, openehr_path, built.returning.clone());
            }
            if let Some(inner) = inner {
                let parents = ParentPaths::new(None, parents.openehr);
                self.store(graph, owner, inner, &full, openehr_path, parents);
            }
        }
    }
}

/// An entry key is usable for `wanted` when one extends the other, unless
/// the only difference is a further occurrence index.
fn compatible(key: &str, wanted: &str) -> bool {
    if key.starts_with(wanted) {
        return true;
    }
    let Some(diff) = wanted.strip_prefix(key) else {
        return false;
    };
    let diff = diff.replace(':', "");
    let leading_digit = diff.chars().next().is_some_and(|c| c.is_ascii_digit());
    !(leading_digit && !diff.contains('|')) && diff.parse::<i64>().is_err()
}

/// Byte offset of the `.` starting the last top-level segment.
fn last_segment_start(path: &str) -> Option<usize> {
    let segments = split_segments(path);
    if segments.len() < 2 {
        return None;
    }
    let last = segments.last().map(String::len).unwrap_or_default();
    Some(path.len() - last - 1)
}

fn join(path: &str, segment: &str) -> String {
    if segment.is_empty() {
        path.to_owned()
    } else if path.is_empty() {
        segment.to_owned()
    } else {
        format!("{path}.{segment}")
    }
}

fn ends_with_digit(path: &str) -> bool {
    path.chars().last().is_some_and(|c| c.is_ascii_digit())
}

/// `a/b:3` becomes `a/b`; other paths are returned as is.
fn strip_trailing_index(path: &str) -> String {
    match path.rfind(':') {
        Some(colon) if ends_with_digit(path) => path[..colon].to_owned(),
        _ => path.to_owned(),
    }
}
