use serde::{Deserialize, Serialize};
use std::fmt;

use crate::path::{parse_pattern, pattern_matches, pointer_string, Path, PathSegment, PatternStep};
use crate::value::ViewValue;

/// One structural edit. `Move` follows JSON-Patch: remove at `from`, then
/// insert at `path` in the shortened list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: Path, value: ViewValue },
    Replace { path: Path, value: ViewValue },
    Remove { path: Path },
    Move { from: Path, path: Path },
}

impl PatchOp {
    pub fn name(&self) -> &'static str {
        match self {
            PatchOp::Add { .. } => "add",
            PatchOp::Replace { .. } => "replace",
            PatchOp::Remove { .. } => "remove",
            PatchOp::Move { .. } => "move",
        }
    }

    /// Target path of the op.
    pub fn path(&self) -> &[PathSegment] {
        match self {
            PatchOp::Add { path, .. }
            | PatchOp::Replace { path, .. }
            | PatchOp::Remove { path }
            | PatchOp::Move { path, .. } => path,
        }
    }

    /// True when the op reads or writes anything at or below `prefix`.
    pub(crate) fn touches(&self, prefix: &[PathSegment]) -> bool {
        let under = |p: &[PathSegment]| p.len() > prefix.len() && p.starts_with(prefix);
        match self {
            PatchOp::Move { from, path } => under(from) || under(path),
            other => under(other.path()),
        }
    }
}

impl fmt::Display for PatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchOp::Move { from, path } => write!(
                f,
                "move {} -> {}",
                pointer_string(from),
                pointer_string(path)
            ),
            other => write!(f, "{} {}", other.name(), pointer_string(other.path())),
        }
    }
}

/// Key order of a keyed list in the snapshot a patch was computed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrayContext {
    pub path: Path,
    pub match_by: String,
    pub keys: Vec<String>,
}

/// Diff-time declarations of which lists are keyed, and by which field.
#[derive(Debug, Clone, Default)]
pub struct ArrayContexts {
    entries: Vec<(Vec<PatternStep>, String)>,
}

impl ArrayContexts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the lists matching `pattern` as keyed by `match_by`.
    ///
    /// Patterns are slash separated; `*` matches any single step.
    pub fn keyed(mut self, pattern: &str, match_by: impl Into<String>) -> Self {
        self.entries.push((parse_pattern(pattern), match_by.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Match field for the list at `path`. The first matching declaration wins.
    pub fn match_by(&self, path: &[PathSegment]) -> Option<&str> {
        self.entries
            .iter()
            .find(|(pattern, _)| pattern_matches(pattern, path))
            .map(|(_, field)| field.as_str())
    }
}

/// Ordered list of ops plus the key order of every keyed list they touch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub ops: Vec<PatchOp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contexts: Vec<ArrayContext>,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PatchOp> {
        self.ops.iter()
    }
}

impl<'a> IntoIterator for &'a Patch {
    type Item = &'a PatchOp;
    type IntoIter = std::slice::Iter<'a, PatchOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_op_wire_shape() {
        let op = PatchOp::Replace {
            path: vec!["count".into()],
            value: ViewValue::from(1),
        };
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"op": "replace", "path": ["count"], "value": 1})
        );

        let mv: PatchOp =
            serde_json::from_value(json!({"op": "move", "from": ["a", 2], "path": ["a", 0]}))
                .unwrap();
        assert_eq!(
            mv,
            PatchOp::Move {
                from: vec!["a".into(), 2.into()],
                path: vec!["a".into(), 0.into()],
            }
        );
        assert_eq!(mv.to_string(), "move /a/2 -> /a/0");
    }

    #[test]
    fn test_contexts_omitted_when_empty() {
        let patch = Patch {
            ops: vec![PatchOp::Remove {
                path: vec!["x".into()],
            }],
            contexts: Vec::new(),
        };
        let wire = serde_json::to_value(&patch).unwrap();
        assert_eq!(wire, json!({"ops": [{"op": "remove", "path": ["x"]}]}));
        let back: Patch = serde_json::from_value(wire).unwrap();
        assert_eq!(back, patch);
    }

    #[test]
    fn test_touches() {
        let op = PatchOp::Move {
            from: vec!["todos".into(), 2.into()],
            path: vec!["todos".into(), 0.into()],
        };
        assert!(op.touches(&["todos".into()]));
        assert!(!op.touches(&["todos".into(), 2.into(), "tags".into()]));
        assert!(!op.touches(&["other".into()]));
    }

    #[test]
    fn test_match_by_first_declaration_wins() {
        let contexts = ArrayContexts::new()
            .keyed("/todos", "id")
            .keyed("/groups/*/items", "sku")
            .keyed("/*", "name");
        assert_eq!(contexts.match_by(&["todos".into()]), Some("id"));
        assert_eq!(contexts.match_by(&["people".into()]), Some("name"));
        assert_eq!(
            contexts.match_by(&["groups".into(), 0.into(), "items".into()]),
            Some("sku")
        );
        assert_eq!(contexts.match_by(&[]), None);
    }
}
