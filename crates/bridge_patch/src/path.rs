use serde::{Deserialize, Serialize};
use std::fmt;

/// One step into a snapshot: an object key or a list index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl PathSegment {
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(i) => write!(f, "{i}"),
            PathSegment::Key(k) => write!(f, "{k}"),
        }
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

pub type Path = Vec<PathSegment>;

/// Renders a path as a JSON pointer (`/todos/0/title`). The root is `""`.
pub fn pointer_string(path: &[PathSegment]) -> String {
    let mut out = String::new();
    for segment in path {
        out.push('/');
        out.push_str(&segment.to_string());
    }
    out
}

/// Step of an array-context pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PatternStep {
    Exact(String),
    Any,
}

/// Parses `/groups/*/items` into pattern steps. Leading and trailing slashes
/// are optional; `""` and `"/"` name the root.
pub(crate) fn parse_pattern(pattern: &str) -> Vec<PatternStep> {
    pattern
        .split('/')
        .filter(|part| !part.is_empty())
        .map(|part| match part {
            "*" => PatternStep::Any,
            exact => PatternStep::Exact(exact.to_string()),
        })
        .collect()
}

pub(crate) fn pattern_matches(pattern: &[PatternStep], path: &[PathSegment]) -> bool {
    pattern.len() == path.len()
        && pattern.iter().zip(path).all(|(step, segment)| match (step, segment) {
            (PatternStep::Any, _) => true,
            (PatternStep::Exact(want), PathSegment::Key(k)) => want == k,
            (PatternStep::Exact(want), PathSegment::Index(i)) => *want == i.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_json_shape() {
        let path: Path = vec!["todos".into(), 2.into(), "title".into()];
        assert_eq!(
            serde_json::to_string(&path).unwrap(),
            r#"["todos",2,"title"]"#
        );
        let back: Path = serde_json::from_str(r#"["todos",2,"title"]"#).unwrap();
        assert_eq!(back, path);
        assert_eq!(pointer_string(&path), "/todos/2/title");
        assert_eq!(pointer_string(&[]), "");
    }

    #[test]
    fn test_pattern_matching() {
        let pattern = parse_pattern("/groups/*/items");
        assert!(pattern_matches(
            &pattern,
            &["groups".into(), 3.into(), "items".into()]
        ));
        assert!(pattern_matches(
            &pattern,
            &["groups".into(), "a".into(), "items".into()]
        ));
        assert!(!pattern_matches(&pattern, &["groups".into(), 3.into()]));
        assert!(!pattern_matches(
            &pattern,
            &["other".into(), 3.into(), "items".into()]
        ));

        assert!(pattern_matches(&parse_pattern("/"), &[]));
        assert!(pattern_matches(&parse_pattern("rows/0"), &["rows".into(), 0.into()]));
    }
}
