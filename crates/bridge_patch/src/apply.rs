//! Patch application on a copy-on-write working copy.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::diff::item_keys;
use crate::patch::{ArrayContext, Patch, PatchOp};
use crate::path::{pointer_string, PathSegment};
use crate::value::ViewValue;
use crate::PatchError;

/// Applies `patch` to `base`, returning the patched snapshot.
///
/// `base` itself is never modified. Subtrees the patch does not touch stay
/// pointer-shared between `base` and the result.
pub fn apply(patch: &Patch, base: &ViewValue) -> Result<ViewValue, PatchError> {
    let mut root = base.clone();
    let mut checked = vec![false; patch.contexts.len()];

    for (index, op) in patch.ops.iter().enumerate() {
        for (slot, context) in patch.contexts.iter().enumerate() {
            if !checked[slot] && op.touches(&context.path) {
                realign(&mut root, context, index)?;
                checked[slot] = true;
            }
        }
        apply_op(&mut root, op, index)?;
    }
    Ok(root)
}

fn malformed(index: usize, op: &str, path: &[PathSegment], detail: &str) -> PatchError {
    PatchError::malformed(format!(
        "op #{index} ({op} {}): {detail}",
        pointer_string(path)
    ))
}

/// Mutable access to the value at `path`, cloning shared nodes on the way.
fn resolve_mut<'v>(
    root: &'v mut ViewValue,
    path: &[PathSegment],
) -> Result<&'v mut ViewValue, String> {
    let mut current = root;
    for (depth, segment) in path.iter().enumerate() {
        current = match (current, segment) {
            (ViewValue::Object(map), PathSegment::Key(key)) => Arc::make_mut(map)
                .get_mut(key.as_str())
                .ok_or_else(|| format!("missing key at {}", pointer_string(&path[..=depth])))?,
            (ViewValue::List(items), PathSegment::Index(i)) => {
                let items = Arc::make_mut(items);
                let len = items.len();
                items.get_mut(*i).ok_or_else(|| {
                    format!(
                        "index out of range at {} (len {len})",
                        pointer_string(&path[..=depth])
                    )
                })?
            }
            (other, _) => {
                return Err(format!(
                    "cannot step into {} at {}",
                    other.kind(),
                    pointer_string(&path[..=depth])
                ))
            }
        };
    }
    Ok(current)
}

fn insert_at(
    parent: &mut ViewValue,
    last: &PathSegment,
    value: ViewValue,
) -> Result<(), String> {
    match (parent, last) {
        (ViewValue::Object(map), PathSegment::Key(key)) => {
            let map = Arc::make_mut(map);
            if map.contains_key(key.as_str()) {
                return Err(format!("key {key:?} already exists"));
            }
            map.insert(Arc::from(key.as_str()), value);
            Ok(())
        }
        (ViewValue::List(items), PathSegment::Index(i)) => {
            let items = Arc::make_mut(items);
            if *i > items.len() {
                return Err(format!("insert index {i} beyond len {}", items.len()));
            }
            items.insert(*i, value);
            Ok(())
        }
        (other, segment) => Err(format!("cannot add {segment} into {}", other.kind())),
    }
}

fn remove_at(parent: &mut ViewValue, last: &PathSegment) -> Result<ViewValue, String> {
    match (parent, last) {
        (ViewValue::Object(map), PathSegment::Key(key)) => Arc::make_mut(map)
            .remove(key.as_str())
            .ok_or_else(|| format!("key {key:?} does not exist")),
        (ViewValue::List(items), PathSegment::Index(i)) => {
            let items = Arc::make_mut(items);
            if *i >= items.len() {
                return Err(format!("remove index {i} beyond len {}", items.len()));
            }
            Ok(items.remove(*i))
        }
        (other, segment) => Err(format!("cannot remove {segment} from {}", other.kind())),
    }
}

fn split_last(path: &[PathSegment]) -> Result<(&PathSegment, &[PathSegment]), String> {
    path.split_last()
        .ok_or_else(|| "the root cannot be added, removed or moved".to_string())
}

fn apply_op(root: &mut ViewValue, op: &PatchOp, index: usize) -> Result<(), PatchError> {
    let fail = |path: &[PathSegment], detail: String| malformed(index, op.name(), path, &detail);

    match op {
        PatchOp::Replace { path, value } => {
            let target = resolve_mut(root, path).map_err(|e| fail(path, e))?;
            *target = value.clone();
        }
        PatchOp::Add { path, value } if path.is_empty() => {
            *root = value.clone();
        }
        PatchOp::Add { path, value } => {
            let (last, parent) = split_last(path).map_err(|e| fail(path, e))?;
            let parent = resolve_mut(root, parent).map_err(|e| fail(path, e))?;
            insert_at(parent, last, value.clone()).map_err(|e| fail(path, e))?;
        }
        PatchOp::Remove { path } => {
            let (last, parent) = split_last(path).map_err(|e| fail(path, e))?;
            let parent = resolve_mut(root, parent).map_err(|e| fail(path, e))?;
            remove_at(parent, last).map_err(|e| fail(path, e))?;
        }
        PatchOp::Move { from, path } => {
            let (from_last, from_parent) = split_last(from).map_err(|e| fail(from, e))?;
            let source = resolve_mut(root, from_parent).map_err(|e| fail(from, e))?;
            let moved = remove_at(source, from_last).map_err(|e| fail(from, e))?;

            let (last, parent) = split_last(path).map_err(|e| fail(path, e))?;
            let parent = resolve_mut(root, parent).map_err(|e| fail(path, e))?;
            insert_at(parent, last, moved).map_err(|e| fail(path, e))?;
        }
    }
    Ok(())
}

/// Brings the keyed list at `context.path` into the context's key order.
fn realign(root: &mut ViewValue, context: &ArrayContext, index: usize) -> Result<(), PatchError> {
    let fail = |detail: &str| malformed(index, "context", &context.path, detail);

    let target = resolve_mut(root, &context.path).map_err(|e| fail(&e))?;
    let ViewValue::List(items) = &*target else {
        return Err(fail("keyed context does not point at a list"));
    };
    let keys =
        item_keys(items, &context.match_by).ok_or_else(|| fail("list items lack unique keys"))?;
    if keys == context.keys {
        return Ok(());
    }

    let mut by_key: HashMap<&str, &ViewValue> = keys
        .iter()
        .map(String::as_str)
        .zip(items.iter())
        .collect();
    if by_key.len() != context.keys.len() {
        return Err(fail("list holds a different key set than the patch source"));
    }
    let mut aligned = Vec::with_capacity(context.keys.len());
    for key in &context.keys {
        let item = by_key
            .remove(key.as_str())
            .ok_or_else(|| fail("list holds a different key set than the patch source"))?;
        aligned.push(item.clone());
    }

    debug!(
        path = %pointer_string(&context.path),
        items = aligned.len(),
        "realigned locally reordered list"
    );
    *target = ViewValue::from(aligned);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::diff;
    use crate::patch::ArrayContexts;
    use crate::PatchErrorCode;
    use serde_json::json;

    fn v(value: serde_json::Value) -> ViewValue {
        ViewValue::from(value)
    }

    #[test]
    fn test_untouched_subtrees_stay_shared() {
        let base = v(json!({"left": {"deep": [1, 2, 3]}, "right": {"n": 0}}));
        let patch = Patch {
            ops: vec![PatchOp::Replace {
                path: vec!["right".into(), "n".into()],
                value: ViewValue::from(1),
            }],
            contexts: vec![],
        };
        let patched = apply(&patch, &base).unwrap();
        assert_eq!(patched.pointer(&["right".into(), "n".into()]), Some(&ViewValue::from(1)));
        assert_eq!(base.pointer(&["right".into(), "n".into()]), Some(&ViewValue::from(0)));

        let left_before = base.get("left").unwrap();
        let left_after = patched.get("left").unwrap();
        assert!(left_before.ptr_eq(left_after));
    }

    #[test]
    fn test_missing_path_is_malformed() {
        let base = v(json!({"count": 0}));
        let patch = Patch {
            ops: vec![PatchOp::Replace {
                path: vec!["nope".into(), "deeper".into()],
                value: ViewValue::Null,
            }],
            contexts: vec![],
        };
        let err = apply(&patch, &base).unwrap_err();
        assert_eq!(err.code(), PatchErrorCode::MalformedPatch as u32);
        assert!(err.to_string().contains("/nope"));
        assert!(err.to_string().contains("op #0"));
    }

    #[test]
    fn test_malformed_variants() {
        let base = v(json!({"a": 1, "list": [1]}));
        let cases = vec![
            PatchOp::Add {
                path: vec!["a".into()],
                value: ViewValue::Null,
            },
            PatchOp::Remove {
                path: vec!["list".into(), 5.into()],
            },
            PatchOp::Replace {
                path: vec!["a".into(), "b".into()],
                value: ViewValue::Null,
            },
            PatchOp::Remove { path: vec![] },
            PatchOp::Add {
                path: vec!["list".into(), "x".into()],
                value: ViewValue::Null,
            },
        ];
        for op in cases {
            let patch = Patch {
                ops: vec![op.clone()],
                contexts: vec![],
            };
            let err = apply(&patch, &base).unwrap_err();
            assert!(matches!(err, PatchError::MalformedPatch { .. }), "{op}");
        }
    }

    #[test]
    fn test_move_between_object_keys() {
        let base = v(json!({"a": {"x": 1}}));
        let patch = Patch {
            ops: vec![PatchOp::Move {
                from: vec!["a".into()],
                path: vec!["b".into()],
            }],
            contexts: vec![],
        };
        assert_eq!(apply(&patch, &base).unwrap(), v(json!({"b": {"x": 1}})));
    }

    #[test]
    fn test_realigns_locally_reordered_copy() {
        let contexts = ArrayContexts::new().keyed("/todos", "id");
        let source = v(json!({"todos": [{"id": 1, "t": "a"}, {"id": 2, "t": "b"}, {"id": 3, "t": "c"}]}));
        let target = v(json!({"todos": [{"id": 3, "t": "c"}, {"id": 1, "t": "A"}, {"id": 2, "t": "b"}]}));
        let patch = diff(&source, &target, &contexts);

        // the receiver sorted its copy differently before the patch arrived
        let local = v(json!({"todos": [{"id": 2, "t": "b"}, {"id": 3, "t": "c"}, {"id": 1, "t": "a"}]}));
        assert_eq!(apply(&patch, &local).unwrap(), target);
    }

    #[test]
    fn test_context_with_foreign_keys_is_malformed() {
        let contexts = ArrayContexts::new().keyed("/todos", "id");
        let source = v(json!({"todos": [{"id": 1}, {"id": 2}]}));
        let target = v(json!({"todos": [{"id": 2}, {"id": 1}]}));
        let patch = diff(&source, &target, &contexts);

        let diverged = v(json!({"todos": [{"id": 2}, {"id": 9}]}));
        let err = apply(&patch, &diverged).unwrap_err();
        assert_eq!(err.code(), PatchErrorCode::MalformedPatch as u32);
        assert!(err.to_string().contains("different key set"));
    }
}
