//! View-state snapshots and structural patches.
//!
//! The untrusted side renders immutable [`ViewValue`] snapshots, computes a
//! [`Patch`] between consecutive snapshots with [`diff`], and ships it to the
//! trusted side, which replays it with [`apply`]. Lists declared in
//! [`ArrayContexts`] are reconciled by key, so reordering produces `move`
//! ops instead of a cascade of replaces.

mod apply;
mod diff;
mod patch;
mod path;
mod value;

pub use apply::apply;
pub use diff::diff;
pub use patch::{ArrayContext, ArrayContexts, Patch, PatchOp};
pub use path::{pointer_string, Path, PathSegment};
pub use value::ViewValue;

// ============================================================================
// Error Types (codes 11100-11109)
// ============================================================================

/// Error codes for patch operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PatchErrorCode {
    /// Patch does not fit the snapshot it is applied to
    MalformedPatch = 11100,
    /// Value has an unexpected shape
    TypeMismatch = 11101,
    /// Path could not be parsed
    InvalidPath = 11102,
}

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("[{code}] Malformed patch: {message}")]
    MalformedPatch { code: u32, message: String },

    #[error("[{code}] Type mismatch: {message}")]
    TypeMismatch { code: u32, message: String },

    #[error("[{code}] Invalid path: {message}")]
    InvalidPath { code: u32, message: String },
}

impl PatchError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedPatch {
            code: PatchErrorCode::MalformedPatch as u32,
            message: message.into(),
        }
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::TypeMismatch {
            code: PatchErrorCode::TypeMismatch as u32,
            message: message.into(),
        }
    }

    pub fn invalid_path(message: impl Into<String>) -> Self {
        Self::InvalidPath {
            code: PatchErrorCode::InvalidPath as u32,
            message: message.into(),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::MalformedPatch { code, .. }
            | Self::TypeMismatch { code, .. }
            | Self::InvalidPath { code, .. } => *code,
        }
    }
}

/// Parses a JSON pointer (`/todos/0/title`) into a path. Segments made only
/// of ASCII digits become indices.
pub fn parse_pointer(pointer: &str) -> Result<Path, PatchError> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err(PatchError::invalid_path(format!(
            "pointer {pointer:?} must start with '/'"
        )));
    };
    Ok(rest
        .split('/')
        .map(|part| {
            let unescaped = part.replace("~1", "/").replace("~0", "~");
            match unescaped.parse::<usize>() {
                Ok(i) if !unescaped.starts_with('+') => PathSegment::Index(i),
                _ => PathSegment::Key(unescaped),
            }
        })
        .collect())
}

/// Reads the keyed item `key` of the list at `path`, matching on `match_by`.
pub fn keyed_item<'v>(
    snapshot: &'v ViewValue,
    path: &[PathSegment],
    match_by: &str,
    key: &str,
) -> Result<Option<&'v ViewValue>, PatchError> {
    let list = snapshot
        .pointer(path)
        .ok_or_else(|| PatchError::invalid_path(pointer_string(path)))?;
    let items = list.as_list().ok_or_else(|| {
        PatchError::type_mismatch(format!(
            "{} is {}, not a list",
            pointer_string(path),
            list.kind()
        ))
    })?;
    Ok(items.iter().find(|item| {
        item.get(match_by)
            .and_then(ViewValue::key_string)
            .is_some_and(|k| k == key)
    }))
}
