//! References to rendered elements.
//!
//! Components reach their elements through a [`RefTree`]. On the trusted
//! side the tree hands out [`LiveRef`]s bound to real display nodes
//! ([`ReferenceManager`]). On the untrusted side it hands out [`ProxyRef`]s
//! that only record which coordinate listens to which event, and through
//! which extractor ([`SecureReferenceManager`]). Component code is written
//! once against [`EventTarget`] and runs unchanged in either context.

use bridge_coords::{ComponentId, CoordError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

mod live;
mod proxy;
mod shape;
mod tree;

pub use live::{LiveBackend, LiveRef, NodeHandle};
pub use proxy::{HandlerTable, ProxyBackend, ProxyRef};
pub use shape::{RefShape, RefShapeBuilder, RefSlot};
pub use tree::{ComponentListRefs, RefTree, RepeatedRefs};

/// Trusted-side manager: live refs bound to display nodes.
pub type ReferenceManager = RefTree<LiveBackend>;

/// Untrusted-side manager: proxy refs recording registrations.
pub type SecureReferenceManager = RefTree<ProxyBackend>;

// ============================================================================
// Error Types (codes 11300-11309)
// ============================================================================

/// Error codes for ref operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RefErrorCode {
    /// No slot with that name
    UnknownRef = 11300,
    /// Slot exists but is of another kind
    KindMismatch = 11301,
    /// Event for a coordinate nobody listens on
    DanglingReference = 11302,
    /// The coordinate table could not address the ref
    Addressing = 11303,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RefError {
    #[error("[{code}] Unknown ref: {message}")]
    UnknownRef { code: u32, message: String },

    #[error("[{code}] Ref kind mismatch: {message}")]
    KindMismatch { code: u32, message: String },

    #[error("[{code}] Dangling reference: {message}")]
    DanglingReference { code: u32, message: String },

    #[error("[{code}] Addressing failed: {message}")]
    Addressing { code: u32, message: String },
}

impl RefError {
    pub fn unknown_ref(message: impl Into<String>) -> Self {
        Self::UnknownRef {
            code: RefErrorCode::UnknownRef as u32,
            message: message.into(),
        }
    }

    pub fn kind_mismatch(message: impl Into<String>) -> Self {
        Self::KindMismatch {
            code: RefErrorCode::KindMismatch as u32,
            message: message.into(),
        }
    }

    pub fn dangling(message: impl Into<String>) -> Self {
        Self::DanglingReference {
            code: RefErrorCode::DanglingReference as u32,
            message: message.into(),
        }
    }

    pub fn addressing(message: impl Into<String>) -> Self {
        Self::Addressing {
            code: RefErrorCode::Addressing as u32,
            message: message.into(),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::UnknownRef { code, .. }
            | Self::KindMismatch { code, .. }
            | Self::DanglingReference { code, .. }
            | Self::Addressing { code, .. } => *code,
        }
    }

    pub fn is_dangling(&self) -> bool {
        matches!(self, Self::DanglingReference { .. })
    }
}

impl From<CoordError> for RefError {
    fn from(error: CoordError) -> Self {
        Self::addressing(error.to_string())
    }
}

// ============================================================================
// Events
// ============================================================================

/// Extractor ids understood by both sides.
pub const EXTRACT_NONE: u32 = 0;
pub const EXTRACT_TARGET_VALUE: u32 = 1;
pub const EXTRACT_KEY_CODE: u32 = 2;
pub const EXTRACT_CHECKED: u32 = 3;

pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Reduces a raw event through an extractor. Used by live refs so local
/// handlers see the same payload a proxied handler would.
pub trait PayloadReducer: Send + Sync {
    fn reduce(&self, extractor_id: u32, raw: &Value) -> Option<Value>;
}

/// An untrusted-side listener declaration, as shipped to the trusted side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub coordinate: ComponentId,
    pub event: String,
    pub extractor_id: u32,
}

/// One change to the set of registrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationChange {
    Register(Registration),
    Unregister { coordinate: ComponentId, event: String },
}

/// Anything that can carry event handlers.
pub trait EventTarget {
    /// Coordinate of the element behind this ref.
    fn coordinate(&self) -> ComponentId;

    /// Registers `handler` for `event`; the payload is reduced through
    /// `extractor_id` first. Replaces any earlier handler for the same event.
    fn on_with(&self, event: &str, extractor_id: u32, handler: EventHandler);

    fn off(&self, event: &str);

    fn on(&self, event: &str, handler: impl Fn(&Value) + Send + Sync + 'static)
    where
        Self: Sized,
    {
        self.on_with(event, EXTRACT_NONE, Arc::new(handler));
    }

    fn on_click(&self, handler: impl Fn(&Value) + Send + Sync + 'static)
    where
        Self: Sized,
    {
        self.on_with("click", EXTRACT_NONE, Arc::new(handler));
    }

    /// Handler receives `{targetValue}`.
    fn on_input(&self, handler: impl Fn(&Value) + Send + Sync + 'static)
    where
        Self: Sized,
    {
        self.on_with("input", EXTRACT_TARGET_VALUE, Arc::new(handler));
    }

    /// Handler receives `{keyCode}`.
    fn on_keydown(&self, handler: impl Fn(&Value) + Send + Sync + 'static)
    where
        Self: Sized,
    {
        self.on_with("keydown", EXTRACT_KEY_CODE, Arc::new(handler));
    }
}

/// Creates the refs of one side.
pub trait RefBackend: Clone + Send + Sync + 'static {
    type Ref: EventTarget + Clone + Into<Ref> + Send + Sync + 'static;

    fn make_ref(&self, id: ComponentId) -> Self::Ref;

    /// Called with every id a release removed from the table.
    fn released(&self, ids: &[ComponentId]);
}

/// A ref of either kind.
#[derive(Clone)]
pub enum Ref {
    Live(LiveRef),
    Proxy(ProxyRef),
}

impl Ref {
    pub fn is_proxy(&self) -> bool {
        matches!(self, Ref::Proxy(_))
    }
}

impl From<LiveRef> for Ref {
    fn from(value: LiveRef) -> Self {
        Ref::Live(value)
    }
}

impl From<ProxyRef> for Ref {
    fn from(value: ProxyRef) -> Self {
        Ref::Proxy(value)
    }
}

impl EventTarget for Ref {
    fn coordinate(&self) -> ComponentId {
        match self {
            Ref::Live(r) => r.coordinate(),
            Ref::Proxy(r) => r.coordinate(),
        }
    }

    fn on_with(&self, event: &str, extractor_id: u32, handler: EventHandler) {
        match self {
            Ref::Live(r) => r.on_with(event, extractor_id, handler),
            Ref::Proxy(r) => r.on_with(event, extractor_id, handler),
        }
    }

    fn off(&self, event: &str) {
        match self {
            Ref::Live(r) => r.off(event),
            Ref::Proxy(r) => r.off(event),
        }
    }
}

impl std::fmt::Debug for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ref::Live(r) => write!(f, "Ref::Live({})", r.coordinate()),
            Ref::Proxy(r) => write!(f, "Ref::Proxy({})", r.coordinate()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(RefError::unknown_ref("x").code(), 11300);
        assert_eq!(RefError::kind_mismatch("x").code(), 11301);
        let dangling = RefError::dangling("no handler for 7/click");
        assert_eq!(dangling.code(), 11302);
        assert!(dangling.is_dangling());
        assert_eq!(
            dangling.to_string(),
            "[11302] Dangling reference: no handler for 7/click"
        );

        let exhausted: RefError = CoordError::exhausted("no ids left").into();
        assert_eq!(exhausted.code(), 11303);
        assert!(exhausted.to_string().contains("11003"));
    }

    #[test]
    fn test_registration_wire_shape() {
        let registration = Registration {
            coordinate: ComponentId(5),
            event: "input".into(),
            extractor_id: EXTRACT_TARGET_VALUE,
        };
        assert_eq!(
            serde_json::to_value(&registration).unwrap(),
            serde_json::json!({"coordinate": 5, "event": "input", "extractorId": 1})
        );
    }
}
