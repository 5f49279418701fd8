//! Function and event execution protocol.
//!
//! Raw display events never leave the trusted side. Each registration names
//! an extractor; the trusted side runs it over the raw event and ships only
//! the reduced payload ([`EventFrame`]). The untrusted side may also ask the
//! trusted side to run a function from a fixed repository ([`ExecRequest`]),
//! optionally against one of its elements, and awaits the correlated
//! [`ExecResponse`].

use bridge_coords::ComponentId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

mod client;
mod registry;
mod repository;
mod server;

pub use bridge_refs::{EXTRACT_CHECKED, EXTRACT_KEY_CODE, EXTRACT_NONE, EXTRACT_TARGET_VALUE};
pub use client::{ExecClient, RequestSink};
pub use registry::EventRegistry;
pub use repository::{
    ExecCall, ExecFuture, FunctionRepository, FunctionRepositoryBuilder, FN_ECHO, FN_NEXT_FRAME,
    FRAME_INTERVAL,
};
pub use server::ExecServer;

// ============================================================================
// Error Types (codes 11400-11409)
// ============================================================================

/// Error codes for exec operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExecErrorCode {
    /// Id is not in the repository
    UnknownFunctionId = 11400,
    /// Connection closed before a response arrived
    ConnectionClosed = 11401,
    /// The function itself failed
    FunctionFailed = 11402,
    /// Target coordinate is not mounted
    DanglingReference = 11403,
    /// Id names a function where an extractor is required
    NotAnExtractor = 11404,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecError {
    #[error("[{code}] Unknown function id: {message}")]
    UnknownFunctionId { code: u32, message: String },

    #[error("[{code}] Connection closed: {message}")]
    ConnectionClosed { code: u32, message: String },

    #[error("[{code}] Function failed: {message}")]
    FunctionFailed { code: u32, message: String },

    #[error("[{code}] Dangling reference: {message}")]
    DanglingReference { code: u32, message: String },

    #[error("[{code}] Not an extractor: {message}")]
    NotAnExtractor { code: u32, message: String },
}

impl ExecError {
    pub fn unknown_function(id: FunctionId) -> Self {
        Self::UnknownFunctionId {
            code: ExecErrorCode::UnknownFunctionId as u32,
            message: format!("function {id} is not registered"),
        }
    }

    pub fn connection_closed(message: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            code: ExecErrorCode::ConnectionClosed as u32,
            message: message.into(),
        }
    }

    pub fn function_failed(message: impl Into<String>) -> Self {
        Self::FunctionFailed {
            code: ExecErrorCode::FunctionFailed as u32,
            message: message.into(),
        }
    }

    pub fn dangling(message: impl Into<String>) -> Self {
        Self::DanglingReference {
            code: ExecErrorCode::DanglingReference as u32,
            message: message.into(),
        }
    }

    pub fn not_an_extractor(id: FunctionId) -> Self {
        Self::NotAnExtractor {
            code: ExecErrorCode::NotAnExtractor as u32,
            message: format!("{id} is not an extractor"),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::UnknownFunctionId { code, .. }
            | Self::ConnectionClosed { code, .. }
            | Self::FunctionFailed { code, .. }
            | Self::DanglingReference { code, .. }
            | Self::NotAnExtractor { code, .. } => *code,
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::UnknownFunctionId { message, .. }
            | Self::ConnectionClosed { message, .. }
            | Self::FunctionFailed { message, .. }
            | Self::DanglingReference { message, .. }
            | Self::NotAnExtractor { message, .. } => message,
        }
    }

    /// Rebuilds an error received from the peer.
    pub fn from_failure(failure: ExecFailure) -> Self {
        let ExecFailure { code, message } = failure;
        let variant = |c: ExecErrorCode| c as u32 == code;
        if variant(ExecErrorCode::UnknownFunctionId) {
            Self::UnknownFunctionId { code, message }
        } else if variant(ExecErrorCode::ConnectionClosed) {
            Self::ConnectionClosed { code, message }
        } else if variant(ExecErrorCode::DanglingReference) {
            Self::DanglingReference { code, message }
        } else if variant(ExecErrorCode::NotAnExtractor) {
            Self::NotAnExtractor { code, message }
        } else {
            Self::FunctionFailed { code, message }
        }
    }
}

impl From<&ExecError> for ExecFailure {
    fn from(error: &ExecError) -> Self {
        ExecFailure {
            code: error.code(),
            message: error.message().to_string(),
        }
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionId(pub u32);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A reduced event on its way to the untrusted side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    pub coordinate: ComponentId,
    pub event: String,
    pub extractor_id: u32,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    pub request_id: RequestId,
    pub function_id: FunctionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ComponentId>,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecFailure {
    pub code: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecOutcome {
    Result(Value),
    Error(ExecFailure),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResponse {
    pub request_id: RequestId,
    #[serde(flatten)]
    pub outcome: ExecOutcome,
}

impl ExecResponse {
    pub fn ok(request_id: RequestId, value: Value) -> Self {
        Self {
            request_id,
            outcome: ExecOutcome::Result(value),
        }
    }

    pub fn err(request_id: RequestId, error: &ExecError) -> Self {
        Self {
            request_id,
            outcome: ExecOutcome::Error(error.into()),
        }
    }

    pub fn into_result(self) -> Result<Value, ExecError> {
        match self.outcome {
            ExecOutcome::Result(value) => Ok(value),
            ExecOutcome::Error(failure) => Err(ExecError::from_failure(failure)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_codes() {
        assert_eq!(ExecError::unknown_function(FunctionId(7)).code(), 11400);
        assert_eq!(ExecError::connection_closed("x").code(), 11401);
        assert_eq!(ExecError::function_failed("x").code(), 11402);
        assert_eq!(ExecError::dangling("x").code(), 11403);
        assert_eq!(ExecError::not_an_extractor(FunctionId(100)).code(), 11404);
        assert_eq!(
            ExecError::unknown_function(FunctionId(7)).to_string(),
            "[11400] Unknown function id: function fn#7 is not registered"
        );
    }

    #[test]
    fn test_response_wire_shape() {
        let ok = ExecResponse::ok(RequestId(3), json!({"x": 1}));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"requestId": 3, "result": {"x": 1}})
        );

        let err = ExecResponse::err(RequestId(4), &ExecError::unknown_function(FunctionId(9)));
        let wire = serde_json::to_value(&err).unwrap();
        assert_eq!(wire["requestId"], 4);
        assert_eq!(wire["error"]["code"], 11400);

        let back: ExecResponse = serde_json::from_value(wire).unwrap();
        assert!(matches!(
            back.into_result(),
            Err(ExecError::UnknownFunctionId { .. })
        ));
    }

    #[test]
    fn test_request_wire_shape() {
        let request = ExecRequest {
            request_id: RequestId(1),
            function_id: FunctionId(101),
            target: None,
            args: json!([1, 2]),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"requestId": 1, "functionId": 101, "args": [1, 2]})
        );
    }
}
