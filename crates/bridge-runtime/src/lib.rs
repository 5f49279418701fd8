//! Bridge orchestrator.
//!
//! Splits one component tree across two contexts:
//!
//! ```text
//!   trusted (HostBridge)                    untrusted (SecureBridge)
//!   ┌───────────────────────┐  handshake   ┌────────────────────────┐
//!   │ ReferenceManager      │◄────────────►│ SecureReferenceManager │
//!   │ EventRegistry         │   event ──►  │ HandlerTable           │
//!   │ ExecServer            │ ◄── exec-req │ ExecClient             │
//!   │ Renderer + snapshot   │ ◄── patch    │ Component + diff       │
//!   └───────────────────────┘              └────────────────────────┘
//! ```
//!
//! The trusted side owns the display surface and answers the handshake with
//! a [`MountInfo`]. The untrusted side runs the component, ships mappings,
//! registrations and patches, and receives reduced events. List items the
//! trusted renderer maps on its own are announced back as mappings; when both
//! sides map the same item, each keeps its id and translates the peer's.
//! [`LocalBridge`] runs the same component contract in one context.

use bridge_channel::ChannelError;
use bridge_coords::CoordError;
use bridge_exec::ExecError;
use bridge_patch::PatchError;
use bridge_refs::RefError;

pub mod config;
mod component;
mod frame;
mod host;
mod local;
mod secure;

pub use component::{
    Component, ComponentContext, NullRenderer, Renderer, SharedSnapshotSource, SnapshotCallback,
    SnapshotCell, SnapshotSource,
};
pub use config::BridgeConfig;
pub use frame::{Frame, MountInfo};
pub use host::{HostBridge, HostHandle};
pub use local::{LocalBridge, LocalHandle};
pub use secure::{SecureBridge, SecureHandle};

/// Slot under the root id where the mounted component lives.
pub const MOUNT_SLOT: &str = "mount";

// ============================================================================
// Error Types (codes 11500-11509)
// ============================================================================

/// Error codes for orchestrator operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BridgeErrorCode {
    /// Handshake failed or the peer went away
    Connection = 11500,
    /// The two sides no longer agree on state
    Synchronization = 11501,
    /// Invalid configuration
    Config = 11502,
    /// Peer sent something the protocol does not allow
    Protocol = 11503,
    /// Component construction failed
    Component = 11504,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("[{code}] Connection error: {message}")]
    Connection { code: u32, message: String },

    #[error("[{code}] Synchronization error: {message}")]
    Synchronization { code: u32, message: String },

    #[error("[{code}] Config error: {message}")]
    Config { code: u32, message: String },

    #[error("[{code}] Protocol error: {message}")]
    Protocol { code: u32, message: String },

    #[error("[{code}] Component error: {message}")]
    Component { code: u32, message: String },
}

impl BridgeError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            code: BridgeErrorCode::Connection as u32,
            message: message.into(),
        }
    }

    pub fn synchronization(message: impl Into<String>) -> Self {
        Self::Synchronization {
            code: BridgeErrorCode::Synchronization as u32,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            code: BridgeErrorCode::Config as u32,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            code: BridgeErrorCode::Protocol as u32,
            message: message.into(),
        }
    }

    pub fn component(message: impl Into<String>) -> Self {
        Self::Component {
            code: BridgeErrorCode::Component as u32,
            message: message.into(),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::Connection { code, .. }
            | Self::Synchronization { code, .. }
            | Self::Config { code, .. }
            | Self::Protocol { code, .. }
            | Self::Component { code, .. } => *code,
        }
    }
}

impl From<ChannelError> for BridgeError {
    fn from(error: ChannelError) -> Self {
        Self::connection(error.to_string())
    }
}

impl From<PatchError> for BridgeError {
    fn from(error: PatchError) -> Self {
        Self::synchronization(error.to_string())
    }
}

impl From<CoordError> for BridgeError {
    fn from(error: CoordError) -> Self {
        Self::synchronization(error.to_string())
    }
}

impl From<RefError> for BridgeError {
    fn from(error: RefError) -> Self {
        Self::component(error.to_string())
    }
}

impl From<ExecError> for BridgeError {
    fn from(error: ExecError) -> Self {
        match error {
            ExecError::ConnectionClosed { .. } => Self::connection(error.to_string()),
            other => Self::protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(BridgeError::connection("x").code(), 11500);
        assert_eq!(BridgeError::synchronization("x").code(), 11501);
        assert_eq!(BridgeError::config("x").code(), 11502);
        assert_eq!(BridgeError::protocol("x").code(), 11503);
        assert_eq!(BridgeError::component("x").code(), 11504);
        assert_eq!(
            BridgeError::config("stride must be at least 1").to_string(),
            "[11502] Config error: stride must be at least 1"
        );
    }

    #[test]
    fn test_taxonomy_mapping() {
        let exhausted: BridgeError = ChannelError::handshake_exhausted(5).into();
        assert_eq!(exhausted.code(), 11500);
        assert!(exhausted.to_string().contains("11200"));

        let malformed: BridgeError = PatchError::malformed("bad path").into();
        assert!(matches!(malformed, BridgeError::Synchronization { .. }));

        let closed: BridgeError = ExecError::connection_closed("gone").into();
        assert!(matches!(closed, BridgeError::Connection { .. }));
    }
}
