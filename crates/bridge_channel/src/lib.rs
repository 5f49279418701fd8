//! Message channel between two execution contexts.
//!
//! A [`Channel`] wraps a raw `postMessage`-style transport with a handshake
//! (`Disconnected -> Handshaking -> Connected -> Closed`), bounded handshake
//! retries, buffering of sends made before the handshake completes, and
//! per-direction sequence numbers so duplicates can be discarded.
//!
//! The initiating side retries `handshake-req` until the accepting side
//! answers with `handshake-ack`; the ack may carry an init payload. Every
//! request names the initiator's session. When a connected acceptor sees a
//! new session, the peer has restarted and both directions start counting
//! from sequence 1 again.

mod channel;
mod transport;

pub use channel::{
    Channel, ChannelConfig, ChannelState, ChannelStats, Envelope, FrameReceiver, Role,
    WireMessage,
};
pub use transport::{port_pair, MessagePort, MessageSource, PortReceiver, PortSender, PostMessage};

// ============================================================================
// Error Types (codes 11200-11209)
// ============================================================================

/// Error codes for channel operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelErrorCode {
    /// Peer never acknowledged the handshake
    HandshakeExhausted = 11200,
    /// Channel is closed
    Closed = 11201,
    /// Underlying transport failed
    Transport = 11202,
    /// Frame could not be encoded
    Codec = 11203,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("[{code}] Handshake not acknowledged after {attempts} attempts")]
    HandshakeExhausted { code: u32, attempts: u32 },

    #[error("[{code}] Channel closed: {message}")]
    Closed { code: u32, message: String },

    #[error("[{code}] Transport error: {message}")]
    Transport { code: u32, message: String },

    #[error("[{code}] Codec error: {message}")]
    Codec { code: u32, message: String },
}

impl ChannelError {
    pub fn handshake_exhausted(attempts: u32) -> Self {
        Self::HandshakeExhausted {
            code: ChannelErrorCode::HandshakeExhausted as u32,
            attempts,
        }
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::Closed {
            code: ChannelErrorCode::Closed as u32,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            code: ChannelErrorCode::Transport as u32,
            message: message.into(),
        }
    }

    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            code: ChannelErrorCode::Codec as u32,
            message: message.into(),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::HandshakeExhausted { code, .. }
            | Self::Closed { code, .. }
            | Self::Transport { code, .. }
            | Self::Codec { code, .. } => *code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ChannelError::handshake_exhausted(5).code(), 11200);
        assert_eq!(ChannelError::closed("x").code(), 11201);
        assert_eq!(ChannelError::transport("x").code(), 11202);
        assert_eq!(ChannelError::codec("x").code(), 11203);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            ChannelError::handshake_exhausted(3).to_string(),
            "[11200] Handshake not acknowledged after 3 attempts"
        );
        assert_eq!(
            ChannelError::closed("peer closed the channel").to_string(),
            "[11201] Channel closed: peer closed the channel"
        );
    }

    #[test]
    fn test_envelope_wire_shape() {
        let data: Envelope<String> = Envelope::Data {
            seq: 4,
            message: "m".into(),
        };
        assert_eq!(
            serde_json::to_value(&data).unwrap(),
            serde_json::json!({"type": "data", "seq": 4, "message": "m"})
        );
        let close: Envelope<String> =
            serde_json::from_value(serde_json::json!({"type": "close"})).unwrap();
        assert_eq!(close, Envelope::Close);
        let req: Envelope<String> =
            serde_json::from_value(serde_json::json!({"type": "handshake-req", "attempt": 2}))
                .unwrap();
        assert_eq!(
            req,
            Envelope::HandshakeReq {
                attempt: 2,
                session: None
            }
        );

        let ack: Envelope<String> = Envelope::HandshakeAck {
            init: None,
            session: Some("s1".into()),
        };
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            serde_json::json!({"type": "handshake-ack", "init": null, "session": "s1"})
        );
    }
}
