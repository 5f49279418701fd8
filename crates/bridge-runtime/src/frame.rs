use bridge_channel::Channel;
use bridge_coords::{ComponentId, Mapping};
use bridge_exec::{EventFrame, ExecError, ExecRequest, ExecResponse, RequestSink};
use bridge_patch::Patch;
use bridge_refs::{RefShape, Registration};
use serde::{Deserialize, Serialize};

/// Application frames carried inside the channel's data envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    /// Reduced event, trusted to untrusted
    Event(EventFrame),
    ExecReq(ExecRequest),
    ExecRes(ExecResponse),
    Patch {
        patch: Patch,
    },
    Register {
        registrations: Vec<Registration>,
    },
    Unregister {
        coordinate: ComponentId,
        event: String,
    },
    /// Ids the sender allocated since its last batch. Both sides send these;
    /// the receiver merges them and aliases pairs it had already mapped.
    Mappings {
        mappings: Vec<Mapping>,
    },
    Release {
        coordinates: Vec<ComponentId>,
    },
}

impl Frame {
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Event(_) => "event",
            Frame::ExecReq(_) => "exec-req",
            Frame::ExecRes(_) => "exec-res",
            Frame::Patch { .. } => "patch",
            Frame::Register { .. } => "register",
            Frame::Unregister { .. } => "unregister",
            Frame::Mappings { .. } => "mappings",
            Frame::Release { .. } => "release",
        }
    }
}

/// Init payload of the handshake ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountInfo {
    /// Coordinate the component is mounted at
    pub root: ComponentId,
    pub shape: RefShape,
    /// Every id the trusted side mapped for the shape
    pub mappings: Vec<Mapping>,
}

/// Sends exec requests as frames on a channel.
pub(crate) struct FrameSink(pub(crate) Channel<Frame>);

impl RequestSink for FrameSink {
    fn send_request(&self, request: ExecRequest) -> Result<(), ExecError> {
        self.0
            .send(Frame::ExecReq(request))
            .map_err(|e| ExecError::connection_closed(e.to_string()))
    }
}
