use bridge_coords::ComponentId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

use crate::{EventHandler, EventTarget, PayloadReducer, RefBackend, RefError};

/// Opaque handle of a real display node, issued by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeHandle(pub u64);

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

#[derive(Default)]
struct LiveState {
    node_to_id: HashMap<NodeHandle, ComponentId>,
    id_to_node: HashMap<ComponentId, NodeHandle>,
    handlers: HashMap<(ComponentId, String), (u32, EventHandler)>,
}

/// Trusted-side backend: binds coordinates to display nodes and keeps the
/// handlers attached directly to live refs.
#[derive(Clone, Default)]
pub struct LiveBackend {
    state: Arc<Mutex<LiveState>>,
    reducer: Option<Arc<dyn PayloadReducer>>,
}

impl LiveBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reduce raw events through `reducer` before local handlers see them.
    pub fn with_reducer(mut self, reducer: Arc<dyn PayloadReducer>) -> Self {
        self.reducer = Some(reducer);
        self
    }

    fn lock(&self) -> MutexGuard<'_, LiveState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds the element at `id` to `node`, replacing an earlier binding of
    /// either side.
    pub fn bind(&self, id: ComponentId, node: NodeHandle) {
        let mut state = self.lock();
        if let Some(previous) = state.id_to_node.insert(id, node) {
            state.node_to_id.remove(&previous);
        }
        if let Some(previous) = state.node_to_id.insert(node, id) {
            if previous != id {
                state.id_to_node.remove(&previous);
            }
        }
        trace!(coordinate = id.0, %node, "bound node");
    }

    pub fn unbind(&self, node: NodeHandle) -> Option<ComponentId> {
        let mut state = self.lock();
        let id = state.node_to_id.remove(&node)?;
        state.id_to_node.remove(&id);
        Some(id)
    }

    pub fn resolve(&self, node: NodeHandle) -> Option<ComponentId> {
        self.lock().node_to_id.get(&node).copied()
    }

    pub fn node_of(&self, id: ComponentId) -> Option<NodeHandle> {
        self.lock().id_to_node.get(&id).copied()
    }

    /// Fires the local handler for a raw event on `node`.
    pub fn dispatch(&self, node: NodeHandle, event: &str, raw: &Value) -> Result<(), RefError> {
        let (id, entry) = {
            let state = self.lock();
            let id = *state
                .node_to_id
                .get(&node)
                .ok_or_else(|| RefError::dangling(format!("{node} is not bound")))?;
            let entry = state.handlers.get(&(id, event.to_string())).cloned();
            (id, entry)
        };
        let (extractor_id, handler) = entry
            .ok_or_else(|| RefError::dangling(format!("no {event} handler on {id}")))?;

        let payload = match &self.reducer {
            Some(reducer) => reducer.reduce(extractor_id, raw).unwrap_or_else(|| {
                warn!(extractor_id, "unknown extractor for local handler");
                json!({})
            }),
            None => raw.clone(),
        };
        debug!(coordinate = id.0, event, "dispatching local event");
        handler(&payload);
        Ok(())
    }
}

impl RefBackend for LiveBackend {
    type Ref = LiveRef;

    fn make_ref(&self, id: ComponentId) -> LiveRef {
        LiveRef {
            id,
            backend: self.clone(),
        }
    }

    fn released(&self, ids: &[ComponentId]) {
        let mut state = self.lock();
        for id in ids {
            if let Some(node) = state.id_to_node.remove(id) {
                state.node_to_id.remove(&node);
            }
        }
        state.handlers.retain(|(id, _), _| !ids.contains(id));
    }
}

/// Ref to a real element on the trusted side.
#[derive(Clone)]
pub struct LiveRef {
    id: ComponentId,
    backend: LiveBackend,
}

impl LiveRef {
    /// Display node currently bound to this ref.
    pub fn node(&self) -> Option<NodeHandle> {
        self.backend.node_of(self.id)
    }
}

impl EventTarget for LiveRef {
    fn coordinate(&self) -> ComponentId {
        self.id
    }

    fn on_with(&self, event: &str, extractor_id: u32, handler: EventHandler) {
        self.backend
            .lock()
            .handlers
            .insert((self.id, event.to_string()), (extractor_id, handler));
    }

    fn off(&self, event: &str) {
        self.backend
            .lock()
            .handlers
            .remove(&(self.id, event.to_string()));
    }
}
