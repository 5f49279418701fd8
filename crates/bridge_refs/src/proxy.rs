use bridge_coords::ComponentId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

use crate::{EventHandler, EventTarget, RefBackend, RefError, Registration, RegistrationChange};

struct Entry {
    extractor_id: u32,
    handler: EventHandler,
}

#[derive(Default)]
struct TableState {
    entries: HashMap<(ComponentId, String), Entry>,
    changes: Vec<RegistrationChange>,
}

/// Untrusted-side handler registry, keyed by `(coordinate, event)`.
///
/// Every change is also queued so the orchestrator can tell the trusted side
/// which events to forward.
#[derive(Clone, Default)]
pub struct HandlerTable {
    state: Arc<Mutex<TableState>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a handler. Returns `true` if it replaced an earlier one.
    pub fn register(
        &self,
        coordinate: ComponentId,
        event: &str,
        extractor_id: u32,
        handler: EventHandler,
    ) -> bool {
        let mut state = self.lock();
        let replaced = state
            .entries
            .insert(
                (coordinate, event.to_string()),
                Entry {
                    extractor_id,
                    handler,
                },
            )
            .is_some();
        state.changes.push(RegistrationChange::Register(Registration {
            coordinate,
            event: event.to_string(),
            extractor_id,
        }));
        trace!(coordinate = coordinate.0, event, extractor_id, replaced, "handler registered");
        replaced
    }

    pub fn unregister(&self, coordinate: ComponentId, event: &str) -> bool {
        let mut state = self.lock();
        let removed = state
            .entries
            .remove(&(coordinate, event.to_string()))
            .is_some();
        if removed {
            state.changes.push(RegistrationChange::Unregister {
                coordinate,
                event: event.to_string(),
            });
        }
        removed
    }

    /// Runs the handler for `(coordinate, event)` with an already reduced
    /// payload. The table lock is not held while the handler runs.
    pub fn dispatch(
        &self,
        coordinate: ComponentId,
        event: &str,
        payload: &Value,
    ) -> Result<(), RefError> {
        let handler = self
            .lock()
            .entries
            .get(&(coordinate, event.to_string()))
            .map(|entry| entry.handler.clone())
            .ok_or_else(|| {
                RefError::dangling(format!("no {event} handler at coordinate {coordinate}"))
            })?;
        debug!(coordinate = coordinate.0, event, "dispatching proxied event");
        handler(payload);
        Ok(())
    }

    /// Drops every handler of `coordinate`. Returns how many were removed.
    pub fn remove_coordinate(&self, coordinate: ComponentId) -> usize {
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|(id, _), _| *id != coordinate);
        before - state.entries.len()
    }

    pub fn contains(&self, coordinate: ComponentId, event: &str) -> bool {
        self.lock()
            .entries
            .contains_key(&(coordinate, event.to_string()))
    }

    pub fn extractor_of(&self, coordinate: ComponentId, event: &str) -> Option<u32> {
        self.lock()
            .entries
            .get(&(coordinate, event.to_string()))
            .map(|entry| entry.extractor_id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Current registrations, ordered by coordinate then event.
    pub fn registrations(&self) -> Vec<Registration> {
        let mut all: Vec<Registration> = self
            .lock()
            .entries
            .iter()
            .map(|((coordinate, event), entry)| Registration {
                coordinate: *coordinate,
                event: event.clone(),
                extractor_id: entry.extractor_id,
            })
            .collect();
        all.sort_by(|a, b| (a.coordinate, &a.event).cmp(&(b.coordinate, &b.event)));
        all
    }

    /// Changes since the previous drain, in the order they happened.
    pub fn drain_changes(&self) -> Vec<RegistrationChange> {
        std::mem::take(&mut self.lock().changes)
    }
}

/// Untrusted-side backend: refs are proxies into a [`HandlerTable`].
#[derive(Clone, Default)]
pub struct ProxyBackend {
    handlers: HandlerTable,
}

impl ProxyBackend {
    pub fn new(handlers: HandlerTable) -> Self {
        Self { handlers }
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }
}

impl RefBackend for ProxyBackend {
    type Ref = ProxyRef;

    fn make_ref(&self, id: ComponentId) -> ProxyRef {
        ProxyRef {
            id,
            handlers: self.handlers.clone(),
        }
    }

    fn released(&self, ids: &[ComponentId]) {
        for id in ids {
            self.handlers.remove_coordinate(*id);
        }
    }
}

/// Stand-in for an element the untrusted side cannot touch.
#[derive(Clone)]
pub struct ProxyRef {
    id: ComponentId,
    handlers: HandlerTable,
}

impl EventTarget for ProxyRef {
    fn coordinate(&self) -> ComponentId {
        self.id
    }

    fn on_with(&self, event: &str, extractor_id: u32, handler: EventHandler) {
        self.handlers.register(self.id, event, extractor_id, handler);
    }

    fn off(&self, event: &str) {
        self.handlers.unregister(self.id, event);
    }
}
