use bridge_coords::ComponentId;
use bridge_refs::{Registration, RegistrationChange};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::{EventFrame, ExecError, FunctionId, FunctionRepository};

/// Trusted-side view of which events the untrusted side listens to.
///
/// Raw events for unregistered `(coordinate, event)` pairs are dropped here
/// and never cross the boundary.
pub struct EventRegistry {
    repository: Arc<FunctionRepository>,
    registrations: HashMap<(ComponentId, String), u32>,
}

impl EventRegistry {
    pub fn new(repository: Arc<FunctionRepository>) -> Self {
        Self {
            repository,
            registrations: HashMap::new(),
        }
    }

    pub fn repository(&self) -> &Arc<FunctionRepository> {
        &self.repository
    }

    /// Records a registration. Unknown extractor ids are rejected so a bad
    /// registration fails at once instead of on the first event.
    pub fn register(&mut self, registration: Registration) -> Result<(), ExecError> {
        let id = FunctionId(registration.extractor_id);
        if !self.repository.contains(id) {
            return Err(ExecError::unknown_function(id));
        }
        trace!(
            coordinate = registration.coordinate.0,
            event = %registration.event,
            extractor_id = registration.extractor_id,
            "event registered"
        );
        self.registrations.insert(
            (registration.coordinate, registration.event),
            registration.extractor_id,
        );
        Ok(())
    }

    pub fn unregister(&mut self, coordinate: ComponentId, event: &str) -> bool {
        self.registrations
            .remove(&(coordinate, event.to_string()))
            .is_some()
    }

    pub fn apply(&mut self, change: RegistrationChange) -> Result<(), ExecError> {
        match change {
            RegistrationChange::Register(registration) => self.register(registration),
            RegistrationChange::Unregister { coordinate, event } => {
                self.unregister(coordinate, &event);
                Ok(())
            }
        }
    }

    /// Forgets every registration on the given coordinates.
    pub fn remove_coordinates(&mut self, coordinates: &[ComponentId]) -> usize {
        let before = self.registrations.len();
        self.registrations
            .retain(|(coordinate, _), _| !coordinates.contains(coordinate));
        let removed = before - self.registrations.len();
        if removed > 0 {
            debug!(removed, "registrations released");
        }
        removed
    }

    pub fn extractor_of(&self, coordinate: ComponentId, event: &str) -> Option<u32> {
        self.registrations
            .get(&(coordinate, event.to_string()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Reduces a raw event into the frame the untrusted side will see.
    /// Returns `None` when nobody listens.
    pub fn reduce(
        &self,
        coordinate: ComponentId,
        event: &str,
        raw: &Value,
    ) -> Result<Option<EventFrame>, ExecError> {
        let Some(extractor_id) = self.extractor_of(coordinate, event) else {
            trace!(coordinate = coordinate.0, event, "event not registered, dropped");
            return Ok(None);
        };
        let payload = self
            .repository
            .extract(FunctionId(extractor_id), raw)
            .inspect_err(|e| warn!(coordinate = coordinate.0, event, "extractor failed: {e}"))?;
        Ok(Some(EventFrame {
            coordinate,
            event: event.to_string(),
            extractor_id,
            payload,
        }))
    }
}
