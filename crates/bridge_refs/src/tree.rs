use bridge_coords::{lock, ComponentId, Segment, SharedTable};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::live::{LiveBackend, NodeHandle};
use crate::proxy::{HandlerTable, ProxyBackend};
use crate::shape::{RefShape, RefSlot};
use crate::{RefBackend, RefError, RegistrationChange};

/// Refs of one mounted component, addressed through the side's coordinate
/// table.
///
/// Static slots are mapped when the tree is built; list items are mapped the
/// first time their key is asked for. Cloning is cheap.
#[derive(Clone)]
pub struct RefTree<B: RefBackend> {
    backend: B,
    table: SharedTable,
    id: ComponentId,
    shape: Arc<RefShape>,
}

impl<B: RefBackend> RefTree<B> {
    pub fn new(backend: B, table: SharedTable, id: ComponentId, shape: Arc<RefShape>) -> Self {
        let tree = Self {
            backend,
            table,
            id,
            shape,
        };
        tree.map_static_slots();
        tree
    }

    fn map_static_slots(&self) {
        for slot in &self.shape.slots {
            let slot_id = match self.slot_id(slot.name()) {
                Ok(id) => id,
                Err(e) => {
                    warn!(parent = self.id.0, slot = slot.name(), error = %e, "static slot not mapped");
                    continue;
                }
            };
            if let RefSlot::Component { shape, .. } = slot {
                let child = self.subtree(slot_id, shape.clone());
                child.map_static_slots();
            }
        }
    }

    fn subtree(&self, id: ComponentId, shape: Arc<RefShape>) -> Self {
        Self {
            backend: self.backend.clone(),
            table: self.table.clone(),
            id,
            shape,
        }
    }

    fn slot_id(&self, name: &str) -> Result<ComponentId, RefError> {
        Ok(lock(&self.table).map(self.id, &Segment::slot(name))?)
    }

    fn slot(&self, name: &str, kind: &'static str) -> Result<&RefSlot, RefError> {
        let slot = self
            .shape
            .slot(name)
            .ok_or_else(|| RefError::unknown_ref(format!("no slot named {name:?}")))?;
        if slot.kind() != kind {
            return Err(RefError::kind_mismatch(format!(
                "{name:?} is a {} slot, not {kind}",
                slot.kind()
            )));
        }
        Ok(slot)
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn shape(&self) -> &RefShape {
        &self.shape
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn table(&self) -> &SharedTable {
        &self.table
    }

    pub fn element(&self, name: &str) -> Result<B::Ref, RefError> {
        self.slot(name, "element")?;
        Ok(self.backend.make_ref(self.slot_id(name)?))
    }

    pub fn repeated(&self, name: &str) -> Result<RepeatedRefs<B>, RefError> {
        self.slot(name, "repeated")?;
        Ok(RepeatedRefs {
            backend: self.backend.clone(),
            table: self.table.clone(),
            container: self.slot_id(name)?,
        })
    }

    pub fn component(&self, name: &str) -> Result<RefTree<B>, RefError> {
        let RefSlot::Component { shape, .. } = self.slot(name, "component")? else {
            return Err(RefError::kind_mismatch(format!("{name:?} is not a component")));
        };
        Ok(self.subtree(self.slot_id(name)?, shape.clone()))
    }

    pub fn component_list(&self, name: &str) -> Result<ComponentListRefs<B>, RefError> {
        let RefSlot::ComponentList { shape, .. } = self.slot(name, "component-list")? else {
            return Err(RefError::kind_mismatch(format!(
                "{name:?} is not a component list"
            )));
        };
        Ok(ComponentListRefs {
            parent: self.subtree(self.slot_id(name)?, Arc::new(RefShape::default())),
            shape: shape.clone(),
        })
    }

    /// Releases the list item `key` of slot `name`, and everything below it.
    pub fn release_item(&self, name: &str, key: &str) -> Result<Vec<ComponentId>, RefError> {
        let slot = self
            .shape
            .slot(name)
            .ok_or_else(|| RefError::unknown_ref(format!("no slot named {name:?}")))?;
        if !matches!(slot, RefSlot::Repeated { .. } | RefSlot::ComponentList { .. }) {
            return Err(RefError::kind_mismatch(format!(
                "{name:?} is a {} slot, not a list",
                slot.kind()
            )));
        }
        let container = self.slot_id(name)?;
        let item = lock(&self.table).lookup(container, &Segment::key(key));
        Ok(item.map(|id| self.release(&[id])).unwrap_or_default())
    }

    /// Releases coordinates and their descendants from the table and the
    /// backend. Returns every id removed.
    pub fn release(&self, ids: &[ComponentId]) -> Vec<ComponentId> {
        let released: Vec<ComponentId> = {
            let mut table = lock(&self.table);
            ids.iter().flat_map(|id| table.release(*id)).collect()
        };
        if !released.is_empty() {
            debug!(count = released.len(), "released coordinates");
            self.backend.released(&released);
        }
        released
    }

    /// Every id currently mapped at or below this tree, sorted.
    pub fn coordinates(&self) -> Vec<ComponentId> {
        let table = lock(&self.table);
        let mut out = Vec::new();
        let mut stack = vec![self.id];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(table.children_of(id));
        }
        out.sort();
        out
    }
}

impl RefTree<LiveBackend> {
    /// Trusted-side manager rooted at `id`.
    pub fn live(backend: LiveBackend, table: SharedTable, id: ComponentId, shape: RefShape) -> Self {
        Self::new(backend, table, id, Arc::new(shape))
    }

    pub fn bind(&self, coordinate: ComponentId, node: NodeHandle) {
        self.backend.bind(coordinate, node);
    }

    pub fn unbind(&self, node: NodeHandle) -> Option<ComponentId> {
        self.backend.unbind(node)
    }

    /// Coordinate of a live node.
    pub fn resolve(&self, node: NodeHandle) -> Option<ComponentId> {
        self.backend.resolve(node)
    }

    pub fn node_of(&self, coordinate: ComponentId) -> Option<NodeHandle> {
        self.backend.node_of(coordinate)
    }

    /// Fires local handlers for a raw event on `node`.
    pub fn dispatch_local(&self, node: NodeHandle, event: &str, raw: &Value) -> Result<(), RefError> {
        self.backend.dispatch(node, event, raw)
    }
}

impl RefTree<ProxyBackend> {
    /// Untrusted-side manager rooted at `id`.
    pub fn proxy(
        handlers: HandlerTable,
        table: SharedTable,
        id: ComponentId,
        shape: RefShape,
    ) -> Self {
        Self::new(ProxyBackend::new(handlers), table, id, Arc::new(shape))
    }

    pub fn handlers(&self) -> &HandlerTable {
        self.backend.handlers()
    }

    /// Registration changes since the previous drain.
    pub fn drain_registrations(&self) -> Vec<RegistrationChange> {
        self.backend.handlers().drain_changes()
    }
}

/// Element refs of a repeated slot, one per list key.
#[derive(Clone)]
pub struct RepeatedRefs<B: RefBackend> {
    backend: B,
    table: SharedTable,
    container: ComponentId,
}

impl<B: RefBackend> RepeatedRefs<B> {
    pub fn container(&self) -> ComponentId {
        self.container
    }

    /// Ref of the item `key`, mapping it the first time it is asked for.
    pub fn item(&self, key: &str) -> Result<B::Ref, RefError> {
        let id = lock(&self.table).map(self.container, &Segment::key(key))?;
        Ok(self.backend.make_ref(id))
    }

    /// Keys currently mapped under this slot.
    pub fn keys(&self) -> Vec<String> {
        let table = lock(&self.table);
        table
            .children_of(self.container)
            .into_iter()
            .filter_map(|id| match table.segment_of(id) {
                Some(Segment::Key(key)) => Some(key.to_string()),
                _ => None,
            })
            .collect()
    }
}

/// Child components of a component-list slot, one per list key.
#[derive(Clone)]
pub struct ComponentListRefs<B: RefBackend> {
    parent: RefTree<B>,
    shape: Arc<RefShape>,
}

impl<B: RefBackend> ComponentListRefs<B> {
    pub fn container(&self) -> ComponentId {
        self.parent.id
    }

    pub fn item(&self, key: &str) -> Result<RefTree<B>, RefError> {
        let id = lock(&self.parent.table).map(self.parent.id, &Segment::key(key))?;
        Ok(RefTree::new(
            self.parent.backend.clone(),
            self.parent.table.clone(),
            id,
            self.shape.clone(),
        ))
    }

    pub fn keys(&self) -> Vec<String> {
        RepeatedRefs {
            backend: self.parent.backend.clone(),
            table: self.parent.table.clone(),
            container: self.parent.id,
        }
        .keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventTarget, Registration, EXTRACT_NONE};
    use bridge_coords::{AddressSpace, CoordinateTable};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn todo_shape() -> RefShape {
        RefShape::builder()
            .element("add")
            .repeated("labels")
            .component("footer", RefShape::builder().element("clear").build())
            .component_list("rows", RefShape::builder().element("remove").build())
            .build()
    }

    #[test]
    fn test_both_sides_agree_on_static_slots() {
        let trusted = CoordinateTable::new(AddressSpace::trusted()).shared();
        let host = RefTree::live(LiveBackend::new(), trusted.clone(), ComponentId::ROOT, todo_shape());
        let mappings = lock(&trusted).drain_allocations();
        assert_eq!(mappings.len(), 5);

        let untrusted = CoordinateTable::new(AddressSpace::untrusted()).shared();
        lock(&untrusted).add_mappings(&mappings).unwrap();
        let guest = RefTree::proxy(HandlerTable::new(), untrusted.clone(), ComponentId::ROOT, todo_shape());
        assert!(lock(&untrusted).drain_allocations().is_empty());

        assert_eq!(
            host.element("add").unwrap().coordinate(),
            guest.element("add").unwrap().coordinate()
        );
        let host_clear = host.component("footer").unwrap().element("clear").unwrap();
        let guest_clear = guest.component("footer").unwrap().element("clear").unwrap();
        assert_eq!(host_clear.coordinate(), guest_clear.coordinate());
    }

    #[test]
    fn test_list_items_follow_peer_mappings() {
        let trusted = CoordinateTable::new(AddressSpace::trusted()).shared();
        let untrusted = CoordinateTable::new(AddressSpace::untrusted()).shared();
        let host = RefTree::live(LiveBackend::new(), trusted.clone(), ComponentId::ROOT, todo_shape());
        let seed = lock(&trusted).drain_allocations();
        lock(&untrusted).add_mappings(&seed).unwrap();
        let guest = RefTree::proxy(HandlerTable::new(), untrusted.clone(), ComponentId::ROOT, todo_shape());

        let guest_row = guest.component_list("rows").unwrap().item("k1").unwrap();
        let guest_remove = guest_row.element("remove").unwrap();
        let shipped = lock(&untrusted).drain_allocations();
        assert_eq!(shipped.len(), 2);
        assert!(shipped.iter().all(|m| AddressSpace::untrusted().owns(m.id)));

        lock(&trusted).add_mappings(&shipped).unwrap();
        let host_remove = host
            .component_list("rows")
            .unwrap()
            .item("k1")
            .unwrap()
            .element("remove")
            .unwrap();
        assert_eq!(host_remove.coordinate(), guest_remove.coordinate());
        assert!(lock(&trusted).drain_allocations().is_empty());
        assert_eq!(host.component_list("rows").unwrap().keys(), vec!["k1"]);
    }

    #[test]
    fn test_item_ids_survive_reorders_and_release() {
        let table = CoordinateTable::new(AddressSpace::untrusted()).shared();
        let guest = RefTree::proxy(HandlerTable::new(), table, ComponentId::ROOT, todo_shape());
        let labels = guest.repeated("labels").unwrap();
        let a = labels.item("a").unwrap().coordinate();
        let b = labels.item("b").unwrap().coordinate();
        assert_eq!(labels.item("b").unwrap().coordinate(), b);
        assert_eq!(labels.item("a").unwrap().coordinate(), a);

        let released = guest.release_item("labels", "a").unwrap();
        assert_eq!(released, vec![a]);
        let again = labels.item("a").unwrap().coordinate();
        assert_ne!(again, a);
        assert_eq!(labels.keys(), vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_released_component_items_drop_handlers() {
        let handlers = HandlerTable::new();
        let table = CoordinateTable::new(AddressSpace::untrusted()).shared();
        let guest = RefTree::proxy(handlers.clone(), table, ComponentId::ROOT, todo_shape());
        let row = guest.component_list("rows").unwrap().item("k9").unwrap();
        let remove = row.element("remove").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        remove.on_click(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(
            guest.drain_registrations(),
            vec![RegistrationChange::Register(Registration {
                coordinate: remove.coordinate(),
                event: "click".into(),
                extractor_id: EXTRACT_NONE,
            })]
        );

        let released = guest.release_item("rows", "k9").unwrap();
        assert_eq!(released.len(), 2);
        assert!(handlers
            .dispatch(remove.coordinate(), "click", &json!({}))
            .unwrap_err()
            .is_dangling());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_slot_errors() {
        let table = CoordinateTable::new(AddressSpace::trusted()).shared();
        let host = RefTree::live(LiveBackend::new(), table, ComponentId::ROOT, todo_shape());
        assert!(matches!(host.element("nope"), Err(RefError::UnknownRef { .. })));
        assert!(matches!(host.element("rows"), Err(RefError::KindMismatch { .. })));
        assert!(matches!(host.repeated("add"), Err(RefError::KindMismatch { .. })));
        assert!(matches!(
            host.release_item("add", "x"),
            Err(RefError::KindMismatch { .. })
        ));
        assert!(host.release_item("rows", "never-mounted").unwrap().is_empty());
    }

    #[test]
    fn test_live_tree_resolves_bound_nodes() {
        let table = CoordinateTable::new(AddressSpace::trusted()).shared();
        let host = RefTree::live(LiveBackend::new(), table, ComponentId::ROOT, todo_shape());
        let add = host.element("add").unwrap();
        host.bind(add.coordinate(), NodeHandle(41));
        assert_eq!(host.resolve(NodeHandle(41)), Some(add.coordinate()));
        assert_eq!(add.node(), Some(NodeHandle(41)));

        let coordinates = host.coordinates();
        assert_eq!(coordinates[0], ComponentId::ROOT);
        assert!(coordinates.contains(&add.coordinate()));
    }

    #[test]
    fn test_exhausted_table_surfaces_addressing_error() {
        let space = AddressSpace::new(u32::MAX - 8, 2).unwrap();
        let table = CoordinateTable::new(space).shared();
        // add, labels, footer, footer/clear, rows
        let guest = RefTree::proxy(HandlerTable::new(), table, ComponentId::ROOT, todo_shape());
        let labels = guest.repeated("labels").unwrap();

        let err = labels.item("a").map(|_| ()).unwrap_err();
        assert!(matches!(err, RefError::Addressing { .. }));
        assert_eq!(err.code(), 11303);
        let err = guest.component_list("rows").unwrap().item("k1").map(|_| ()).unwrap_err();
        assert!(matches!(err, RefError::Addressing { .. }));
        // Static slots were mapped before the space ran out
        assert!(guest.element("add").is_ok());
    }
}
