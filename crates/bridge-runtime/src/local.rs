//! Unsplit mode: component, refs and renderer in one context.

use bridge_coords::{lock, AddressSpace, ComponentId, CoordinateTable, Segment};
use bridge_exec::FunctionRepository;
use bridge_patch::{diff, Patch, ViewValue};
use bridge_refs::{LiveBackend, NodeHandle, RefError, RefShape, ReferenceManager};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::component::{forward_snapshots, Component, ComponentContext, Renderer};
use crate::{BridgeError, MOUNT_SLOT};

/// Mounts components against live refs, with no channel in between.
pub struct LocalBridge {
    shape: RefShape,
    repository: Arc<FunctionRepository>,
}

impl LocalBridge {
    pub fn new(shape: RefShape, repository: Arc<FunctionRepository>) -> Self {
        Self { shape, repository }
    }

    /// Runs `constructor` against a [`ReferenceManager`] and mounts its first
    /// snapshot on `renderer`.
    pub fn mount<P, C, R, F>(
        self,
        props: P,
        constructor: F,
        mut renderer: R,
    ) -> Result<LocalHandle<C, R>, BridgeError>
    where
        C: Component,
        R: Renderer,
        F: FnOnce(P, &ReferenceManager, ComponentContext) -> Result<C, RefError>,
    {
        let table = CoordinateTable::new(AddressSpace::trusted()).shared();
        let root = lock(&table).map(ComponentId::ROOT, &Segment::slot(MOUNT_SLOT))?;
        let backend = LiveBackend::new().with_reducer(self.repository);
        let refs = ReferenceManager::live(backend, table, root, self.shape);

        let ctx = ComponentContext::new(None);
        let component = constructor(props, &refs, ctx.clone())?;
        let (pushed_tx, pushed) = mpsc::unbounded_channel();
        if let Some(source) = component.snapshot_source() {
            forward_snapshots(source, pushed_tx);
        }
        let snapshot = component.render();
        renderer.mount(&refs, &snapshot);
        debug!(root = root.0, "component mounted locally");

        Ok(LocalHandle {
            refs,
            ctx,
            component,
            renderer,
            snapshot,
            pushed,
        })
    }
}

/// A locally mounted component.
pub struct LocalHandle<C: Component, R: Renderer> {
    refs: ReferenceManager,
    ctx: ComponentContext,
    component: C,
    renderer: R,
    snapshot: ViewValue,
    pushed: mpsc::UnboundedReceiver<ViewValue>,
}

impl<C: Component, R: Renderer> LocalHandle<C, R> {
    /// Fires the handler bound to `node` and re-renders if it invalidated.
    /// Returns the patch that was rendered, if any.
    pub fn dispatch(
        &mut self,
        node: NodeHandle,
        event: &str,
        raw: &Value,
    ) -> Result<Option<Patch>, BridgeError> {
        if let Err(e) = self.refs.dispatch_local(node, event, raw) {
            if !e.is_dangling() {
                return Err(e.into());
            }
            warn!(%node, event, error = %e, "event dropped");
            return Ok(None);
        }
        Ok(self.refresh())
    }

    /// Re-renders if the component asked for it, or picks up the latest
    /// snapshot it published.
    pub fn refresh(&mut self) -> Option<Patch> {
        let mut published = None;
        while let Ok(snapshot) = self.pushed.try_recv() {
            published = Some(snapshot);
        }
        let next = if self.ctx.take_dirty() {
            self.component.render()
        } else {
            let snapshot = published?;
            trace!("applying published snapshot");
            snapshot
        };
        let patch = diff(&self.snapshot, &next, &self.component.array_contexts());
        self.snapshot = next;
        if patch.is_empty() {
            return None;
        }
        self.renderer.apply(&self.refs, &patch, &self.snapshot);
        Some(patch)
    }

    pub fn snapshot(&self) -> &ViewValue {
        &self.snapshot
    }

    pub fn refs(&self) -> &ReferenceManager {
        &self.refs
    }

    pub fn component(&self) -> &C {
        &self.component
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NullRenderer, SharedSnapshotSource, SnapshotCell};
    use bridge_refs::EventTarget;
    use serde_json::json;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct Echo {
        last: Arc<std::sync::Mutex<Value>>,
    }

    impl Component for Echo {
        fn render(&self) -> ViewValue {
            ViewValue::from(json!({ "last": self.last.lock().unwrap().clone() }))
        }
    }

    fn echo(
        _props: (),
        refs: &ReferenceManager,
        ctx: ComponentContext,
    ) -> Result<Echo, RefError> {
        let last = Arc::new(std::sync::Mutex::new(Value::Null));
        let sink = last.clone();
        refs.element("field")?.on_input(move |payload| {
            *sink.lock().unwrap() = payload.clone();
            ctx.invalidate();
        });
        Ok(Echo { last })
    }

    #[test]
    fn test_local_handlers_see_reduced_payloads() {
        let shape = RefShape::builder().element("field").build();
        let bridge = LocalBridge::new(shape, Arc::new(FunctionRepository::standard()));
        let mut handle = bridge.mount((), echo, NullRenderer).unwrap();

        let field = handle.refs().element("field").unwrap().coordinate();
        handle.refs().bind(field, NodeHandle(10));

        let raw = json!({"target": {"value": "hi", "id": "secret"}});
        let patch = handle.dispatch(NodeHandle(10), "input", &raw).unwrap().unwrap();
        assert_eq!(patch.len(), 1);
        assert_eq!(
            handle.snapshot(),
            &ViewValue::from(json!({"last": {"targetValue": "hi"}}))
        );
    }

    #[test]
    fn test_unbound_node_is_dropped() {
        let shape = RefShape::builder().element("field").build();
        let bridge = LocalBridge::new(shape, Arc::new(FunctionRepository::standard()));
        let mut handle = bridge.mount((), echo, NullRenderer).unwrap();
        assert!(handle
            .dispatch(NodeHandle(77), "input", &json!({}))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_constructor_errors_surface() {
        struct Nothing;
        impl Component for Nothing {
            fn render(&self) -> ViewValue {
                ViewValue::Null
            }
        }

        let bridge = LocalBridge::new(RefShape::default(), Arc::new(FunctionRepository::standard()));
        let result = bridge.mount(
            (),
            |_: (), refs: &ReferenceManager, _ctx| {
                refs.element("missing")?;
                Ok(Nothing)
            },
            NullRenderer,
        );
        assert!(matches!(result, Err(BridgeError::Component { .. })));
    }

    #[test]
    fn test_counter_without_invalidate_does_not_render() {
        struct Silent(Arc<AtomicI64>);
        impl Component for Silent {
            fn render(&self) -> ViewValue {
                ViewValue::from(self.0.load(Ordering::SeqCst))
            }
        }

        let shape = RefShape::builder().element("button").build();
        let bridge = LocalBridge::new(shape, Arc::new(FunctionRepository::standard()));
        let mut handle = bridge
            .mount(
                (),
                |_: (), refs: &ReferenceManager, _ctx| {
                    let count = Arc::new(AtomicI64::new(0));
                    let c = count.clone();
                    refs.element("button")?.on_click(move |_| {
                        c.fetch_add(1, Ordering::SeqCst);
                    });
                    Ok(Silent(count))
                },
                NullRenderer,
            )
            .unwrap();
        let button = handle.refs().element("button").unwrap().coordinate();
        handle.refs().bind(button, NodeHandle(1));

        assert!(handle.dispatch(NodeHandle(1), "click", &json!({})).unwrap().is_none());
        assert_eq!(handle.component().0.load(Ordering::SeqCst), 1);
        assert_eq!(handle.snapshot(), &ViewValue::from(0i64));
    }

    struct Published {
        cell: Arc<SnapshotCell>,
    }

    impl Component for Published {
        fn render(&self) -> ViewValue {
            self.cell.get()
        }

        fn snapshot_source(&self) -> Option<SharedSnapshotSource> {
            Some(self.cell.clone())
        }
    }

    #[test]
    fn test_published_snapshots_render_without_invalidate() {
        let shape = RefShape::builder().element("button").build();
        let bridge = LocalBridge::new(shape, Arc::new(FunctionRepository::standard()));
        let mut handle = bridge
            .mount(
                (),
                |_: (), refs: &ReferenceManager, _ctx| {
                    let cell = Arc::new(SnapshotCell::new(ViewValue::from(json!({"ticks": 0}))));
                    let publisher = cell.clone();
                    let ticks = Arc::new(AtomicI64::new(0));
                    refs.element("button")?.on_click(move |_| {
                        let n = ticks.fetch_add(1, Ordering::SeqCst) + 1;
                        publisher.publish(ViewValue::from(json!({ "ticks": n })));
                    });
                    Ok(Published { cell })
                },
                NullRenderer,
            )
            .unwrap();
        let button = handle.refs().element("button").unwrap().coordinate();
        handle.refs().bind(button, NodeHandle(1));
        assert_eq!(handle.snapshot(), &ViewValue::from(json!({"ticks": 0})));

        let patch = handle.dispatch(NodeHandle(1), "click", &json!({})).unwrap().unwrap();
        assert_eq!(
            serde_json::to_value(&patch.ops).unwrap(),
            json!([{"op": "replace", "path": ["ticks"], "value": 1}])
        );

        handle.dispatch(NodeHandle(1), "click", &json!({})).unwrap();
        assert_eq!(handle.snapshot(), &ViewValue::from(json!({"ticks": 2})));
        assert!(handle.refresh().is_none());
    }
}
