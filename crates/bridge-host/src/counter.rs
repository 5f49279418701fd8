use bridge_patch::{Patch, ViewValue};
use bridge_refs::{EventTarget, NodeHandle, RefBackend, RefError, RefShape, RefTree, ReferenceManager};
use bridge_runtime::{Component, ComponentContext, Renderer};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Node the demo renderer binds the counter button to.
pub const BUTTON_NODE: NodeHandle = NodeHandle(1);

pub fn shape() -> RefShape {
    RefShape::builder().element("button").build()
}

pub struct Counter {
    count: Arc<AtomicI64>,
}

impl Component for Counter {
    fn render(&self) -> ViewValue {
        ViewValue::object([("count", ViewValue::from(self.count.load(Ordering::SeqCst)))])
    }
}

pub fn counter<B: RefBackend>(
    start: i64,
    refs: &RefTree<B>,
    ctx: ComponentContext,
) -> Result<Counter, RefError> {
    let count = Arc::new(AtomicI64::new(start));
    let handle = count.clone();
    refs.element("button")?.on_click(move |_| {
        let now = handle.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(count = now, "counter clicked");
        ctx.invalidate();
    });
    Ok(Counter { count })
}

/// Stands in for a real display tree: binds the button and logs patches.
#[derive(Default)]
pub struct LogRenderer;

impl Renderer for LogRenderer {
    fn mount(&mut self, refs: &ReferenceManager, snapshot: &ViewValue) {
        match refs.element("button") {
            Ok(button) => refs.bind(button.coordinate(), BUTTON_NODE),
            Err(e) => warn!(error = %e, "counter shape has no button"),
        }
        info!(%snapshot, "mounted");
    }

    fn apply(&mut self, _refs: &ReferenceManager, patch: &Patch, _snapshot: &ViewValue) {
        for op in patch {
            info!(%op, "patch");
        }
    }
}
