use bridge_exec::ExecClient;
use bridge_patch::{ArrayContexts, Patch, ViewValue};
use bridge_refs::ReferenceManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch, Notify};
use tracing::trace;

/// A component instance. Constructed once per mount with its props, its refs
/// and a [`ComponentContext`].
pub trait Component: Send + 'static {
    /// Current view state. Must be cheap to call repeatedly; unchanged
    /// subtrees should be shared with the previous snapshot.
    fn render(&self) -> ViewValue;

    /// Keyed lists in the snapshot, for move-aware diffs.
    fn array_contexts(&self) -> ArrayContexts {
        ArrayContexts::new()
    }

    /// Where the component publishes snapshots on its own. The bridge syncs
    /// every snapshot published there; [`ComponentContext::invalidate`] keeps
    /// working alongside it.
    fn snapshot_source(&self) -> Option<SharedSnapshotSource> {
        None
    }
}

/// Handle a component keeps to talk to its bridge.
#[derive(Clone)]
pub struct ComponentContext {
    dirty: Arc<AtomicBool>,
    wake: Arc<Notify>,
    exec: Option<ExecClient>,
}

impl ComponentContext {
    pub(crate) fn new(exec: Option<ExecClient>) -> Self {
        Self {
            dirty: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            exec,
        }
    }

    /// Asks the bridge for a fresh snapshot. Several calls before the bridge
    /// gets to it collapse into one render.
    pub fn invalidate(&self) {
        if !self.dirty.swap(true, Ordering::SeqCst) {
            trace!("component invalidated");
        }
        self.wake.notify_one();
    }

    /// Exec client for calls into the trusted side. `None` when the component
    /// runs unsplit.
    pub fn exec(&self) -> Option<&ExecClient> {
        self.exec.as_ref()
    }

    pub fn is_split(&self) -> bool {
        self.exec.is_some()
    }

    pub(crate) fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    pub(crate) async fn invalidated(&self) {
        self.wake.notified().await;
    }
}

pub type SnapshotCallback = Box<dyn FnOnce(ViewValue) + Send>;

/// Reactive boundary: something that produces snapshots over time.
pub trait SnapshotSource {
    /// Calls `callback` once, with the next snapshot published after this
    /// call.
    fn on_next_snapshot(&self, callback: SnapshotCallback);
}

pub type SharedSnapshotSource = Arc<dyn SnapshotSource + Send + Sync>;

/// Forwards every snapshot `source` publishes into `tx`, re-arming from inside
/// the callback so none is missed. Stops once the receiver is gone.
pub(crate) fn forward_snapshots(source: SharedSnapshotSource, tx: mpsc::UnboundedSender<ViewValue>) {
    let next = source.clone();
    source.on_next_snapshot(Box::new(move |snapshot| {
        if tx.send(snapshot).is_ok() {
            forward_snapshots(next, tx);
        } else {
            trace!("snapshot receiver gone, not re-arming");
        }
    }));
}

/// Latest snapshot plus a watch channel for observers.
pub struct SnapshotCell {
    tx: watch::Sender<ViewValue>,
    waiters: Mutex<Vec<SnapshotCallback>>,
}

impl SnapshotCell {
    pub fn new(initial: ViewValue) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            tx,
            waiters: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> ViewValue {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewValue> {
        self.tx.subscribe()
    }

    pub fn publish(&self, snapshot: ViewValue) {
        self.tx.send_replace(snapshot.clone());
        let waiters = std::mem::take(
            &mut *self
                .waiters
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for callback in waiters {
            callback(snapshot.clone());
        }
    }
}

impl Default for SnapshotCell {
    fn default() -> Self {
        Self::new(ViewValue::Null)
    }
}

impl SnapshotSource for SnapshotCell {
    fn on_next_snapshot(&self, callback: SnapshotCallback) {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }
}

/// Drives the real display tree on the trusted side.
pub trait Renderer: Send + 'static {
    /// First snapshot. Typically creates nodes and binds them to refs.
    fn mount(&mut self, refs: &ReferenceManager, snapshot: &ViewValue);

    /// Every later patch, with the snapshot it produced.
    fn apply(&mut self, refs: &ReferenceManager, patch: &Patch, snapshot: &ViewValue);
}

/// Renderer that draws nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRenderer;

impl Renderer for NullRenderer {
    fn mount(&mut self, _refs: &ReferenceManager, _snapshot: &ViewValue) {}

    fn apply(&mut self, _refs: &ReferenceManager, _patch: &Patch, _snapshot: &ViewValue) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invalidations_collapse() {
        let ctx = ComponentContext::new(None);
        assert!(!ctx.is_split());
        ctx.invalidate();
        ctx.clone().invalidate();
        assert!(ctx.take_dirty());
        assert!(!ctx.take_dirty());
    }

    #[tokio::test]
    async fn test_invalidate_wakes_waiter() {
        let ctx = ComponentContext::new(None);
        ctx.invalidate();
        tokio::time::timeout(std::time::Duration::from_secs(1), ctx.invalidated())
            .await
            .unwrap();
    }

    #[test]
    fn test_snapshot_cell_callbacks_fire_once() {
        let cell = SnapshotCell::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        cell.on_next_snapshot(Box::new(move |snapshot| {
            sink.lock().unwrap().push(snapshot);
        }));

        let mut rx = cell.subscribe();
        cell.publish(ViewValue::from(json!({"count": 1})));
        cell.publish(ViewValue::from(json!({"count": 2})));

        assert_eq!(*seen.lock().unwrap(), vec![ViewValue::from(json!({"count": 1}))]);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ViewValue::from(json!({"count": 2})));
        assert_eq!(cell.get(), ViewValue::from(json!({"count": 2})));
    }

    #[test]
    fn test_forwarding_keeps_every_published_snapshot() {
        let cell = Arc::new(SnapshotCell::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        forward_snapshots(cell.clone(), tx);

        for n in 1..=3 {
            cell.publish(ViewValue::from(n as i64));
        }
        for n in 1..=3 {
            assert_eq!(rx.try_recv().unwrap(), ViewValue::from(n as i64));
        }
        assert!(rx.try_recv().is_err());

        // Dropping the receiver ends the chain at the next publish
        drop(rx);
        cell.publish(ViewValue::from(4i64));
        cell.publish(ViewValue::from(5i64));
        assert!(cell.waiters.lock().unwrap().is_empty());
    }
}
