//! Trusted side of the bridge.

use bridge_channel::{Channel, FrameReceiver, MessagePort, Role};
use bridge_coords::{lock, ComponentId, CoordinateTable, Segment, SharedTable};
use bridge_exec::{EventRegistry, ExecServer, FunctionRepository};
use bridge_patch::{apply, ViewValue};
use bridge_refs::{LiveBackend, NodeHandle, RefShape, ReferenceManager};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::component::{Renderer, SnapshotCell};
use crate::config::BridgeConfig;
use crate::frame::{Frame, MountInfo};
use crate::{BridgeError, MOUNT_SLOT};

type SharedRegistry = Arc<Mutex<EventRegistry>>;

fn lock_registry(registry: &SharedRegistry) -> MutexGuard<'_, EventRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Trusted-side bridge, ready to accept one untrusted peer.
pub struct HostBridge<R: Renderer> {
    config: BridgeConfig,
    table: SharedTable,
    refs: ReferenceManager,
    repository: Arc<FunctionRepository>,
    renderer: R,
    mount_info: MountInfo,
}

impl<R: Renderer> HostBridge<R> {
    /// Maps `shape` into the trusted address space and prepares the mount
    /// info the handshake will carry.
    pub fn new(
        config: BridgeConfig,
        shape: RefShape,
        repository: Arc<FunctionRepository>,
        renderer: R,
    ) -> Result<Self, BridgeError> {
        config.validate()?;
        let table = CoordinateTable::new(config.trusted_space()?).shared();
        let root = lock(&table).map(ComponentId::ROOT, &Segment::slot(MOUNT_SLOT))?;

        let backend = LiveBackend::new().with_reducer(repository.clone());
        let refs = ReferenceManager::live(backend, table.clone(), root, shape.clone());
        let mappings = lock(&table).drain_allocations();
        debug!(root = root.0, mapped = mappings.len(), "host bridge prepared");

        Ok(Self {
            config,
            table,
            refs,
            repository,
            renderer,
            mount_info: MountInfo {
                root,
                shape,
                mappings,
            },
        })
    }

    pub fn refs(&self) -> &ReferenceManager {
        &self.refs
    }

    pub fn mount_info(&self) -> &MountInfo {
        &self.mount_info
    }

    /// Opens the acceptor end on `port` and starts serving. Must be called
    /// inside a tokio runtime.
    pub fn serve(self, port: MessagePort) -> Result<HostHandle, BridgeError> {
        let init = serde_json::to_value(&self.mount_info)
            .map_err(|e| BridgeError::protocol(format!("encoding mount info: {e}")))?;
        let channel: Channel<Frame> = Channel::open(
            port,
            Role::Acceptor { init: Some(init) },
            self.config.channel_config(),
        );
        let frames = channel.listen();

        let registry = Arc::new(Mutex::new(EventRegistry::new(self.repository.clone())));
        let snapshots = Arc::new(SnapshotCell::default());
        let session = HostSession {
            channel: channel.clone(),
            table: self.table.clone(),
            refs: self.refs.clone(),
            registry: registry.clone(),
            server: ExecServer::new(self.repository),
            renderer: self.renderer,
            snapshot: ViewValue::Null,
            mounted: false,
            snapshots: snapshots.clone(),
        };
        let task = tokio::spawn(session.run(frames));
        info!(root = self.mount_info.root.0, "host bridge serving");

        Ok(HostHandle {
            channel,
            refs: self.refs,
            registry,
            snapshots,
            table: self.table,
            task,
        })
    }
}

/// Ships ids this side mapped since the last flush, typically list items the
/// renderer bound. The peer merges them before any frame that follows.
fn flush_allocations(table: &SharedTable, channel: &Channel<Frame>) -> Result<(), BridgeError> {
    let mappings = lock(table).drain_allocations();
    if mappings.is_empty() {
        return Ok(());
    }
    trace!(count = mappings.len(), "announcing trusted allocations");
    channel.send(Frame::Mappings { mappings })?;
    Ok(())
}

struct HostSession<R: Renderer> {
    channel: Channel<Frame>,
    table: SharedTable,
    refs: ReferenceManager,
    registry: SharedRegistry,
    server: ExecServer,
    renderer: R,
    snapshot: ViewValue,
    mounted: bool,
    snapshots: Arc<SnapshotCell>,
}

impl<R: Renderer> HostSession<R> {
    async fn run(mut self, mut frames: FrameReceiver<Frame>) -> Result<(), BridgeError> {
        while let Some(frame) = frames.recv().await {
            trace!(frame = frame.name(), "host received frame");
            if let Err(e) = self.handle(frame) {
                error!(error = %e, "host bridge failed, closing channel");
                self.channel.close();
                return Err(e);
            }
            if let Err(e) = flush_allocations(&self.table, &self.channel) {
                debug!(error = %e, "allocations not announced, channel gone");
            }
        }
        info!(
            reason = ?self.channel.close_reason().map(|e| e.to_string()),
            "host bridge stopped"
        );
        Ok(())
    }

    fn handle(&mut self, frame: Frame) -> Result<(), BridgeError> {
        match frame {
            Frame::Mappings { mappings } => {
                let seeded = lock(&self.table).merge_mappings(&mappings)?;
                debug!(count = mappings.len(), seeded = seeded.len(), "merged peer mappings");
            }
            Frame::Register { mut registrations } => {
                {
                    let table = lock(&self.table);
                    for registration in &mut registrations {
                        registration.coordinate = table.local_id(registration.coordinate);
                    }
                }
                let mut registry = lock_registry(&self.registry);
                for registration in registrations {
                    let coordinate = registration.coordinate;
                    if let Err(e) = registry.register(registration) {
                        warn!(coordinate = coordinate.0, error = %e, "registration rejected");
                    }
                }
            }
            Frame::Unregister { coordinate, event } => {
                let coordinate = lock(&self.table).local_id(coordinate);
                lock_registry(&self.registry).unregister(coordinate, &event);
            }
            Frame::Release { coordinates } => {
                let coordinates: Vec<ComponentId> = {
                    let table = lock(&self.table);
                    coordinates.into_iter().map(|id| table.local_id(id)).collect()
                };
                let released = self.refs.release(&coordinates);
                lock_registry(&self.registry).remove_coordinates(&released);
                debug!(count = released.len(), "released peer coordinates");
            }
            Frame::Patch { patch } => {
                let next = apply(&patch, &self.snapshot)?;
                if self.mounted {
                    self.renderer.apply(&self.refs, &patch, &next);
                } else {
                    self.renderer.mount(&self.refs, &next);
                    self.mounted = true;
                }
                debug!(ops = patch.len(), "applied patch");
                self.snapshot = next.clone();
                self.snapshots.publish(next);
            }
            Frame::ExecReq(mut request) => {
                request.target = request.target.map(|id| lock(&self.table).local_id(id));
                let server = self.server.clone();
                let channel = self.channel.clone();
                let table = self.table.clone();
                tokio::spawn(async move {
                    let response = server
                        .handle(request, |id| lock(&table).contains(id))
                        .await;
                    if let Err(e) = channel.send(Frame::ExecRes(response)) {
                        debug!(error = %e, "dropping exec response, channel gone");
                    }
                });
            }
            Frame::Event(_) | Frame::ExecRes(_) => {
                warn!(frame = frame.name(), "untrusted side sent a trusted-only frame");
            }
        }
        Ok(())
    }
}

/// Running trusted-side bridge.
pub struct HostHandle {
    channel: Channel<Frame>,
    refs: ReferenceManager,
    registry: SharedRegistry,
    snapshots: Arc<SnapshotCell>,
    table: SharedTable,
    task: JoinHandle<Result<(), BridgeError>>,
}

impl HostHandle {
    /// Forwards a raw display event on `node`. Returns whether a frame was
    /// shipped; events nobody listens to stay on this side.
    pub fn dispatch(&self, node: NodeHandle, event: &str, raw: &Value) -> Result<bool, BridgeError> {
        let Some(coordinate) = self.refs.resolve(node) else {
            warn!(%node, event, "event on unbound node dropped");
            return Ok(false);
        };
        let frame = match lock_registry(&self.registry).reduce(coordinate, event, raw) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(false),
            Err(e) => {
                warn!(coordinate = coordinate.0, event, error = %e, "event dropped");
                return Ok(false);
            }
        };
        flush_allocations(&self.table, &self.channel)?;
        self.channel.send(Frame::Event(frame))?;
        trace!(coordinate = coordinate.0, event, "event forwarded");
        Ok(true)
    }

    pub fn refs(&self) -> &ReferenceManager {
        &self.refs
    }

    /// Latest replicated snapshot.
    pub fn snapshot(&self) -> ViewValue {
        self.snapshots.get()
    }

    pub fn snapshots(&self) -> watch::Receiver<ViewValue> {
        self.snapshots.subscribe()
    }

    pub fn snapshot_cell(&self) -> &Arc<SnapshotCell> {
        &self.snapshots
    }

    /// Resolves once the peer completed the handshake.
    pub async fn connected(&self) -> Result<(), BridgeError> {
        self.channel.connected().await?;
        Ok(())
    }

    pub fn is_registered(&self, coordinate: ComponentId, event: &str) -> bool {
        lock_registry(&self.registry)
            .extractor_of(coordinate, event)
            .is_some()
    }

    pub fn close(&self) {
        self.channel.close();
    }

    /// Waits for the session to end. A malformed patch from the peer surfaces
    /// here as [`BridgeError::Synchronization`].
    pub async fn join(self) -> Result<(), BridgeError> {
        self.task
            .await
            .map_err(|e| BridgeError::protocol(format!("host task failed: {e}")))?
    }
}
