//! Untrusted side of the bridge.

use bridge_channel::{Channel, ChannelError, ChannelState, FrameReceiver, MessagePort, Role};
use bridge_coords::{lock, ComponentId, CoordinateTable, SharedTable};
use bridge_exec::ExecClient;
use bridge_patch::{diff, ViewValue};
use bridge_refs::{
    HandlerTable, RefError, Registration, RegistrationChange, SecureReferenceManager,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::component::{forward_snapshots, Component, ComponentContext, SnapshotCell};
use crate::config::BridgeConfig;
use crate::frame::{Frame, FrameSink, MountInfo};
use crate::BridgeError;

/// Entry point for mounting a component on the untrusted side.
pub struct SecureBridge;

impl SecureBridge {
    /// Connects on `port`, builds the proxy refs from the peer's mount info,
    /// constructs the component and ships its first snapshot.
    ///
    /// Later snapshots are shipped whenever the component invalidates, and
    /// whenever its [`Component::snapshot_source`] publishes one.
    pub async fn mount<P, C, F>(
        config: &BridgeConfig,
        port: MessagePort,
        props: P,
        constructor: F,
    ) -> Result<SecureHandle, BridgeError>
    where
        C: Component,
        F: FnOnce(P, &SecureReferenceManager, ComponentContext) -> Result<C, RefError>,
    {
        config.validate()?;
        let channel: Channel<Frame> =
            Channel::open(port, Role::Initiator, config.channel_config());
        let frames = channel.listen();

        let init = channel.connected().await?.ok_or_else(|| {
            channel.close();
            BridgeError::protocol("handshake ack carried no mount info")
        })?;
        let info: MountInfo = serde_json::from_value(init).map_err(|e| {
            channel.close();
            BridgeError::protocol(format!("decoding mount info: {e}"))
        })?;
        debug!(root = info.root.0, mapped = info.mappings.len(), "received mount info");

        let table = CoordinateTable::new(config.untrusted_space()?).shared();
        lock(&table).add_mappings(&info.mappings)?;
        let handlers = HandlerTable::new();
        let refs = SecureReferenceManager::proxy(handlers.clone(), table.clone(), info.root, info.shape);

        let exec = ExecClient::new(Arc::new(FrameSink(channel.clone())));
        let ctx = ComponentContext::new(Some(exec.clone()));
        let component = constructor(props, &refs, ctx.clone()).inspect_err(|_| channel.close())?;

        let (pushed_tx, pushed) = mpsc::unbounded_channel();
        if let Some(source) = component.snapshot_source() {
            forward_snapshots(source, pushed_tx);
            debug!("component publishes its own snapshots");
        }

        let snapshots = Arc::new(SnapshotCell::default());
        let known = lock(&table).mappings().into_iter().map(|m| m.id).collect();
        let mut session = SecureSession {
            channel: channel.clone(),
            table,
            handlers,
            exec: exec.clone(),
            ctx: ctx.clone(),
            component,
            snapshot: ViewValue::Null,
            known,
            snapshots: snapshots.clone(),
        };
        session.sync()?;
        info!(root = info.root.0, "component mounted on untrusted side");

        let task = tokio::spawn(session.run(frames, pushed));
        Ok(SecureHandle {
            channel,
            exec,
            refs,
            ctx,
            snapshots,
            task,
        })
    }
}

struct SecureSession<C: Component> {
    channel: Channel<Frame>,
    table: SharedTable,
    handlers: HandlerTable,
    exec: ExecClient,
    ctx: ComponentContext,
    component: C,
    snapshot: ViewValue,
    /// Ids the peer has been told about
    known: BTreeSet<ComponentId>,
    snapshots: Arc<SnapshotCell>,
}

impl<C: Component> SecureSession<C> {
    async fn run(
        mut self,
        mut frames: FrameReceiver<Frame>,
        mut pushed: mpsc::UnboundedReceiver<ViewValue>,
    ) -> Result<(), BridgeError> {
        let outcome = loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = self.handle(frame) {
                            error!(error = %e, "secure bridge failed, closing channel");
                            self.channel.close();
                            self.exec.close();
                            return Err(e);
                        }
                    }
                    None => break Ok(()),
                },
                _ = self.ctx.invalidated() => {
                    if self.ctx.take_dirty() {
                        if let Err(e) = self.sync() {
                            break Err(e);
                        }
                    }
                }
                Some(snapshot) = pushed.recv() => {
                    trace!("component published a snapshot");
                    if let Err(e) = self.sync_to(snapshot) {
                        break Err(e);
                    }
                }
            }
        };

        let rejected = self.exec.close();
        info!(
            rejected,
            reason = ?self.channel.close_reason().map(|e| e.to_string()),
            "secure bridge stopped"
        );
        match outcome {
            Err(_) if self.channel.state() == ChannelState::Closed => Ok(()),
            other => other,
        }
    }

    fn handle(&mut self, frame: Frame) -> Result<(), BridgeError> {
        match frame {
            Frame::Event(event) => {
                let coordinate = lock(&self.table).local_id(event.coordinate);
                if let Err(e) = self
                    .handlers
                    .dispatch(coordinate, &event.event, &event.payload)
                {
                    warn!(coordinate = coordinate.0, event = %event.event, error = %e, "event dropped");
                }
            }
            Frame::ExecRes(response) => {
                self.exec.resolve(response);
            }
            Frame::Mappings { mappings } => {
                let seeded = lock(&self.table).merge_mappings(&mappings)?;
                debug!(count = mappings.len(), seeded = seeded.len(), "merged trusted allocations");
                self.known.extend(seeded);
            }
            other => {
                warn!(frame = other.name(), "trusted side sent an untrusted-only frame");
            }
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<(), BridgeError> {
        let next = self.component.render();
        self.sync_to(next)
    }

    /// Ships everything the peer needs for `next`: releases, then mappings,
    /// then registrations, then the patch.
    fn sync_to(&mut self, next: ViewValue) -> Result<(), BridgeError> {
        let (released, mappings) = {
            let mut table = lock(&self.table);
            let live: BTreeSet<ComponentId> = table.mappings().into_iter().map(|m| m.id).collect();
            let released: Vec<ComponentId> = self.known.difference(&live).copied().collect();
            self.known = live;
            (released, table.drain_allocations())
        };

        if !released.is_empty() {
            self.send(Frame::Release {
                coordinates: released,
            })?;
        }
        if !mappings.is_empty() {
            self.send(Frame::Mappings { mappings })?;
        }
        self.ship_registrations()?;

        let patch = diff(&self.snapshot, &next, &self.component.array_contexts());
        if patch.is_empty() {
            trace!("render produced no changes");
        } else {
            debug!(ops = patch.len(), "shipping patch");
            self.send(Frame::Patch { patch })?;
        }
        self.snapshot = next.clone();
        self.snapshots.publish(next);
        Ok(())
    }

    fn ship_registrations(&self) -> Result<(), BridgeError> {
        let mut batch: Vec<Registration> = Vec::new();
        for change in self.handlers.drain_changes() {
            match change {
                RegistrationChange::Register(registration) => batch.push(registration),
                RegistrationChange::Unregister { coordinate, event } => {
                    if !batch.is_empty() {
                        self.send(Frame::Register {
                            registrations: std::mem::take(&mut batch),
                        })?;
                    }
                    self.send(Frame::Unregister { coordinate, event })?;
                }
            }
        }
        if !batch.is_empty() {
            self.send(Frame::Register {
                registrations: batch,
            })?;
        }
        Ok(())
    }

    fn send(&self, frame: Frame) -> Result<(), BridgeError> {
        self.channel.send(frame).map_err(BridgeError::from)
    }
}

/// Running untrusted-side bridge.
pub struct SecureHandle {
    channel: Channel<Frame>,
    exec: ExecClient,
    refs: SecureReferenceManager,
    ctx: ComponentContext,
    snapshots: Arc<SnapshotCell>,
    task: JoinHandle<Result<(), BridgeError>>,
}

impl SecureHandle {
    pub fn refs(&self) -> &SecureReferenceManager {
        &self.refs
    }

    pub fn exec(&self) -> &ExecClient {
        &self.exec
    }

    /// Snapshot most recently shipped to the trusted side.
    pub fn snapshot(&self) -> ViewValue {
        self.snapshots.get()
    }

    pub fn snapshots(&self) -> watch::Receiver<ViewValue> {
        self.snapshots.subscribe()
    }

    /// Same as the component calling [`ComponentContext::invalidate`].
    pub fn invalidate(&self) {
        self.ctx.invalidate();
    }

    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn close_reason(&self) -> Option<ChannelError> {
        self.channel.close_reason()
    }

    /// Closes the channel and rejects outstanding exec calls.
    pub fn close(&self) {
        self.channel.close();
        self.exec.close();
    }

    pub async fn join(self) -> Result<(), BridgeError> {
        self.task
            .await
            .map_err(|e| BridgeError::protocol(format!("secure task failed: {e}")))?
    }
}
