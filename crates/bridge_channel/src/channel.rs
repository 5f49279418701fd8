//! Handshaked, sequenced channel on top of a raw transport.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::transport::{MessagePort, MessageSource, PostMessage};
use crate::ChannelError;

/// Payload types a channel can carry.
pub trait WireMessage: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> WireMessage for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Wire framing around application messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope<M> {
    HandshakeReq {
        attempt: u32,
        /// Nonce of the initiator's session; a new one starts sequencing over
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
    HandshakeAck {
        #[serde(default)]
        init: Option<Value>,
        /// Echo of the request's session
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
    Data {
        seq: u64,
        message: M,
    },
    Close,
}

/// Which end of the handshake this channel plays.
#[derive(Debug, Clone)]
pub enum Role {
    /// Sends handshake requests and retries until acknowledged
    Initiator,
    /// Answers every request with an ack carrying `init`. A request with a
    /// new session restarts sequencing in both directions.
    Acceptor { init: Option<Value> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Disconnected,
    Handshaking,
    Connected,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Handshaking => "handshaking",
            ChannelState::Connected => "connected",
            ChannelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Wait per handshake attempt
    pub handshake_timeout: Duration,
    /// Total handshake requests sent before giving up
    pub handshake_attempts: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(250),
            handshake_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub sent: u64,
    pub received: u64,
    pub buffered: u64,
    pub dropped: u64,
    /// Sessions that replaced an earlier one on this channel
    pub reconnects: u64,
}

/// Inbound data frames for one listener, in arrival order.
pub struct FrameReceiver<M> {
    rx: mpsc::UnboundedReceiver<M>,
}

impl<M> FrameReceiver<M> {
    /// Next frame, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<M> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<M> {
        self.rx.try_recv().ok()
    }
}

struct Shared<M> {
    state: ChannelState,
    /// Last sequence number sent
    next_seq: u64,
    /// Highest sequence number received
    last_seen: u64,
    outbound: VecDeque<M>,
    /// Frames that arrived before anyone listened
    backlog: VecDeque<M>,
    listeners: Vec<mpsc::UnboundedSender<M>>,
    init: Option<Value>,
    /// Current session nonce. Initiators pick it, acceptors learn it.
    session: Option<String>,
    error: Option<ChannelError>,
    stats: ChannelStats,
}

struct Inner<M> {
    sender: Arc<dyn PostMessage>,
    role: Role,
    config: ChannelConfig,
    state_tx: watch::Sender<ChannelState>,
    shared: Mutex<Shared<M>>,
}

impl<M: WireMessage> Inner<M> {
    fn lock(&self) -> MutexGuard<'_, Shared<M>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn post(&self, envelope: &Envelope<M>) -> Result<(), ChannelError> {
        let value =
            serde_json::to_value(envelope).map_err(|e| ChannelError::codec(e.to_string()))?;
        self.sender.post(value)
    }

    fn set_state(&self, shared: &mut Shared<M>, state: ChannelState) {
        if shared.state != state {
            debug!(from = %shared.state, to = %state, "channel state changed");
            shared.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn send_now(&self, shared: &mut Shared<M>, message: M) -> Result<(), ChannelError> {
        let seq = shared.next_seq + 1;
        self.post(&Envelope::Data { seq, message })?;
        shared.next_seq = seq;
        shared.stats.sent += 1;
        trace!(seq, "sent data frame");
        Ok(())
    }

    fn connect(&self, shared: &mut Shared<M>) {
        let queued = shared.outbound.len();
        while let Some(message) = shared.outbound.pop_front() {
            if let Err(error) = self.send_now(shared, message) {
                warn!(%error, "failed to flush buffered frame");
                break;
            }
        }
        if queued > 0 {
            debug!(queued, "flushed frames buffered during handshake");
        }
        self.set_state(shared, ChannelState::Connected);
    }

    fn on_handshake_request(&self, attempt: u32, session: Option<String>) {
        let Role::Acceptor { init } = &self.role else {
            debug!(attempt, "initiator ignoring handshake request");
            return;
        };
        let mut shared = self.lock();
        if shared.state == ChannelState::Closed {
            return;
        }
        let reconnect = shared.state == ChannelState::Connected && shared.session != session;
        if reconnect {
            info!(
                attempt,
                previous = ?shared.session,
                session = ?session,
                "peer started a new session, resetting sequence numbers"
            );
            shared.next_seq = 0;
            shared.last_seen = 0;
            shared.stats.reconnects += 1;
        }
        shared.session = session.clone();

        let ack = Envelope::HandshakeAck {
            init: init.clone(),
            session,
        };
        if let Err(error) = self.post(&ack) {
            warn!(attempt, %error, "failed to acknowledge handshake");
            return;
        }
        if shared.state == ChannelState::Connected {
            if !reconnect {
                trace!(attempt, "re-acknowledged handshake");
            }
        } else {
            debug!(attempt, "handshake accepted");
            self.connect(&mut shared);
        }
    }

    fn on_ack(&self, init: Option<Value>, session: Option<String>) {
        if matches!(self.role, Role::Acceptor { .. }) {
            debug!("acceptor ignoring handshake ack");
            return;
        }
        let mut shared = self.lock();
        if shared.state != ChannelState::Handshaking {
            trace!(state = %shared.state, "ignoring late handshake ack");
            return;
        }
        if session.is_some() && session != shared.session {
            debug!(session = ?session, "ignoring ack for an earlier session");
            return;
        }
        shared.init = init;
        self.connect(&mut shared);
    }

    fn on_data(&self, seq: u64, message: M) {
        let mut shared = self.lock();
        if shared.state != ChannelState::Connected {
            shared.stats.dropped += 1;
            debug!(seq, state = %shared.state, "dropping data frame outside connected state");
            return;
        }
        if seq <= shared.last_seen {
            shared.stats.dropped += 1;
            debug!(seq, last = shared.last_seen, "dropping duplicate data frame");
            return;
        }
        if seq != shared.last_seen + 1 {
            warn!(seq, expected = shared.last_seen + 1, "sequence gap on inbound frames");
        }
        shared.last_seen = seq;
        shared.stats.received += 1;

        if shared.listeners.is_empty() {
            shared.backlog.push_back(message);
            return;
        }
        shared
            .listeners
            .retain(|listener| listener.send(message.clone()).is_ok());
    }

    fn shutdown_locked(&self, shared: &mut Shared<M>, error: ChannelError, notify_peer: bool) {
        if shared.state == ChannelState::Closed {
            return;
        }
        if notify_peer && shared.state == ChannelState::Connected {
            if let Err(e) = self.post(&Envelope::Close) {
                trace!(error = %e, "peer already gone while closing");
            }
        }
        debug!(reason = %error, "closing channel");
        shared.error = Some(error);
        shared.outbound.clear();
        shared.backlog.clear();
        shared.listeners.clear();
        self.set_state(shared, ChannelState::Closed);
    }

    fn shutdown(&self, error: ChannelError, notify_peer: bool) {
        let mut shared = self.lock();
        self.shutdown_locked(&mut shared, error, notify_peer);
    }

    fn exhaust(&self, attempts: u32) {
        let mut shared = self.lock();
        if shared.state == ChannelState::Handshaking {
            warn!(attempts, "handshake was never acknowledged");
            self.shutdown_locked(&mut shared, ChannelError::handshake_exhausted(attempts), false);
        }
    }
}

async fn until_closed(state_rx: &mut watch::Receiver<ChannelState>) {
    let _ = state_rx.wait_for(|s| *s == ChannelState::Closed).await;
}

async fn until_settled(state_rx: &mut watch::Receiver<ChannelState>) {
    let _ = state_rx
        .wait_for(|s| *s != ChannelState::Handshaking)
        .await;
}

async fn read_loop<M: WireMessage, S: MessageSource>(inner: Arc<Inner<M>>, mut source: S) {
    let mut state_rx = inner.state_tx.subscribe();
    loop {
        let raw = tokio::select! {
            raw = source.next_message() => raw,
            _ = until_closed(&mut state_rx) => break,
        };
        let Some(raw) = raw else {
            inner.shutdown(ChannelError::closed("transport ended"), false);
            break;
        };
        let envelope: Envelope<M> = match serde_json::from_value(raw) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, "dropping undecodable frame");
                inner.lock().stats.dropped += 1;
                continue;
            }
        };
        match envelope {
            Envelope::HandshakeReq { attempt, session } => {
                inner.on_handshake_request(attempt, session)
            }
            Envelope::HandshakeAck { init, session } => inner.on_ack(init, session),
            Envelope::Data { seq, message } => inner.on_data(seq, message),
            Envelope::Close => {
                inner.shutdown(ChannelError::closed("peer closed the channel"), false);
                break;
            }
        }
    }
    trace!("channel reader stopped");
}

async fn drive_handshake<M: WireMessage>(inner: Arc<Inner<M>>, session: String) {
    let attempts = inner.config.handshake_attempts;
    let mut state_rx = inner.state_tx.subscribe();
    for attempt in 1..=attempts {
        if *state_rx.borrow() != ChannelState::Handshaking {
            return;
        }
        debug!(attempt, attempts, %session, "sending handshake request");
        let request = Envelope::HandshakeReq {
            attempt,
            session: Some(session.clone()),
        };
        if let Err(error) = inner.post(&request) {
            inner.shutdown(error, false);
            return;
        }
        let settled = until_settled(&mut state_rx);
        if tokio::time::timeout(inner.config.handshake_timeout, settled)
            .await
            .is_ok()
        {
            return;
        }
    }
    inner.exhaust(attempts);
}

/// Duplex channel carrying `M` messages after a handshake.
///
/// Cloning yields another handle to the same channel.
pub struct Channel<M> {
    inner: Arc<Inner<M>>,
}

impl<M> Clone for Channel<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: WireMessage> Channel<M> {
    /// Opens a channel on an in-memory port. Must be called inside a tokio
    /// runtime.
    pub fn open(port: MessagePort, role: Role, config: ChannelConfig) -> Self {
        let (sender, receiver) = port.split();
        Self::open_with(Arc::new(sender), receiver, role, config)
    }

    /// Opens a channel on any transport.
    pub fn open_with<S>(
        sender: Arc<dyn PostMessage>,
        source: S,
        role: Role,
        config: ChannelConfig,
    ) -> Self
    where
        S: MessageSource + 'static,
    {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let inner = Arc::new(Inner {
            sender,
            role,
            config,
            state_tx,
            shared: Mutex::new(Shared {
                state: ChannelState::Disconnected,
                next_seq: 0,
                last_seen: 0,
                outbound: VecDeque::new(),
                backlog: VecDeque::new(),
                listeners: Vec::new(),
                init: None,
                session: None,
                error: None,
                stats: ChannelStats::default(),
            }),
        });
        let session = {
            let mut shared = inner.lock();
            inner.set_state(&mut shared, ChannelState::Handshaking);
            if matches!(inner.role, Role::Initiator) {
                let session = Uuid::new_v4().to_string();
                shared.session = Some(session.clone());
                Some(session)
            } else {
                None
            }
        };

        tokio::spawn(read_loop(inner.clone(), source));
        if let Some(session) = session {
            tokio::spawn(drive_handshake(inner.clone(), session));
        }
        Self { inner }
    }

    /// Sends `message`, buffering it until the handshake completes.
    pub fn send(&self, message: M) -> Result<(), ChannelError> {
        let mut shared = self.inner.lock();
        match shared.state {
            ChannelState::Closed => Err(ChannelError::closed("channel is closed")),
            ChannelState::Connected => self.inner.send_now(&mut shared, message),
            ChannelState::Disconnected | ChannelState::Handshaking => {
                shared.outbound.push_back(message);
                shared.stats.buffered += 1;
                trace!(queued = shared.outbound.len(), "buffered frame until connected");
                Ok(())
            }
        }
    }

    /// Registers a listener for inbound data frames. Frames that arrived
    /// before the first listener are replayed to it.
    pub fn listen(&self) -> FrameReceiver<M> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = self.inner.lock();
        if shared.state != ChannelState::Closed {
            for message in shared.backlog.drain(..) {
                let _ = tx.send(message);
            }
            shared.listeners.push(tx);
        }
        FrameReceiver { rx }
    }

    /// Resolves once the handshake settles, with the ack's init payload.
    pub async fn connected(&self) -> Result<Option<Value>, ChannelError> {
        let mut state_rx = self.inner.state_tx.subscribe();
        let state = state_rx
            .wait_for(|s| matches!(s, ChannelState::Connected | ChannelState::Closed))
            .await
            .map(|s| *s)
            .unwrap_or(ChannelState::Closed);

        let shared = self.inner.lock();
        match state {
            ChannelState::Connected => Ok(shared.init.clone()),
            _ => Err(shared
                .error
                .clone()
                .unwrap_or_else(|| ChannelError::closed("channel is closed"))),
        }
    }

    /// Resolves once the channel is closed, for whatever reason.
    pub async fn closed(&self) {
        let mut state_rx = self.inner.state_tx.subscribe();
        until_closed(&mut state_rx).await;
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> ChannelStats {
        self.inner.lock().stats
    }

    /// Why the channel closed, if it has.
    pub fn close_reason(&self) -> Option<ChannelError> {
        self.inner.lock().error.clone()
    }

    /// Starts a new session over the same transport: fresh nonce, sequence
    /// numbers back to zero, and a new handshake. Sends made until the peer
    /// acknowledges are buffered. Acceptors follow their peer and do nothing
    /// here. Must be called inside a tokio runtime.
    pub fn reconnect(&self) -> Result<(), ChannelError> {
        if matches!(self.inner.role, Role::Acceptor { .. }) {
            debug!("acceptor waits for the peer to reconnect");
            return Ok(());
        }
        let session = Uuid::new_v4().to_string();
        {
            let mut shared = self.inner.lock();
            if shared.state == ChannelState::Closed {
                return Err(ChannelError::closed("channel is closed"));
            }
            info!(previous = ?shared.session, %session, "reconnecting");
            shared.session = Some(session.clone());
            shared.next_seq = 0;
            shared.last_seen = 0;
            shared.stats.reconnects += 1;
            self.inner.set_state(&mut shared, ChannelState::Handshaking);
        }
        tokio::spawn(drive_handshake(self.inner.clone(), session));
        Ok(())
    }

    /// Closes the channel and tells the peer. Idempotent.
    pub fn close(&self) {
        self.inner
            .shutdown(ChannelError::closed("channel closed locally"), true);
    }
}
