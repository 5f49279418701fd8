//! Raw transport seam: a non-blocking `post` and an async message source.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::ChannelError;

/// Fire-and-forget send of one structured message to the peer context.
pub trait PostMessage: Send + Sync {
    fn post(&self, message: Value) -> Result<(), ChannelError>;
}

/// Inbound half of a transport. `None` means the transport is gone.
#[async_trait]
pub trait MessageSource: Send {
    async fn next_message(&mut self) -> Option<Value>;
}

/// One end of an in-memory entangled port pair.
pub struct MessagePort {
    sender: PortSender,
    receiver: PortReceiver,
}

/// Creates two entangled ports: what one posts, the other receives.
pub fn port_pair() -> (MessagePort, MessagePort) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MessagePort {
            sender: PortSender(a_tx),
            receiver: PortReceiver(b_rx),
        },
        MessagePort {
            sender: PortSender(b_tx),
            receiver: PortReceiver(a_rx),
        },
    )
}

impl MessagePort {
    pub fn split(self) -> (PortSender, PortReceiver) {
        (self.sender, self.receiver)
    }
}

#[derive(Clone)]
pub struct PortSender(mpsc::UnboundedSender<Value>);

impl PostMessage for PortSender {
    fn post(&self, message: Value) -> Result<(), ChannelError> {
        self.0
            .send(message)
            .map_err(|_| ChannelError::transport("peer port was dropped"))
    }
}

pub struct PortReceiver(mpsc::UnboundedReceiver<Value>);

#[async_trait]
impl MessageSource for PortReceiver {
    async fn next_message(&mut self) -> Option<Value> {
        self.0.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_port_pair_is_entangled() {
        let (a, b) = port_pair();
        let (a_tx, mut a_rx) = a.split();
        let (b_tx, mut b_rx) = b.split();

        a_tx.post(json!({"from": "a"})).unwrap();
        b_tx.post(json!({"from": "b"})).unwrap();
        assert_eq!(b_rx.next_message().await, Some(json!({"from": "a"})));
        assert_eq!(a_rx.next_message().await, Some(json!({"from": "b"})));

        drop(b_rx);
        let err = a_tx.post(json!(1)).unwrap_err();
        assert!(matches!(err, ChannelError::Transport { .. }));
    }
}
