//! Communication channels for the conclave host

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::error::ConclaveError;
use crate::protocol::{Event, Op};

/// Host-side ends: operations in, events out
pub struct ChannelPair {
    pub op_rx: mpsc::UnboundedReceiver<Op>,
    pub event_tx: mpsc::UnboundedSender<Event>,
}

/// Client-side channel for driving a running `Conclave`
#[derive(Clone)]
pub struct ConclaveChannel {
    op_tx: mpsc::UnboundedSender<Op>,
    event_rx: Arc<Mutex<mpsc::UnboundedReceiver<Event>>>,
}

impl ConclaveChannel {
    /// Create the client channel and the host's channel pair
    pub fn new() -> (Self, ChannelPair) {
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let channel = Self {
            op_tx,
            event_rx: Arc::new(Mutex::new(event_rx)),
        };

        (channel, ChannelPair { op_rx, event_tx })
    }

    /// Submit an operation to the host
    pub fn send(&self, op: Op) -> Result<(), ConclaveError> {
        self.op_tx.send(op).map_err(|_| ConclaveError::ChannelClosed)
    }

    /// Receive an event if one is ready
    pub fn try_recv(&self) -> Option<Event> {
        self.event_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Wait for the next event; `None` once the host has stopped
    pub async fn recv(&self) -> Option<Event> {
        self.event_rx.lock().await.recv().await
    }

    /// Drain every event that is ready
    pub fn drain(&self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.op_tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_creation() {
        let (channel, _pair) = ConclaveChannel::new();
        assert!(!channel.is_closed());
    }

    #[test]
    fn test_send_op() {
        let (channel, mut pair) = ConclaveChannel::new();
        channel
            .send(Op::Cancel {
                reason: "test".into(),
            })
            .unwrap();
        assert!(matches!(pair.op_rx.try_recv(), Ok(Op::Cancel { .. })));
    }

    #[test]
    fn test_send_after_host_dropped() {
        let (channel, pair) = ConclaveChannel::new();
        drop(pair);
        assert!(channel.is_closed());
        assert!(matches!(channel.send(Op::Shutdown), Err(ConclaveError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_receive_event() {
        let (channel, pair) = ConclaveChannel::new();
        pair.event_tx
            .send(Event::UserMessage {
                text: "hello".into(),
            })
            .unwrap();
        pair.event_tx
            .send(Event::TaskLimitReached { active: 7, limit: 7 })
            .unwrap();

        assert!(matches!(channel.recv().await, Some(Event::UserMessage { .. })));
        assert_eq!(channel.drain().len(), 1);
    }
}
