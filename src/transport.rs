//! Duplex message transport: opaque byte-string messages, owned
//! exclusively by one session at a time.

use crate::error::SyncError;
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::SinkExt;
use futures::StreamExt;

/// A message-oriented duplex channel. Messages are opaque; [`crate::sync`]
/// is the only caller that interprets their bytes.
#[async_trait]
pub trait Transport: Send {
    /// Sends one message. Resolves once the transport has accepted it for
    /// delivery, not once the remote has received it.
    async fn send(&mut self, msg: Vec<u8>) -> Result<(), SyncError>;

    /// Waits for the next inbound message. Returns `None` once the
    /// transport is closed and no further messages will arrive.
    async fn recv(&mut self) -> Option<Vec<u8>>;

    /// Closes the transport. Idempotent.
    fn close(&mut self);
}

/// An in-process duplex pair backed by two `futures::channel::mpsc`
/// queues, for tests and same-process replicas.
pub struct InMemoryTransport {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl InMemoryTransport {
    /// Builds a connected pair: messages sent on one side arrive on the
    /// other's `recv`.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded();
        let (b_tx, a_rx) = mpsc::unbounded();
        (
            Self {
                tx: Some(a_tx),
                rx: a_rx,
            },
            Self {
                tx: Some(b_tx),
                rx: b_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&mut self, msg: Vec<u8>) -> Result<(), SyncError> {
        match &mut self.tx {
            Some(tx) => tx
                .send(msg)
                .await
                .map_err(|e| SyncError::TransportError(e.to_string())),
            None => Err(SyncError::TransportError("transport closed".into())),
        }
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.next().await
    }

    fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn messages_cross_the_pair_in_order() {
        let (mut a, mut b) = InMemoryTransport::pair();
        a.send(vec![1]).await.unwrap();
        a.send(vec![2]).await.unwrap();
        assert_eq!(b.recv().await, Some(vec![1]));
        assert_eq!(b.recv().await, Some(vec![2]));
    }

    #[async_std::test]
    async fn closing_ends_the_receive_stream() {
        let (mut a, mut b) = InMemoryTransport::pair();
        a.close();
        assert_eq!(b.recv().await, None);
    }
}
