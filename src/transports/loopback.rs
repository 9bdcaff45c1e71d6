//! In-process transport pair.
//!
//! [`loopback_pair`] returns two connected [`LoopbackTransport`] ends. It lets
//! a [`RelayChannel`](crate::backends::relay::RelayChannel) talk to a relay
//! served by [`serve_channel`](crate::backends::relay::serve_channel) in the
//! same process, which is how the relay protocol is tested and demonstrated.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ListeningRoomError;
use crate::transport::Transport;

/// One end of an in-process text message pipe.
#[derive(Debug)]
pub struct LoopbackTransport {
    outgoing: Option<mpsc::UnboundedSender<String>>,
    incoming: mpsc::UnboundedReceiver<String>,
}

/// Two connected transport ends. What one sends, the other receives.
pub fn loopback_pair() -> (LoopbackTransport, LoopbackTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        LoopbackTransport {
            outgoing: Some(a_tx),
            incoming: b_rx,
        },
        LoopbackTransport {
            outgoing: Some(b_tx),
            incoming: a_rx,
        },
    )
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), ListeningRoomError> {
        let outgoing = self
            .outgoing
            .as_ref()
            .ok_or(ListeningRoomError::TransportClosed)?;
        outgoing
            .send(message)
            .map_err(|_| ListeningRoomError::TransportSend("peer hung up".into()))
    }

    async fn recv(&mut self) -> Option<Result<String, ListeningRoomError>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), ListeningRoomError> {
        // Dropping the sender ends the peer's stream.
        self.outgoing = None;
        self.incoming.close();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_cross_over() {
        let (mut a, mut b) = loopback_pair();
        a.send("hello".into()).await.unwrap();
        assert_eq!(b.recv().await.unwrap().unwrap(), "hello");
    }

    #[tokio::test]
    async fn close_ends_peer_stream() {
        let (mut a, mut b) = loopback_pair();
        a.close().await.unwrap();
        assert!(b.recv().await.is_none());
        assert!(matches!(
            a.send("late".into()).await,
            Err(ListeningRoomError::TransportClosed)
        ));
        a.close().await.unwrap();
    }
}
