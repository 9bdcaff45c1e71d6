//! Transport abstraction for the relay protocol.
//!
//! A [`RelayChannel`](crate::backends::relay::RelayChannel) reaches a remote
//! room state channel by exchanging JSON text messages
//! ([`ChannelRequest`](crate::protocol::ChannelRequest) one way,
//! [`ChannelNotice`](crate::protocol::ChannelNotice) the other) over a
//! [`Transport`]. The same trait is used on the relay side by
//! [`serve_channel`](crate::backends::relay::serve_channel).
//!
//! Connection setup is not part of the trait. Construct a connected
//! transport, then hand it over.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use listening_room::error::ListeningRoomError;
//! use listening_room::transport::Transport;
//! use tokio::sync::mpsc;
//!
//! struct QueueTransport {
//!     outgoing: mpsc::UnboundedSender<String>,
//!     incoming: mpsc::UnboundedReceiver<String>,
//! }
//!
//! #[async_trait]
//! impl Transport for QueueTransport {
//!     async fn send(&mut self, message: String) -> Result<(), ListeningRoomError> {
//!         self.outgoing
//!             .send(message)
//!             .map_err(|_| ListeningRoomError::TransportClosed)
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, ListeningRoomError>> {
//!         self.incoming.recv().await.map(Ok)
//!     }
//!
//!     async fn close(&mut self) -> Result<(), ListeningRoomError> {
//!         self.incoming.close();
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::ListeningRoomError;

/// A bidirectional text message transport.
///
/// Each call to [`send`](Transport::send) transmits one complete JSON
/// message and each call to [`recv`](Transport::recv) returns one; framing is
/// the transport's business.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) **must** be cancel-safe: it is polled inside
/// `tokio::select!`, and a cancelled call must not lose a message.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send one JSON text message.
    ///
    /// # Errors
    ///
    /// [`ListeningRoomError::TransportSend`] or
    /// [`ListeningRoomError::TransportClosed`].
    async fn send(&mut self, message: String) -> Result<(), ListeningRoomError>;

    /// Receive the next JSON text message.
    ///
    /// `None` means the peer closed the connection cleanly.
    async fn recv(&mut self) -> Option<Result<String, ListeningRoomError>>;

    /// Close the connection. Closing twice succeeds.
    async fn close(&mut self) -> Result<(), ListeningRoomError>;
}
