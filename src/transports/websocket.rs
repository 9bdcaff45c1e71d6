//! WebSocket relay transport using `tokio-tungstenite`.
//!
//! [`WebSocketTransport`] carries relay messages as WebSocket text frames.
//! Clients dial a relay with [`connect`](WebSocketTransport::connect); a relay
//! wraps each accepted TCP connection with
//! [`accept`](WebSocketTransport::accept) and hands it to
//! [`serve_channel`](crate::backends::relay::serve_channel).
//!
//! ```rust,no_run
//! # async fn example() -> listening_room::Result<()> {
//! use std::sync::Arc;
//! use listening_room::backends::relay::{RelayChannel, RelayConfig};
//! use listening_room::WebSocketTransport;
//!
//! let transport = WebSocketTransport::connect("wss://relay.example/rooms").await?;
//! let channel = Arc::new(RelayChannel::start(transport, RelayConfig::default()));
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, info, warn};

use crate::error::ListeningRoomError;
use crate::transport::Transport;

/// The underlying WebSocket stream, plain or TLS.
pub type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What a received frame means for the relay protocol.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Text(String),
    Closed,
    Skip,
}

fn classify(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text.to_string()),
        Message::Close(frame) => {
            debug!(?frame, "relay sent close frame");
            Frame::Closed
        }
        // tungstenite answers pings itself.
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Frame::Skip,
        Message::Binary(bytes) => {
            warn!(len = bytes.len(), "binary frame on relay connection, skipping");
            Frame::Skip
        }
    }
}

fn connect_error(error: tokio_tungstenite::tungstenite::Error) -> ListeningRoomError {
    let kind = match &error {
        tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
        _ => std::io::ErrorKind::Other,
    };
    ListeningRoomError::Io(std::io::Error::new(kind, error))
}

/// A [`Transport`] over one WebSocket connection.
///
/// `recv` is cancel-safe.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Dial a relay at a `ws://` or `wss://` URL.
    ///
    /// # Errors
    ///
    /// [`ListeningRoomError::Io`] when the URL is invalid or the handshake
    /// fails. The I/O error kind is kept when there is one.
    pub async fn connect(url: &str) -> Result<Self, ListeningRoomError> {
        debug!(url, "connecting to relay");
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(connect_error)?;
        info!(url, "relay connection established");
        Ok(Self::from_stream(stream))
    }

    /// Like [`connect`](Self::connect), failing with
    /// [`ListeningRoomError::Timeout`] after `timeout`.
    pub async fn connect_with_timeout(
        url: &str,
        timeout: Duration,
    ) -> Result<Self, ListeningRoomError> {
        tokio::time::timeout(timeout, Self::connect(url))
            .await
            .map_err(|_| ListeningRoomError::Timeout)?
    }

    /// Complete the server side of the handshake on an accepted connection.
    pub async fn accept(tcp: TcpStream) -> Result<Self, ListeningRoomError> {
        let peer = tcp.peer_addr().ok();
        let stream = tokio_tungstenite::accept_async(MaybeTlsStream::Plain(tcp))
            .await
            .map_err(connect_error)?;
        debug!(?peer, "accepted relay client");
        Ok(Self::from_stream(stream))
    }

    /// Wrap a stream set up elsewhere (custom TLS, proxies, headers).
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: String) -> Result<(), ListeningRoomError> {
        if self.closed {
            return Err(ListeningRoomError::TransportClosed);
        }
        self.stream
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| ListeningRoomError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, ListeningRoomError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(ListeningRoomError::TransportReceive(e.to_string()))),
            };
            match classify(message) {
                Frame::Text(text) => return Some(Ok(text)),
                Frame::Closed => return None,
                Frame::Skip => {}
            }
        }
    }

    async fn close(&mut self) -> Result<(), ListeningRoomError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| ListeningRoomError::TransportSend(e.to_string()))
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn frames_are_classified() {
        assert_eq!(
            classify(Message::Text("{}".into())),
            Frame::Text("{}".into())
        );
        assert_eq!(classify(Message::Close(None)), Frame::Closed);
        assert_eq!(classify(Message::Ping(vec![1].into())), Frame::Skip);
        assert_eq!(classify(Message::Binary(vec![0xDE].into())), Frame::Skip);
    }

    #[tokio::test]
    async fn connect_fails_with_invalid_url() {
        let err = WebSocketTransport::connect("not-a-url").await.unwrap_err();
        assert!(matches!(err, ListeningRoomError::Io(_)));
    }

    #[tokio::test]
    async fn connect_with_timeout_times_out() {
        // Accepts the TCP connection but never answers the handshake.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stalled = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(tcp);
        });

        let err = WebSocketTransport::connect_with_timeout(
            &format!("ws://{addr}"),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ListeningRoomError::Timeout));
        stalled.abort();
    }

    /// Accept one connection with [`WebSocketTransport::accept`] and run
    /// `handler` on it.
    async fn start_relay<F, Fut>(handler: F) -> String
    where
        F: FnOnce(WebSocketTransport) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let transport = WebSocketTransport::accept(tcp).await.unwrap();
            handler(transport).await;
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn accepted_and_dialed_ends_exchange_text() {
        let url = start_relay(|mut relay| async move {
            let request = relay.recv().await.unwrap().unwrap();
            relay.send(format!("echo:{request}")).await.unwrap();
            relay.close().await.unwrap();
        })
        .await;

        let mut client = WebSocketTransport::connect(&url).await.unwrap();
        client.send(r#"{"type":"Ping"}"#.into()).await.unwrap();
        assert_eq!(
            client.recv().await.unwrap().unwrap(),
            r#"echo:{"type":"Ping"}"#
        );
        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_after_close_is_rejected_and_close_is_idempotent() {
        let url = start_relay(|mut relay| async move { while let Some(Ok(_)) = relay.recv().await {} })
            .await;

        let mut client = WebSocketTransport::connect(&url).await.unwrap();
        client.close().await.unwrap();
        client.close().await.unwrap();
        let err = client.send("late".into()).await.unwrap_err();
        assert!(matches!(err, ListeningRoomError::TransportClosed));
    }
}
