#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for listening-room integration tests.
//!
//! Provides a channel-driven [`MockTransport`] with its [`MockPeer`], a
//! [`FakePlayer`] whose state stays inspectable after it is moved into a
//! session, and fixtures for tracks, configuration and rooms.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use listening_room::backends::memory::{MemoryChannel, MemoryStore};
use listening_room::config::RetryPolicy;
use listening_room::protocol::{ChannelNotice, ChannelRequest};
use listening_room::{
    ListeningRoomError, LocalPlayer, RoomConfig, RoomEvent, RoomManager, Track, Transport,
};
use tokio::sync::mpsc;

/// Deadline for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(2);

// ── MockTransport ───────────────────────────────────────────────────

type Incoming = Option<Result<String, ListeningRoomError>>;

/// A transport whose other end is driven by the test through [`MockPeer`].
pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<Incoming>,
    sent: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

/// The test's end of a [`MockTransport`].
pub struct MockPeer {
    incoming: mpsc::UnboundedSender<Incoming>,
    sent: mpsc::UnboundedReceiver<String>,
    pub closed: Arc<AtomicBool>,
}

impl MockTransport {
    pub fn new() -> (Self, MockPeer) {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        (
            Self {
                incoming: incoming_rx,
                sent: sent_tx,
                closed: Arc::clone(&closed),
            },
            MockPeer {
                incoming: incoming_tx,
                sent: sent_rx,
                closed,
            },
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: String) -> Result<(), ListeningRoomError> {
        self.sent
            .send(message)
            .map_err(|_| ListeningRoomError::TransportSend("peer dropped".into()))
    }

    async fn recv(&mut self) -> Option<Result<String, ListeningRoomError>> {
        match self.incoming.recv().await {
            Some(item) => item,
            // The peer handle is gone; stay open until shutdown.
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), ListeningRoomError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

impl MockPeer {
    /// The next raw message the transport owner sent.
    pub async fn next_sent(&mut self) -> String {
        tokio::time::timeout(WAIT, self.sent.recv())
            .await
            .expect("timed out waiting for an outgoing message")
            .expect("transport dropped")
    }

    pub async fn next_request(&mut self) -> ChannelRequest {
        let text = self.next_sent().await;
        serde_json::from_str(&text).unwrap_or_else(|e| panic!("bad request {text}: {e}"))
    }

    pub async fn next_notice(&mut self) -> ChannelNotice {
        let text = self.next_sent().await;
        serde_json::from_str(&text).unwrap_or_else(|e| panic!("bad notice {text}: {e}"))
    }

    /// Deliver `message` to the transport owner.
    pub fn push(&self, message: impl serde::Serialize) {
        let text = serde_json::to_string(&message).expect("serialize pushed message");
        self.incoming.send(Some(Ok(text))).expect("transport dropped");
    }

    pub fn push_raw(&self, text: &str) {
        self.incoming
            .send(Some(Ok(text.to_owned())))
            .expect("transport dropped");
    }

    /// Close the connection from the peer side.
    pub fn hang_up(&self) {
        let _ = self.incoming.send(None);
    }
}

// ── FakePlayer ──────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct PlayerState {
    pub track: Option<Track>,
    pub playing: bool,
    pub position: f64,
    pub loads: usize,
    pub seeks: usize,
    pub stopped: bool,
}

/// A [`LocalPlayer`] whose state is shared with every clone.
#[derive(Debug, Default, Clone)]
pub struct FakePlayer {
    state: Arc<StdMutex<PlayerState>>,
}

impl FakePlayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PlayerState {
        self.state.lock().unwrap().clone()
    }

    /// Let local time pass on the player.
    pub fn advance(&self, seconds: f64) {
        self.state.lock().unwrap().position += seconds;
    }

    pub fn title(&self) -> Option<String> {
        self.state().track.map(|t| t.title)
    }
}

impl LocalPlayer for FakePlayer {
    fn load(&mut self, track: &Track) {
        let mut state = self.state.lock().unwrap();
        state.track = Some(track.clone());
        state.playing = false;
        state.position = 0.0;
        state.loads += 1;
    }

    fn play(&mut self) {
        self.state.lock().unwrap().playing = true;
    }

    fn pause(&mut self) {
        self.state.lock().unwrap().playing = false;
    }

    fn seek(&mut self, position: f64) {
        let mut state = self.state.lock().unwrap();
        state.position = position;
        state.seeks += 1;
    }

    fn position(&self) -> f64 {
        self.state.lock().unwrap().position
    }

    fn is_playing(&self) -> bool {
        self.state.lock().unwrap().playing
    }

    fn stop(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.playing = false;
        state.stopped = true;
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

pub fn track(name: &str) -> Track {
    Track {
        composer: "Bach".into(),
        title: name.into(),
        asset_ref: format!("audio/Bach/{name}.mp3"),
        url: format!("https://cdn.test/{name}.mp3"),
    }
}

/// Configuration with short timeouts and quick retries.
pub fn fast_config() -> RoomConfig {
    RoomConfig::new("https://listen.test")
        .with_operation_timeout(Duration::from_millis(500))
        .with_shutdown_timeout(Duration::from_millis(200))
        .with_retry(RetryPolicy {
            attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        })
}

pub struct Backend {
    pub store: Arc<MemoryStore>,
    pub channel: Arc<MemoryChannel>,
    pub manager: RoomManager,
}

pub fn memory_backend() -> Backend {
    let store = Arc::new(MemoryStore::new());
    let channel = Arc::new(MemoryChannel::new());
    let manager = RoomManager::new(store.clone(), channel.clone(), fast_config());
    Backend {
        store,
        channel,
        manager,
    }
}

// ── Event helpers ───────────────────────────────────────────────────

/// Receive events until one matches `pred`, returning it.
pub async fn wait_for<F>(events: &mut mpsc::Receiver<RoomEvent>, mut pred: F) -> RoomEvent
where
    F: FnMut(&RoomEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll `check` until it holds or the deadline passes.
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}
