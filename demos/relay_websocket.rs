//! # Relay over WebSocket Example
//!
//! Serves one in-memory room state channel to remote clients over WebSocket,
//! then connects an admin and a follower to it through
//! [`RelayChannel`](listening_room::backends::relay::RelayChannel). Both
//! clients share the room store directly; only live playback and presence
//! travel through the relay.
//!
//! ## Running
//!
//! ```sh
//! cargo run --example relay_websocket
//!
//! # Watch the relay protocol:
//! RUST_LOG=listening_room::backends::relay=trace cargo run --example relay_websocket
//! ```

use std::sync::Arc;
use std::time::Duration;

use listening_room::backends::memory::{MemoryChannel, MemoryStore};
use listening_room::backends::relay::{serve_channel, RelayChannel, RelayConfig};
use listening_room::{
    CreateRoomParams, LocalPlayer, RoomChannel, RoomConfig, RoomEvent, RoomManager, RoomView,
    Track, WebSocketTransport,
};
use tokio::net::TcpListener;

/// Accept relay clients forever, one task per connection.
async fn run_relay(listener: TcpListener, channel: Arc<dyn RoomChannel>) {
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!("accept failed: {e}");
                continue;
            }
        };
        let channel = Arc::clone(&channel);
        tokio::spawn(async move {
            let transport = match WebSocketTransport::accept(tcp).await {
                Ok(transport) => transport,
                Err(e) => {
                    tracing::warn!("handshake with {peer} failed: {e}");
                    return;
                }
            };
            if let Err(e) = serve_channel(channel, transport).await {
                tracing::warn!("relay connection {peer} ended: {e}");
            }
        });
    }
}

/// Keeps only what the follower needs to stay in line.
#[derive(Default)]
struct SilentPlayer {
    position: f64,
    playing: bool,
}

impl LocalPlayer for SilentPlayer {
    fn load(&mut self, track: &Track) {
        tracing::info!("loading {}", track.title);
        self.position = 0.0;
        self.playing = false;
    }

    fn play(&mut self) {
        self.playing = true;
    }

    fn pause(&mut self) {
        self.playing = false;
    }

    fn seek(&mut self, position: f64) {
        self.position = position;
    }

    fn position(&self) -> f64 {
        self.position
    }

    fn is_playing(&self) -> bool {
        self.playing
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Relay ───────────────────────────────────────────────────────
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}", listener.local_addr()?);
    tokio::spawn(run_relay(listener, Arc::new(MemoryChannel::new())));
    tracing::info!("relay listening on {url}");

    // ── Clients ─────────────────────────────────────────────────────
    let relay_config = RelayConfig::default().with_heartbeat_interval(Duration::from_secs(15));
    let store = Arc::new(MemoryStore::new());
    let config = RoomConfig::new("https://listen.example");

    let admin_channel = Arc::new(RelayChannel::start(
        WebSocketTransport::connect(&url).await?,
        relay_config.clone(),
    ));
    let admin = RoomManager::new(store.clone(), admin_channel.clone(), config.clone());

    let follower_channel = Arc::new(RelayChannel::start(
        WebSocketTransport::connect(&url).await?,
        relay_config,
    ));
    let follower = RoomManager::new(store, follower_channel.clone(), config);

    // ── Room ────────────────────────────────────────────────────────
    let tracks = vec![Track {
        composer: "Satie".into(),
        title: "Gymnopédie No. 1".into(),
        asset_ref: "audio/Satie/Gymnopedie_1.mp3".into(),
        url: "https://cdn.example/satie-1.mp3".into(),
    }];
    let room = admin
        .create(CreateRoomParams::new("Remote Satie", 2, "alice", tracks))
        .await?;
    let (mut alice, _alice_events) = admin
        .open_session(RoomView::for_admin(room.clone()), SilentPlayer::default())
        .await?;

    let view = follower.enter(&room.share_url, "bob").await?;
    let (mut bob, mut bob_events) = follower.open_session(view, SilentPlayer::default()).await?;

    alice.play().await?;
    alice.seek(42.0).await?;
    alice.close().await?;

    while let Some(event) = bob_events.recv().await {
        tracing::info!("bob: {event:?}");
        if event.is_terminal() {
            break;
        }
    }
    bob.leave().await?;

    admin_channel.shutdown().await;
    follower_channel.shutdown().await;
    Ok(())
}
