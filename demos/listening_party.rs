//! # Listening Party Example
//!
//! Runs a whole listening room in one process on the in-memory backends:
//!
//! 1. Build a playlist from a track catalog
//! 2. Create a room as `alice`, who becomes its admin
//! 3. Let `bob` join through the share link
//! 4. Drive playback as the admin and watch bob's player follow
//! 5. Close the room and observe bob being notified
//!
//! ## Running
//!
//! ```sh
//! cargo run --example listening_party
//!
//! # See every snapshot being applied:
//! RUST_LOG=listening_room=debug cargo run --example listening_party
//! ```

use std::sync::Arc;
use std::time::Duration;

use listening_room::backends::memory::{MemoryCatalog, MemoryChannel, MemoryStore};
use listening_room::{
    CreateRoomParams, LocalPlayer, RoomConfig, RoomEvent, RoomManager, RoomView, SkipDirection,
    Track, TrackCatalog,
};
use tokio::sync::mpsc;

/// A player that only logs what it is told to do.
struct ConsolePlayer {
    name: &'static str,
    position: f64,
    playing: bool,
}

impl ConsolePlayer {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            position: 0.0,
            playing: false,
        }
    }
}

impl LocalPlayer for ConsolePlayer {
    fn load(&mut self, track: &Track) {
        tracing::info!("[{}] loading {} by {}", self.name, track.title, track.composer);
        self.position = 0.0;
        self.playing = false;
    }

    fn play(&mut self) {
        tracing::info!("[{}] ▶ at {:.1}s", self.name, self.position);
        self.playing = true;
    }

    fn pause(&mut self) {
        tracing::info!("[{}] ⏸ at {:.1}s", self.name, self.position);
        self.playing = false;
    }

    fn seek(&mut self, position: f64) {
        tracing::info!("[{}] seek {:.1}s → {position:.1}s", self.name, self.position);
        self.position = position;
    }

    fn position(&self) -> f64 {
        self.position
    }

    fn is_playing(&self) -> bool {
        self.playing
    }
}

/// Log bob's events until the room closes.
async fn follow(mut events: mpsc::Receiver<RoomEvent>) {
    while let Some(event) = events.recv().await {
        match &event {
            RoomEvent::PlaybackApplied(state) => tracing::info!(
                "bob applied #{}: {} {:?} at {:.1}s",
                state.sequence,
                state.active_track.title,
                state.transport,
                state.position
            ),
            RoomEvent::PresenceChanged(presence) => {
                tracing::info!("in the room: {}", presence.users().join(", "));
            }
            RoomEvent::RoomClosed => {
                tracing::info!("bob: the admin closed the room");
                break;
            }
            other => tracing::debug!("bob: {other:?}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Backends ────────────────────────────────────────────────────
    let store = Arc::new(MemoryStore::new());
    let channel = Arc::new(MemoryChannel::new());
    let catalog = MemoryCatalog::new([
        ("audio/Bach/Cello_Suite_1.mp3", "https://cdn.example/bach-1.mp3"),
        ("audio/Satie/Gymnopedie_1.mp3", "https://cdn.example/satie-1.mp3"),
        ("audio/Bach/Air_on_G.mp3", "https://cdn.example/bach-air.mp3"),
    ]);
    let manager = RoomManager::new(store, channel, RoomConfig::new("https://listen.example"));

    // ── Create ──────────────────────────────────────────────────────
    let tracks = catalog.list().await?;
    let room = manager
        .create(CreateRoomParams::new("Sunday Morning", 4, "alice", tracks))
        .await?;
    tracing::info!("created {}, share link {}", room.name, room.share_url);

    let (mut alice, _alice_events) = manager
        .open_session(RoomView::for_admin(room.clone()), ConsolePlayer::new("alice"))
        .await?;

    // ── Join ────────────────────────────────────────────────────────
    let view = manager.enter(&room.share_url, "bob").await?;
    let (mut bob, bob_events) = manager.open_session(view, ConsolePlayer::new("bob")).await?;
    let follower = tokio::spawn(follow(bob_events));

    // ── Drive playback ──────────────────────────────────────────────
    let pause = Duration::from_millis(100);
    alice.play().await?;
    tokio::time::sleep(pause).await;
    alice.seek(64.0).await?;
    tokio::time::sleep(pause).await;
    alice.skip_track(SkipDirection::Next).await?;
    tokio::time::sleep(pause).await;
    alice.pause().await?;
    tokio::time::sleep(pause).await;

    // ── Close ───────────────────────────────────────────────────────
    alice.close().await?;
    follower.await?;
    bob.leave().await?;
    tracing::info!("rooms left open: {}", manager.list().await?.len());
    Ok(())
}
