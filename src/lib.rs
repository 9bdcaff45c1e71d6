//! # Listening Room
//!
//! Synchronized listening rooms: one admin controls playback of a shared
//! playlist, and every follower's local player mirrors the admin's track
//! selection, play/pause state and position.
//!
//! The crate is backend-agnostic. Room documents live in a [`RoomStore`],
//! live playback and presence state in a [`RoomChannel`], and playable
//! tracks come from a [`TrackCatalog`]. In-memory implementations of all
//! three are in [`backends::memory`]; [`backends::relay`] reaches a remote
//! channel over any [`Transport`].
//!
//! ## Features
//!
//! - **Ordered playback sync**: snapshots carry a sequence number; stale and
//!   duplicate deliveries are discarded, drift beyond a tolerance is corrected
//! - **Presence with capacity**: last-write-wins joins confirmed by re-reading
//! - **Event-driven sessions**: each [`RoomSession`] reports on a bounded
//!   [`RoomEvent`] channel
//! - **WebSocket relay**: the default `transport-websocket` feature provides
//!   `WebSocketTransport`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! let manager = RoomManager::new(store, channel, RoomConfig::new("https://listen.example"));
//! let room = manager.create(CreateRoomParams::new("Sunday Bach", 8, "alice", tracks)).await?;
//! let (admin, _events) = manager.open_session(RoomView::for_admin(room.clone()), player).await?;
//! admin.play().await?;
//!
//! let view = manager.enter(&room.share_url, "bob").await?;
//! let (follower, mut events) = manager.open_session(view, other_player).await?;
//! ```

pub mod backends;
pub mod catalog;
pub mod channel;
pub mod config;
pub mod error;
pub mod error_codes;
pub mod event;
pub mod lifecycle;
pub mod presence;
pub mod protocol;
pub mod role;
pub mod session;
pub mod store;
pub mod sync;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use catalog::TrackCatalog;
pub use channel::{ChannelPath, RoomChannel, Subscription};
pub use config::RoomConfig;
pub use error::{ListeningRoomError, Result};
pub use error_codes::ErrorCode;
pub use event::RoomEvent;
pub use lifecycle::{CreateRoomParams, RoomManager, RoomView};
pub use presence::PresenceTracker;
pub use protocol::{PlayState, PlaybackEvent, PlaybackState, Presence, RoomDocument, RoomId, Track};
pub use role::{SessionRole, ShareLink};
pub use session::RoomSession;
pub use store::RoomStore;
pub use sync::{LocalPlayer, PlaybackSynchronizer, SkipDirection, SyncPhase};
pub use transport::Transport;

#[cfg(feature = "transport-websocket")]
pub use transports::WebSocketTransport;
