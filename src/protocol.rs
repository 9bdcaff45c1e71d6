//! Documents and wire messages shared by every listening-room participant.
//!
//! The first half of this module describes the JSON documents stored for a
//! room (the [`RoomDocument`] in the room store, the [`PlaybackState`] and
//! [`Presence`] in the room state channel). The second half is the relay
//! protocol used by [`RelayChannel`](crate::backends::relay::RelayChannel)
//! to reach a remote room state channel over a text transport.
//!
//! Document field names are camelCase (`activeTrack`, `createdAt`) so that
//! rooms written by other clients of the same backend remain readable.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ListeningRoomError, Result};
use crate::error_codes::ErrorCode;

// ── Type aliases ────────────────────────────────────────────────────

/// Unique identifier for rooms.
pub type RoomId = Uuid;

/// Identifier of one channel subscription, unique per channel client.
pub type SubscriptionId = u64;

/// Correlates a relay request with its acknowledgement.
pub type RequestId = u64;

// ── Tracks ──────────────────────────────────────────────────────────

/// A playable track. Identity is [`asset_ref`](Track::asset_ref).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Track {
    pub composer: String,
    pub title: String,
    /// Opaque asset reference, e.g. `audio/Bach/Cello_Suite_1.mp3`.
    #[serde(rename = "ref")]
    pub asset_ref: String,
    /// Resolvable URL the local player can load.
    pub url: String,
}

impl Track {
    /// Returns `true` if both values name the same asset.
    pub fn same_asset(&self, other: &Track) -> bool {
        self.asset_ref == other.asset_ref
    }
}

// ── Playback ────────────────────────────────────────────────────────

/// Transport state of the shared player.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlayState {
    Playing,
    #[default]
    Paused,
}

/// A logical playback event published by the admin.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Play,
    Pause,
    /// Jump to a position, in seconds.
    Seek(f64),
    /// Switch to another track of the room. Position restarts at zero.
    TrackChange(Track),
}

/// The admin-authored snapshot of the shared player.
///
/// Always written as a single document so that followers never observe a
/// position belonging to a different track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub active_track: Track,
    pub transport: PlayState,
    /// Position in seconds, never negative.
    pub position: f64,
    /// Incremented on every write; orders and deduplicates snapshots.
    pub sequence: u64,
}

impl PlaybackState {
    /// The state every room starts in: first track, paused, at zero.
    pub fn initial(track: Track) -> Self {
        Self {
            active_track: track,
            transport: PlayState::Paused,
            position: 0.0,
            sequence: 0,
        }
    }

    /// Builds the snapshot that follows `self` once `event` happened.
    ///
    /// `at_position` is the admin player's position when the event fired; it
    /// is recorded for `Play` and `Pause`.
    pub fn advance(&self, event: &PlaybackEvent, at_position: f64) -> Self {
        let sequence = self.sequence.saturating_add(1);
        match event {
            PlaybackEvent::Play => Self {
                transport: PlayState::Playing,
                position: clamp_position(at_position),
                sequence,
                ..self.clone()
            },
            PlaybackEvent::Pause => Self {
                transport: PlayState::Paused,
                position: clamp_position(at_position),
                sequence,
                ..self.clone()
            },
            PlaybackEvent::Seek(position) => Self {
                position: clamp_position(*position),
                sequence,
                ..self.clone()
            },
            PlaybackEvent::TrackChange(track) => Self {
                active_track: track.clone(),
                transport: self.transport,
                position: 0.0,
                sequence,
            },
        }
    }

    /// Returns `true` if the transport is [`PlayState::Playing`].
    pub fn is_playing(&self) -> bool {
        self.transport == PlayState::Playing
    }
}

/// Clamps negative and non-finite positions to zero.
pub fn clamp_position(position: f64) -> f64 {
    if position.is_finite() && position > 0.0 {
        position
    } else {
        0.0
    }
}

// ── Presence ────────────────────────────────────────────────────────

/// Usernames currently in a room, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Presence {
    users: Vec<String>,
}

impl Presence {
    /// Presence of a freshly created room: only the admin.
    pub fn seeded(admin: impl Into<String>) -> Self {
        Self {
            users: vec![admin.into()],
        }
    }

    pub fn from_users(users: Vec<String>) -> Self {
        Self { users }
    }

    pub fn users(&self) -> &[String] {
        &self.users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Exact, case-sensitive membership test.
    pub fn contains(&self, username: &str) -> bool {
        self.users.iter().any(|u| u == username)
    }

    /// Arrival index of `username`, if present.
    pub fn position_of(&self, username: &str) -> Option<usize> {
        self.users.iter().position(|u| u == username)
    }

    /// Returns the presence with `username` appended.
    ///
    /// # Errors
    ///
    /// [`ListeningRoomError::Full`] when `capacity` users are already present,
    /// [`ListeningRoomError::DuplicateName`] when the name is taken.
    pub fn admit(&self, username: &str, capacity: u32) -> Result<Presence> {
        if self.users.len() >= capacity as usize {
            return Err(ListeningRoomError::Full);
        }
        if self.contains(username) {
            return Err(ListeningRoomError::DuplicateName);
        }
        let mut users = self.users.clone();
        users.push(username.to_owned());
        Ok(Self { users })
    }

    /// Returns the presence without `username`, or `None` if it was absent.
    pub fn without(&self, username: &str) -> Option<Presence> {
        if !self.contains(username) {
            return None;
        }
        Some(Self {
            users: self
                .users
                .iter()
                .filter(|u| *u != username)
                .cloned()
                .collect(),
        })
    }
}

// ── Room document ───────────────────────────────────────────────────

/// Durable metadata of a room, as kept by the room store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDocument {
    pub id: RoomId,
    pub name: String,
    /// Username of the room's creator.
    pub admin: String,
    pub capacity: u32,
    /// The room's own copy of its tracks, in playlist order. Never empty.
    pub tracks: Vec<Track>,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: u64,
    pub share_url: String,
}

impl RoomDocument {
    /// Index of `track` in the room's playlist.
    pub fn track_index(&self, track: &Track) -> Option<usize> {
        self.tracks.iter().position(|t| t.same_asset(track))
    }
}

// ── Relay messages ──────────────────────────────────────────────────

/// Messages sent from a client to a relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ChannelRequest {
    /// Fetch the current value at `path`.
    Read { request_id: RequestId, path: String },
    /// Replace the value at `path` in one atomic write.
    Write {
        request_id: RequestId,
        path: String,
        value: serde_json::Value,
    },
    /// Delete `path` and everything below it.
    Remove { request_id: RequestId, path: String },
    /// Start receiving `Value`/`Removed` notices for `path`.
    Subscribe {
        request_id: RequestId,
        subscription: SubscriptionId,
        path: String,
    },
    /// Stop notices for a subscription. Never acknowledged.
    Unsubscribe { subscription: SubscriptionId },
    /// Heartbeat.
    Ping,
}

/// Messages sent from a relay to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ChannelNotice {
    /// A `Write`, `Remove` or `Subscribe` request succeeded.
    Ack { request_id: RequestId },
    /// Answer to a `Read` request. `None` when nothing is stored at the path.
    ReadResult {
        request_id: RequestId,
        #[serde(default)]
        value: Option<serde_json::Value>,
    },
    /// The current value of a subscribed path.
    Value {
        subscription: SubscriptionId,
        value: serde_json::Value,
    },
    /// A subscribed path (or one of its ancestors) was removed.
    Removed { subscription: SubscriptionId },
    /// A request failed, or the relay reports a connection-level problem
    /// when `request_id` is absent.
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
    },
    /// Heartbeat response.
    Pong,
}
