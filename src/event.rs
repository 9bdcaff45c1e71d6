//! Events emitted by a [`RoomSession`](crate::session::RoomSession).
//!
//! Events arrive on the bounded receiver returned from
//! [`RoomSession::start`](crate::session::RoomSession::start). When the
//! consumer falls behind, events are dropped with a warning, except
//! [`RoomEvent::RoomClosed`], which is always delivered and always last.

use crate::error_codes::ErrorCode;
use crate::protocol::{PlaybackState, Presence};
use crate::role::SessionRole;

/// Something that happened in the room, as seen by this client.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// The initial playback snapshot was applied. Always the first event.
    Loaded {
        playback: PlaybackState,
        role: SessionRole,
    },
    /// A remote snapshot was applied to the local player.
    PlaybackApplied(PlaybackState),
    /// A remote snapshot was recorded but not applied, because sync is off.
    PlaybackDeferred { sequence: u64 },
    /// The presence list changed.
    PresenceChanged(Presence),
    /// The follower toggled synchronization.
    SyncToggled { enabled: bool },
    /// The channel stopped delivering updates. Local playback continues
    /// unsynchronized.
    SyncDegraded { reason: String },
    /// A non-fatal failure worth showing to the user, such as a playback
    /// write that ran out of retries.
    Notice { code: ErrorCode, message: String },
    /// The admin closed the room. No further events follow.
    RoomClosed,
}

impl RoomEvent {
    /// Returns `true` for events after which the session receives nothing more.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RoomClosed)
    }
}
