//! Playback synchronizer: the per-client state machine behind a room session.
//!
//! The admin turns local player events into new [`PlaybackState`] snapshots;
//! followers apply incoming snapshots to their [`LocalPlayer`]. The machine
//! itself does no I/O. [`RoomSession`](crate::session::RoomSession) feeds it
//! channel notifications and writes the snapshots it produces.
//!
//! ```text
//!   Stopped ──load──▶ Paused ◀──▶ Playing
//! ```
//!
//! Ordering rules:
//!
//! - A snapshot is applied only if its `sequence` is greater than the last
//!   applied one. Replays and late deliveries are discarded, so applying is
//!   idempotent.
//! - Followers never publish. A follower's player reacting to a snapshot can
//!   therefore not echo the change back into the channel.

use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{ListeningRoomError, Result};
use crate::protocol::{PlayState, PlaybackEvent, PlaybackState, Track};
use crate::role::SessionRole;

/// The local audio player a session drives.
///
/// Implemented by the embedding application over its audio element or
/// decoder. Methods are synchronous and must not block.
pub trait LocalPlayer: Send + 'static {
    /// Switch the source to `track`. The player is left paused at 0.
    fn load(&mut self, track: &Track);

    fn play(&mut self);

    fn pause(&mut self);

    /// Move the playhead, in seconds.
    fn seek(&mut self, position: f64);

    /// Current playhead, in seconds.
    fn position(&self) -> f64;

    fn is_playing(&self) -> bool;

    /// Release the source. Called once, after every subscription of the
    /// session has been released.
    fn stop(&mut self) {
        self.pause();
    }
}

/// Where the local player stands relative to the shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    /// No snapshot has been loaded yet.
    #[default]
    Stopped,
    Paused,
    Playing,
}

impl From<PlayState> for SyncPhase {
    fn from(state: PlayState) -> Self {
        match state {
            PlayState::Playing => Self::Playing,
            PlayState::Paused => Self::Paused,
        }
    }
}

/// What [`PlaybackSynchronizer::on_remote_update`] did with a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The snapshot was newer and the local player now matches it.
    Applied,
    /// The snapshot was newer but local sync is disabled; only bookkeeping changed.
    Deferred,
    /// The snapshot was not newer than the last applied one and was dropped.
    Stale,
    /// The admin's own write came back; the admin is the source of truth.
    OwnEcho,
}

/// Direction for [`PlaybackSynchronizer::skip_target`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDirection {
    Previous,
    Next,
}

impl SkipDirection {
    pub fn offset(self) -> i64 {
        match self {
            Self::Previous => -1,
            Self::Next => 1,
        }
    }
}

/// Synchronization state of one client in one room.
#[derive(Debug, Clone)]
pub struct PlaybackSynchronizer {
    role: SessionRole,
    /// The room's playlist, in room order.
    tracks: Vec<Track>,
    drift_tolerance: f64,
    phase: SyncPhase,
    /// Latest snapshot seen (followers) or written (admin).
    latest: Option<PlaybackState>,
    last_applied_sequence: Option<u64>,
    /// Track currently loaded into the local player.
    loaded: Option<Track>,
    enabled: bool,
}

impl PlaybackSynchronizer {
    pub fn new(role: SessionRole, tracks: Vec<Track>, drift_tolerance: Duration) -> Self {
        Self {
            role,
            tracks,
            drift_tolerance: drift_tolerance.as_secs_f64(),
            phase: SyncPhase::Stopped,
            latest: None,
            last_applied_sequence: None,
            loaded: None,
            enabled: true,
        }
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn latest(&self) -> Option<&PlaybackState> {
        self.latest.as_ref()
    }

    pub fn last_applied_sequence(&self) -> Option<u64> {
        self.last_applied_sequence
    }

    /// Whether remote updates currently reach the local player.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Load the first snapshot and leave `Stopped`.
    ///
    /// Applies unconditionally, whatever the snapshot's sequence.
    pub fn load<P: LocalPlayer + ?Sized>(&mut self, snapshot: PlaybackState, player: &mut P) {
        debug!(
            sequence = snapshot.sequence,
            track = %snapshot.active_track.asset_ref,
            "loading playback state"
        );
        self.last_applied_sequence = Some(snapshot.sequence);
        if self.enabled || self.role.is_admin() {
            self.apply(&snapshot, player);
        }
        self.latest = Some(snapshot);
    }

    /// Handle a snapshot delivered by the channel.
    pub fn on_remote_update<P: LocalPlayer + ?Sized>(
        &mut self,
        snapshot: PlaybackState,
        player: &mut P,
    ) -> UpdateOutcome {
        if self.role.is_admin() {
            trace!(sequence = snapshot.sequence, "ignoring own playback echo");
            return UpdateOutcome::OwnEcho;
        }
        let Some(last) = self.last_applied_sequence else {
            self.load(snapshot, player);
            return if self.enabled {
                UpdateOutcome::Applied
            } else {
                UpdateOutcome::Deferred
            };
        };
        if snapshot.sequence <= last {
            debug!(
                sequence = snapshot.sequence,
                last_applied = last,
                "discarding stale playback snapshot"
            );
            return UpdateOutcome::Stale;
        }
        self.last_applied_sequence = Some(snapshot.sequence);
        let outcome = if self.enabled {
            self.apply(&snapshot, player);
            UpdateOutcome::Applied
        } else {
            debug!(sequence = snapshot.sequence, "local sync disabled, deferring");
            UpdateOutcome::Deferred
        };
        self.latest = Some(snapshot);
        outcome
    }

    /// Turn local following on or off.
    ///
    /// With `catch_up`, re-enabling immediately applies the latest known
    /// snapshot. Returns `true` if the player was touched.
    pub fn set_enabled<P: LocalPlayer + ?Sized>(
        &mut self,
        enabled: bool,
        catch_up: bool,
        player: &mut P,
    ) -> bool {
        self.enabled = enabled;
        if !(enabled && catch_up) {
            return false;
        }
        match self.latest.clone() {
            Some(snapshot) => {
                self.apply(&snapshot, player);
                true
            }
            None => false,
        }
    }

    /// Build the snapshot that publishes `event`. Admin only.
    ///
    /// `at_position` is the admin player's current position.
    ///
    /// # Errors
    ///
    /// - [`ListeningRoomError::Forbidden`] for followers.
    /// - [`ListeningRoomError::InvalidInput`] before the first snapshot is
    ///   loaded, or for a track change to a track outside the room.
    pub fn prepare(&self, event: &PlaybackEvent, at_position: f64) -> Result<PlaybackState> {
        self.role.require_admin()?;
        let current = self.latest.as_ref().ok_or_else(not_loaded)?;
        if let PlaybackEvent::TrackChange(track) = event {
            if !self.tracks.iter().any(|t| t.same_asset(track)) {
                return Err(ListeningRoomError::InvalidInput(format!(
                    "track {} is not part of this room",
                    track.asset_ref
                )));
            }
        }
        Ok(current.advance(event, at_position))
    }

    /// Record a snapshot the admin is publishing and bring the admin's own
    /// player in line with it.
    ///
    /// For play/pause/seek the player is already there; only a track change
    /// makes the player switch source.
    pub fn commit<P: LocalPlayer + ?Sized>(&mut self, snapshot: PlaybackState, player: &mut P) {
        self.last_applied_sequence = Some(snapshot.sequence);
        self.apply(&snapshot, player);
        self.latest = Some(snapshot);
    }

    /// Track `direction` steps away from the active one, wrapping around the
    /// room's playlist. Admin only.
    pub fn skip_target(&self, direction: SkipDirection) -> Result<Track> {
        self.role.require_admin()?;
        let current = self.latest.as_ref().ok_or_else(not_loaded)?;
        let index = self
            .tracks
            .iter()
            .position(|t| t.same_asset(&current.active_track))
            .ok_or_else(|| {
                ListeningRoomError::InvalidInput("active track is not part of this room".into())
            })?;
        let count = self.tracks.len() as i64;
        let next = (index as i64 + direction.offset()).rem_euclid(count) as usize;
        self.tracks
            .get(next)
            .cloned()
            .ok_or_else(|| ListeningRoomError::InvalidInput("room has no tracks".into()))
    }

    fn apply<P: LocalPlayer + ?Sized>(&mut self, snapshot: &PlaybackState, player: &mut P) {
        let switch = self
            .loaded
            .as_ref()
            .is_none_or(|t| !t.same_asset(&snapshot.active_track));
        if switch {
            debug!(track = %snapshot.active_track.asset_ref, "switching source");
            player.load(&snapshot.active_track);
            self.loaded = Some(snapshot.active_track.clone());
        }

        let drift = (player.position() - snapshot.position).abs();
        if drift > self.drift_tolerance {
            trace!(drift, position = snapshot.position, "correcting drift");
            player.seek(snapshot.position);
        }

        match snapshot.transport {
            PlayState::Playing if !player.is_playing() => player.play(),
            PlayState::Paused if player.is_playing() => player.pause(),
            _ => {}
        }
        self.phase = snapshot.transport.into();
    }
}

fn not_loaded() -> ListeningRoomError {
    ListeningRoomError::InvalidInput("playback state has not been loaded yet".into())
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

    /// Player double that counts every call.
    #[derive(Debug, Default)]
    struct CountingPlayer {
        track: Option<Track>,
        playing: bool,
        position: f64,
        loads: usize,
        seeks: usize,
        plays: usize,
        pauses: usize,
    }

    impl LocalPlayer for CountingPlayer {
        fn load(&mut self, track: &Track) {
            self.track = Some(track.clone());
            self.playing = false;
            self.position = 0.0;
            self.loads += 1;
        }
        fn play(&mut self) {
            self.playing = true;
            self.plays += 1;
        }
        fn pause(&mut self) {
            self.playing = false;
            self.pauses += 1;
        }
        fn seek(&mut self, position: f64) {
            self.position = position;
            self.seeks += 1;
        }
        fn position(&self) -> f64 {
            self.position
        }
        fn is_playing(&self) -> bool {
            self.playing
        }
    }

    fn track(name: &str) -> Track {
        Track {
            composer: "Test".into(),
            title: name.into(),
            asset_ref: format!("audio/Test/{name}.mp3"),
            url: format!("https://cdn.test/{name}.mp3"),
        }
    }

    fn tracks() -> Vec<Track> {
        vec![track("A"), track("B"), track("C")]
    }

    fn snapshot(name: &str, transport: PlayState, position: f64, sequence: u64) -> PlaybackState {
        PlaybackState {
            active_track: track(name),
            transport,
            position,
            sequence,
        }
    }

    fn follower() -> PlaybackSynchronizer {
        PlaybackSynchronizer::new(
            SessionRole::Follower,
            tracks(),
            Duration::from_millis(750),
        )
    }

    fn loaded_admin(player: &mut CountingPlayer) -> PlaybackSynchronizer {
        let mut admin =
            PlaybackSynchronizer::new(SessionRole::Admin, tracks(), Duration::from_millis(750));
        admin.load(PlaybackState::initial(track("A")), player);
        admin
    }

    #[test]
    fn starts_stopped_and_load_exits() {
        let mut sync = follower();
        let mut player = CountingPlayer::default();
        assert_eq!(sync.phase(), SyncPhase::Stopped);
        sync.load(snapshot("A", PlayState::Paused, 0.0, 0), &mut player);
        assert_eq!(sync.phase(), SyncPhase::Paused);
        assert_eq!(player.track, Some(track("A")));
        assert_eq!(sync.last_applied_sequence(), Some(0));
    }

    #[test]
    fn duplicate_snapshot_changes_player_once() {
        let mut sync = follower();
        let mut player = CountingPlayer::default();
        sync.load(snapshot("A", PlayState::Paused, 0.0, 0), &mut player);

        let update = snapshot("B", PlayState::Playing, 10.0, 1);
        assert_eq!(
            sync.on_remote_update(update.clone(), &mut player),
            UpdateOutcome::Applied
        );
        let (loads, plays, seeks) = (player.loads, player.plays, player.seeks);
        assert_eq!(
            sync.on_remote_update(update, &mut player),
            UpdateOutcome::Stale
        );
        assert_eq!(
            (player.loads, player.plays, player.seeks),
            (loads, plays, seeks)
        );
    }

    #[test]
    fn out_of_order_deliveries_keep_maximum_sequence() {
        let mut sync = follower();
        let mut player = CountingPlayer::default();
        sync.load(snapshot("A", PlayState::Paused, 0.0, 0), &mut player);

        let outcomes: Vec<_> = [
            snapshot("C", PlayState::Playing, 30.0, 3),
            snapshot("A", PlayState::Paused, 10.0, 1),
            snapshot("B", PlayState::Playing, 20.0, 2),
        ]
        .into_iter()
        .map(|s| sync.on_remote_update(s, &mut player))
        .collect();

        assert_eq!(
            outcomes,
            [
                UpdateOutcome::Applied,
                UpdateOutcome::Stale,
                UpdateOutcome::Stale
            ]
        );
        assert_eq!(sync.latest().unwrap().sequence, 3);
        assert_eq!(player.track, Some(track("C")));
        assert!(player.playing);
        assert_eq!(player.position, 30.0);
    }

    #[test]
    fn small_drift_does_not_seek() {
        let mut sync = follower();
        let mut player = CountingPlayer::default();
        sync.load(snapshot("A", PlayState::Playing, 0.0, 0), &mut player);
        player.position = 10.0;

        sync.on_remote_update(snapshot("A", PlayState::Playing, 10.5, 1), &mut player);
        assert_eq!(player.seeks, 0);

        sync.on_remote_update(snapshot("A", PlayState::Playing, 12.0, 2), &mut player);
        assert_eq!(player.seeks, 1);
        assert_eq!(player.position, 12.0);
    }

    #[test]
    fn track_change_reloads_source_then_matches_transport() {
        let mut sync = follower();
        let mut player = CountingPlayer::default();
        sync.load(snapshot("A", PlayState::Playing, 0.0, 0), &mut player);
        assert!(player.playing);

        sync.on_remote_update(snapshot("B", PlayState::Playing, 0.0, 1), &mut player);
        assert_eq!(player.loads, 2);
        assert_eq!(player.track, Some(track("B")));
        assert!(player.playing, "transport intent restored after the switch");
        assert_eq!(sync.phase(), SyncPhase::Playing);
    }

    #[test]
    fn disabled_sync_keeps_bookkeeping_without_touching_player() {
        let mut sync = follower();
        let mut player = CountingPlayer::default();
        sync.load(snapshot("A", PlayState::Paused, 0.0, 0), &mut player);
        assert!(!sync.set_enabled(false, false, &mut player));

        let outcome = sync.on_remote_update(snapshot("B", PlayState::Playing, 5.0, 1), &mut player);
        assert_eq!(outcome, UpdateOutcome::Deferred);
        assert_eq!(sync.last_applied_sequence(), Some(1));
        assert_eq!(player.track, Some(track("A")));
        assert!(!player.playing);

        // Re-enabling without catch-up leaves the player alone.
        assert!(!sync.set_enabled(true, false, &mut player));
        assert_eq!(player.track, Some(track("A")));

        // The deferred snapshot is not re-applied later as if it were new.
        let outcome = sync.on_remote_update(snapshot("B", PlayState::Playing, 5.0, 1), &mut player);
        assert_eq!(outcome, UpdateOutcome::Stale);

        assert!(sync.set_enabled(true, true, &mut player));
        assert_eq!(player.track, Some(track("B")));
        assert!(player.playing);
    }

    #[test]
    fn admin_ignores_its_own_echo() {
        let mut player = CountingPlayer::default();
        let mut admin = loaded_admin(&mut player);
        let outcome =
            admin.on_remote_update(snapshot("C", PlayState::Playing, 0.0, 9), &mut player);
        assert_eq!(outcome, UpdateOutcome::OwnEcho);
        assert_eq!(player.track, Some(track("A")));
    }

    #[test]
    fn followers_cannot_prepare_or_skip() {
        let mut sync = follower();
        let mut player = CountingPlayer::default();
        sync.load(snapshot("A", PlayState::Paused, 0.0, 0), &mut player);
        assert!(matches!(
            sync.prepare(&PlaybackEvent::Play, 0.0),
            Err(ListeningRoomError::Forbidden)
        ));
        assert!(matches!(
            sync.skip_target(SkipDirection::Next),
            Err(ListeningRoomError::Forbidden)
        ));
    }

    #[test]
    fn prepare_increments_sequence_from_latest() {
        let mut player = CountingPlayer::default();
        let mut admin = loaded_admin(&mut player);
        let first = admin.prepare(&PlaybackEvent::Play, 0.0).unwrap();
        assert_eq!(first.sequence, 1);
        admin.commit(first, &mut player);
        let second = admin.prepare(&PlaybackEvent::Seek(42.0), 0.0).unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(second.transport, PlayState::Playing);
        assert_eq!(second.position, 42.0);
    }

    #[test]
    fn prepare_rejects_foreign_track() {
        let mut player = CountingPlayer::default();
        let admin = loaded_admin(&mut player);
        let err = admin
            .prepare(&PlaybackEvent::TrackChange(track("Z")), 0.0)
            .unwrap_err();
        assert!(matches!(err, ListeningRoomError::InvalidInput(_)));
    }

    #[test]
    fn skip_wraps_in_both_directions() {
        let mut player = CountingPlayer::default();
        let mut admin = loaded_admin(&mut player);
        assert_eq!(admin.skip_target(SkipDirection::Previous).unwrap(), track("C"));
        assert_eq!(admin.skip_target(SkipDirection::Next).unwrap(), track("B"));

        let last = admin
            .prepare(&PlaybackEvent::TrackChange(track("C")), 0.0)
            .unwrap();
        admin.commit(last, &mut player);
        assert_eq!(admin.skip_target(SkipDirection::Next).unwrap(), track("A"));
    }

    #[test]
    fn skip_uses_room_order_for_single_track_room() {
        let mut player = CountingPlayer::default();
        let mut admin =
            PlaybackSynchronizer::new(SessionRole::Admin, vec![track("A")], Duration::ZERO);
        admin.load(PlaybackState::initial(track("A")), &mut player);
        assert_eq!(admin.skip_target(SkipDirection::Next).unwrap(), track("A"));
        assert_eq!(admin.skip_target(SkipDirection::Previous).unwrap(), track("A"));
    }

    #[test]
    fn admin_commit_of_track_change_switches_own_player() {
        let mut player = CountingPlayer::default();
        let mut admin = loaded_admin(&mut player);
        player.play();
        let playing = admin.prepare(&PlaybackEvent::Play, 0.0).unwrap();
        admin.commit(playing, &mut player);
        let plays_before = player.plays;

        let next = admin
            .prepare(&PlaybackEvent::TrackChange(track("B")), 3.0)
            .unwrap();
        admin.commit(next, &mut player);
        assert_eq!(player.track, Some(track("B")));
        assert!(player.playing);
        assert_eq!(player.plays, plays_before + 1);
    }
}
