//! Room lifecycle: create, join, enter, close.
//!
//! [`RoomManager`] ties the room store and the room state channel together.
//! A room exists when its [`RoomDocument`] is in the store and its playback
//! and presence documents are in the channel; creation writes all three in
//! that order and rolls back on failure, closing removes them in reverse.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{remove_path, with_timeout, write_document, ChannelPath, RoomChannel};
use crate::config::RoomConfig;
use crate::error::{ListeningRoomError, Result};
use crate::event::RoomEvent;
use crate::presence::PresenceTracker;
use crate::protocol::{PlaybackState, Presence, RoomDocument, RoomId, Track};
use crate::role::{SessionRole, ShareLink};
use crate::session::RoomSession;
use crate::store::RoomStore;
use crate::sync::LocalPlayer;

// ── Parameters ──────────────────────────────────────────────────────

/// Parameters for [`RoomManager::create`].
///
/// # Example
///
/// ```
/// use listening_room::lifecycle::CreateRoomParams;
///
/// let params = CreateRoomParams::new("Sunday Bach", 8, "alice", vec![]);
/// assert_eq!(params.capacity, 8);
/// ```
#[derive(Debug, Clone)]
pub struct CreateRoomParams {
    pub name: String,
    pub capacity: u32,
    /// Username of the creator, who becomes the room admin.
    pub admin: String,
    /// Playlist in room order. Must not be empty.
    pub tracks: Vec<Track>,
}

impl CreateRoomParams {
    pub fn new(
        name: impl Into<String>,
        capacity: u32,
        admin: impl Into<String>,
        tracks: Vec<Track>,
    ) -> Self {
        Self {
            name: name.into(),
            capacity,
            admin: admin.into(),
            tracks,
        }
    }
}

/// A room as entered by one user: what a session is opened from.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomView {
    pub room: RoomDocument,
    pub username: String,
    pub role: SessionRole,
    /// Presence right after admission.
    pub presence: Presence,
}

impl RoomView {
    /// The creator's view of a freshly created room.
    pub fn for_admin(room: RoomDocument) -> Self {
        let username = room.admin.clone();
        Self {
            presence: Presence::seeded(username.clone()),
            room,
            username,
            role: SessionRole::Admin,
        }
    }
}

// ── Manager ─────────────────────────────────────────────────────────

/// Creates, admits to, and closes rooms.
#[derive(Clone)]
pub struct RoomManager {
    store: Arc<dyn RoomStore>,
    channel: Arc<dyn RoomChannel>,
    config: RoomConfig,
}

impl RoomManager {
    pub fn new(store: Arc<dyn RoomStore>, channel: Arc<dyn RoomChannel>, config: RoomConfig) -> Self {
        Self {
            store,
            channel,
            config,
        }
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    /// Create a room and seed its playback and presence.
    ///
    /// # Errors
    ///
    /// - [`ListeningRoomError::InvalidInput`] for an empty playlist, a
    ///   capacity outside `1..=max_capacity`, or a rejected name.
    /// - [`ListeningRoomError::CreateFailed`] when a backend write fails; the
    ///   steps already taken are undone on a best-effort basis.
    pub async fn create(&self, params: CreateRoomParams) -> Result<RoomDocument> {
        self.validate(&params)?;
        let CreateRoomParams {
            name,
            capacity,
            admin,
            tracks,
        } = params;
        let first = tracks
            .first()
            .cloned()
            .ok_or_else(|| ListeningRoomError::InvalidInput("room needs at least one track".into()))?;

        let id = Uuid::new_v4();
        let room = RoomDocument {
            id,
            name,
            admin,
            capacity,
            tracks,
            created_at: now_millis(),
            share_url: self.config.share_url(id),
        };
        let timeout = self.config.operation_timeout;

        if let Err(e) = with_timeout(timeout, self.store.set(id, room.clone())).await {
            warn!(room = %id, "storing room document failed: {e}");
            return Err(ListeningRoomError::CreateFailed(e.to_string()));
        }

        if let Err(e) = write_document(
            self.channel.as_ref(),
            &ChannelPath::Playback(id),
            &PlaybackState::initial(first),
            timeout,
            self.config.retry,
        )
        .await
        {
            warn!(room = %id, "writing initial playback state failed: {e}");
            self.roll_back(id, false).await;
            return Err(ListeningRoomError::CreateFailed(e.to_string()));
        }

        if let Err(e) = self.presence(&room).seed(&room.admin).await {
            warn!(room = %id, "seeding presence failed: {e}");
            self.roll_back(id, true).await;
            return Err(ListeningRoomError::CreateFailed(e.to_string()));
        }

        info!(room = %id, name = %room.name, capacity, admin = %room.admin, "room created");
        Ok(room)
    }

    /// Close a room. Admin only; closing an absent room succeeds.
    pub async fn close(&self, room_id: RoomId, role: SessionRole) -> Result<()> {
        role.require_admin()?;
        close_room(
            self.channel.as_ref(),
            Some(self.store.as_ref()),
            room_id,
            &self.config,
        )
        .await
    }

    /// Admit `username` to a room as a follower.
    ///
    /// # Errors
    ///
    /// [`ListeningRoomError::NotFound`], [`ListeningRoomError::InvalidInput`]
    /// for a rejected username, or the presence rejections
    /// ([`ListeningRoomError::Full`], [`ListeningRoomError::DuplicateName`]).
    pub async fn join(&self, room_id: RoomId, username: &str) -> Result<RoomView> {
        let room = self.get(room_id).await?;
        self.config.name_rules.validate_username(username)?;
        let presence = self.presence(&room).join(username).await?;
        info!(room = %room_id, username, users = presence.len(), "joined room");
        Ok(RoomView {
            room,
            username: username.to_owned(),
            role: SessionRole::Follower,
            presence,
        })
    }

    /// Enter a room through a share link.
    ///
    /// A plain link joins as follower. An admin link resumes the admin
    /// session, which requires `username` to be the room's recorded admin.
    pub async fn enter(&self, link: &str, username: &str) -> Result<RoomView> {
        let link = ShareLink::parse(link)?;
        if !link.admin {
            return self.join(link.room_id, username).await;
        }
        let room = self.get(link.room_id).await?;
        if room.admin != username {
            warn!(room = %room.id, username, "admin link used by another user");
            return Err(ListeningRoomError::Forbidden);
        }
        let tracker = self.presence(&room);
        let current = tracker.users().await?;
        let presence = if current.contains(username) {
            current
        } else {
            debug!(room = %room.id, username, "re-admitting admin");
            tracker.join(username).await?
        };
        Ok(RoomView {
            room,
            username: username.to_owned(),
            role: SessionRole::Admin,
            presence,
        })
    }

    /// The room document for `room_id`.
    pub async fn get(&self, room_id: RoomId) -> Result<RoomDocument> {
        with_timeout(self.config.operation_timeout, self.store.get(room_id))
            .await?
            .ok_or(ListeningRoomError::NotFound)
    }

    /// Every open room, oldest first.
    pub async fn list(&self) -> Result<Vec<RoomDocument>> {
        let mut rooms = with_timeout(self.config.operation_timeout, self.store.list_all()).await?;
        rooms.sort_by_key(|room| room.created_at);
        Ok(rooms)
    }

    pub fn presence(&self, room: &RoomDocument) -> PresenceTracker {
        PresenceTracker::new(Arc::clone(&self.channel), room, &self.config)
    }

    /// Start a session for an admitted user.
    ///
    /// The session can close the room itself, through this manager's store.
    pub async fn open_session<P: LocalPlayer>(
        &self,
        view: RoomView,
        player: P,
    ) -> Result<(RoomSession<P>, mpsc::Receiver<RoomEvent>)> {
        let (session, events) = RoomSession::start(
            Arc::clone(&self.channel),
            view.room,
            view.username,
            view.role,
            player,
            self.config.clone(),
        )
        .await?;
        Ok((session.with_store(Arc::clone(&self.store)), events))
    }

    fn validate(&self, params: &CreateRoomParams) -> Result<()> {
        let rules = &self.config.name_rules;
        rules.validate_room_name(&params.name)?;
        rules.validate_username(&params.admin)?;
        if params.capacity == 0 || params.capacity > self.config.max_capacity {
            return Err(ListeningRoomError::InvalidInput(format!(
                "capacity must be between 1 and {}",
                self.config.max_capacity
            )));
        }
        if params.tracks.is_empty() {
            return Err(ListeningRoomError::InvalidInput(
                "room needs at least one track".into(),
            ));
        }
        Ok(())
    }

    async fn roll_back(&self, room_id: RoomId, channel_written: bool) {
        let timeout = self.config.operation_timeout;
        if channel_written {
            if let Err(e) = remove_path(
                self.channel.as_ref(),
                &ChannelPath::Room(room_id),
                timeout,
                self.config.retry,
            )
            .await
            {
                warn!(room = %room_id, "rollback of channel region failed: {e}");
            }
        }
        if let Err(e) = with_timeout(timeout, self.store.delete(room_id)).await {
            warn!(room = %room_id, "rollback of room document failed: {e}");
        }
    }
}

impl std::fmt::Debug for RoomManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomManager")
            .field("config", &self.config)
            .finish()
    }
}

/// Remove a room's channel region, then its document when a store is given.
///
/// Subscribers of the room observe the removal. Removing an absent room
/// succeeds.
pub(crate) async fn close_room(
    channel: &dyn RoomChannel,
    store: Option<&dyn RoomStore>,
    room_id: RoomId,
    config: &RoomConfig,
) -> Result<()> {
    remove_path(
        channel,
        &ChannelPath::Room(room_id),
        config.operation_timeout,
        config.retry,
    )
    .await?;
    if let Some(store) = store {
        if let Err(e) = with_timeout(config.operation_timeout, store.delete(room_id)).await {
            warn!(room = %room_id, "channel region removed but room document remains: {e}");
            return Err(e);
        }
    }
    info!(room = %room_id, "room closed");
    Ok(())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
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
    use crate::backends::memory::{MemoryChannel, MemoryStore};
    use crate::channel::read_document;
    use std::time::Duration;

    fn track(name: &str) -> Track {
        Track {
            composer: "Bach".into(),
            title: name.into(),
            asset_ref: format!("audio/Bach/{name}.mp3"),
            url: format!("https://cdn.test/{name}.mp3"),
        }
    }

    fn manager() -> (Arc<MemoryStore>, Arc<MemoryChannel>, RoomManager) {
        let store = Arc::new(MemoryStore::new());
        let channel = Arc::new(MemoryChannel::new());
        let config = RoomConfig::new("https://listen.test").with_retry(crate::config::RetryPolicy {
            attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        });
        let manager = RoomManager::new(store.clone(), channel.clone(), config);
        (store, channel, manager)
    }

    fn params(capacity: u32) -> CreateRoomParams {
        CreateRoomParams::new("Sunday Bach", capacity, "alice", vec![track("A"), track("B")])
    }

    #[tokio::test]
    async fn create_seeds_playback_and_presence() {
        let (store, channel, manager) = manager();
        let room = manager.create(params(3)).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(room.share_url, format!("https://listen.test/rooms/{}", room.id));
        let playback: PlaybackState =
            read_document(channel.as_ref(), &ChannelPath::Playback(room.id), Duration::from_secs(1))
                .await
                .unwrap()
                .unwrap();
        assert_eq!(playback, PlaybackState::initial(track("A")));
        let users = manager.presence(&room).users().await.unwrap();
        assert_eq!(users.users(), ["alice"]);
    }

    #[tokio::test]
    async fn create_validates_input() {
        let (store, _channel, manager) = manager();
        for bad in [
            CreateRoomParams::new("Room", 3, "alice", vec![]),
            CreateRoomParams::new("Room", 0, "alice", vec![track("A")]),
            CreateRoomParams::new("Room", 60, "alice", vec![track("A")]),
            CreateRoomParams::new("", 3, "alice", vec![track("A")]),
            CreateRoomParams::new("Room", 3, "al1ce", vec![track("A")]),
        ] {
            let err = manager.create(bad).await.unwrap_err();
            assert!(matches!(err, ListeningRoomError::InvalidInput(_)), "{err}");
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn failed_playback_write_rolls_back_document() {
        let (store, channel, manager) = manager();
        channel.fail_writes_matching("/playback");
        let err = manager.create(params(3)).await.unwrap_err();
        assert!(matches!(err, ListeningRoomError::CreateFailed(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn failed_presence_seed_rolls_back_everything() {
        let (store, channel, manager) = manager();
        channel.fail_writes_matching("/users");
        let err = manager.create(params(3)).await.unwrap_err();
        assert!(matches!(err, ListeningRoomError::CreateFailed(_)));
        assert!(store.is_empty());
        assert_eq!(manager.list().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn offline_store_fails_creation() {
        let (store, _channel, manager) = manager();
        store.set_available(false);
        let err = manager.create(params(3)).await.unwrap_err();
        assert!(matches!(err, ListeningRoomError::CreateFailed(_)));
    }

    #[tokio::test]
    async fn join_checks_room_and_username() {
        let (_store, _channel, manager) = manager();
        let err = manager.join(Uuid::new_v4(), "bob").await.unwrap_err();
        assert!(matches!(err, ListeningRoomError::NotFound));

        let room = manager.create(params(3)).await.unwrap();
        let err = manager.join(room.id, "b0b").await.unwrap_err();
        assert!(matches!(err, ListeningRoomError::InvalidInput(_)));

        let view = manager.join(room.id, "bob").await.unwrap();
        assert_eq!(view.role, SessionRole::Follower);
        assert_eq!(view.presence.users(), ["alice", "bob"]);
    }

    #[tokio::test]
    async fn close_requires_admin_and_is_idempotent() {
        let (store, channel, manager) = manager();
        let room = manager.create(params(3)).await.unwrap();

        let err = manager.close(room.id, SessionRole::Follower).await.unwrap_err();
        assert!(matches!(err, ListeningRoomError::Forbidden));
        assert_eq!(store.len(), 1);

        manager.close(room.id, SessionRole::Admin).await.unwrap();
        manager.close(room.id, SessionRole::Admin).await.unwrap();
        assert!(store.is_empty());
        assert!(channel.snapshot(&ChannelPath::Playback(room.id)).is_none());
        assert!(channel.snapshot(&ChannelPath::Users(room.id)).is_none());
    }

    #[tokio::test]
    async fn close_with_offline_store_keeps_document_and_reports() {
        let (store, channel, manager) = manager();
        let room = manager.create(params(3)).await.unwrap();
        store.set_available(false);

        let err = manager.close(room.id, SessionRole::Admin).await.unwrap_err();
        assert!(matches!(err, ListeningRoomError::ChannelUnavailable(_)), "{err}");
        assert!(channel.snapshot(&ChannelPath::Playback(room.id)).is_none());
        assert_eq!(store.len(), 1);

        store.set_available(true);
        manager.close(room.id, SessionRole::Admin).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn enter_with_admin_link_requires_recorded_admin() {
        let (_store, _channel, manager) = manager();
        let room = manager.create(params(3)).await.unwrap();
        let admin_link = ShareLink::admin(room.id).to_url("https://listen.test");

        let err = manager.enter(&admin_link, "mallory").await.unwrap_err();
        assert!(matches!(err, ListeningRoomError::Forbidden));

        let view = manager.enter(&admin_link, "alice").await.unwrap();
        assert_eq!(view.role, SessionRole::Admin);
        assert_eq!(view.presence.users(), ["alice"]);

        let follower = manager.enter(&room.share_url, "bob").await.unwrap();
        assert_eq!(follower.role, SessionRole::Follower);
    }

    #[tokio::test]
    async fn enter_readmits_an_admin_who_left() {
        let (_store, _channel, manager) = manager();
        let room = manager.create(params(3)).await.unwrap();
        manager.presence(&room).leave("alice").await.unwrap();

        let link = ShareLink::admin(room.id).to_url("https://listen.test");
        let view = manager.enter(&link, "alice").await.unwrap();
        assert_eq!(view.presence.users(), ["alice"]);
    }
}
