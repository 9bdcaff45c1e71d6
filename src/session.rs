//! Per-client room runtime.
//!
//! [`RoomSession`] is a handle over a background listener task, in the same
//! shape as a transport client: the listener multiplexes the playback and
//! presence subscriptions with a shutdown signal via `tokio::select!`, and
//! reports what happened on a bounded [`RoomEvent`] channel returned from
//! [`RoomSession::start`].
//!
//! # Example
//!
//! ```rust,ignore
//! let (mut session, mut events) =
//!     RoomSession::start(channel, room, "bob".into(), SessionRole::Follower, player, config)
//!         .await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         RoomEvent::PlaybackApplied(state) => { /* update the UI */ }
//!         RoomEvent::RoomClosed => break,
//!         _ => {}
//!     }
//! }
//! session.leave().await?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{
    read_document, write_document, ChannelPath, ChannelUpdate, RoomChannel, Subscription,
};
use crate::config::RoomConfig;
use crate::error::{ListeningRoomError, Result};
use crate::error_codes::ErrorCode;
use crate::event::RoomEvent;
use crate::lifecycle::close_room;
use crate::presence::PresenceTracker;
use crate::protocol::{PlaybackEvent, PlaybackState, Presence, RoomDocument, Track};
use crate::role::SessionRole;
use crate::store::RoomStore;
use crate::sync::{LocalPlayer, PlaybackSynchronizer, SkipDirection, SyncPhase, UpdateOutcome};

// ── Shared state ────────────────────────────────────────────────────

/// State shared by the handle and the listener, guarded by one async mutex.
struct SessionInner<P> {
    sync: PlaybackSynchronizer,
    player: P,
    presence: Presence,
}

struct SessionState {
    closed: AtomicBool,
    degraded: AtomicBool,
}

impl SessionState {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
        }
    }
}

// ── Session handle ──────────────────────────────────────────────────

/// One client's participation in one room.
///
/// Admin sessions publish playback events; follower sessions mirror them.
/// Call [`leave`](Self::leave) when done. Dropping the session without it
/// aborts the listener and removes the username from presence on a
/// best-effort basis.
pub struct RoomSession<P: LocalPlayer> {
    room: RoomDocument,
    username: String,
    role: SessionRole,
    channel: Arc<dyn RoomChannel>,
    store: Option<Arc<dyn RoomStore>>,
    config: RoomConfig,
    presence: PresenceTracker,
    inner: Arc<Mutex<SessionInner<P>>>,
    /// Serializes admin publishes so that snapshots reach the channel in
    /// sequence order.
    publish_lock: Mutex<()>,
    state: Arc<SessionState>,
    event_tx: mpsc::Sender<RoomEvent>,
    task: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    left: bool,
}

impl<P: LocalPlayer> RoomSession<P> {
    /// Load the room's playback state into `player`, subscribe to the room and
    /// start the listener.
    ///
    /// The username must already be present in the room; admission is the
    /// job of [`RoomManager::join`](crate::lifecycle::RoomManager::join).
    ///
    /// # Errors
    ///
    /// - [`ListeningRoomError::NotFound`] when the room has no playback state.
    /// - Channel errors from the initial read or the subscriptions.
    pub async fn start(
        channel: Arc<dyn RoomChannel>,
        room: RoomDocument,
        username: String,
        role: SessionRole,
        mut player: P,
        config: RoomConfig,
    ) -> Result<(Self, mpsc::Receiver<RoomEvent>)> {
        let timeout = config.operation_timeout;
        let snapshot: PlaybackState =
            read_document(channel.as_ref(), &ChannelPath::Playback(room.id), timeout)
                .await?
                .ok_or(ListeningRoomError::NotFound)?;

        let presence = PresenceTracker::new(Arc::clone(&channel), &room, &config);
        let users = presence.users().await?;

        let playback_sub =
            Subscription::open(Arc::clone(&channel), ChannelPath::Playback(room.id), timeout)
                .await?;
        let users_sub =
            Subscription::open(Arc::clone(&channel), ChannelPath::Users(room.id), timeout).await?;

        let mut sync = PlaybackSynchronizer::new(role, room.tracks.clone(), config.drift_tolerance);
        sync.load(snapshot.clone(), &mut player);

        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        emit_event(
            &event_tx,
            RoomEvent::Loaded {
                playback: snapshot,
                role,
            },
        );

        let inner = Arc::new(Mutex::new(SessionInner {
            sync,
            player,
            presence: users,
        }));
        let state = Arc::new(SessionState::new());

        let task = tokio::spawn(listen(
            playback_sub,
            users_sub,
            Arc::clone(&inner),
            Arc::clone(&state),
            event_tx.clone(),
            shutdown_rx,
        ));

        info!(room = %room.id, username = %username, ?role, "session started");

        let session = Self {
            room,
            username,
            role,
            channel,
            store: None,
            config,
            presence,
            inner,
            publish_lock: Mutex::new(()),
            state,
            event_tx,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            left: false,
        };
        Ok((session, event_rx))
    }

    /// Attach the room store, so that [`close`](Self::close) also deletes the
    /// room document.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn RoomStore>) -> Self {
        self.store = Some(store);
        self
    }

    // ── Admin API ───────────────────────────────────────────────────

    /// Publish a playback event to every follower. Admin only.
    ///
    /// The admin's own player is brought in line first; a failed write does
    /// not roll it back. On failure a [`RoomEvent::Notice`] is emitted as well.
    pub async fn publish(&self, event: PlaybackEvent) -> Result<PlaybackState> {
        self.publish_with(|_| Ok(event)).await
    }

    pub async fn play(&self) -> Result<PlaybackState> {
        self.publish(PlaybackEvent::Play).await
    }

    pub async fn pause(&self) -> Result<PlaybackState> {
        self.publish(PlaybackEvent::Pause).await
    }

    /// Seek to `position` seconds.
    pub async fn seek(&self, position: f64) -> Result<PlaybackState> {
        self.publish(PlaybackEvent::Seek(position)).await
    }

    /// Switch to `track`, which must be one of the room's tracks.
    pub async fn select_track(&self, track: Track) -> Result<PlaybackState> {
        self.publish(PlaybackEvent::TrackChange(track)).await
    }

    /// Switch to the previous or next track, wrapping around the playlist.
    pub async fn skip_track(&self, direction: SkipDirection) -> Result<PlaybackState> {
        self.publish_with(|sync| sync.skip_target(direction).map(PlaybackEvent::TrackChange))
            .await
    }

    /// Close the room for everyone. Admin only.
    ///
    /// Removes the room's channel region (followers receive
    /// [`RoomEvent::RoomClosed`]) and, when a store is attached, the room
    /// document. The session is finished afterwards without a presence write.
    pub async fn close(&mut self) -> Result<()> {
        self.role.require_admin()?;
        close_room(
            self.channel.as_ref(),
            self.store.as_deref(),
            self.room.id,
            &self.config,
        )
        .await?;
        self.state.closed.store(true, Ordering::Release);
        self.leave().await
    }

    async fn publish_with<F>(&self, make_event: F) -> Result<PlaybackState>
    where
        F: FnOnce(&PlaybackSynchronizer) -> Result<PlaybackEvent>,
    {
        self.role.require_admin()?;
        if self.is_closed() {
            return Err(ListeningRoomError::NotFound);
        }
        let _ordered = self.publish_lock.lock().await;
        let snapshot = {
            let mut inner = self.inner.lock().await;
            let SessionInner { sync, player, .. } = &mut *inner;
            let event = make_event(&*sync)?;
            let snapshot = sync.prepare(&event, player.position())?;
            sync.commit(snapshot.clone(), player);
            snapshot
        };
        let written = write_document(
            self.channel.as_ref(),
            &ChannelPath::Playback(self.room.id),
            &snapshot,
            self.config.operation_timeout,
            self.config.retry,
        )
        .await;
        match written {
            Ok(()) => {
                debug!(
                    room = %self.room.id,
                    sequence = snapshot.sequence,
                    transport = ?snapshot.transport,
                    "published playback state"
                );
                Ok(snapshot)
            }
            Err(e) => {
                warn!(room = %self.room.id, sequence = snapshot.sequence, "publish failed: {e}");
                emit_event(
                    &self.event_tx,
                    RoomEvent::Notice {
                        code: e.code(),
                        message: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    // ── Any role ────────────────────────────────────────────────────

    /// Turn following of remote playback on or off.
    ///
    /// With `catch_up`, re-enabling applies the latest known snapshot right
    /// away instead of waiting for the next one. Returns `true` if the player
    /// was touched.
    pub async fn set_sync_enabled(&self, enabled: bool, catch_up: bool) -> bool {
        let touched = {
            let mut inner = self.inner.lock().await;
            let SessionInner { sync, player, .. } = &mut *inner;
            sync.set_enabled(enabled, catch_up, player)
        };
        debug!(room = %self.room.id, enabled, catch_up, touched, "local sync toggled");
        emit_event(&self.event_tx, RoomEvent::SyncToggled { enabled });
        touched
    }

    /// Latest playback state known to this client.
    pub async fn playback(&self) -> Option<PlaybackState> {
        self.inner.lock().await.sync.latest().cloned()
    }

    pub async fn phase(&self) -> SyncPhase {
        self.inner.lock().await.sync.phase()
    }

    /// Presence as last delivered by the channel.
    pub async fn users(&self) -> Presence {
        self.inner.lock().await.presence.clone()
    }

    /// `true` while remote updates reach the local player.
    pub async fn is_synchronized(&self) -> bool {
        !self.is_degraded() && !self.is_closed() && self.inner.lock().await.sync.is_enabled()
    }

    /// `true` once the channel stopped delivering updates.
    pub fn is_degraded(&self) -> bool {
        self.state.degraded.load(Ordering::Acquire)
    }

    /// `true` once the room was closed.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    pub fn room(&self) -> &RoomDocument {
        &self.room
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Leave the room.
    ///
    /// Stops the listener (releasing every subscription) before stopping the
    /// local player, then removes the username from presence unless the room
    /// is already closed. Calling it again does nothing.
    pub async fn leave(&mut self) -> Result<()> {
        if self.left {
            return Ok(());
        }
        self.left = true;
        self.stop_listener().await;
        self.inner.lock().await.player.stop();
        if self.is_closed() {
            debug!(room = %self.room.id, username = %self.username, "room closed, skipping presence leave");
            return Ok(());
        }
        self.presence.leave(&self.username).await?;
        info!(room = %self.room.id, username = %self.username, "session left");
        Ok(())
    }

    async fn stop_listener(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.config.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("session listener terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("session listener did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("session listener aborted: {join_err}");
                    }
                }
            }
        }
    }
}

impl<P: LocalPlayer> std::fmt::Debug for RoomSession<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSession")
            .field("room", &self.room.id)
            .field("username", &self.username)
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .field("degraded", &self.is_degraded())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl<P: LocalPlayer> Drop for RoomSession<P> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if self.left || self.is_closed() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let presence = self.presence.clone();
                let username = std::mem::take(&mut self.username);
                handle.spawn(async move {
                    if let Err(e) = presence.leave(&username).await {
                        warn!(username = %username, "best-effort leave on drop failed: {e}");
                    }
                });
            }
            Err(_) => {
                warn!(username = %self.username, "session dropped outside a runtime; presence not updated");
            }
        }
    }
}

// ── Listener ────────────────────────────────────────────────────────

/// Background listener applying channel updates until shutdown, room
/// removal, or the end of a subscription.
///
/// Owns both subscription guards, so every exit path unsubscribes.
async fn listen<P: LocalPlayer>(
    mut playback: Subscription,
    mut users: Subscription,
    inner: Arc<Mutex<SessionInner<P>>>,
    state: Arc<SessionState>,
    event_tx: mpsc::Sender<RoomEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!(playback = playback.id(), users = users.id(), "session listener started");

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("session listener shutdown requested");
                break;
            }

            update = playback.next() => match update {
                Some(ChannelUpdate::Value(value)) => {
                    match serde_json::from_value::<PlaybackState>(value) {
                        Ok(snapshot) => apply_playback(&inner, &event_tx, snapshot).await,
                        Err(e) => {
                            warn!("malformed playback state: {e}");
                            emit_event(&event_tx, RoomEvent::Notice {
                                code: ErrorCode::MalformedDocument,
                                message: e.to_string(),
                            });
                        }
                    }
                }
                Some(ChannelUpdate::Removed) => {
                    emit_room_closed(&event_tx, &state).await;
                    break;
                }
                None => {
                    emit_degraded(&event_tx, &state, "playback subscription ended");
                    break;
                }
            },

            update = users.next() => match update {
                Some(ChannelUpdate::Value(value)) => {
                    match serde_json::from_value::<Presence>(value) {
                        Ok(presence) => {
                            inner.lock().await.presence = presence.clone();
                            emit_event(&event_tx, RoomEvent::PresenceChanged(presence));
                        }
                        Err(e) => warn!("malformed presence list: {e}"),
                    }
                }
                Some(ChannelUpdate::Removed) => {
                    emit_room_closed(&event_tx, &state).await;
                    break;
                }
                None => {
                    emit_degraded(&event_tx, &state, "presence subscription ended");
                    break;
                }
            },
        }
    }

    debug!("session listener exited");
}

async fn apply_playback<P: LocalPlayer>(
    inner: &Mutex<SessionInner<P>>,
    event_tx: &mpsc::Sender<RoomEvent>,
    snapshot: PlaybackState,
) {
    let sequence = snapshot.sequence;
    let outcome = {
        let mut guard = inner.lock().await;
        let SessionInner { sync, player, .. } = &mut *guard;
        sync.on_remote_update(snapshot.clone(), player)
    };
    match outcome {
        UpdateOutcome::Applied => emit_event(event_tx, RoomEvent::PlaybackApplied(snapshot)),
        UpdateOutcome::Deferred => emit_event(event_tx, RoomEvent::PlaybackDeferred { sequence }),
        UpdateOutcome::Stale | UpdateOutcome::OwnEcho => {}
    }
}

/// Emit an event without blocking the listener. A full channel drops the
/// event with a warning.
fn emit_event(event_tx: &mpsc::Sender<RoomEvent>, event: RoomEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!(
                "event channel full, dropping event: {:?}",
                std::mem::discriminant(&dropped)
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}

fn emit_degraded(event_tx: &mpsc::Sender<RoomEvent>, state: &SessionState, reason: &str) {
    warn!("sync degraded: {reason}");
    state.degraded.store(true, Ordering::Release);
    emit_event(
        event_tx,
        RoomEvent::SyncDegraded {
            reason: reason.to_owned(),
        },
    );
}

/// `RoomClosed` is the last event of a session and is never dropped.
async fn emit_room_closed(event_tx: &mpsc::Sender<RoomEvent>, state: &SessionState) {
    info!("room closed by admin");
    state.closed.store(true, Ordering::Release);
    if event_tx.send(RoomEvent::RoomClosed).await.is_err() {
        debug!("event channel closed, receiver dropped");
    }
}
