//! Presence tracker: admits and removes usernames against a room's capacity.
//!
//! The presence list lives at `room/{id}/users` and has many writers (every
//! joining client) and no lock. Writes are last-write-wins on the whole list,
//! so a join re-reads the list after writing it and only reports success when
//! the username survived.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::channel::{read_document, write_document, ChannelPath, RoomChannel};
use crate::config::{RetryPolicy, RoomConfig};
use crate::error::{ListeningRoomError, Result};
use crate::protocol::{Presence, RoomDocument, RoomId};

/// Capacity and uniqueness enforcement for one room.
#[derive(Clone)]
pub struct PresenceTracker {
    channel: Arc<dyn RoomChannel>,
    room_id: RoomId,
    capacity: u32,
    timeout: Duration,
    retry: RetryPolicy,
    join_attempts: u32,
}

impl PresenceTracker {
    pub fn new(channel: Arc<dyn RoomChannel>, room: &RoomDocument, config: &RoomConfig) -> Self {
        Self {
            channel,
            room_id: room.id,
            capacity: room.capacity,
            timeout: config.operation_timeout,
            retry: config.retry,
            join_attempts: config.join_attempts.max(1),
        }
    }

    fn path(&self) -> ChannelPath {
        ChannelPath::Users(self.room_id)
    }

    /// The current presence list. An absent list reads as empty.
    pub async fn users(&self) -> Result<Presence> {
        Ok(read_document(self.channel.as_ref(), &self.path(), self.timeout)
            .await?
            .unwrap_or_default())
    }

    /// Write the initial presence of a new room: the admin alone.
    pub(crate) async fn seed(&self, admin: &str) -> Result<()> {
        write_document(
            self.channel.as_ref(),
            &self.path(),
            &Presence::seeded(admin),
            self.timeout,
            self.retry,
        )
        .await
    }

    /// Add `username` to the room.
    ///
    /// # Errors
    ///
    /// - [`ListeningRoomError::Full`] when the room is at capacity.
    /// - [`ListeningRoomError::DuplicateName`] when the name is present.
    /// - [`ListeningRoomError::ChannelUnavailable`] when concurrent writers
    ///   kept overwriting the join for every attempt.
    ///
    /// Rejections never write to the channel.
    pub async fn join(&self, username: &str) -> Result<Presence> {
        for attempt in 0..self.join_attempts {
            let current = self.users().await?;
            let admitted = match current.admit(username, self.capacity) {
                Ok(admitted) => admitted,
                Err(rejection) => {
                    info!(
                        room = %self.room_id,
                        username,
                        users = current.len(),
                        "join rejected: {rejection}"
                    );
                    return Err(rejection);
                }
            };
            write_document(
                self.channel.as_ref(),
                &self.path(),
                &admitted,
                self.timeout,
                self.retry,
            )
            .await?;

            let confirmed = self.users().await?;
            match confirmed.position_of(username) {
                Some(index) if index < self.capacity as usize => {
                    debug!(room = %self.room_id, username, index, "join confirmed");
                    return Ok(confirmed);
                }
                Some(index) => {
                    warn!(
                        room = %self.room_id,
                        username,
                        index,
                        "admitted past capacity by a concurrent join, withdrawing"
                    );
                    self.leave(username).await?;
                    return Err(ListeningRoomError::Full);
                }
                None => {
                    warn!(
                        room = %self.room_id,
                        username,
                        attempt,
                        "join overwritten by a concurrent writer, retrying"
                    );
                }
            }
        }
        Err(ListeningRoomError::ChannelUnavailable(format!(
            "could not confirm presence of {username} after {} attempts",
            self.join_attempts
        )))
    }

    /// Remove `username`. Removing an absent name is a no-op.
    pub async fn leave(&self, username: &str) -> Result<()> {
        let current = self.users().await?;
        let Some(remaining) = current.without(username) else {
            debug!(room = %self.room_id, username, "leave: not present");
            return Ok(());
        };
        write_document(
            self.channel.as_ref(),
            &self.path(),
            &remaining,
            self.timeout,
            self.retry,
        )
        .await?;
        info!(room = %self.room_id, username, "left room");
        Ok(())
    }
}

impl std::fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("room_id", &self.room_id)
            .field("capacity", &self.capacity)
            .finish()
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
    use crate::backends::memory::MemoryChannel;
    use crate::channel::UpdateReceiver;
    use crate::protocol::{SubscriptionId, Track};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use uuid::Uuid;

    fn room(capacity: u32) -> RoomDocument {
        RoomDocument {
            id: Uuid::from_u128(1),
            name: "Test".into(),
            admin: "alice".into(),
            capacity,
            tracks: vec![Track {
                composer: "Test".into(),
                title: "A".into(),
                asset_ref: "audio/Test/A.mp3".into(),
                url: "https://cdn.test/A.mp3".into(),
            }],
            created_at: 0,
            share_url: String::new(),
        }
    }

    async fn seeded(capacity: u32) -> (Arc<MemoryChannel>, PresenceTracker) {
        let channel = Arc::new(MemoryChannel::new());
        let tracker = PresenceTracker::new(channel.clone(), &room(capacity), &RoomConfig::new("x"));
        tracker.seed("alice").await.unwrap();
        (channel, tracker)
    }

    #[tokio::test]
    async fn join_appends_in_arrival_order() {
        let (_channel, tracker) = seeded(3).await;
        tracker.join("bob").await.unwrap();
        let presence = tracker.join("carl").await.unwrap();
        assert_eq!(presence.users(), ["alice", "bob", "carl"]);
    }

    #[tokio::test]
    async fn full_room_rejects_without_writing() {
        let (channel, tracker) = seeded(2).await;
        tracker.join("bob").await.unwrap();
        let writes = channel.write_count();

        let err = tracker.join("carl").await.unwrap_err();
        assert!(matches!(err, ListeningRoomError::Full));
        assert_eq!(channel.write_count(), writes);
        assert_eq!(tracker.users().await.unwrap().users(), ["alice", "bob"]);
    }

    #[tokio::test]
    async fn duplicate_name_rejects_without_writing() {
        let (channel, tracker) = seeded(5).await;
        let writes = channel.write_count();
        let err = tracker.join("alice").await.unwrap_err();
        assert!(matches!(err, ListeningRoomError::DuplicateName));
        assert_eq!(channel.write_count(), writes);
    }

    #[tokio::test]
    async fn leave_is_idempotent() {
        let (channel, tracker) = seeded(5).await;
        tracker.join("bob").await.unwrap();
        tracker.leave("bob").await.unwrap();
        let writes = channel.write_count();
        tracker.leave("bob").await.unwrap();
        assert_eq!(channel.write_count(), writes);
        assert_eq!(tracker.users().await.unwrap().users(), ["alice"]);
    }

    /// Channel wrapper that lets a rival client overwrite the presence list
    /// right after the first presence write, as a concurrent joiner would.
    struct RacingChannel {
        inner: MemoryChannel,
        rival: Presence,
        raced: AtomicBool,
    }

    #[async_trait]
    impl RoomChannel for RacingChannel {
        async fn read(&self, path: &ChannelPath) -> Result<Option<serde_json::Value>> {
            self.inner.read(path).await
        }

        async fn write(&self, path: &ChannelPath, value: serde_json::Value) -> Result<()> {
            self.inner.write(path, value).await?;
            if matches!(path, ChannelPath::Users(_)) && !self.raced.swap(true, Ordering::SeqCst)
            {
                self.inner
                    .write(path, serde_json::to_value(&self.rival).unwrap())
                    .await?;
            }
            Ok(())
        }

        async fn subscribe(&self, path: &ChannelPath) -> Result<(SubscriptionId, UpdateReceiver)> {
            self.inner.subscribe(path).await
        }

        fn unsubscribe(&self, id: SubscriptionId) {
            self.inner.unsubscribe(id);
        }

        async fn remove(&self, path: &ChannelPath) -> Result<()> {
            self.inner.remove(path).await
        }
    }

    async fn racing(capacity: u32, rival: &[&str]) -> PresenceTracker {
        let inner = MemoryChannel::new();
        let initial = Presence::from_users(vec!["alice".to_string()]);
        inner
            .write(
                &ChannelPath::Users(room(capacity).id),
                serde_json::to_value(&initial).unwrap(),
            )
            .await
            .unwrap();
        let channel = Arc::new(RacingChannel {
            inner,
            rival: Presence::from_users(rival.iter().map(|s| s.to_string()).collect()),
            raced: AtomicBool::new(false),
        });
        PresenceTracker::new(channel, &room(capacity), &RoomConfig::new("x"))
    }

    #[tokio::test]
    async fn lost_race_retries_and_reports_full() {
        // bob's write is replaced by dave's; the room is then full.
        let tracker = racing(2, &["alice", "dave"]).await;
        let err = tracker.join("bob").await.unwrap_err();
        assert!(matches!(err, ListeningRoomError::Full));
        assert_eq!(tracker.users().await.unwrap().users(), ["alice", "dave"]);
    }

    #[tokio::test]
    async fn lost_race_retries_and_succeeds_when_room_remains() {
        let tracker = racing(3, &["alice", "dave"]).await;
        let presence = tracker.join("bob").await.unwrap();
        assert_eq!(presence.users(), ["alice", "dave", "bob"]);
    }

    #[tokio::test]
    async fn admitted_past_capacity_withdraws() {
        // A rival list that already holds bob beyond capacity.
        let tracker = racing(2, &["alice", "dave", "bob"]).await;
        let err = tracker.join("bob").await.unwrap_err();
        assert!(matches!(err, ListeningRoomError::Full));
        assert_eq!(tracker.users().await.unwrap().users(), ["alice", "dave"]);
    }
}
