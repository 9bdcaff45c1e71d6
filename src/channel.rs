//! The room state channel: a live, subscribable key-value region per room.
//!
//! The channel is the synchronization medium between clients. It holds two
//! documents per room, the [`PlaybackState`](crate::protocol::PlaybackState)
//! at `room/{id}/playback` and the [`Presence`](crate::protocol::Presence) at
//! `room/{id}/users`. Backends implement [`RoomChannel`]; the rest of the
//! crate only talks to `Arc<dyn RoomChannel>`.
//!
//! Subscriptions are handed out as [`Subscription`] guards. Dropping a guard
//! unsubscribes, so a listener can never outlive its owner.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{ListeningRoomError, Result};
use crate::protocol::{RoomId, SubscriptionId};

// ── Paths ───────────────────────────────────────────────────────────

/// Locations inside the channel used by the room protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelPath {
    /// The whole region of a room. Removing it removes every child.
    Room(RoomId),
    /// `room/{id}/playback`, the atomic playback snapshot.
    Playback(RoomId),
    /// `room/{id}/users`, the presence list.
    Users(RoomId),
}

impl ChannelPath {
    pub fn room_id(&self) -> RoomId {
        match self {
            Self::Room(id) | Self::Playback(id) | Self::Users(id) => *id,
        }
    }
}

impl FromStr for ChannelPath {
    type Err = ListeningRoomError;

    fn from_str(path: &str) -> Result<Self> {
        let unknown = || ListeningRoomError::InvalidInput(format!("unknown channel path: {path}"));
        let mut segments = path.split('/');
        if segments.next() != Some("room") {
            return Err(unknown());
        }
        let id = segments
            .next()
            .and_then(|id| RoomId::parse_str(id).ok())
            .ok_or_else(unknown)?;
        let parsed = match segments.next() {
            None => Self::Room(id),
            Some("playback") => Self::Playback(id),
            Some("users") => Self::Users(id),
            Some(_) => return Err(unknown()),
        };
        if segments.next().is_some() {
            return Err(unknown());
        }
        Ok(parsed)
    }
}

impl fmt::Display for ChannelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Room(id) => write!(f, "room/{id}"),
            Self::Playback(id) => write!(f, "room/{id}/playback"),
            Self::Users(id) => write!(f, "room/{id}/users"),
        }
    }
}

/// Returns `true` if `path` is `parent` or lies below it.
pub fn path_covers(parent: &str, path: &str) -> bool {
    match path.strip_prefix(parent) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

// ── Channel contract ────────────────────────────────────────────────

/// A notification delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelUpdate {
    /// The full current value at the subscribed path.
    Value(serde_json::Value),
    /// The subscribed path, or one of its ancestors, was removed.
    Removed,
}

/// Receiving half of a subscription, as returned by [`RoomChannel::subscribe`].
pub type UpdateReceiver = mpsc::UnboundedReceiver<ChannelUpdate>;

/// A mutable, subscribable key-value region shared by every client of a room.
///
/// # Delivery contract
///
/// - A new subscription first receives the current value (if any), then every
///   subsequent write to the path, in write order.
/// - `remove` on a path notifies subscribers of that path and of every path
///   below it with [`ChannelUpdate::Removed`].
/// - When the backend connection is lost, the update receivers of all live
///   subscriptions end (`recv` yields `None`).
///
/// Writes replace the whole value at a path in one step; partial updates are
/// not part of the contract.
#[async_trait]
pub trait RoomChannel: Send + Sync + 'static {
    /// Current value at `path`, or `None` when nothing is stored there.
    async fn read(&self, path: &ChannelPath) -> Result<Option<serde_json::Value>>;

    /// Replace the value at `path`.
    async fn write(&self, path: &ChannelPath, value: serde_json::Value) -> Result<()>;

    /// Register a subscriber for `path`.
    async fn subscribe(&self, path: &ChannelPath) -> Result<(SubscriptionId, UpdateReceiver)>;

    /// Release a subscription. Unknown ids are ignored.
    ///
    /// Synchronous so that it can run from `Drop`.
    fn unsubscribe(&self, id: SubscriptionId);

    /// Delete `path` and everything below it. Removing an absent path is not
    /// an error.
    async fn remove(&self, path: &ChannelPath) -> Result<()>;
}

// ── Subscription guard ──────────────────────────────────────────────

/// An open subscription that unsubscribes when dropped.
pub struct Subscription {
    id: SubscriptionId,
    path: ChannelPath,
    updates: UpdateReceiver,
    channel: Arc<dyn RoomChannel>,
}

impl Subscription {
    /// Subscribe to `path`, failing with [`ListeningRoomError::Timeout`] after `timeout`.
    pub async fn open(
        channel: Arc<dyn RoomChannel>,
        path: ChannelPath,
        timeout: Duration,
    ) -> Result<Self> {
        let (id, updates) = with_timeout(timeout, channel.subscribe(&path)).await?;
        debug!(%path, subscription = id, "subscribed");
        Ok(Self {
            id,
            path,
            updates,
            channel,
        })
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn path(&self) -> ChannelPath {
        self.path
    }

    /// Next update, or `None` once the channel has dropped the subscription.
    ///
    /// Cancel-safe: usable as a `tokio::select!` branch.
    pub async fn next(&mut self) -> Option<ChannelUpdate> {
        self.updates.recv().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("path", &self.path.to_string())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.channel.unsubscribe(self.id);
        debug!(path = %self.path, subscription = self.id, "unsubscribed");
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Run a channel or store operation with a client-side deadline.
///
/// # Errors
///
/// Returns [`ListeningRoomError::Timeout`] if `operation` does not finish in
/// time, or the operation's own error.
pub async fn with_timeout<T, F>(timeout: Duration, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| ListeningRoomError::Timeout)?
}

/// Read and decode the document at `path`.
pub async fn read_document<T: DeserializeOwned>(
    channel: &dyn RoomChannel,
    path: &ChannelPath,
    timeout: Duration,
) -> Result<Option<T>> {
    match with_timeout(timeout, channel.read(path)).await? {
        Some(serde_json::Value::Null) | None => Ok(None),
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
    }
}

/// Encode `document` and write it to `path`, retrying transient failures.
///
/// Each attempt gets its own `timeout`. Non-transient errors are returned
/// immediately.
pub async fn write_document<T: Serialize + ?Sized>(
    channel: &dyn RoomChannel,
    path: &ChannelPath,
    document: &T,
    timeout: Duration,
    retry: RetryPolicy,
) -> Result<()> {
    let value = serde_json::to_value(document)?;
    let attempts = retry.attempts.max(1);
    let mut attempt = 0;
    loop {
        match with_timeout(timeout, channel.write(path, value.clone())).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                let delay = retry.delay_for(attempt);
                warn!(%path, attempt, ?delay, "channel write failed, retrying: {e}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Remove `path`, retrying transient failures like [`write_document`].
pub async fn remove_path(
    channel: &dyn RoomChannel,
    path: &ChannelPath,
    timeout: Duration,
    retry: RetryPolicy,
) -> Result<()> {
    let attempts = retry.attempts.max(1);
    let mut attempt = 0;
    loop {
        match with_timeout(timeout, channel.remove(path)).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                let delay = retry.delay_for(attempt);
                warn!(%path, attempt, ?delay, "channel remove failed, retrying: {e}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
