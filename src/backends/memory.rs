//! In-process backends.
//!
//! [`MemoryChannel`], [`MemoryStore`] and [`MemoryCatalog`] keep everything in
//! memory. They back single-process deployments, demos, and every test in the
//! crate. Clients sharing one `Arc<MemoryChannel>` observe each other exactly
//! as clients of a hosted channel would.
//!
//! The channel and store also carry fault injection (unavailability, failing
//! writes, dropped subscriptions) so that degradation paths can be exercised.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::catalog::{group_by_composer, track_from_asset, TrackCatalog};
use crate::channel::{path_covers, ChannelPath, ChannelUpdate, RoomChannel, UpdateReceiver};
use crate::error::{ListeningRoomError, Result};
use crate::protocol::{RoomDocument, RoomId, SubscriptionId, Track};
use crate::store::RoomStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unavailable(what: &str) -> ListeningRoomError {
    ListeningRoomError::ChannelUnavailable(format!("{what} is offline"))
}

// ── Channel ─────────────────────────────────────────────────────────

struct Subscriber {
    path: String,
    tx: mpsc::UnboundedSender<ChannelUpdate>,
}

#[derive(Default)]
struct ChannelInner {
    values: BTreeMap<String, Value>,
    subscribers: HashMap<SubscriptionId, Subscriber>,
    failing_writes: u32,
    failing_suffix: Option<String>,
    write_count: usize,
}

impl ChannelInner {
    fn notify(&mut self, path: &str, update: &ChannelUpdate, covered: bool) {
        for (id, subscriber) in &self.subscribers {
            let matches = if covered {
                path_covers(path, &subscriber.path)
            } else {
                subscriber.path == path
            };
            if matches && subscriber.tx.send(update.clone()).is_err() {
                trace!(subscription = id, "subscriber receiver already dropped");
            }
        }
    }
}

/// An in-memory [`RoomChannel`].
pub struct MemoryChannel {
    inner: Mutex<ChannelInner>,
    next_subscription: AtomicU64,
    available: AtomicBool,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ChannelInner::default()),
            next_subscription: AtomicU64::new(1),
            available: AtomicBool::new(true),
        }
    }

    /// Take the channel offline (every operation fails with
    /// [`ListeningRoomError::ChannelUnavailable`]) or bring it back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Make the next `count` writes fail with a transient error.
    pub fn fail_next_writes(&self, count: u32) {
        lock(&self.inner).failing_writes = count;
    }

    /// Make every write to a path ending in `suffix` fail, e.g. `"/playback"`.
    pub fn fail_writes_matching(&self, suffix: impl Into<String>) {
        lock(&self.inner).failing_suffix = Some(suffix.into());
    }

    pub fn clear_write_failures(&self) {
        let mut inner = lock(&self.inner);
        inner.failing_writes = 0;
        inner.failing_suffix = None;
    }

    /// Drop every live subscription, as a lost connection would.
    ///
    /// Update receivers yield `None` afterwards.
    pub fn disconnect_subscribers(&self) {
        let dropped = std::mem::take(&mut lock(&self.inner).subscribers);
        debug!(count = dropped.len(), "memory channel dropped all subscribers");
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        lock(&self.inner).write_count
    }

    /// The raw value stored at `path`, bypassing availability.
    pub fn snapshot(&self, path: &ChannelPath) -> Option<Value> {
        lock(&self.inner).values.get(&path.to_string()).cloned()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(unavailable("memory channel"))
        }
    }
}

#[async_trait]
impl RoomChannel for MemoryChannel {
    async fn read(&self, path: &ChannelPath) -> Result<Option<Value>> {
        self.ensure_available()?;
        Ok(lock(&self.inner).values.get(&path.to_string()).cloned())
    }

    async fn write(&self, path: &ChannelPath, value: Value) -> Result<()> {
        self.ensure_available()?;
        let key = path.to_string();
        let mut inner = lock(&self.inner);
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(ListeningRoomError::ChannelUnavailable(format!(
                "injected write failure at {key}"
            )));
        }
        if inner
            .failing_suffix
            .as_deref()
            .is_some_and(|suffix| key.ends_with(suffix))
        {
            return Err(ListeningRoomError::ChannelUnavailable(format!(
                "writes to {key} are failing"
            )));
        }
        inner.values.insert(key.clone(), value.clone());
        inner.write_count += 1;
        inner.notify(&key, &ChannelUpdate::Value(value), false);
        trace!(path = %key, "memory channel write");
        Ok(())
    }

    async fn subscribe(&self, path: &ChannelPath) -> Result<(SubscriptionId, UpdateReceiver)> {
        self.ensure_available()?;
        let key = path.to_string();
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = lock(&self.inner);
        if let Some(current) = inner.values.get(&key) {
            // Receiver is alive, the send cannot fail.
            let _ = tx.send(ChannelUpdate::Value(current.clone()));
        }
        inner.subscribers.insert(id, Subscriber { path: key, tx });
        Ok((id, rx))
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        lock(&self.inner).subscribers.remove(&id);
    }

    async fn remove(&self, path: &ChannelPath) -> Result<()> {
        self.ensure_available()?;
        let key = path.to_string();
        let mut inner = lock(&self.inner);
        let before = inner.values.len();
        inner.values.retain(|stored, _| !path_covers(&key, stored));
        if inner.values.len() != before {
            inner.notify(&key, &ChannelUpdate::Removed, true);
            debug!(path = %key, "memory channel removed path");
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("MemoryChannel")
            .field("paths", &inner.values.len())
            .field("subscribers", &inner.subscribers.len())
            .field("available", &self.available.load(Ordering::Acquire))
            .finish()
    }
}

// ── Store ───────────────────────────────────────────────────────────

/// An in-memory [`RoomStore`].
#[derive(Debug)]
pub struct MemoryStore {
    rooms: Mutex<BTreeMap<RoomId, RoomDocument>>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        lock(&self.rooms).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.rooms).is_empty()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(unavailable("memory store"))
        }
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn get(&self, id: RoomId) -> Result<Option<RoomDocument>> {
        self.ensure_available()?;
        Ok(lock(&self.rooms).get(&id).cloned())
    }

    async fn set(&self, id: RoomId, document: RoomDocument) -> Result<()> {
        self.ensure_available()?;
        lock(&self.rooms).insert(id, document);
        Ok(())
    }

    async fn delete(&self, id: RoomId) -> Result<()> {
        self.ensure_available()?;
        lock(&self.rooms).remove(&id);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<RoomDocument>> {
        self.ensure_available()?;
        let mut rooms: Vec<_> = lock(&self.rooms).values().cloned().collect();
        rooms.sort_by_key(|room| room.created_at);
        Ok(rooms)
    }
}

// ── Catalog ─────────────────────────────────────────────────────────

/// A [`TrackCatalog`] over a fixed list of `(asset path, url)` pairs.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    assets: Vec<(String, String)>,
}

impl MemoryCatalog {
    pub fn new<P, U>(assets: impl IntoIterator<Item = (P, U)>) -> Self
    where
        P: Into<String>,
        U: Into<String>,
    {
        Self {
            assets: assets
                .into_iter()
                .map(|(path, url)| (path.into(), url.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl TrackCatalog for MemoryCatalog {
    async fn list(&self) -> Result<Vec<Track>> {
        let tracks = self
            .assets
            .iter()
            .map(|(path, url)| track_from_asset(path, url.as_str()))
            .collect::<Result<Vec<_>>>()?;
        Ok(group_by_composer(tracks))
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
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn subscribe_delivers_current_value_first() {
        let channel = MemoryChannel::new();
        let path = ChannelPath::Users(Uuid::nil());
        channel.write(&path, json!(["alice"])).await.unwrap();

        let (_id, mut rx) = channel.subscribe(&path).await.unwrap();
        assert_eq!(rx.recv().await, Some(ChannelUpdate::Value(json!(["alice"]))));

        channel.write(&path, json!(["alice", "bob"])).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(ChannelUpdate::Value(json!(["alice", "bob"])))
        );
    }

    #[tokio::test]
    async fn writes_only_reach_subscribers_of_that_path() {
        let channel = MemoryChannel::new();
        let id = Uuid::nil();
        let (_sub, mut rx) = channel.subscribe(&ChannelPath::Playback(id)).await.unwrap();
        channel
            .write(&ChannelPath::Users(id), json!(["alice"]))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn removing_room_notifies_children() {
        let channel = MemoryChannel::new();
        let id = Uuid::nil();
        channel
            .write(&ChannelPath::Users(id), json!(["alice"]))
            .await
            .unwrap();
        let (_sub, mut rx) = channel.subscribe(&ChannelPath::Users(id)).await.unwrap();
        let _ = rx.recv().await;

        channel.remove(&ChannelPath::Room(id)).await.unwrap();
        assert_eq!(rx.recv().await, Some(ChannelUpdate::Removed));
        assert!(channel.read(&ChannelPath::Users(id)).await.unwrap().is_none());

        // Removing again changes nothing and notifies nobody.
        channel.remove(&ChannelPath::Room(id)).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn removing_a_room_keeps_other_rooms() {
        let channel = MemoryChannel::new();
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        channel.write(&ChannelPath::Users(a), json!(["x"])).await.unwrap();
        channel.write(&ChannelPath::Users(b), json!(["y"])).await.unwrap();
        channel.remove(&ChannelPath::Room(a)).await.unwrap();
        assert!(channel.snapshot(&ChannelPath::Users(a)).is_none());
        assert_eq!(channel.snapshot(&ChannelPath::Users(b)), Some(json!(["y"])));
    }

    #[tokio::test]
    async fn disconnect_ends_update_streams() {
        let channel = MemoryChannel::new();
        let (_id, mut rx) = channel
            .subscribe(&ChannelPath::Playback(Uuid::nil()))
            .await
            .unwrap();
        channel.disconnect_subscribers();
        assert_eq!(rx.recv().await, None);
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn offline_channel_rejects_operations() {
        let channel = MemoryChannel::new();
        channel.set_available(false);
        let err = channel
            .read(&ChannelPath::Users(Uuid::nil()))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn matching_write_failures_persist_until_cleared() {
        let channel = MemoryChannel::new();
        let path = ChannelPath::Playback(Uuid::nil());
        channel.fail_writes_matching("/playback");
        assert!(channel.write(&path, json!(1)).await.is_err());
        assert!(channel.write(&path, json!(1)).await.is_err());
        assert!(channel
            .write(&ChannelPath::Users(Uuid::nil()), json!([]))
            .await
            .is_ok());
        channel.clear_write_failures();
        assert!(channel.write(&path, json!(1)).await.is_ok());
    }

    #[tokio::test]
    async fn catalog_lists_grouped_tracks() {
        let catalog = MemoryCatalog::new([
            ("audio/Satie/Gnossienne_1.mp3", "https://cdn/g1.mp3"),
            ("audio/Bach/Prelude.mp3", "https://cdn/p.mp3"),
        ]);
        let tracks = catalog.list().await.unwrap();
        assert_eq!(tracks[0].composer, "Bach");
        assert_eq!(tracks[1].title, "Gnossienne 1");
    }

    #[tokio::test]
    async fn store_delete_is_idempotent() {
        let store = MemoryStore::new();
        store.delete(Uuid::nil()).await.unwrap();
        assert!(store.get(Uuid::nil()).await.unwrap().is_none());
        assert!(store.is_empty());
    }
}
