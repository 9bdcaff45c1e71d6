#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Relay protocol tests.
//!
//! The client half ([`RelayChannel`]) is driven against a scripted
//! [`MockPeer`]; the relay half ([`serve_channel`]) is driven by pushing raw
//! requests. The last tests connect both halves over loopback transports and
//! run a whole room through them.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_test::assert_ok;
use uuid::Uuid;

use listening_room::backends::memory::{MemoryChannel, MemoryStore};
use listening_room::backends::relay::{serve_channel, RelayChannel, RelayConfig};
use listening_room::channel::ChannelUpdate;
use listening_room::protocol::{ChannelNotice, ChannelRequest};
use listening_room::transports::loopback::loopback_pair;
use listening_room::{
    ChannelPath, CreateRoomParams, ErrorCode, ListeningRoomError, PlayState, RoomChannel,
    RoomEvent, RoomManager, RoomView, Subscription,
};

use common::{eventually, fast_config, track, wait_for, FakePlayer, MockTransport, WAIT};

fn relay_client() -> (Arc<RelayChannel>, common::MockPeer) {
    let (transport, peer) = MockTransport::new();
    (Arc::new(RelayChannel::start(transport, RelayConfig::default())), peer)
}

// ════════════════════════════════════════════════════════════════════
// Client side
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn calls_are_numbered_and_resolved_by_their_answers() {
    let (relay, mut peer) = relay_client();
    let room = Uuid::new_v4();

    let reader = Arc::clone(&relay);
    let read = tokio::spawn(async move { reader.read(&ChannelPath::Playback(room)).await });
    match peer.next_request().await {
        ChannelRequest::Read { request_id, path } => {
            assert_eq!(request_id, 1);
            assert_eq!(path, format!("room/{room}/playback"));
        }
        other => panic!("expected Read, got {other:?}"),
    }
    peer.push(ChannelNotice::ReadResult {
        request_id: 1,
        value: Some(json!(["alice"])),
    });
    assert_eq!(read.await.unwrap().unwrap(), Some(json!(["alice"])));

    let writer = Arc::clone(&relay);
    let write =
        tokio::spawn(async move { writer.write(&ChannelPath::Users(room), json!(["bob"])).await });
    match peer.next_request().await {
        ChannelRequest::Write {
            request_id, value, ..
        } => {
            assert_eq!(request_id, 2);
            assert_eq!(value, json!(["bob"]));
        }
        other => panic!("expected Write, got {other:?}"),
    }
    peer.push(ChannelNotice::Ack { request_id: 2 });
    assert_ok!(write.await.unwrap());

    let remover = Arc::clone(&relay);
    let remove = tokio::spawn(async move { remover.remove(&ChannelPath::Room(room)).await });
    match peer.next_request().await {
        ChannelRequest::Remove { request_id, path } => {
            assert_eq!(request_id, 3);
            assert_eq!(path, format!("room/{room}"));
        }
        other => panic!("expected Remove, got {other:?}"),
    }
    peer.push(ChannelNotice::Ack { request_id: 3 });
    assert_ok!(remove.await.unwrap());
}

#[tokio::test]
async fn relay_errors_map_back_to_backend_errors() {
    let (relay, mut peer) = relay_client();
    let room = Uuid::new_v4();

    let writer = Arc::clone(&relay);
    let write =
        tokio::spawn(async move { writer.write(&ChannelPath::Users(room), json!([])).await });
    peer.next_request().await;
    peer.push(ChannelNotice::Error {
        request_id: Some(1),
        message: "rules rejected the write".into(),
        error_code: Some(ErrorCode::PermissionDenied),
    });
    assert!(matches!(
        write.await.unwrap(),
        Err(ListeningRoomError::Forbidden)
    ));

    let reader = Arc::clone(&relay);
    let read = tokio::spawn(async move { reader.read(&ChannelPath::Users(room)).await });
    peer.next_request().await;
    peer.push(ChannelNotice::Error {
        request_id: Some(2),
        message: "backend offline".into(),
        error_code: None,
    });
    let err = read.await.unwrap().unwrap_err();
    assert!(err.is_transient(), "{err}");
}

#[tokio::test]
async fn subscriptions_deliver_updates_and_unsubscribe_on_drop() {
    let (relay, mut peer) = relay_client();
    let room = Uuid::new_v4();
    let channel: Arc<dyn RoomChannel> = relay.clone();

    let open = tokio::spawn(Subscription::open(channel, ChannelPath::Users(room), WAIT));
    match peer.next_request().await {
        ChannelRequest::Subscribe {
            request_id,
            subscription,
            path,
        } => {
            assert_eq!((request_id, subscription), (1, 1));
            assert_eq!(path, format!("room/{room}/users"));
        }
        other => panic!("expected Subscribe, got {other:?}"),
    }
    peer.push(ChannelNotice::Ack { request_id: 1 });
    let mut subscription = open.await.unwrap().unwrap();
    assert_eq!(subscription.id(), 1);

    peer.push(ChannelNotice::Value {
        subscription: 1,
        value: json!(["alice", "bob"]),
    });
    peer.push(ChannelNotice::Value {
        subscription: 42,
        value: json!(["nobody"]),
    });
    peer.push(ChannelNotice::Removed { subscription: 1 });
    assert_eq!(
        subscription.next().await,
        Some(ChannelUpdate::Value(json!(["alice", "bob"])))
    );
    assert_eq!(subscription.next().await, Some(ChannelUpdate::Removed));

    drop(subscription);
    assert!(matches!(
        peer.next_request().await,
        ChannelRequest::Unsubscribe { subscription: 1 }
    ));
}

#[tokio::test]
async fn rejected_subscription_fails_the_call() {
    let (relay, mut peer) = relay_client();
    let reader = Arc::clone(&relay);
    let open =
        tokio::spawn(async move { reader.subscribe(&ChannelPath::Users(Uuid::new_v4())).await });
    peer.next_request().await;
    peer.push(ChannelNotice::Error {
        request_id: Some(1),
        message: "unknown path".into(),
        error_code: Some(ErrorCode::UnknownPath),
    });
    assert!(matches!(
        open.await.unwrap(),
        Err(ListeningRoomError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn hang_up_fails_pending_calls_and_ends_streams() {
    let (relay, mut peer) = relay_client();
    let room = Uuid::new_v4();

    let channel: Arc<dyn RoomChannel> = relay.clone();
    let open = tokio::spawn(Subscription::open(channel, ChannelPath::Playback(room), WAIT));
    peer.next_request().await;
    peer.push(ChannelNotice::Ack { request_id: 1 });
    let mut subscription = open.await.unwrap().unwrap();

    let reader = Arc::clone(&relay);
    let read = tokio::spawn(async move { reader.read(&ChannelPath::Playback(room)).await });
    peer.next_request().await;
    peer.hang_up();

    let err = read.await.unwrap().unwrap_err();
    assert!(matches!(err, ListeningRoomError::ChannelUnavailable(_)));
    assert_eq!(subscription.next().await, None);
    eventually(|| !relay.is_connected()).await;

    let err = relay.read(&ChannelPath::Playback(room)).await.unwrap_err();
    assert!(matches!(err, ListeningRoomError::ChannelUnavailable(_)));
}

#[tokio::test]
async fn heartbeat_sends_pings() {
    let (transport, mut peer) = MockTransport::new();
    let config = RelayConfig::default().with_heartbeat_interval(Duration::from_millis(20));
    let _relay = RelayChannel::start(transport, config);

    assert!(matches!(peer.next_request().await, ChannelRequest::Ping));
    peer.push(ChannelNotice::Pong);
    assert!(matches!(peer.next_request().await, ChannelRequest::Ping));
}

#[tokio::test]
async fn silent_relay_is_disconnected() {
    let (transport, mut peer) = MockTransport::new();
    let config = RelayConfig::default().with_heartbeat_interval(Duration::from_millis(25));
    let relay = Arc::new(RelayChannel::start(transport, config));
    let room = Uuid::new_v4();

    let channel: Arc<dyn RoomChannel> = relay.clone();
    let open = tokio::spawn(Subscription::open(channel, ChannelPath::Playback(room), WAIT));
    loop {
        match peer.next_request().await {
            ChannelRequest::Ping => continue,
            ChannelRequest::Subscribe { request_id, .. } => {
                peer.push(ChannelNotice::Ack { request_id });
                break;
            }
            other => panic!("expected Subscribe, got {other:?}"),
        }
    }
    let mut subscription = open.await.unwrap().unwrap();

    // Pings go unanswered from here on.
    let ended = tokio::time::timeout(WAIT, subscription.next()).await;
    assert_eq!(ended.unwrap(), None);
    eventually(|| !relay.is_connected()).await;
    assert!(peer.closed.load(Ordering::Relaxed));
}

#[tokio::test]
async fn cancelled_subscribe_is_released_once_acknowledged() {
    let (relay, mut peer) = relay_client();
    let room = Uuid::new_v4();

    let channel: Arc<dyn RoomChannel> = relay.clone();
    let open = tokio::spawn(Subscription::open(
        channel,
        ChannelPath::Playback(room),
        Duration::from_millis(50),
    ));
    let (request_id, subscription) = match peer.next_request().await {
        ChannelRequest::Subscribe {
            request_id,
            subscription,
            ..
        } => (request_id, subscription),
        other => panic!("expected Subscribe, got {other:?}"),
    };
    assert!(matches!(
        open.await.unwrap(),
        Err(ListeningRoomError::Timeout)
    ));

    peer.push(ChannelNotice::Ack { request_id });
    peer.push(ChannelNotice::Value {
        subscription,
        value: json!({}),
    });
    assert!(matches!(
        peer.next_request().await,
        ChannelRequest::Unsubscribe { subscription: released } if released == subscription
    ));

    // The connection stays usable.
    let reader = Arc::clone(&relay);
    let read = tokio::spawn(async move { reader.read(&ChannelPath::Playback(room)).await });
    match peer.next_request().await {
        ChannelRequest::Read { request_id, .. } => peer.push(ChannelNotice::ReadResult {
            request_id,
            value: None,
        }),
        other => panic!("expected Read, got {other:?}"),
    }
    assert_eq!(read.await.unwrap().unwrap(), None);
}

#[tokio::test]
async fn shutdown_closes_the_transport() {
    let (relay, peer) = relay_client();
    assert!(relay.is_connected());
    relay.shutdown().await;
    assert!(!relay.is_connected());
    assert!(peer.closed.load(Ordering::Relaxed));
    relay.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Relay side
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn serve_answers_requests_against_the_channel() {
    let channel = Arc::new(MemoryChannel::new());
    let (transport, mut peer) = MockTransport::new();
    let server = tokio::spawn(serve_channel(channel.clone(), transport));
    let room = Uuid::new_v4();
    let users = format!("room/{room}/users");

    peer.push(ChannelRequest::Write {
        request_id: 1,
        path: users.clone(),
        value: json!(["alice"]),
    });
    assert!(matches!(
        peer.next_notice().await,
        ChannelNotice::Ack { request_id: 1 }
    ));
    assert_eq!(channel.snapshot(&ChannelPath::Users(room)), Some(json!(["alice"])));

    peer.push(ChannelRequest::Read {
        request_id: 2,
        path: users.clone(),
    });
    match peer.next_notice().await {
        ChannelNotice::ReadResult { request_id, value } => {
            assert_eq!(request_id, 2);
            assert_eq!(value, Some(json!(["alice"])));
        }
        other => panic!("expected ReadResult, got {other:?}"),
    }

    peer.push(ChannelRequest::Ping);
    assert!(matches!(peer.next_notice().await, ChannelNotice::Pong));

    peer.hang_up();
    assert_ok!(tokio::time::timeout(WAIT, server).await.unwrap().unwrap());
    assert!(peer.closed.load(Ordering::Relaxed));
}

#[tokio::test]
async fn serve_reports_bad_requests() {
    let channel = Arc::new(MemoryChannel::new());
    let (transport, mut peer) = MockTransport::new();
    let _server = tokio::spawn(serve_channel(channel, transport));

    peer.push(ChannelRequest::Read {
        request_id: 7,
        path: "lobby/everyone".into(),
    });
    match peer.next_notice().await {
        ChannelNotice::Error {
            request_id,
            error_code,
            ..
        } => {
            assert_eq!(request_id, Some(7));
            assert_eq!(error_code, Some(ErrorCode::UnknownPath));
        }
        other => panic!("expected Error, got {other:?}"),
    }

    peer.push_raw("{not json");
    match peer.next_notice().await {
        ChannelNotice::Error {
            request_id,
            error_code,
            ..
        } => {
            assert_eq!(request_id, None);
            assert_eq!(error_code, Some(ErrorCode::MalformedDocument));
        }
        other => panic!("expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn serve_forwards_subscriptions_until_unsubscribed() {
    let channel = Arc::new(MemoryChannel::new());
    let (transport, mut peer) = MockTransport::new();
    let _server = tokio::spawn(serve_channel(channel.clone(), transport));
    let room = Uuid::new_v4();
    let path = ChannelPath::Playback(room);

    peer.push(ChannelRequest::Subscribe {
        request_id: 1,
        subscription: 9,
        path: path.to_string(),
    });
    assert!(matches!(
        peer.next_notice().await,
        ChannelNotice::Ack { request_id: 1 }
    ));
    assert_eq!(channel.subscriber_count(), 1);

    channel.write(&path, json!({"sequence": 1})).await.unwrap();
    match peer.next_notice().await {
        ChannelNotice::Value {
            subscription,
            value,
        } => {
            assert_eq!(subscription, 9);
            assert_eq!(value["sequence"], 1);
        }
        other => panic!("expected Value, got {other:?}"),
    }

    channel.remove(&ChannelPath::Room(room)).await.unwrap();
    assert!(matches!(
        peer.next_notice().await,
        ChannelNotice::Removed { subscription: 9 }
    ));

    peer.push(ChannelRequest::Unsubscribe { subscription: 9 });
    let memory = channel.clone();
    eventually(|| memory.subscriber_count() == 0).await;
}

// ════════════════════════════════════════════════════════════════════
// Both sides over loopback
// ════════════════════════════════════════════════════════════════════

/// A relay client connected to `channel` through an in-process relay.
fn connect(channel: &Arc<MemoryChannel>) -> Arc<RelayChannel> {
    let (client_end, relay_end) = loopback_pair();
    tokio::spawn(serve_channel(channel.clone(), relay_end));
    Arc::new(RelayChannel::start(client_end, RelayConfig::default()))
}

#[tokio::test]
async fn room_flow_over_the_relay() {
    let memory = Arc::new(MemoryChannel::new());
    let store = Arc::new(MemoryStore::new());
    let alice_manager = RoomManager::new(store.clone(), connect(&memory), fast_config());
    let bob_manager = RoomManager::new(store.clone(), connect(&memory), fast_config());

    let room = alice_manager
        .create(CreateRoomParams::new(
            "Relayed",
            3,
            "alice",
            vec![track("A"), track("B")],
        ))
        .await
        .unwrap();
    let (mut alice, _alice_events) = alice_manager
        .open_session(RoomView::for_admin(room.clone()), FakePlayer::new())
        .await
        .unwrap();

    let view = bob_manager.enter(&room.share_url, "bob").await.unwrap();
    assert_eq!(view.presence.users(), ["alice", "bob"]);
    let bob_player = FakePlayer::new();
    let (bob, mut bob_events) = bob_manager
        .open_session(view, bob_player.clone())
        .await
        .unwrap();

    let state = alice.play().await.unwrap();
    assert_eq!(state.transport, PlayState::Playing);
    wait_for(&mut bob_events, |e| {
        matches!(e, RoomEvent::PlaybackApplied(s) if s.sequence == 1)
    })
    .await;
    assert!(bob_player.state().playing);
    assert_eq!(bob.users().await.users(), ["alice", "bob"]);

    alice.close().await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, RoomEvent::RoomClosed)).await;
    assert!(store.is_empty());
    assert!(memory.snapshot(&ChannelPath::Playback(room.id)).is_none());
}

#[tokio::test]
async fn relay_loss_degrades_sessions() {
    let memory = Arc::new(MemoryChannel::new());
    let store = Arc::new(MemoryStore::new());
    let admin = RoomManager::new(store.clone(), memory.clone(), fast_config());
    let room = admin
        .create(CreateRoomParams::new("Fragile", 3, "alice", vec![track("A")]))
        .await
        .unwrap();

    let relay = connect(&memory);
    let follower = RoomManager::new(store, relay.clone(), fast_config());
    let view = follower.join(room.id, "bob").await.unwrap();
    let (bob, mut bob_events) = follower.open_session(view, FakePlayer::new()).await.unwrap();

    relay.shutdown().await;
    wait_for(&mut bob_events, |e| matches!(e, RoomEvent::SyncDegraded { .. })).await;
    assert!(bob.is_degraded());
}
