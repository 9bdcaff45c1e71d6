#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Wire format tests for room documents and relay messages.
//!
//! Fixtures are written out as JSON text, the way another client of the same
//! backend or a relay would produce them.

use listening_room::error_codes::ErrorCode;
use listening_room::protocol::{
    ChannelNotice, ChannelRequest, PlayState, PlaybackState, Presence, RoomDocument, Track,
};
use serde_json::json;

const ROOM_ID: &str = "6f1c2a3e-8b9d-4e5f-a1b2-c3d4e5f60718";

fn track(name: &str) -> Track {
    Track {
        composer: "Bach".into(),
        title: name.into(),
        asset_ref: format!("audio/Bach/{name}.mp3"),
        url: format!("https://cdn.test/{name}.mp3"),
    }
}

// ════════════════════════════════════════════════════════════════════
// Documents
// ════════════════════════════════════════════════════════════════════

#[test]
fn room_document_fixture() {
    let json = format!(
        r#"{{
            "id": "{ROOM_ID}",
            "name": "Sunday Bach",
            "admin": "alice",
            "capacity": 8,
            "tracks": [
                {{"composer": "Bach", "title": "A", "ref": "audio/Bach/A.mp3", "url": "https://cdn.test/A.mp3"}},
                {{"composer": "Bach", "title": "B", "ref": "audio/Bach/B.mp3", "url": "https://cdn.test/B.mp3"}}
            ],
            "createdAt": 1760000000000,
            "shareUrl": "https://listen.test/rooms/{ROOM_ID}"
        }}"#
    );
    let room: RoomDocument = serde_json::from_str(&json).unwrap();
    assert_eq!(room.id.to_string(), ROOM_ID);
    assert_eq!(room.capacity, 8);
    assert_eq!(room.tracks, vec![track("A"), track("B")]);
    assert_eq!(room.created_at, 1_760_000_000_000);
    assert_eq!(room.track_index(&track("B")), Some(1));

    let back = serde_json::to_value(&room).unwrap();
    assert_eq!(back["shareUrl"], format!("https://listen.test/rooms/{ROOM_ID}"));
    assert!(back.get("share_url").is_none());
}

#[test]
fn playback_state_fixture() {
    let json = r#"{
        "activeTrack": {"composer": "Bach", "title": "B", "ref": "audio/Bach/B.mp3", "url": "https://cdn.test/B.mp3"},
        "transport": "playing",
        "position": 83.25,
        "sequence": 17
    }"#;
    let state: PlaybackState = serde_json::from_str(json).unwrap();
    assert_eq!(state.active_track, track("B"));
    assert_eq!(state.transport, PlayState::Playing);
    assert_eq!(state.position, 83.25);
    assert_eq!(state.sequence, 17);
    assert!(state.is_playing());
}

#[test]
fn playback_state_rejects_unknown_transport() {
    let json = json!({
        "activeTrack": track("A"),
        "transport": "stopped",
        "position": 0.0,
        "sequence": 0
    });
    assert!(serde_json::from_value::<PlaybackState>(json).is_err());
}

#[test]
fn playback_state_requires_a_sequence() {
    let json = json!({
        "activeTrack": track("A"),
        "transport": "paused",
        "position": 0.0
    });
    assert!(serde_json::from_value::<PlaybackState>(json).is_err());
}

#[test]
fn presence_is_a_plain_list_in_arrival_order() {
    let presence: Presence = serde_json::from_str(r#"["alice","bob","carl"]"#).unwrap();
    assert_eq!(presence.users(), ["alice", "bob", "carl"]);
    assert_eq!(presence.position_of("carl"), Some(2));
    assert_eq!(serde_json::to_value(&presence).unwrap(), json!(["alice", "bob", "carl"]));
}

#[test]
fn presence_built_from_users_matches_the_decoded_list() {
    let built = Presence::from_users(vec!["alice".into(), "bob".into()]);
    let decoded: Presence = serde_json::from_value(json!(["alice", "bob"])).unwrap();
    assert_eq!(built, decoded);
    assert!(built.contains("bob"));
    assert!(!built.contains("Bob"));
}

// ════════════════════════════════════════════════════════════════════
// Relay messages
// ════════════════════════════════════════════════════════════════════

#[test]
fn requests_are_adjacently_tagged() {
    let write = ChannelRequest::Write {
        request_id: 4,
        path: format!("room/{ROOM_ID}/users"),
        value: json!(["alice"]),
    };
    assert_eq!(
        serde_json::to_value(&write).unwrap(),
        json!({
            "type": "Write",
            "data": {"request_id": 4, "path": format!("room/{ROOM_ID}/users"), "value": ["alice"]}
        })
    );
    assert_eq!(
        serde_json::to_value(ChannelRequest::Ping).unwrap(),
        json!({"type": "Ping"})
    );
}

#[test]
fn request_fixtures_decode() {
    let subscribe: ChannelRequest = serde_json::from_str(
        r#"{"type":"Subscribe","data":{"request_id":2,"subscription":5,"path":"room/x/playback"}}"#,
    )
    .unwrap();
    assert!(matches!(
        subscribe,
        ChannelRequest::Subscribe {
            request_id: 2,
            subscription: 5,
            ..
        }
    ));

    let unsubscribe: ChannelRequest =
        serde_json::from_str(r#"{"type":"Unsubscribe","data":{"subscription":5}}"#).unwrap();
    assert!(matches!(
        unsubscribe,
        ChannelRequest::Unsubscribe { subscription: 5 }
    ));

    assert!(serde_json::from_str::<ChannelRequest>(r#"{"type":"Truncate","data":{}}"#).is_err());
}

#[test]
fn notice_fixtures_decode() {
    let read: ChannelNotice =
        serde_json::from_str(r#"{"type":"ReadResult","data":{"request_id":3}}"#).unwrap();
    assert!(matches!(
        read,
        ChannelNotice::ReadResult {
            request_id: 3,
            value: None
        }
    ));

    let removed: ChannelNotice =
        serde_json::from_str(r#"{"type":"Removed","data":{"subscription":1}}"#).unwrap();
    assert!(matches!(removed, ChannelNotice::Removed { subscription: 1 }));

    let error: ChannelNotice = serde_json::from_str(
        r#"{"type":"Error","data":{"request_id":9,"message":"denied","error_code":"PERMISSION_DENIED"}}"#,
    )
    .unwrap();
    match error {
        ChannelNotice::Error {
            request_id,
            message,
            error_code,
        } => {
            assert_eq!(request_id, Some(9));
            assert_eq!(message, "denied");
            assert_eq!(error_code, Some(ErrorCode::PermissionDenied));
        }
        other => panic!("expected Error, got {other:?}"),
    }
}

#[test]
fn connection_level_error_omits_absent_fields() {
    let notice = ChannelNotice::Error {
        request_id: None,
        message: "bad frame".into(),
        error_code: None,
    };
    assert_eq!(
        serde_json::to_value(&notice).unwrap(),
        json!({"type": "Error", "data": {"message": "bad frame"}})
    );
}

#[test]
fn error_codes_use_screaming_snake_case() {
    for (code, text) in [
        (ErrorCode::RoomFull, "ROOM_FULL"),
        (ErrorCode::RoomNotFound, "ROOM_NOT_FOUND"),
        (ErrorCode::DuplicateName, "DUPLICATE_NAME"),
        (ErrorCode::ChannelUnavailable, "CHANNEL_UNAVAILABLE"),
        (ErrorCode::UnknownPath, "UNKNOWN_PATH"),
    ] {
        assert_eq!(serde_json::to_value(code).unwrap(), json!(text));
        assert_eq!(serde_json::from_value::<ErrorCode>(json!(text)).unwrap(), code);
    }
}
