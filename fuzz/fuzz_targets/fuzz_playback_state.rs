#![no_main]

use libfuzzer_sys::fuzz_target;
use listening_room::protocol::{PlaybackEvent, PlaybackState, Presence, RoomDocument};

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<RoomDocument>(data);

    if let Ok(presence) = serde_json::from_slice::<Presence>(data) {
        if let Ok(admitted) = presence.admit("fuzzer", 59) {
            assert!(admitted.len() <= 59);
        }
    }

    // Any decoded snapshot must advance to a valid successor.
    if let Ok(state) = serde_json::from_slice::<PlaybackState>(data) {
        for event in [
            PlaybackEvent::Play,
            PlaybackEvent::Pause,
            PlaybackEvent::Seek(state.position - 1.0),
        ] {
            let next = state.advance(&event, f64::NAN);
            assert!(next.position >= 0.0);
            assert!(next.sequence >= state.sequence);
        }
    }
});
