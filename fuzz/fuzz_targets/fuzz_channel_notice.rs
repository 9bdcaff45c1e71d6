#![no_main]

use libfuzzer_sys::fuzz_target;
use listening_room::protocol::{ChannelNotice, ChannelRequest};

fuzz_target!(|data: &[u8]| {
    // Both directions of the relay protocol arrive as untrusted text.
    let _ = serde_json::from_slice::<ChannelNotice>(data);
    let _ = serde_json::from_slice::<ChannelRequest>(data);

    if let Ok(s) = std::str::from_utf8(data) {
        let _ = s.parse::<listening_room::ChannelPath>();
        let _ = listening_room::ShareLink::parse(s);
    }
});
