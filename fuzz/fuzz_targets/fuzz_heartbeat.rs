#![no_main]

use imlink::protocol::HeartbeatMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    // Anything that parses must re-encode and parse back to the same value.
    if let Ok(heartbeat) = serde_json::from_str::<HeartbeatMessage>(text) {
        let json = heartbeat.to_json().unwrap_or_default();
        assert_eq!(
            serde_json::from_str::<HeartbeatMessage>(&json).ok(),
            Some(heartbeat)
        );
    }
});
