#![no_main]

use imlink::protocol::ApiResponse;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Every endpoint decodes one of these three payload shapes.
    if let Ok(envelope) = serde_json::from_slice::<ApiResponse<i64>>(data) {
        let _ = envelope.into_data();
    }
    if let Ok(envelope) = serde_json::from_slice::<ApiResponse<String>>(data) {
        let _ = envelope.clone().into_optional_data();
        let _ = envelope.into_data();
    }
    let _ = serde_json::from_slice::<ApiResponse<serde_json::Value>>(data);
});
