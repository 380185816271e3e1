#![no_main]

use gcs_release_monitor::webhook::{build_signed_payload, canonical_json};
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return;
    };

    // Canonicalization must be a fixed point and deterministic under signing.
    let encoded = canonical_json(&value);
    let reparsed: Value = serde_json::from_str(&encoded).expect("canonical JSON parses");
    assert_eq!(encoded, canonical_json(&reparsed));

    let first = build_signed_payload(&value, "fuzz-secret", Some(1_700_000_000));
    let second = build_signed_payload(&reparsed, "fuzz-secret", Some(1_700_000_000));
    assert_eq!(first, second);
});
