#![no_main]

use gcs_release_monitor::monitor::extract_release_tag;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let tag = extract_release_tag(&text, "g1");
    // Either a version-shaped tag or the generation fallback.
    assert!(tag.starts_with('v') || tag == "gcs-g1");
});
