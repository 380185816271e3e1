#![no_main]

use gcs_release_monitor::notes::extract_section_for_tag;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let (split_at, _) = text.char_indices().nth(8).unwrap_or((text.len(), ' '));
    let (tag, body) = text.split_at(split_at);

    let (section, _has_versions) = extract_section_for_tag(body, tag);
    if let Some(section) = section {
        // Sections are bounded by the truncation cap plus its marker.
        assert!(section.chars().count() <= 40_000 + 100);
        assert!(!section.is_empty());
    }
});
