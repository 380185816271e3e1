//! Percent-escaping helpers for object names, WebDAV segments, and share
//! links.
//!
//! Both sets keep the unreserved characters (`ALPHA / DIGIT / - _ . ~`);
//! [`escape_path`] additionally keeps `/` so object names survive as URL
//! paths. Downstream verifiers compare these escapes byte-for-byte, so the
//! sets are fixed here rather than borrowed from a URL library's defaults.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const PATH: &AsciiSet = &COMPONENT.remove(b'/');

/// Escape a single path component; `/` becomes `%2F`.
pub fn escape_component(value: &str) -> String {
    utf8_percent_encode(value, COMPONENT).to_string()
}

/// Escape an object name for use as a URL path; `/` is kept.
pub fn escape_path(value: &str) -> String {
    utf8_percent_encode(value, PATH).to_string()
}
