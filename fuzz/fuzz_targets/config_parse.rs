#![no_main]

use std::fs;

use gcs_release_monitor::config::load_config;
use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let path = td.path().join("config.yaml");
    if fs::write(&path, data).is_ok() {
        let _ = load_config(&path);
    }
});
