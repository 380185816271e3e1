#![no_main]

use std::fs;

use gcs_release_monitor::state::StateStore;
use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let path = td.path().join("state.json");
    if fs::write(path, data).is_ok() {
        let _ = StateStore::new(td.path()).load_state();
    }
});
