//! Durable state persistence for the polling pipeline.
//!
//! Two JSON documents live under the state directory: `state.json` (the map
//! of processed object ids) and `snapshot-latest.json` (the last bucket
//! listing). The previous listing is kept as `snapshot-previous.json` for
//! operator inspection. Every write goes through a `.tmp` sibling followed
//! by an atomic rename, so the on-disk files are always either the old or
//! the new version, never torn.
//!
//! # Example
//!
//! ```
//! use gcs_release_monitor::state::StateStore;
//! use gcs_release_monitor::types::MonitorState;
//!
//! let dir = tempfile::tempdir().expect("tempdir");
//! let store = StateStore::new(dir.path());
//! store.bootstrap().expect("bootstrap");
//!
//! let state = store.load_state().expect("load");
//! assert!(state.processed.is_empty());
//! store.save_state(&state).expect("save");
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::types::{MonitorState, Snapshot};

/// State file name under the state directory.
pub const STATE_FILE: &str = "state.json";
/// Most recent bucket listing.
pub const SNAPSHOT_LATEST_FILE: &str = "snapshot-latest.json";
/// The listing before that, kept for diffing by hand.
pub const SNAPSHOT_PREVIOUS_FILE: &str = "snapshot-previous.json";

/// Persistent store for monitor state and bucket snapshots.
#[derive(Debug, Clone)]
pub struct StateStore {
    state_dir: PathBuf,
    state_file: PathBuf,
    latest_snapshot_file: PathBuf,
    previous_snapshot_file: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            state_file: state_dir.join(STATE_FILE),
            latest_snapshot_file: state_dir.join(SNAPSHOT_LATEST_FILE),
            previous_snapshot_file: state_dir.join(SNAPSHOT_PREVIOUS_FILE),
        }
    }

    /// Create the state directory if it does not exist yet.
    pub fn bootstrap(&self) -> Result<()> {
        fs::create_dir_all(&self.state_dir).with_context(|| {
            format!("failed to create state dir {}", self.state_dir.display())
        })
    }

    /// Load the processed-object map. A missing file is an empty state.
    pub fn load_state(&self) -> Result<MonitorState> {
        if !self.state_file.exists() {
            return Ok(MonitorState::empty());
        }
        let content = fs::read_to_string(&self.state_file)
            .with_context(|| format!("failed to read state file {}", self.state_file.display()))?;
        let mut state: MonitorState = serde_json::from_str(&content).with_context(|| {
            format!("failed to parse state JSON from {}", self.state_file.display())
        })?;
        for record in state.processed.values_mut() {
            record.normalize();
        }
        Ok(state)
    }

    pub fn save_state(&self, state: &MonitorState) -> Result<()> {
        write_json_atomic(&self.state_file, state)
    }

    /// Load the last persisted listing, or `None` on first run.
    pub fn load_latest_snapshot(&self) -> Result<Option<Snapshot>> {
        if !self.latest_snapshot_file.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.latest_snapshot_file).with_context(|| {
            format!(
                "failed to read snapshot file {}",
                self.latest_snapshot_file.display()
            )
        })?;
        let snapshot: Snapshot = serde_json::from_str(&content).with_context(|| {
            format!(
                "failed to parse snapshot JSON from {}",
                self.latest_snapshot_file.display()
            )
        })?;
        Ok(Some(snapshot))
    }

    /// Install a new latest snapshot, demoting the current one to previous.
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        if self.latest_snapshot_file.exists() {
            fs::rename(&self.latest_snapshot_file, &self.previous_snapshot_file).with_context(
                || {
                    format!(
                        "failed to rotate snapshot to {}",
                        self.previous_snapshot_file.display()
                    )
                },
            )?;
        }
        write_json_atomic(&self.latest_snapshot_file, snapshot)
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }
}

/// Serialize as pretty JSON into `<target>.tmp`, then rename over the target.
fn write_json_atomic<T: Serialize>(target: &Path, value: &T) -> Result<()> {
    let mut tmp = target.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let json = serde_json::to_string_pretty(value).context("failed to serialize JSON")?;
    fs::write(&tmp, json)
        .with_context(|| format!("failed to write temp file {}", tmp.display()))?;
    fs::rename(&tmp, target)
        .with_context(|| format!("failed to rename temp file to {}", target.display()))?;
    Ok(())
}
