//! # GCS Release Monitor
//!
//! A single-node daemon that watches an object-storage bucket for newly
//! appearing release archives, mirrors the interesting files to Nextcloud,
//! and announces each release to a downstream release filter with a signed
//! webhook.
//!
//! ## Guarantees
//!
//! - **At-most-once delivery per object** — every object is identified by
//!   `name#generation`; a processing record is committed only after the
//!   downstream accepted the webhook, and recorded objects are never
//!   re-delivered automatically.
//! - **Crash-safe state** — state and snapshot files are written through a
//!   temp-file-plus-rename discipline, so a crash leaves either the old or
//!   the new file, never a torn one.
//! - **Ordered notification** — candidates are processed in ascending
//!   `updated` order, and the per-object commit preserves that order across
//!   restarts.
//! - **Graceful degradation** — release-notes extraction is best-effort,
//!   and member selection can fall back to shipping the archive whole.
//!
//! ## Pipeline
//!
//! The core flow per polling cycle is **snapshot → diff → filter →
//! process → persist**:
//!
//! 1. [`source::ObjectSource::list_snapshot`] captures the bucket listing.
//! 2. [`monitor::diff_snapshot`] yields the object ids new since the last
//!    persisted snapshot; the archive filter and the processed map prune
//!    them to real work.
//! 3. Per candidate: download, [`notes`] extraction,
//!    [`artifacts::select_upload_candidates`], optional
//!    [`nextcloud::NextcloudClient`] mirroring, then
//!    [`webhook`] signing and delivery.
//! 4. [`state::StateStore`] persists the processing record after each
//!    delivered object, and the new snapshot at cycle end.
//!
//! ## Modules
//!
//! - [`monitor`] — the pipeline engine: run-once/run-forever, per-object
//!   processing, payload construction
//! - [`types`] — object metadata, snapshots, processing records
//! - [`config`] — typed YAML configuration with validation
//! - [`state`] — crash-safe persistence of state and snapshots
//! - [`source`] — bucket listing/download variants behind one trait
//! - [`artifacts`] — binary/genesis member selection from tar archives
//! - [`notes`] — release-notes extraction and section matching
//! - [`nextcloud`] — WebDAV uploads and OCS public shares
//! - [`webhook`] — canonical JSON, HMAC signing, delivery
//!
//! ## CLI Usage
//!
//! For the operator surface, see the `gcs-release-monitor-cli` crate.

/// Binary/genesis member selection from tar archives.
pub mod artifacts;

/// Typed YAML configuration with validation.
pub mod config;

/// The pipeline engine: run-once/run-forever and payload construction.
pub mod monitor;

/// WebDAV uploads and OCS public shares.
pub mod nextcloud;

/// Release-notes extraction and section matching.
pub mod notes;

/// Bucket listing/download variants behind one trait.
pub mod source;

/// Crash-safe persistence of state and snapshots.
pub mod state;

/// Object metadata, snapshots, processing records.
pub mod types;

/// Percent-escaping helpers shared by the HTTP clients.
mod urlenc;

/// Canonical JSON, HMAC signing, webhook delivery.
pub mod webhook;
