//! Domain types: bucket object metadata, snapshots, and processing records.
//!
//! A `Snapshot` is the full listing of a bucket at one instant, keyed by
//! object id (`name#generation`). `MonitorState` records which object ids
//! have already produced a delivered webhook; it only ever grows.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Object-name suffixes accepted as release archives when the bucket does not
/// set a useful content type.
pub const ARCHIVE_SUFFIX_DEFAULTS: &[&str] =
    &[".tar.gz", ".tgz", ".tar.xz", ".tar.zst", ".zip", ".gz"];

/// Content types accepted as release archives.
pub const CONTENT_TYPE_DEFAULTS: &[&str] = &[
    "application/gzip",
    "application/x-gzip",
    "application/x-tar",
    "application/gzip-compressed",
    "application/octet-stream",
];

/// Current UTC time as an ISO-8601 string with whole-second precision.
pub fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Metadata for one versioned object in the source bucket.
///
/// `generation` is the store-assigned version token; together with `name` it
/// forms the dedup identity ([`ObjectMeta::object_id`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub bucket: String,
    pub name: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub generation: String,
    pub metageneration: Option<String>,
    pub md5_hash: Option<String>,
    pub crc32c: Option<String>,
    pub etag: Option<String>,
    pub updated: String,
    pub time_created: Option<String>,
}

impl ObjectMeta {
    /// Deduplication identity: `name#generation`.
    pub fn object_id(&self) -> String {
        format!("{}#{}", self.name, self.generation)
    }

    /// Display URL for logs and payloads.
    pub fn gs_url(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.name)
    }

    /// Directory placeholders list with size 0 and a trailing slash.
    pub fn is_file(&self) -> bool {
        self.size > 0 && !self.name.ends_with('/')
    }
}

/// Full listing of a bucket at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub bucket: String,
    pub captured_at: String,
    #[serde(default)]
    pub objects: BTreeMap<String, ObjectMeta>,
}

impl Snapshot {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            captured_at: now_iso(),
            objects: BTreeMap::new(),
        }
    }

    /// Insert an object under its id. Entries with an empty id are dropped.
    pub fn insert(&mut self, meta: ObjectMeta) {
        let id = meta.object_id();
        if id != "#" {
            self.objects.insert(id, meta);
        }
    }
}

/// Role of an uploaded artifact within a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    /// The release binary extracted from the archive.
    Binary,
    /// The chain genesis descriptor extracted from the archive.
    Genesis,
    /// The archive itself (selection fallback).
    Archive,
}

impl ArtifactType {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactType::Binary => "binary",
            ArtifactType::Genesis => "genesis",
            ArtifactType::Archive => "archive",
        }
    }
}

/// One artifact shipped (or referenced) for a processed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedArtifact {
    pub artifact_type: ArtifactType,
    #[serde(default)]
    pub artifact_name: Option<String>,
    pub source_member: Option<String>,
    pub nextcloud_path: String,
    pub nextcloud_url: String,
    pub share_url: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
}

/// Commit marker for a fully processed object.
///
/// A record exists for an object id only after the webhook for that object
/// was accepted downstream. The top-level `nextcloud_*` fields mirror the
/// primary (first) upload for quick operator inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub processed_at: String,
    pub nextcloud_path: String,
    pub nextcloud_url: String,
    pub share_url: Option<String>,
    pub webhook_delivered_at: String,
    #[serde(default)]
    pub uploads: Vec<UploadedArtifact>,
}

/// Map of processed object ids to their commit markers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorState {
    #[serde(default)]
    pub processed: BTreeMap<String, ProcessingRecord>,
}

impl MonitorState {
    pub fn empty() -> Self {
        Self::default()
    }
}

impl ProcessingRecord {
    /// Records written before per-artifact tracking existed carry no
    /// `uploads` list; synthesize a single archive entry from the top-level
    /// fields so the rest of the code can assume the list is non-empty.
    pub fn normalize(&mut self) {
        if self.uploads.is_empty() {
            self.uploads.push(UploadedArtifact {
                artifact_type: ArtifactType::Archive,
                artifact_name: None,
                source_member: None,
                nextcloud_path: self.nextcloud_path.clone(),
                nextcloud_url: self.nextcloud_url.clone(),
                share_url: self.share_url.clone(),
                download_url: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> ObjectMeta {
        ObjectMeta {
            bucket: "releases".to_string(),
            name: "v2.0.9/node-v2.0.9.tar.gz".to_string(),
            size: 123,
            content_type: Some("application/x-tar".to_string()),
            generation: "111".to_string(),
            metageneration: Some("1".to_string()),
            md5_hash: None,
            crc32c: None,
            etag: Some("etag-1".to_string()),
            updated: "2026-02-16T00:00:00Z".to_string(),
            time_created: Some("2026-02-16T00:00:00Z".to_string()),
        }
    }

    #[test]
    fn object_id_joins_name_and_generation() {
        assert_eq!(sample_meta().object_id(), "v2.0.9/node-v2.0.9.tar.gz#111");
    }

    #[test]
    fn gs_url_formats_bucket_and_name() {
        assert_eq!(
            sample_meta().gs_url(),
            "gs://releases/v2.0.9/node-v2.0.9.tar.gz"
        );
    }

    #[test]
    fn directories_and_empty_objects_are_not_files() {
        let mut meta = sample_meta();
        assert!(meta.is_file());

        meta.size = 0;
        assert!(!meta.is_file());

        meta.size = 10;
        meta.name = "v2.0.9/".to_string();
        assert!(!meta.is_file());
    }

    #[test]
    fn snapshot_drops_entries_without_identity() {
        let mut snapshot = Snapshot::new("releases");
        let mut meta = sample_meta();
        meta.name = String::new();
        meta.generation = String::new();
        snapshot.insert(meta);
        assert!(snapshot.objects.is_empty());

        snapshot.insert(sample_meta());
        assert_eq!(snapshot.objects.len(), 1);
    }

    #[test]
    fn snapshot_roundtrips_regardless_of_insertion_order() {
        let mut forward = Snapshot::new("releases");
        let mut backward = Snapshot::new("releases");
        backward.captured_at = forward.captured_at.clone();

        let mut second = sample_meta();
        second.name = "a-first/node.tar.gz".to_string();
        second.generation = "7".to_string();

        forward.insert(sample_meta());
        forward.insert(second.clone());
        backward.insert(second);
        backward.insert(sample_meta());

        assert_eq!(forward, backward);

        let json = serde_json::to_string(&forward).expect("serialize");
        let parsed: Snapshot = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, forward);
    }

    #[test]
    fn artifact_type_serializes_lowercase() {
        let json = serde_json::to_string(&ArtifactType::Genesis).expect("serialize");
        assert_eq!(json, "\"genesis\"");
        assert_eq!(ArtifactType::Binary.as_str(), "binary");
    }

    #[test]
    fn legacy_record_without_uploads_gains_archive_entry() {
        let json = r#"{
            "processed_at": "2026-01-01T00:00:00Z",
            "nextcloud_path": "release-mirror/acme/v1.0.0-node.tar.gz-g5",
            "nextcloud_url": "https://cloud.example/remote.php/dav/files/svc/x",
            "share_url": null,
            "webhook_delivered_at": "2026-01-01T00:00:00Z"
        }"#;
        let mut record: ProcessingRecord = serde_json::from_str(json).expect("deserialize");
        record.normalize();
        assert_eq!(record.uploads.len(), 1);
        assert_eq!(record.uploads[0].artifact_type, ArtifactType::Archive);
        assert_eq!(
            record.uploads[0].nextcloud_path,
            "release-mirror/acme/v1.0.0-node.tar.gz-g5"
        );
    }

    #[test]
    fn now_iso_has_second_precision_and_utc_suffix() {
        let ts = now_iso();
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), "2026-01-01T00:00:00Z".len());
    }
}
