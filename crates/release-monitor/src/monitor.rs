//! The polling pipeline: snapshot, diff, process, persist.
//!
//! One cycle lists the bucket, diffs against the last persisted snapshot,
//! and walks the new candidate archives in ascending `updated` order. Each
//! object is downloaded to a scratch directory, inspected for binary and
//! genesis artifacts plus release notes, optionally mirrored to Nextcloud,
//! and announced downstream with a signed webhook. The processing record is
//! persisted immediately after each delivered webhook, so a crash loses at
//! most the in-progress object and never replays a delivered one.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde_json::{Value, json};

use crate::artifacts::{self, UploadCandidate};
use crate::config::{AppConfig, DeliveryMode};
use crate::nextcloud::NextcloudClient;
use crate::notes::{self, ExtractedReleaseNotes};
use crate::source::{self, ObjectSource, is_candidate_archive};
use crate::state::StateStore;
use crate::types::{ArtifactType, ObjectMeta, ProcessingRecord, Snapshot, UploadedArtifact, now_iso};
use crate::urlenc::escape_component;
use crate::webhook::WebhookClient;

static VERSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"v\d+(?:\.\d+){1,3}(?:-[0-9A-Za-z][0-9A-Za-z.-]*)?").expect("static regex")
});

/// Sink for operator-visible progress messages.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Extract a release tag from the object name: the basename first, then
/// parent path segments right to left, then a `gcs-<generation>` fallback.
pub fn extract_release_tag(object_name: &str, fallback_generation: &str) -> String {
    if let Some(found) = VERSION_PATTERN.find(basename(object_name)) {
        return found.as_str().to_string();
    }
    let segments: Vec<&str> = object_name.split('/').collect();
    for segment in segments[..segments.len().saturating_sub(1)].iter().rev() {
        if let Some(found) = VERSION_PATTERN.find(segment) {
            return found.as_str().to_string();
        }
    }
    format!("gcs-{fallback_generation}")
}

/// Set difference between two listings: `(added, removed)` object ids.
pub fn diff_snapshot(
    previous: Option<&Snapshot>,
    current: &Snapshot,
) -> (BTreeSet<String>, BTreeSet<String>) {
    let previous_ids: BTreeSet<&String> = previous
        .map(|snapshot| snapshot.objects.keys().collect())
        .unwrap_or_default();
    let current_ids: BTreeSet<&String> = current.objects.keys().collect();

    let added = current_ids
        .iter()
        .filter(|id| !previous_ids.contains(**id))
        .map(|id| (**id).clone())
        .collect();
    let removed = previous_ids
        .iter()
        .filter(|id| !current_ids.contains(**id))
        .map(|id| (**id).clone())
        .collect();
    (added, removed)
}

/// The long-lived pipeline engine.
pub struct MonitorService {
    config: AppConfig,
    source: Box<dyn ObjectSource>,
    nextcloud: Option<NextcloudClient>,
    webhook: WebhookClient,
    store: StateStore,
}

impl MonitorService {
    /// Build the engine with the source variant selected by the config.
    pub fn new(config: AppConfig) -> Result<Self> {
        let source = source::build_source(&config.gcs)?;
        Self::with_source(config, source)
    }

    /// Build the engine around an explicit source (tests, emulators).
    pub fn with_source(config: AppConfig, source: Box<dyn ObjectSource>) -> Result<Self> {
        let nextcloud = match &config.nextcloud {
            Some(nextcloud_config) => Some(NextcloudClient::new(nextcloud_config)?),
            None => None,
        };
        let webhook = WebhookClient::new(&config.webhook);
        let store = StateStore::new(&config.state_dir);
        Ok(Self {
            config,
            source,
            nextcloud,
            webhook,
            store,
        })
    }

    /// Poll until the process is killed, spacing cycles by the configured
    /// interval. Per-cycle failures are logged and swallowed so one bad
    /// listing or delivery never stops the daemon.
    pub fn run_forever(&self, reporter: &mut dyn Reporter) -> Result<()> {
        self.store.bootstrap()?;
        reporter.info(&format!(
            "starting monitor loop with interval={}s",
            self.config.poll_interval_seconds
        ));
        loop {
            if let Err(err) = self.run_once(false, reporter) {
                reporter.error(&format!("polling cycle failed: {err:#}"));
            }
            thread::sleep(Duration::from_secs(self.config.poll_interval_seconds));
        }
    }

    /// Run one full polling cycle. With `dry_run` the cycle discovers,
    /// downloads, and selects artifacts but writes no state, uploads
    /// nothing, and sends no webhook.
    pub fn run_once(&self, dry_run: bool, reporter: &mut dyn Reporter) -> Result<()> {
        if !dry_run {
            self.store.bootstrap()?;
        }
        fs::create_dir_all(&self.config.temp_dir).with_context(|| {
            format!("failed to create temp dir {}", self.config.temp_dir.display())
        })?;

        let mut state = self.store.load_state()?;
        let previous_snapshot = self.store.load_latest_snapshot()?;
        let current_snapshot = self.source.list_snapshot()?;

        let candidates = self.new_candidate_objects(previous_snapshot.as_ref(), &current_snapshot);
        if candidates.is_empty() {
            reporter.info(&format!(
                "no new candidate artifacts in bucket={} at {}",
                self.config.gcs.bucket, current_snapshot.captured_at
            ));
            if !dry_run {
                self.store.save_snapshot(&current_snapshot)?;
            }
            return Ok(());
        }

        reporter.info(&format!(
            "detected {} new candidate artifacts (dry_run={dry_run})",
            candidates.len()
        ));
        for obj in &candidates {
            let object_id = obj.object_id();
            if state.processed.contains_key(&object_id) {
                reporter.info(&format!("skipping already processed object_id={object_id}"));
                continue;
            }
            let record = self.process_object(obj, dry_run, reporter)?;
            if !dry_run {
                state.processed.insert(object_id, record);
                self.store.save_state(&state)?;
            }
        }

        if !dry_run {
            self.store.save_snapshot(&current_snapshot)?;
        } else {
            reporter.info("dry run complete: no state or snapshot files updated");
        }
        Ok(())
    }

    /// New objects that pass the archive filter, oldest first.
    fn new_candidate_objects(
        &self,
        previous: Option<&Snapshot>,
        current: &Snapshot,
    ) -> Vec<ObjectMeta> {
        let (added, _removed) = diff_snapshot(previous, current);
        let mut candidates: Vec<ObjectMeta> = added
            .iter()
            .filter_map(|object_id| current.objects.get(object_id))
            .filter(|obj| {
                is_candidate_archive(
                    obj,
                    &self.config.gcs.include_suffixes,
                    &self.config.gcs.include_content_types,
                )
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.updated.cmp(&b.updated));
        candidates
    }

    fn process_object(
        &self,
        obj: &ObjectMeta,
        dry_run: bool,
        reporter: &mut dyn Reporter,
    ) -> Result<ProcessingRecord> {
        reporter.info(&format!("processing new object {}", obj.gs_url()));
        let webhook_only = self.config.delivery_mode == DeliveryMode::WebhookOnly;
        let release_tag = extract_release_tag(&obj.name, &obj.generation);

        let scratch = tempfile::Builder::new()
            .prefix("gcs-monitor-")
            .tempdir_in(&self.config.temp_dir)
            .context("failed to create scratch dir")?;
        let filename = basename(&obj.name).to_string();
        let local_path = scratch.path().join(&filename);
        self.source.download(&obj.name, &local_path)?;

        let extracted_notes =
            notes::extract_release_notes_for_tag_from_archive(&local_path, &release_tag);
        if let Some(found) = &extracted_notes {
            reporter.info(&format!(
                "extracted release notes for {release_tag} from member={}",
                found.source_member
            ));
        }

        let candidates = self.choose_upload_candidates(&local_path, scratch.path(), obj, reporter)?;

        let mut uploaded_items: Vec<UploadedArtifact> = Vec::new();
        for candidate in &candidates {
            let item = if dry_run {
                self.dry_run_item(obj, candidate, webhook_only, reporter)?
            } else if webhook_only {
                reporter.info(&format!(
                    "webhook-only mode: skipping Nextcloud upload for artifact_type={} source_member={}",
                    candidate.artifact_type.as_str(),
                    candidate
                        .source_member
                        .as_deref()
                        .unwrap_or(&candidate.output_name)
                ));
                UploadedArtifact {
                    artifact_type: candidate.artifact_type,
                    artifact_name: Some(candidate.output_name.clone()),
                    source_member: candidate.source_member.clone(),
                    nextcloud_path: webhook_only_path(obj, candidate),
                    nextcloud_url: webhook_only_link(obj, candidate),
                    share_url: None,
                    download_url: None,
                }
            } else {
                self.mirror_item(obj, candidate)?
            };
            uploaded_items.push(item);
        }
        drop(scratch);

        let payload =
            self.build_release_payload(obj, &uploaded_items, &release_tag, extracted_notes.as_ref());
        if dry_run {
            reporter.info(&format!(
                "dry run: would send one webhook for {release_tag} with {} uploaded artifacts (primary={})",
                uploaded_items.len(),
                payload["release_meta"]["html_url"]
            ));
        } else {
            self.webhook.send_release(&payload)?;
        }

        let now = now_iso();
        if dry_run {
            reporter.info(&format!(
                "dry run processed object_id={} (no upload/webhook performed)",
                obj.object_id()
            ));
        } else if webhook_only {
            reporter.info(&format!(
                "processed object_id={} in webhook_only mode and delivered webhook",
                obj.object_id()
            ));
        } else {
            reporter.info(&format!(
                "processed object_id={} and delivered webhook",
                obj.object_id()
            ));
        }

        let primary = &uploaded_items[0];
        Ok(ProcessingRecord {
            processed_at: now.clone(),
            nextcloud_path: primary.nextcloud_path.clone(),
            nextcloud_url: primary.nextcloud_url.clone(),
            share_url: primary.share_url.clone(),
            webhook_delivered_at: now,
            uploads: uploaded_items,
        })
    }

    /// Mirror one candidate to Nextcloud and mint its public links.
    fn mirror_item(&self, obj: &ObjectMeta, candidate: &UploadCandidate) -> Result<UploadedArtifact> {
        let remote_path = self.build_remote_path(&candidate.output_name, obj)?;
        let nextcloud = self
            .nextcloud
            .as_ref()
            .context("nextcloud client is not configured")?;
        let nextcloud_url = nextcloud.upload_file(&candidate.local_path, &remote_path)?;

        let mut share_url = None;
        if let Some(nextcloud_config) = &self.config.nextcloud
            && nextcloud_config.create_public_share
        {
            share_url = Some(nextcloud.create_public_share(&remote_path)?);
        }
        let download_url = public_download_url(share_url.as_deref(), &candidate.output_name);

        Ok(UploadedArtifact {
            artifact_type: candidate.artifact_type,
            artifact_name: Some(candidate.output_name.clone()),
            source_member: candidate.source_member.clone(),
            nextcloud_path: remote_path,
            nextcloud_url,
            share_url,
            download_url,
        })
    }

    /// Synthesize the item a real run would produce, without touching the
    /// mirror or the webhook.
    fn dry_run_item(
        &self,
        obj: &ObjectMeta,
        candidate: &UploadCandidate,
        webhook_only: bool,
        reporter: &mut dyn Reporter,
    ) -> Result<UploadedArtifact> {
        let source_label = candidate
            .source_member
            .as_deref()
            .unwrap_or(&candidate.output_name);
        let (remote_path, nextcloud_url) = if webhook_only {
            reporter.info(&format!(
                "dry run: webhook_only mode would skip upload for artifact_type={} source_member={source_label}",
                candidate.artifact_type.as_str()
            ));
            (webhook_only_path(obj, candidate), webhook_only_link(obj, candidate))
        } else {
            let remote_path = self.build_remote_path(&candidate.output_name, obj)?;
            reporter.info(&format!(
                "dry run: would upload artifact_type={} source_member={source_label} to {remote_path}",
                candidate.artifact_type.as_str()
            ));
            let url = format!("dry-run://nextcloud/{remote_path}");
            (remote_path, url)
        };
        if let Some(nextcloud_config) = &self.config.nextcloud
            && nextcloud_config.create_public_share
        {
            reporter.info(&format!(
                "dry run: would create Nextcloud public share for {remote_path}"
            ));
        }
        Ok(UploadedArtifact {
            artifact_type: candidate.artifact_type,
            artifact_name: Some(candidate.output_name.clone()),
            source_member: candidate.source_member.clone(),
            nextcloud_path: remote_path,
            nextcloud_url,
            share_url: None,
            download_url: None,
        })
    }

    /// Select binary+genesis members, falling back to the archive itself
    /// when selection comes up empty and the fallback policy allows it.
    fn choose_upload_candidates(
        &self,
        local_archive_path: &Path,
        scratch_dir: &Path,
        obj: &ObjectMeta,
        reporter: &mut dyn Reporter,
    ) -> Result<Vec<UploadCandidate>> {
        match artifacts::select_upload_candidates(
            local_archive_path,
            &scratch_dir.join("selected"),
            &self.config.chain,
            &self.config.artifact_selection,
        ) {
            Ok(selected) if !selected.is_empty() => {
                let names: Vec<&str> = selected
                    .iter()
                    .map(|candidate| candidate.output_name.as_str())
                    .collect();
                reporter.info(&format!(
                    "selected extracted artifacts for object_id={}: {names:?}",
                    obj.object_id()
                ));
                return Ok(selected);
            }
            Ok(_) => {}
            Err(err) => {
                reporter.warn(&format!(
                    "artifact selection failed for object_id={}: {err}",
                    obj.object_id()
                ));
            }
        }

        if !self.config.artifact_selection.fallback_to_archive {
            bail!(
                "artifact selection failed for {} and fallback_to_archive is disabled",
                obj.object_id()
            );
        }
        reporter.info(&format!(
            "falling back to archive upload for object_id={}",
            obj.object_id()
        ));
        Ok(vec![UploadCandidate {
            local_path: local_archive_path.to_path_buf(),
            output_name: basename(&obj.name).to_string(),
            artifact_type: ArtifactType::Archive,
            source_member: None,
        }])
    }

    /// Mirror path for one artifact:
    /// `<remote_dir>/<organization>/<tag>-<filename>-g<generation>`.
    /// Idempotent: an already tag-prefixed filename is not prefixed again.
    fn build_remote_path(&self, filename: &str, obj: &ObjectMeta) -> Result<String> {
        let Some(nextcloud) = &self.config.nextcloud else {
            bail!("nextcloud configuration is not available in webhook_only mode");
        };
        let release_tag = extract_release_tag(&obj.name, &obj.generation);
        let versioned_filename = versioned_filename(&release_tag, filename);
        Ok(format!(
            "{}/{}/{}-g{}",
            nextcloud.remote_dir, self.config.chain.organization, versioned_filename, obj.generation
        ))
    }

    fn build_release_payload(
        &self,
        obj: &ObjectMeta,
        uploaded_items: &[UploadedArtifact],
        release_tag: &str,
        extracted_notes: Option<&ExtractedReleaseNotes>,
    ) -> Value {
        let webhook_only = self.config.delivery_mode == DeliveryMode::WebhookOnly;
        let primary = &uploaded_items[0];
        let primary_link = artifact_link(primary);

        let mut chain = json!({
            "organization": self.config.chain.organization,
            "repository": self.config.chain.repository,
            "common_name": self.config.chain.common_name,
            "extra_info": self.config.chain.extra_info,
            "source": "webhook",
        });
        let chain_map = chain.as_object_mut().expect("chain is an object");
        if let Some(client_name) = &self.config.chain.client_name {
            chain_map.insert("client_name".to_string(), json!(client_name));
        }
        if !self.config.chain.chain_ids.is_empty() {
            chain_map.insert("chain_ids".to_string(), json!(self.config.chain.chain_ids));
        }
        if !self.config.chain.genesis_hashes.is_empty() {
            chain_map.insert(
                "genesis_hashes".to_string(),
                json!(self.config.chain.genesis_hashes),
            );
        }

        let links_block = uploaded_items
            .iter()
            .map(|item| format!("- {}: {}", item.artifact_type.as_str(), artifact_link(item)))
            .collect::<Vec<_>>()
            .join("\n");
        let (summary_prefix, mode_summary, key_change_prefix) = if webhook_only {
            (
                format!(
                    "New release artifacts detected in gs://{}/{}. ",
                    obj.bucket, obj.name
                ),
                format!(
                    "Selected {} artifact(s) for webhook-only delivery without Nextcloud upload. ",
                    uploaded_items.len()
                ),
                "Selected",
            )
        } else {
            (
                format!(
                    "New release artifacts mirrored from gs://{}/{}. ",
                    obj.bucket, obj.name
                ),
                format!("Uploaded {} artifact(s). ", uploaded_items.len()),
                "Mirrored",
            )
        };
        let mut summary = format!(
            "{summary_prefix}{mode_summary}Size={} bytes, updated={}.\n\nArtifact links:\n{links_block}",
            obj.size, obj.updated
        );
        if let Some(found) = extracted_notes {
            summary.push_str(&format!(
                "\n\nRelease notes extracted from archive member `{}`.",
                found.source_member
            ));
        }

        let mut key_changes = vec![format!("Artifact source: {}", obj.gs_url())];
        key_changes.extend(uploaded_items.iter().map(|item| {
            format!(
                "{key_change_prefix} {}: {}",
                item.artifact_type.as_str(),
                artifact_link(item)
            )
        }));
        if let Some(found) = extracted_notes {
            key_changes.push(format!("Release notes source: {}", found.source_member));
        }

        let delivery_mode = self.config.delivery_mode.as_str();
        let mut payload = json!({
            "event_type": "gcs_release_detected",
            "event_version": "1",
            "source": {
                "type": "gcs-poller",
                "bucket": obj.bucket,
                "object_id": obj.object_id(),
                "detected_at": now_iso(),
                "delivery_mode": delivery_mode,
            },
            "chain": chain,
            "release_meta": {
                "html_url": primary_link,
                "tag_name": release_tag,
            },
            "release": {
                "source": "gcs",
                "bucket": obj.bucket,
                "name": obj.name,
                "generation": obj.generation,
                "metageneration": obj.metageneration,
                "size": obj.size,
                "content_type": obj.content_type,
                "md5_hash": obj.md5_hash,
                "crc32c": obj.crc32c,
                "etag": obj.etag,
                "updated": obj.updated,
                "time_created": obj.time_created,
                "gs_url": obj.gs_url(),
                "delivery_mode": delivery_mode,
                "nextcloud_path": primary.nextcloud_path,
                "nextcloud_url": primary.nextcloud_url,
                "share_url": primary.share_url,
                "download_url": primary.download_url,
                "artifact_type": primary.artifact_type.as_str(),
                "artifact_name": primary.artifact_name,
                "source_member": primary.source_member,
                "uploads": uploaded_items,
            },
            "result": {
                "urgent": self.config.release_defaults.urgent,
                "priority": self.config.release_defaults.priority,
                "due_date": self.config.release_defaults.due_date,
                "explicit_deadline": null,
                "summary": summary,
                "key_changes": key_changes,
                "reasoning": "Artifact-based release signal from bucket metadata.",
            },
        });

        if let Some(found) = extracted_notes {
            payload["release_note"] = json!(found.text);
            payload["release_notes"] = json!(found.text);
            payload["release"]["release_notes"] = json!(found.text);
            payload["release"]["release_notes_source"] = json!(found.source_member);
        }
        payload
    }
}

/// Synthetic remote path used when nothing is mirrored: `name::member`.
fn webhook_only_path(obj: &ObjectMeta, candidate: &UploadCandidate) -> String {
    match &candidate.source_member {
        Some(member) => format!("{}::{member}", obj.name),
        None => obj.name.clone(),
    }
}

/// Synthetic link used when nothing is mirrored: the object's `gs://` URL,
/// with the member carried in the fragment.
fn webhook_only_link(obj: &ObjectMeta, candidate: &UploadCandidate) -> String {
    match &candidate.source_member {
        Some(member) => format!("{}#member={}", obj.gs_url(), escape_component(member)),
        None => obj.gs_url(),
    }
}

/// Best public link for an artifact: download URL, then share, then WebDAV.
fn artifact_link(item: &UploadedArtifact) -> String {
    item.download_url
        .clone()
        .or_else(|| item.share_url.clone())
        .unwrap_or_else(|| item.nextcloud_url.clone())
}

/// Direct-download link derived from a share link: strip the query, then
/// append `/download/<escaped name>`.
fn public_download_url(share_url: Option<&str>, artifact_name: &str) -> Option<String> {
    let share_url = share_url?;
    let share_base = share_url
        .split('?')
        .next()
        .unwrap_or(share_url)
        .trim_end_matches('/');
    Some(format!(
        "{share_base}/download/{}",
        escape_component(artifact_name)
    ))
}

pub(crate) fn versioned_filename(release_tag: &str, filename: &str) -> String {
    let version_prefix = format!("{release_tag}-");
    if filename.starts_with(&version_prefix) {
        filename.to_string()
    } else {
        format!("{version_prefix}{filename}")
    }
}

fn basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}
