//! Typed configuration loaded from the operator-rendered YAML file.
//!
//! Parsing is a single pass: deserialize with serde defaults, then
//! [`AppConfig::validate`] normalizes derived fields and rejects
//! out-of-range values. Downstream code only ever sees the validated form.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::types::{ARCHIVE_SUFFIX_DEFAULTS, CONTENT_TYPE_DEFAULTS};

/// Whether artifacts are mirrored to Nextcloud or only referenced by their
/// bucket URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Mirror artifacts to Nextcloud and link the mirror in the webhook.
    #[default]
    Full,
    /// Skip the mirror entirely; the webhook carries `gs://` references.
    WebhookOnly,
}

impl DeliveryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryMode::Full => "full",
            DeliveryMode::WebhookOnly => "webhook_only",
        }
    }
}

/// Source-bucket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcsConfig {
    pub bucket: String,
    /// List the bucket without credentials (public buckets only).
    #[serde(default)]
    pub anonymous: bool,
    /// Force the `gcloud storage` CLI instead of the JSON API.
    #[serde(default)]
    pub use_gcloud_cli: bool,
    /// Service-account credential file for authenticated access.
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
    #[serde(default)]
    pub include_prefixes: Vec<String>,
    /// Falls back to the common archive suffixes when empty.
    #[serde(default)]
    pub include_suffixes: Vec<String>,
    /// Falls back to the common archive content types when empty.
    #[serde(default)]
    pub include_content_types: Vec<String>,
}

/// Nextcloud mirror settings. Required iff `delivery_mode` is `full`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextcloudConfig {
    pub base_url: String,
    pub username: String,
    pub app_password: String,
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
    #[serde(default = "default_true")]
    pub create_public_share: bool,
    #[serde(default)]
    pub share_password: Option<String>,
    #[serde(default)]
    pub share_expire_days: Option<u32>,
    /// OCS permissions bitmask; 1 = read-only.
    #[serde(default = "default_share_permissions")]
    pub share_permissions: u32,
}

/// Downstream release-filter webhook settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    pub shared_secret: String,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_seconds: f64,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
}

/// Identity of the chain whose releases are being watched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub organization: String,
    pub repository: String,
    /// Defaults to `repository` when unset.
    #[serde(default)]
    pub common_name: String,
    #[serde(default)]
    pub extra_info: String,
    #[serde(default)]
    pub client_name: Option<String>,
    /// Mutually exclusive with `genesis_hashes`.
    #[serde(default)]
    pub chain_ids: Vec<i64>,
    #[serde(default)]
    pub genesis_hashes: Vec<String>,
}

/// Defaults copied into the `result` section of every webhook payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseDefaults {
    #[serde(default)]
    pub urgent: bool,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_due_date")]
    pub due_date: String,
}

impl Default for ReleaseDefaults {
    fn default() -> Self {
        Self {
            urgent: false,
            priority: default_priority(),
            due_date: default_due_date(),
        }
    }
}

/// One binary/genesis pattern pair, optionally scoped to a chain identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSelectionRule {
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    pub binary_patterns: Vec<String>,
    pub genesis_patterns: Vec<String>,
}

/// Controls which archive members become standalone artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSelectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Upload the archive itself when member selection fails.
    #[serde(default = "default_true")]
    pub fallback_to_archive: bool,
    #[serde(default)]
    pub default_binary_patterns: Vec<String>,
    #[serde(default)]
    pub default_genesis_patterns: Vec<String>,
    #[serde(default)]
    pub rules: Vec<ArtifactSelectionRule>,
}

impl Default for ArtifactSelectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_to_archive: true,
            default_binary_patterns: Vec::new(),
            default_genesis_patterns: Vec::new(),
            rules: Vec::new(),
        }
    }
}

/// Validated application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    pub gcs: GcsConfig,
    #[serde(default)]
    pub nextcloud: Option<NextcloudConfig>,
    pub webhook: WebhookConfig,
    pub chain: ChainConfig,
    #[serde(default)]
    pub release_defaults: ReleaseDefaults,
    #[serde(default)]
    pub artifact_selection: ArtifactSelectionConfig,
}

fn default_true() -> bool {
    true
}

fn default_remote_dir() -> String {
    "release-mirror".to_string()
}

fn default_share_permissions() -> u32 {
    1
}

fn default_webhook_timeout() -> f64 {
    10.0
}

fn default_priority() -> u8 {
    3
}

fn default_due_date() -> String {
    "P2D".to_string()
}

fn default_poll_interval() -> u64 {
    900
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./state")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("/tmp/gcs-release-monitor")
}

/// Collapse a slash path to clean `/`-joined segments.
fn normalize_slash_path(value: &str) -> String {
    value
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let mut config: AppConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

impl AppConfig {
    /// Normalize derived fields and reject out-of-range values.
    pub fn validate(&mut self) -> Result<()> {
        if self.poll_interval_seconds < 30 {
            bail!("poll_interval_seconds must be >= 30");
        }

        if self.delivery_mode == DeliveryMode::Full && self.nextcloud.is_none() {
            bail!("delivery_mode=full requires a nextcloud section");
        }

        if !self.webhook.timeout_seconds.is_finite() || self.webhook.timeout_seconds <= 0.0 {
            bail!("webhook.timeout_seconds must be a positive number");
        }

        if let Some(nextcloud) = &mut self.nextcloud {
            nextcloud.base_url = nextcloud.base_url.trim_end_matches('/').to_string();
            nextcloud.remote_dir = normalize_slash_path(&nextcloud.remote_dir);
            if nextcloud.remote_dir.is_empty() {
                nextcloud.remote_dir = default_remote_dir();
            }
        }

        if !self.chain.chain_ids.is_empty() && !self.chain.genesis_hashes.is_empty() {
            bail!("chain.chain_ids and chain.genesis_hashes are mutually exclusive");
        }
        self.chain.chain_ids.sort_unstable();
        self.chain.chain_ids.dedup();
        for hash in &mut self.chain.genesis_hashes {
            *hash = hash.to_lowercase();
        }
        self.chain.genesis_hashes.sort();
        self.chain.genesis_hashes.dedup();
        if self.chain.common_name.is_empty() {
            self.chain.common_name = self.chain.repository.clone();
        }
        if self.chain.client_name.as_deref() == Some("") {
            self.chain.client_name = None;
        }

        if !matches!(self.release_defaults.priority, 1 | 3 | 4) {
            bail!("release_defaults.priority must be one of 1, 3, 4");
        }
        if !matches!(self.release_defaults.due_date.as_str(), "P1D" | "P2D" | "P5D") {
            bail!("release_defaults.due_date must be one of P1D, P2D, P5D");
        }

        for rule in &self.artifact_selection.rules {
            if rule.binary_patterns.is_empty() || rule.genesis_patterns.is_empty() {
                bail!("artifact_selection rule requires binary_patterns and genesis_patterns");
            }
        }

        if self.gcs.include_suffixes.is_empty() {
            self.gcs.include_suffixes = ARCHIVE_SUFFIX_DEFAULTS
                .iter()
                .map(|s| s.to_string())
                .collect();
        }
        if self.gcs.include_content_types.is_empty() {
            self.gcs.include_content_types = CONTENT_TYPE_DEFAULTS
                .iter()
                .map(|s| s.to_string())
                .collect();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL_FULL: &str = r#"
gcs:
  bucket: releases
nextcloud:
  base_url: https://cloud.example/
  username: svc
  app_password: secret
webhook:
  url: https://filter.example/hooks/release
  shared_secret: s3cr3t
chain:
  organization: acme
  repository: node
"#;

    const MINIMAL_WEBHOOK_ONLY: &str = r#"
delivery_mode: webhook_only
gcs:
  bucket: releases
webhook:
  url: https://filter.example/hooks/release
  shared_secret: s3cr3t
chain:
  organization: acme
  repository: node
"#;

    fn load(yaml: &str) -> Result<AppConfig> {
        let mut file = NamedTempFile::new().expect("tempfile");
        file.write_all(yaml.as_bytes()).expect("write");
        load_config(file.path())
    }

    #[test]
    fn minimal_full_config_applies_defaults() {
        let config = load(MINIMAL_FULL).expect("load");
        assert_eq!(config.delivery_mode, DeliveryMode::Full);
        assert_eq!(config.poll_interval_seconds, 900);
        assert_eq!(config.release_defaults.priority, 3);
        assert_eq!(config.release_defaults.due_date, "P2D");
        assert!(config.artifact_selection.enabled);
        assert!(config.artifact_selection.fallback_to_archive);
        assert_eq!(
            config.gcs.include_suffixes,
            ARCHIVE_SUFFIX_DEFAULTS.to_vec()
        );
        assert_eq!(
            config.gcs.include_content_types,
            CONTENT_TYPE_DEFAULTS.to_vec()
        );

        let nextcloud = config.nextcloud.expect("nextcloud");
        assert_eq!(nextcloud.base_url, "https://cloud.example");
        assert_eq!(nextcloud.remote_dir, "release-mirror");
        assert_eq!(nextcloud.share_permissions, 1);
        assert!(nextcloud.verify_tls);
        assert!(nextcloud.create_public_share);

        assert_eq!(config.chain.common_name, "node");
        assert!((config.webhook.timeout_seconds - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn webhook_only_does_not_require_nextcloud() {
        let config = load(MINIMAL_WEBHOOK_ONLY).expect("load");
        assert_eq!(config.delivery_mode, DeliveryMode::WebhookOnly);
        assert!(config.nextcloud.is_none());
    }

    #[test]
    fn full_mode_without_nextcloud_is_rejected() {
        let yaml = MINIMAL_WEBHOOK_ONLY.replace("delivery_mode: webhook_only\n", "");
        let err = load(&yaml).expect_err("should fail");
        assert!(err.to_string().contains("nextcloud"), "{err:#}");
    }

    #[test]
    fn short_poll_interval_is_rejected() {
        let yaml = format!("{MINIMAL_WEBHOOK_ONLY}poll_interval_seconds: 10\n");
        let err = load(&yaml).expect_err("should fail");
        assert!(err.to_string().contains("poll_interval_seconds"), "{err:#}");
    }

    #[test]
    fn chain_ids_and_genesis_hashes_are_mutually_exclusive() {
        let yaml = format!(
            "{MINIMAL_WEBHOOK_ONLY}  chain_ids: [5]\n  genesis_hashes: [\"0xABC\"]\n"
        );
        let err = load(&yaml).expect_err("should fail");
        assert!(err.to_string().contains("mutually exclusive"), "{err:#}");
    }

    #[test]
    fn chain_lists_are_normalized() {
        let yaml = format!("{MINIMAL_WEBHOOK_ONLY}  genesis_hashes: [\"0xDEF\", \"0xabc\", \"0xdef\"]\n");
        let config = load(&yaml).expect("load");
        assert_eq!(config.chain.genesis_hashes, vec!["0xabc", "0xdef"]);
    }

    #[test]
    fn invalid_release_defaults_are_rejected() {
        let yaml = format!("{MINIMAL_WEBHOOK_ONLY}release_defaults:\n  priority: 2\n");
        let err = load(&yaml).expect_err("should fail");
        assert!(err.to_string().contains("priority"), "{err:#}");

        let yaml = format!("{MINIMAL_WEBHOOK_ONLY}release_defaults:\n  due_date: P9D\n");
        let err = load(&yaml).expect_err("should fail");
        assert!(err.to_string().contains("due_date"), "{err:#}");
    }

    #[test]
    fn rule_without_patterns_is_rejected() {
        let yaml = format!(
            "{MINIMAL_WEBHOOK_ONLY}artifact_selection:\n  rules:\n    - binary_patterns: [\"node-*\"]\n      genesis_patterns: []\n"
        );
        let err = load(&yaml).expect_err("should fail");
        assert!(
            err.to_string().contains("binary_patterns and genesis_patterns"),
            "{err:#}"
        );
    }

    #[test]
    fn remote_dir_is_normalized() {
        let yaml = MINIMAL_FULL.replace(
            "  app_password: secret\n",
            "  app_password: secret\n  remote_dir: //mirror//releases/\n",
        );
        let config = load(&yaml).expect("load");
        assert_eq!(
            config.nextcloud.expect("nextcloud").remote_dir,
            "mirror/releases"
        );
    }

    #[test]
    fn delivery_mode_parses_snake_case() {
        let config = load(MINIMAL_WEBHOOK_ONLY).expect("load");
        assert_eq!(config.delivery_mode.as_str(), "webhook_only");
        assert_eq!(DeliveryMode::Full.as_str(), "full");
    }
}
