//! Nextcloud mirror client: WebDAV uploads and OCS public shares.
//!
//! The client never retries; delivery policy lives in the pipeline engine.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::Method;
use reqwest::blocking::Client;
use serde_json::Value;

use crate::config::NextcloudConfig;
use crate::urlenc::escape_component;

/// Blocking Nextcloud client for one configured account.
pub struct NextcloudClient {
    config: NextcloudConfig,
    http: Client,
}

impl NextcloudClient {
    pub fn new(config: &NextcloudConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .context("failed to build Nextcloud HTTP client")?;
        Ok(Self {
            config: config.clone(),
            http,
        })
    }

    /// Upload a local file to `remote_path` (relative to the DAV root),
    /// creating parent collections on the way. Returns the WebDAV URL.
    pub fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<String> {
        self.ensure_directories(remote_path)?;
        let webdav_url = self.webdav_url(remote_path);

        let file = fs::File::open(local_path)
            .with_context(|| format!("failed to open upload source {}", local_path.display()))?;
        let response = self
            .http
            .put(&webdav_url)
            .basic_auth(&self.config.username, Some(&self.config.app_password))
            .body(file)
            .send()
            .context("Nextcloud upload request failed")?;

        let status = response.status().as_u16();
        if !matches!(status, 200 | 201 | 204) {
            bail!(
                "Nextcloud upload failed with status={status}: {}",
                truncated_body(response)
            );
        }
        Ok(webdav_url)
    }

    /// Create a public link share for `remote_path` and return its URL.
    pub fn create_public_share(&self, remote_path: &str) -> Result<String> {
        let mut form: Vec<(&str, String)> = vec![
            ("path", format!("/{remote_path}")),
            ("shareType", "3".to_string()),
            ("permissions", self.config.share_permissions.to_string()),
        ];
        if let Some(password) = &self.config.share_password {
            form.push(("password", password.clone()));
        }
        if let Some(days) = self.config.share_expire_days {
            let expires = Utc::now().date_naive() + ChronoDuration::days(i64::from(days));
            form.push(("expireDate", expires.format("%Y-%m-%d").to_string()));
        }

        let response = self
            .http
            .post(format!(
                "{}/ocs/v2.php/apps/files_sharing/api/v1/shares",
                self.config.base_url
            ))
            .basic_auth(&self.config.username, Some(&self.config.app_password))
            .header("OCS-APIRequest", "true")
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .context("Nextcloud share request failed")?;

        let status = response.status().as_u16();
        if !matches!(status, 200 | 201) {
            bail!(
                "Nextcloud share creation failed with status={status}: {}",
                truncated_body(response)
            );
        }

        let data: Value = response
            .json()
            .context("failed to parse Nextcloud share response")?;
        let share_url = data
            .pointer("/ocs/data/url")
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty());
        match share_url {
            Some(url) => Ok(url.to_string()),
            None => bail!("Nextcloud share response missing ocs.data.url"),
        }
    }

    /// MKCOL every ancestor collection of `remote_path`. 201 and 405 both
    /// mean the collection exists; 409 means an ancestor is missing, which
    /// cannot happen if the walk is in order and is therefore fatal.
    fn ensure_directories(&self, remote_path: &str) -> Result<()> {
        let segments: Vec<&str> = remote_path.split('/').collect();
        let parents = &segments[..segments.len().saturating_sub(1)];

        let mut cumulative: Vec<&str> = Vec::new();
        for segment in parents {
            cumulative.push(segment);
            let path = cumulative.join("/");
            let url = self.webdav_url(&path);
            let response = self
                .http
                .request(Method::from_bytes(b"MKCOL").expect("static method"), &url)
                .basic_auth(&self.config.username, Some(&self.config.app_password))
                .send()
                .context("Nextcloud MKCOL request failed")?;
            match response.status().as_u16() {
                201 | 405 => continue,
                409 => bail!("Nextcloud parent folder missing when creating '{path}'"),
                status => bail!(
                    "Nextcloud MKCOL failed for {path} with status={status}: {}",
                    truncated_body(response)
                ),
            }
        }
        Ok(())
    }

    fn webdav_url(&self, remote_path: &str) -> String {
        let encoded = remote_path
            .split('/')
            .filter(|part| !part.is_empty())
            .map(escape_component)
            .collect::<Vec<_>>()
            .join("/");
        format!(
            "{}/remote.php/dav/files/{}/{}",
            self.config.base_url,
            escape_component(&self.config.username),
            encoded
        )
    }
}

fn truncated_body(response: reqwest::blocking::Response) -> String {
    let mut body = response.text().unwrap_or_default();
    body.truncate(500);
    body
}
