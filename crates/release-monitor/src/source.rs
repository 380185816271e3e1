//! Bucket listing and object download.
//!
//! [`ObjectSource`] is the only surface the pipeline engine sees; the
//! concrete transport is chosen once at construction from [`GcsConfig`]:
//! the JSON API with a service-account token, the JSON API anonymously, or
//! the `gcloud storage` CLI as a last resort. The engine never branches on
//! the variant.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::config::GcsConfig;
use crate::types::{ObjectMeta, Snapshot};
use crate::urlenc::{escape_component, escape_path};

const GCS_ENDPOINT: &str = "https://storage.googleapis.com";
const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_only";
const PAGE_SIZE: &str = "1000";

/// Capability the pipeline engine polls and downloads through.
pub trait ObjectSource {
    /// Capture the full bucket listing.
    fn list_snapshot(&self) -> Result<Snapshot>;

    /// Download one object to `destination`. A failed transfer must not
    /// corrupt a previously valid file at that path.
    fn download(&self, object_name: &str, destination: &Path) -> Result<()>;
}

/// Build the source variant selected by the configuration.
///
/// Priority mirrors the operator contract: an explicit `use_gcloud_cli`
/// wins, then an explicit credential file, then anonymous mode, then
/// application-default credentials, and finally the gcloud CLI as an
/// implicit fallback (with a warning, since it needs a logged-in host).
pub fn build_source(config: &GcsConfig) -> Result<Box<dyn ObjectSource>> {
    if config.use_gcloud_cli {
        return Ok(Box::new(GcloudCliSource::new(config)));
    }
    if let Some(credentials_file) = &config.credentials_file {
        let token = TokenProvider::from_file(credentials_file)?;
        return Ok(Box::new(JsonApiSource::new(config, Some(token))?));
    }
    if config.anonymous {
        return Ok(Box::new(JsonApiSource::new(config, None)?));
    }
    match std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
        Ok(path) if !path.is_empty() => {
            let token = TokenProvider::from_file(Path::new(&path))?;
            Ok(Box::new(JsonApiSource::new(config, Some(token))?))
        }
        _ => {
            eprintln!(
                "[warn] application-default credentials not configured; falling back to the gcloud CLI for bucket '{}'",
                config.bucket
            );
            Ok(Box::new(GcloudCliSource::new(config)))
        }
    }
}

/// Suffix/content-type filter applied to new objects before processing.
pub fn is_candidate_archive(obj: &ObjectMeta, suffixes: &[String], content_types: &[String]) -> bool {
    if !obj.is_file() {
        return false;
    }
    if let Some(content_type) = &obj.content_type {
        let lowered = content_type.to_lowercase();
        if content_types.iter().any(|ct| ct.to_lowercase() == lowered) {
            return true;
        }
    }
    let lowered = obj.name.to_lowercase();
    suffixes
        .iter()
        .any(|suffix| lowered.ends_with(&suffix.to_lowercase()))
}

/// Service-account credential file, as written by the operator layer.
#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(Debug, serde::Serialize)]
struct TokenClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Mints read-only OAuth access tokens from a service-account key via the
/// JWT bearer grant, caching them until shortly before expiry.
pub struct TokenProvider {
    key: ServiceAccountKey,
    http: Client,
    cached: RefCell<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read credentials file {}", path.display()))?;
        let key: ServiceAccountKey = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse credentials file {}", path.display()))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build token HTTP client")?;
        Ok(Self {
            key,
            http,
            cached: RefCell::new(None),
        })
    }

    fn access_token(&self) -> Result<String> {
        if let Some(cached) = self.cached.borrow().as_ref()
            && cached.expires_at > Instant::now()
        {
            return Ok(cached.value.clone());
        }

        let minted = self.mint()?;
        let value = minted.value.clone();
        *self.cached.borrow_mut() = Some(minted);
        Ok(value)
    }

    fn mint(&self) -> Result<CachedToken> {
        use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};

        let now = chrono::Utc::now().timestamp();
        let claims = TokenClaims {
            iss: &self.key.client_email,
            scope: STORAGE_SCOPE,
            aud: &self.key.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let encoding_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .context("invalid private_key in credentials file")?;
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
            .context("failed to sign token assertion")?;

        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .context("token exchange request failed")?;
        if !response.status().is_success() {
            bail!(
                "token exchange failed with status {}: {}",
                response.status(),
                response.text().unwrap_or_default()
            );
        }
        let token: TokenResponse = response.json().context("failed to parse token response")?;

        // Refresh one minute before the server-side expiry.
        let slack = token.expires_in.saturating_sub(60);
        Ok(CachedToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(slack),
        })
    }
}

/// Listing and download over the object-storage JSON API, authenticated or
/// anonymous.
pub struct JsonApiSource {
    bucket: String,
    include_prefixes: Vec<String>,
    endpoint: String,
    http: Client,
    token: Option<TokenProvider>,
}

impl JsonApiSource {
    pub fn new(config: &GcsConfig, token: Option<TokenProvider>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            bucket: config.bucket.clone(),
            include_prefixes: config.include_prefixes.clone(),
            endpoint: GCS_ENDPOINT.to_string(),
            http,
            token,
        })
    }

    /// Point at a different endpoint (storage emulators, tests).
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.trim_end_matches('/').to_string();
        self
    }

    fn bearer(&self) -> Result<Option<String>> {
        match &self.token {
            Some(provider) => Ok(Some(provider.access_token()?)),
            None => Ok(None),
        }
    }

    fn list_prefix(&self, prefix: &str, snapshot: &mut Snapshot) -> Result<()> {
        let url = format!("{}/storage/v1/b/{}/o", self.endpoint, self.bucket);
        let bearer = self.bearer()?;
        let mut page_token: Option<String> = None;

        loop {
            let mut query: Vec<(&str, &str)> =
                vec![("projection", "noAcl"), ("maxResults", PAGE_SIZE)];
            if !prefix.is_empty() {
                query.push(("prefix", prefix));
            }
            if let Some(token) = &page_token {
                query.push(("pageToken", token.as_str()));
            }

            let mut request = self.http.get(&url).query(&query);
            if let Some(token) = &bearer {
                request = request.bearer_auth(token);
            }
            let response = request.send().context("bucket listing request failed")?;

            if self.token.is_none()
                && matches!(
                    response.status(),
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                )
            {
                bail!(
                    "anonymous listing denied for bucket '{}'; use authenticated mode (anonymous=false) with a credentials file or ADC",
                    self.bucket
                );
            }
            if !response.status().is_success() {
                bail!(
                    "bucket listing failed with status {} for bucket '{}'",
                    response.status(),
                    self.bucket
                );
            }

            let payload: Value = response.json().context("failed to parse listing JSON")?;
            if let Some(items) = payload.get("items").and_then(Value::as_array) {
                for item in items {
                    if let Some(meta) = meta_from_json(&self.bucket, item) {
                        snapshot.insert(meta);
                    }
                }
            }

            page_token = payload
                .get("nextPageToken")
                .and_then(Value::as_str)
                .map(str::to_string);
            if page_token.is_none() {
                return Ok(());
            }
        }
    }
}

impl ObjectSource for JsonApiSource {
    fn list_snapshot(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new(&self.bucket);
        if self.include_prefixes.is_empty() {
            self.list_prefix("", &mut snapshot)?;
        } else {
            for prefix in &self.include_prefixes {
                self.list_prefix(prefix, &mut snapshot)?;
            }
        }
        Ok(snapshot)
    }

    fn download(&self, object_name: &str, destination: &Path) -> Result<()> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create download dir {}", parent.display())
            })?;
        }

        let bearer = self.bearer()?;
        let mut request = match &bearer {
            // Authenticated media download goes through the JSON API.
            Some(token) => self
                .http
                .get(format!(
                    "{}/storage/v1/b/{}/o/{}",
                    self.endpoint,
                    self.bucket,
                    escape_component(object_name)
                ))
                .query(&[("alt", "media")])
                .bearer_auth(token),
            None => self.http.get(format!(
                "{}/{}/{}",
                self.endpoint,
                self.bucket,
                escape_path(object_name)
            )),
        };
        request = request.timeout(Duration::from_secs(600));

        let mut response = request
            .send()
            .with_context(|| format!("download request failed for {object_name}"))?;
        if !response.status().is_success() {
            bail!(
                "download failed with status {} for {object_name}",
                response.status()
            );
        }

        let part = part_path(destination);
        let mut file = fs::File::create(&part)
            .with_context(|| format!("failed to create {}", part.display()))?;
        response
            .copy_to(&mut file)
            .with_context(|| format!("failed to write {}", part.display()))?;
        fs::rename(&part, destination)
            .with_context(|| format!("failed to finalize {}", destination.display()))?;
        Ok(())
    }
}

/// `gcloud storage` CLI fallback for hosts without usable credentials in
/// the process environment.
pub struct GcloudCliSource {
    bucket: String,
    include_prefixes: Vec<String>,
}

impl GcloudCliSource {
    pub fn new(config: &GcsConfig) -> Self {
        Self {
            bucket: config.bucket.clone(),
            include_prefixes: config.include_prefixes.clone(),
        }
    }
}

impl ObjectSource for GcloudCliSource {
    fn list_snapshot(&self) -> Result<Snapshot> {
        let output = Command::new("gcloud")
            .args([
                "storage",
                "ls",
                "--recursive",
                "--json",
                &format!("gs://{}/**", self.bucket),
            ])
            .output()
            .context("failed to run gcloud storage ls")?;
        if !output.status.success() {
            bail!(
                "gcloud storage ls failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let payload: Value = serde_json::from_slice(&output.stdout)
            .context("failed to parse gcloud storage ls output")?;
        let mut snapshot = Snapshot::new(&self.bucket);
        for item in payload.as_array().into_iter().flatten() {
            if item.get("type").and_then(Value::as_str) != Some("cloud_object") {
                continue;
            }
            let Some(metadata) = item.get("metadata") else {
                continue;
            };
            let Some(meta) = meta_from_json(&self.bucket, metadata) else {
                continue;
            };
            if !self.include_prefixes.is_empty()
                && !self
                    .include_prefixes
                    .iter()
                    .any(|prefix| meta.name.starts_with(prefix.as_str()))
            {
                continue;
            }
            snapshot.insert(meta);
        }
        Ok(snapshot)
    }

    fn download(&self, object_name: &str, destination: &Path) -> Result<()> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create download dir {}", parent.display())
            })?;
        }
        let source = format!("gs://{}/{}", self.bucket, object_name);
        let status = Command::new("gcloud")
            .args(["storage", "cp", &source])
            .arg(destination)
            .status()
            .context("failed to run gcloud storage cp")?;
        if !status.success() {
            bail!("gcloud storage cp failed for {source}");
        }
        Ok(())
    }
}

fn part_path(destination: &Path) -> PathBuf {
    let mut part = destination.as_os_str().to_owned();
    part.push(".part");
    PathBuf::from(part)
}

/// Build object metadata from a JSON API (or gcloud) object resource.
/// The API encodes `size` and `generation` as strings; tolerate numbers too.
fn meta_from_json(bucket: &str, item: &Value) -> Option<ObjectMeta> {
    let name = item.get("name").and_then(Value::as_str)?.to_string();
    Some(ObjectMeta {
        bucket: bucket.to_string(),
        name,
        size: int_field(item, "size").unwrap_or(0),
        content_type: str_field(item, "contentType"),
        generation: stringish_field(item, "generation").unwrap_or_default(),
        metageneration: stringish_field(item, "metageneration"),
        md5_hash: str_field(item, "md5Hash"),
        crc32c: str_field(item, "crc32c"),
        etag: str_field(item, "etag"),
        updated: str_field(item, "updated").unwrap_or_default(),
        time_created: str_field(item, "timeCreated"),
    })
}

fn str_field(item: &Value, key: &str) -> Option<String> {
    item.get(key).and_then(Value::as_str).map(str::to_string)
}

fn stringish_field(item: &Value, key: &str) -> Option<String> {
    match item.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn int_field(item: &Value, key: &str) -> Option<u64> {
    match item.get(key)? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Read;
    use std::thread;
    use tiny_http::{Response, Server};

    fn meta(name: &str, size: u64, content_type: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            bucket: "releases".to_string(),
            name: name.to_string(),
            size,
            content_type: content_type.map(str::to_string),
            generation: "1".to_string(),
            metageneration: None,
            md5_hash: None,
            crc32c: None,
            etag: None,
            updated: "2026-02-16T00:00:00Z".to_string(),
            time_created: None,
        }
    }

    fn gcs_config(bucket: &str) -> GcsConfig {
        GcsConfig {
            bucket: bucket.to_string(),
            anonymous: true,
            use_gcloud_cli: false,
            credentials_file: None,
            include_prefixes: Vec::new(),
            include_suffixes: Vec::new(),
            include_content_types: Vec::new(),
        }
    }

    fn suffixes() -> Vec<String> {
        crate::types::ARCHIVE_SUFFIX_DEFAULTS
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn content_types() -> Vec<String> {
        crate::types::CONTENT_TYPE_DEFAULTS
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn candidate_filter_accepts_suffix_and_content_type() {
        let by_suffix = meta("v1/node.TAR.GZ", 10, None);
        assert!(is_candidate_archive(&by_suffix, &suffixes(), &content_types()));

        let by_content_type = meta("v1/blob", 10, Some("Application/GZIP"));
        assert!(is_candidate_archive(
            &by_content_type,
            &suffixes(),
            &content_types()
        ));
    }

    #[test]
    fn candidate_filter_rejects_directories_and_misses() {
        let directory = meta("v1/", 10, None);
        assert!(!is_candidate_archive(&directory, &suffixes(), &content_types()));

        let empty = meta("v1/node.tar.gz", 0, None);
        assert!(!is_candidate_archive(&empty, &suffixes(), &content_types()));

        let text = meta("v1/readme.txt", 10, Some("text/plain"));
        assert!(!is_candidate_archive(&text, &suffixes(), &content_types()));
    }

    #[test]
    fn meta_parsing_accepts_string_and_number_fields() {
        let item = json!({
            "name": "v1/node.tar.gz",
            "size": "123",
            "generation": 456,
            "contentType": "application/gzip",
            "updated": "2026-02-16T00:00:00Z"
        });
        let meta = meta_from_json("releases", &item).expect("meta");
        assert_eq!(meta.size, 123);
        assert_eq!(meta.generation, "456");
        assert_eq!(meta.object_id(), "v1/node.tar.gz#456");
    }

    #[test]
    fn meta_parsing_requires_a_name() {
        assert!(meta_from_json("releases", &json!({"size": "1"})).is_none());
    }

    #[test]
    fn anonymous_listing_paginates_and_dedupes() {
        let server = Server::http("127.0.0.1:0").expect("server");
        let endpoint = format!("http://{}", server.server_addr());

        let handle = thread::spawn(move || {
            for _ in 0..2 {
                let request = server.recv().expect("request");
                let body = if request.url().contains("pageToken") {
                    json!({
                        "items": [
                            // Repeated from page one; the snapshot dedupes.
                            {"name": "v1/a.tar.gz", "size": "10", "generation": "1",
                             "updated": "2026-02-16T00:00:00Z"},
                            {"name": "v1/b.tar.gz", "size": "20", "generation": "2",
                             "updated": "2026-02-16T00:00:01Z"}
                        ]
                    })
                } else {
                    json!({
                        "items": [
                            {"name": "v1/a.tar.gz", "size": "10", "generation": "1",
                             "updated": "2026-02-16T00:00:00Z"}
                        ],
                        "nextPageToken": "page-2"
                    })
                };
                request
                    .respond(Response::from_string(body.to_string()))
                    .expect("respond");
            }
        });

        let source = JsonApiSource::new(&gcs_config("releases"), None)
            .expect("source")
            .with_endpoint(&endpoint);
        let snapshot = source.list_snapshot().expect("list");
        handle.join().expect("server thread");

        assert_eq!(snapshot.bucket, "releases");
        assert_eq!(snapshot.objects.len(), 2);
        assert!(snapshot.objects.contains_key("v1/a.tar.gz#1"));
        assert!(snapshot.objects.contains_key("v1/b.tar.gz#2"));
    }

    #[test]
    fn anonymous_listing_denied_names_the_remedy() {
        let server = Server::http("127.0.0.1:0").expect("server");
        let endpoint = format!("http://{}", server.server_addr());

        let handle = thread::spawn(move || {
            let request = server.recv().expect("request");
            request
                .respond(Response::from_string("denied").with_status_code(403))
                .expect("respond");
        });

        let source = JsonApiSource::new(&gcs_config("private-bucket"), None)
            .expect("source")
            .with_endpoint(&endpoint);
        let err = source.list_snapshot().expect_err("should fail");
        handle.join().expect("server thread");

        let message = format!("{err:#}");
        assert!(message.contains("private-bucket"), "{message}");
        assert!(message.contains("authenticated mode"), "{message}");
    }

    #[test]
    fn download_writes_atomically() {
        let server = Server::http("127.0.0.1:0").expect("server");
        let endpoint = format!("http://{}", server.server_addr());

        let handle = thread::spawn(move || {
            let request = server.recv().expect("request");
            assert_eq!(request.url(), "/releases/v1/node%20a.tar.gz");
            request
                .respond(Response::from_string("archive-bytes"))
                .expect("respond");
        });

        let td = tempfile::tempdir().expect("tempdir");
        let destination = td.path().join("node a.tar.gz");
        let source = JsonApiSource::new(&gcs_config("releases"), None)
            .expect("source")
            .with_endpoint(&endpoint);
        source
            .download("v1/node a.tar.gz", &destination)
            .expect("download");
        handle.join().expect("server thread");

        let mut content = String::new();
        fs::File::open(&destination)
            .expect("open")
            .read_to_string(&mut content)
            .expect("read");
        assert_eq!(content, "archive-bytes");
        assert!(!part_path(&destination).exists());
    }

    #[test]
    fn failed_download_keeps_the_previous_file() {
        let server = Server::http("127.0.0.1:0").expect("server");
        let endpoint = format!("http://{}", server.server_addr());

        let handle = thread::spawn(move || {
            let request = server.recv().expect("request");
            request
                .respond(Response::from_string("gone").with_status_code(404))
                .expect("respond");
        });

        let td = tempfile::tempdir().expect("tempdir");
        let destination = td.path().join("node.tar.gz");
        fs::write(&destination, "previous-good-bytes").expect("seed");

        let source = JsonApiSource::new(&gcs_config("releases"), None)
            .expect("source")
            .with_endpoint(&endpoint);
        let err = source.download("v1/node.tar.gz", &destination);
        handle.join().expect("server thread");

        assert!(err.is_err());
        assert_eq!(
            fs::read_to_string(&destination).expect("read"),
            "previous-good-bytes"
        );
    }
}
