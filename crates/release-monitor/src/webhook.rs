//! Signed webhook delivery to the downstream release filter.
//!
//! The signed byte sequence is an external contract: the payload is encoded
//! as canonical JSON (recursively sorted keys, compact separators, UTF-8)
//! and the signature covers `"<unix seconds>." + body`. Verifiers recompute
//! the exact same bytes, so the canonical form is produced by a dedicated
//! writer here instead of leaning on serializer defaults.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::config::WebhookConfig;

type HmacSha256 = Hmac<Sha256>;

/// A payload ready for delivery; `body` is the exact signed byte sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedWebhookPayload {
    pub timestamp: String,
    pub signature: String,
    pub body: String,
}

/// Encode `value` as canonical JSON: object keys sorted recursively, no
/// whitespace between tokens.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars already have a single stable encoding.
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Canonicalize and sign a payload. `timestamp` overrides the clock for
/// deterministic verification.
pub fn build_signed_payload(
    payload: &Value,
    secret: &str,
    timestamp: Option<i64>,
) -> SignedWebhookPayload {
    let unix_ts = timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp());
    let body = canonical_json(payload);

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(unix_ts.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    let digest = hex::encode(mac.finalize().into_bytes());

    SignedWebhookPayload {
        timestamp: unix_ts.to_string(),
        signature: format!("sha256={digest}"),
        body,
    }
}

/// Delivers signed release payloads over HTTP POST. No retries; a failed
/// delivery leaves the object unprocessed for the next cycle.
pub struct WebhookClient {
    config: WebhookConfig,
}

impl WebhookClient {
    pub fn new(config: &WebhookConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn send_release(&self, payload: &Value) -> Result<()> {
        let signed = build_signed_payload(payload, &self.config.shared_secret, None);

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs_f64(self.config.timeout_seconds))
            .danger_accept_invalid_certs(!self.config.verify_tls)
            .build()
            .context("failed to build webhook HTTP client")?;

        let response = client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .header("X-Release-Timestamp", &signed.timestamp)
            .header("X-Release-Signature", &signed.signature)
            .body(signed.body)
            .send()
            .context("failed to send webhook request")?;

        if !response.status().is_success() {
            bail!(
                "webhook request failed with status {}: {}",
                response.status(),
                response.text().unwrap_or_default()
            );
        }
        Ok(())
    }
}
