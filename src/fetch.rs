//! Retrieves raw image bytes for a locator.
//!
//! Supported locators: `http://` / `https://` URLs, `file://` paths and
//! `data:<mime>;base64,<payload>` URIs.

use crate::config::FetchConfig;
use crate::error::{Result, SentryError};
use base64::Engine;
use reqwest::StatusCode;
use std::io::ErrorKind;
use std::time::Duration;
use tracing::debug;

pub struct ImageFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl ImageFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SentryError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_bytes: config.max_image_bytes,
        })
    }

    pub async fn fetch(&self, src: &str) -> Result<Vec<u8>> {
        let bytes = if src.starts_with("http://") || src.starts_with("https://") {
            self.fetch_http(src).await?
        } else if let Some(path) = src.strip_prefix("file://") {
            debug!(src = %src, "Loading image from file");
            tokio::fs::read(path).await.map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                    SentryError::fetch_rejected(src, format!("Failed to read file: {}", e))
                }
                _ => SentryError::fetch(src, format!("Failed to read file: {}", e)),
            })?
        } else if src.starts_with("data:") {
            decode_data_uri(src)?
        } else {
            return Err(SentryError::fetch_rejected(src, "unsupported locator scheme"));
        };

        if bytes.is_empty() {
            return Err(SentryError::fetch(src, "empty body"));
        }
        if bytes.len() > self.max_bytes {
            return Err(SentryError::fetch_rejected(
                src,
                format!("body too large: {} bytes (limit {})", bytes.len(), self.max_bytes),
            ));
        }
        Ok(bytes)
    }

    async fn fetch_http(&self, src: &str) -> Result<Vec<u8>> {
        debug!(src = %src, "Downloading image");
        let response = self
            .client
            .get(src)
            .send()
            .await
            .map_err(|e| SentryError::fetch(src, format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let reason = format!("HTTP error: {}", status);
            return Err(if is_permanent_status(status) {
                SentryError::fetch_rejected(src, reason)
            } else {
                SentryError::fetch(src, reason)
            });
        }

        if let Some(len) = response.content_length() {
            if len as usize > self.max_bytes {
                return Err(SentryError::fetch_rejected(
                    src,
                    format!("declared length {} too large", len),
                ));
            }
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| SentryError::fetch(src, format!("Failed to read response: {}", e)))
    }
}

/// Client errors other than timeouts and rate limiting won't change on retry.
fn is_permanent_status(status: StatusCode) -> bool {
    status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
}

/// Decode a base64 `data:` URI. Non-base64 data URIs are rejected.
pub fn decode_data_uri(src: &str) -> Result<Vec<u8>> {
    let (header, payload) = src
        .split_once(',')
        .ok_or_else(|| SentryError::fetch_rejected(src, "malformed data URI"))?;

    if !header.ends_with(";base64") {
        return Err(SentryError::fetch_rejected(src, "only base64 data URIs are supported"));
    }

    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| SentryError::fetch_rejected(src, format!("Base64 decode failed: {}", e)))
}
