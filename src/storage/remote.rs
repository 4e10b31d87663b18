//! Remote blob backend
//!
//! Stores objects through a Dropbox-style v2 HTTP API:
//!
//! | Operation | Endpoint                              |
//! |-----------|---------------------------------------|
//! | put       | `{content}/2/files/upload`            |
//! | get       | `{content}/2/files/download`          |
//! | delete    | `{api}/2/files/delete_v2`             |
//! | stat      | `{api}/2/users/get_space_usage`       |
//!
//! Every failure that is not a clean "not found" is reported as
//! [`DriverError::Dead`] so a router can fail over uniformly. Downloads are
//! charged against the node's [`TokenBucket`] before the body is read.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::{header, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{DriverResult, KvDriver, Stat};
use crate::config::StorageConfig;
use crate::error::{DriverError, Error, Result};
use crate::limiter::TokenBucket;

/// Longest sanitized key kept in an object path
const MAX_KEY_CHARS: usize = 64;

const API_RESULT_HEADER: &str = "Dropbox-API-Result";
const API_ARG_HEADER: &str = "Dropbox-API-Arg";

/// Map a key to its object path: `/<namespace>/<hh>/<sanitized>`.
///
/// Characters that are not Unicode letters or digits become `_` and the result is capped at 64
/// characters. `hh` is the low byte of a base-31 rolling hash of the
/// sanitized key, spreading objects over 256 folders.
pub fn object_path(namespace: &str, key: &str) -> String {
    let sanitized: String = key
        .chars()
        .take(MAX_KEY_CHARS)
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();

    let hash = sanitized
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32));

    format!("/{}/{:02x}/{}", namespace, hash as u8, sanitized)
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Serialize)]
struct PathArg<'a> {
    path: &'a str,
}

#[derive(Serialize)]
struct UploadArg<'a> {
    path: &'a str,
    mode: &'a str,
    autorename: bool,
    mute: bool,
    strict_conflict: bool,
}

#[derive(Debug, Default, Deserialize)]
struct FileMetadata {
    #[serde(default)]
    id: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct DeleteResult {
    metadata: Option<FileMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_summary: String,
}

#[derive(Debug, Deserialize)]
struct SpaceUsage {
    used: u64,
    allocation: SpaceAllocation,
}

#[derive(Debug, Default, Deserialize)]
struct SpaceAllocation {
    #[serde(default)]
    allocated: u64,
}

// =============================================================================
// Backend
// =============================================================================

/// HTTP blob API backend
#[derive(Debug)]
pub struct RemoteBlobStorage {
    name: String,
    namespace: String,
    content_url: String,
    api_url: String,
    access_token: String,
    client: Client,
    throttle: TokenBucket,
    upload_bytes: AtomicU64,
    download_bytes: AtomicU64,
}

impl RemoteBlobStorage {
    /// Build a backend from a `remote` storage config
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let access_token = config.access_token.clone().ok_or_else(|| {
            Error::Config(format!("remote storage node {} needs an access_token", config.name))
        })?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            name: config.name.clone(),
            namespace: config.namespace.clone(),
            content_url: config.content_url.trim_end_matches('/').to_string(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            access_token,
            client,
            throttle: config.throttle.parse()?,
            upload_bytes: AtomicU64::new(0),
            download_bytes: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn throttle(&self) -> &TokenBucket {
        &self.throttle
    }

    fn path_for(&self, key: &str) -> String {
        object_path(&self.namespace, key)
    }

    fn post(&self, url: String) -> reqwest::RequestBuilder {
        self.client.post(url).bearer_auth(&self.access_token)
    }

    /// Log and classify a failed exchange
    fn dead(&self, op: &str, reason: impl std::fmt::Display) -> DriverError {
        warn!(node = %self.name, op, error = %reason, "remote request failed");
        DriverError::dead(format!("{} {}: {}", self.name, op, reason))
    }

    /// Read the `error_summary` of a 409 response
    async fn conflict_summary(resp: Response) -> String {
        resp.json::<ApiError>()
            .await
            .map(|e| e.error_summary)
            .unwrap_or_default()
    }
}

#[async_trait]
impl KvDriver for RemoteBlobStorage {
    #[instrument(skip(self, value), fields(node = %self.name, len = value.len()))]
    async fn put(&self, key: &str, value: Bytes) -> DriverResult<()> {
        let path = self.path_for(key);
        let arg = serde_json::to_string(&UploadArg {
            path: &path,
            mode: "overwrite",
            autorename: false,
            mute: true,
            strict_conflict: false,
        })
        .map_err(|e| self.dead("put", e))?;

        let len = value.len() as u64;
        let resp = self
            .post(format!("{}/2/files/upload", self.content_url))
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(API_ARG_HEADER, arg)
            .body(value)
            .send()
            .await
            .map_err(|e| self.dead("put", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(self.dead("put", format!("{}: {}", status, body)));
        }

        let meta: FileMetadata = resp.json().await.map_err(|e| self.dead("put", e))?;
        if meta.id.is_empty() {
            return Err(self.dead("put", "upload response carries no id"));
        }

        self.upload_bytes.fetch_add(len, Ordering::Relaxed);
        debug!(path = %path, "uploaded");
        Ok(())
    }

    #[instrument(skip(self), fields(node = %self.name))]
    async fn get(&self, key: &str) -> DriverResult<Bytes> {
        let path = self.path_for(key);
        let arg = serde_json::to_string(&PathArg { path: &path }).map_err(|e| self.dead("get", e))?;

        let resp = self
            .post(format!("{}/2/files/download", self.content_url))
            .header(API_ARG_HEADER, arg)
            .send()
            .await
            .map_err(|e| self.dead("get", e))?;

        match resp.status() {
            StatusCode::CONFLICT => {
                let summary = Self::conflict_summary(resp).await;
                debug!(path = %path, summary = %summary, "remote object missing");
                return Err(DriverError::NotFound);
            }
            status if !status.is_success() => {
                return Err(self.dead("get", status));
            }
            _ => {}
        }

        let meta: FileMetadata = resp
            .headers()
            .get(API_RESULT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or_default();
        if meta.id.is_empty() {
            return Err(DriverError::NotFound);
        }

        if !self.throttle.consume(meta.size).await {
            debug!(path = %path, size = meta.size, "download throttled");
            return Err(DriverError::Throttled);
        }

        let body = resp.bytes().await.map_err(|e| self.dead("get", e))?;
        self.download_bytes.fetch_add(body.len() as u64, Ordering::Relaxed);
        Ok(body)
    }

    #[instrument(skip(self), fields(node = %self.name))]
    async fn delete(&self, key: &str) -> DriverResult<()> {
        let path = self.path_for(key);
        let resp = self
            .post(format!("{}/2/files/delete_v2", self.api_url))
            .json(&PathArg { path: &path })
            .send()
            .await
            .map_err(|e| self.dead("delete", e))?;

        match resp.status() {
            StatusCode::CONFLICT => {
                let summary = Self::conflict_summary(resp).await;
                if summary.contains("not_found") {
                    return Ok(());
                }
                Err(self.dead("delete", summary))
            }
            status if status.is_success() => {
                let result: DeleteResult = resp.json().await.map_err(|e| self.dead("delete", e))?;
                match result.metadata {
                    Some(meta) if !meta.id.is_empty() => Ok(()),
                    _ => Err(self.dead("delete", "delete response carries no metadata")),
                }
            }
            status => Err(self.dead("delete", status)),
        }
    }

    #[instrument(skip(self), fields(node = %self.name))]
    async fn stat(&self) -> Stat {
        let start = Instant::now();
        let mut stat = Stat {
            upload_bytes: self.upload_bytes.load(Ordering::Relaxed),
            download_bytes: self.download_bytes.load(Ordering::Relaxed),
            throttle: self.throttle.to_string(),
            updated_at: Some(Utc::now()),
            ..Stat::default()
        };

        let usage: DriverResult<SpaceUsage> = async {
            let resp = self
                .post(format!("{}/2/users/get_space_usage", self.api_url))
                .send()
                .await
                .map_err(|e| self.dead("stat", e))?;
            if !resp.status().is_success() {
                return Err(self.dead("stat", resp.status()));
            }
            resp.json::<SpaceUsage>()
                .await
                .map_err(|e| self.dead("stat", e))
        }
        .await;

        stat.ping_millis = start.elapsed().as_millis() as u64;
        match usage {
            Ok(usage) => {
                stat.total_bytes = usage.allocation.allocated;
                stat.used_bytes = usage.used;
                stat.available_bytes = usage.allocation.allocated.saturating_sub(usage.used);
                stat.sealed = stat.total_bytes > 0 && stat.available_bytes == 0;
            }
            Err(e) => stat.error = Some(e.to_string()),
        }
        stat
    }

    fn kind(&self) -> &'static str {
        "remote"
    }
}

// =============================================================================
// Tests
// =============================================================================
