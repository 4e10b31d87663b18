//! Configuration
//!
//! YAML configuration for storage nodes, the two disk caches, the arena
//! cache and logging. Durations are human strings such as `"30s"`, `"5m"`,
//! `"1h30m"` or `"1d"`.
//!
//! ```yaml
//! storage:
//!   - name: local
//!     type: embedded
//!     weight: 10
//!     path: /var/lib/tiercache/local.redb
//!   - name: blob-1
//!     type: remote
//!     weight: 5
//!     throttle: "1048576x10/8388608"
//!     access_token: "..."
//! generational:
//!   root: /var/cache/tiercache/images
//!   max_files: 10000
//!   purge_interval: 1m
//! quota:
//!   root: /var/cache/tiercache/blobs
//!   max_bytes: 1073741824
//! logging:
//!   level: debug
//!   json: true
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::limiter::TokenBucket;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage nodes, in router order
    pub storage: Vec<StorageConfig>,
    pub generational: GenerationalConfig,
    pub quota: QuotaConfig,
    pub arena: ArenaConfig,
    pub logging: LogConfig,
}

impl Config {
    /// Parse and validate a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }

    /// Check every section for values the caches cannot run with
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut files = HashSet::new();
        for node in &self.storage {
            node.validate()?;
            if !names.insert(node.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate storage node name: {}",
                    node.name
                )));
            }
            // redb locks its file, one open handle per path
            if let (StorageKind::Embedded, Some(path)) = (node.kind, &node.path) {
                if !files.insert(path.as_path()) {
                    return Err(Error::Config(format!(
                        "storage node {} reuses embedded path {}",
                        node.name,
                        path.display()
                    )));
                }
            }
        }

        self.generational.validate()?;
        self.quota.validate()?;
        self.arena.validate()?;
        Ok(())
    }
}

// =============================================================================
// Storage
// =============================================================================

/// Backend selector for a storage node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    Embedded,
    Remote,
}

/// One storage node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: StorageKind,

    /// Relative selection weight, must be positive
    #[serde(default = "default_weight")]
    pub weight: u64,

    /// Node is known but must not receive new objects
    #[serde(default)]
    pub offline: bool,

    /// Token bucket string `"<speed>x<timeoutSecs>/<max>"`, empty = unlimited
    #[serde(default)]
    pub throttle: String,

    /// Bearer token for the remote backend
    #[serde(default)]
    pub access_token: Option<String>,

    /// Database file for the embedded backend
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Top-level folder for remote objects
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_content_url")]
    pub content_url: String,

    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Per-request timeout for the remote backend
    #[serde(default = "default_request_timeout", with = "duration_str")]
    pub request_timeout: Duration,
}

fn default_weight() -> u64 {
    1
}

fn default_namespace() -> String {
    "ch".to_string()
}

fn default_content_url() -> String {
    "https://content.dropboxapi.com".to_string()
}

fn default_api_url() -> String {
    "https://api.dropboxapi.com".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

impl StorageConfig {
    /// Minimal config for a node of the given kind
    pub fn new(name: impl Into<String>, kind: StorageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            weight: default_weight(),
            offline: false,
            throttle: String::new(),
            access_token: None,
            path: None,
            namespace: default_namespace(),
            content_url: default_content_url(),
            api_url: default_api_url(),
            request_timeout: default_request_timeout(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("storage node name is empty".to_string()));
        }
        if self.weight == 0 {
            return Err(Error::Config(format!(
                "storage node {} has zero weight",
                self.name
            )));
        }
        self.throttle.parse::<TokenBucket>()?;

        match self.kind {
            StorageKind::Embedded if self.path.is_none() => Err(Error::Config(format!(
                "embedded storage node {} needs a path",
                self.name
            ))),
            StorageKind::Remote if self.access_token.is_none() => Err(Error::Config(format!(
                "remote storage node {} needs an access_token",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Disk caches
// =============================================================================

/// Hot/cold generational disk cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationalConfig {
    pub root: PathBuf,
    /// Target file count enforced by the purger
    pub max_files: usize,
    #[serde(with = "duration_str")]
    pub purge_interval: Duration,
}

impl Default for GenerationalConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("tiercache").join("generational"),
            max_files: 10_000,
            purge_interval: Duration::from_secs(60),
        }
    }
}

impl GenerationalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.purge_interval.is_zero() {
            return Err(Error::Config("purge_interval must be positive".to_string()));
        }
        Ok(())
    }
}

/// Sharded quota disk cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub root: PathBuf,
    pub shard_count: usize,
    /// Byte budget across all shards
    pub max_bytes: u64,
    /// Fraction of the budget the watcher aims for, in `(0, 1]`
    pub safety_factor: f64,
    #[serde(with = "duration_str")]
    pub watch_interval: Duration,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("tiercache").join("quota"),
            shard_count: 1024,
            max_bytes: 1 << 30,
            safety_factor: 0.9,
            watch_interval: Duration::from_secs(60),
        }
    }
}

impl QuotaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 || self.shard_count > u16::MAX as usize + 1 {
            return Err(Error::Config(format!(
                "shard_count must be in 1..=65536, got {}",
                self.shard_count
            )));
        }
        if !(self.safety_factor > 0.0 && self.safety_factor <= 1.0) {
            return Err(Error::Config(format!(
                "safety_factor must be in (0, 1], got {}",
                self.safety_factor
            )));
        }
        if self.watch_interval.is_zero() {
            return Err(Error::Config("watch_interval must be positive".to_string()));
        }
        Ok(())
    }
}

/// In-process arena cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    pub shards: usize,
    /// Each shard arena holds `2^order` units
    pub order: u32,
    pub block_size: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            shards: 16,
            order: 12,
            block_size: crate::alloc::DEFAULT_BLOCK_SIZE,
        }
    }
}

impl ArenaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.shards == 0 {
            return Err(Error::Config("arena shards must be positive".to_string()));
        }
        if self.order >= 32 {
            return Err(Error::Config(format!("arena order {} too large", self.order)));
        }
        if self.block_size == 0 {
            return Err(Error::Config("arena block_size must be positive".to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Logging
// =============================================================================

/// Logging setup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `trace|debug|info|warn|error`
    pub level: String,
    /// Emit JSON lines instead of text
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// =============================================================================
// Durations
// =============================================================================

/// Parse a duration string like "1h", "30m", "2h30m", "1d"
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_secs: u64 = 0;
    let mut num_buf = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            num_buf.push(c);
        } else {
            let num: u64 = num_buf
                .parse()
                .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
            num_buf.clear();

            let multiplier = match c {
                'h' | 'H' => 3600,
                'm' | 'M' => 60,
                's' | 'S' => 1,
                'd' | 'D' => 86400,
                _ => {
                    return Err(Error::DurationParse(format!(
                        "unknown duration unit: {}",
                        c
                    )))
                }
            };

            total_secs += num * multiplier;
        }
    }

    // Trailing bare number counts as seconds
    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_secs += num;
    }

    if total_secs == 0 {
        return Err(Error::DurationParse(
            "duration must be greater than 0".to_string(),
        ));
    }

    Ok(Duration::from_secs(total_secs))
}

/// Format a duration in the shape `parse_duration` accepts
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs != 0 && secs % 86400 == 0 {
        format!("{}d", secs / 86400)
    } else if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
