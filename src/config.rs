//! Tool configuration.
//!
//! Every knob has a default matching the published replication procedure, so
//! a config file is only needed to deviate from it.
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Current schema version for the config file.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Availability endpoint of the Wayback Machine.
pub const DEFAULT_WAYBACK_ENDPOINT: &str = "https://archive.org/wayback/available";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicationConfig {
    pub schema_version: u32,
    pub download: DownloadConfig,
    pub upload: UploadConfig,
    pub wayback_lookup: WaybackLookupConfig,
}

/// Options for the external downloader and archive rate limiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadConfig {
    pub connect_timeout_secs: u64,
    pub timeout_secs: u64,
    pub max_tries: u32,
    pub max_file_not_found: u32,
    pub lowest_speed_limit: String,
    /// Off by default: at least one vendor serves an incomplete chain.
    pub check_certificate: bool,
    pub wayback_batch_size: usize,
    pub wayback_backoff_secs: u64,
}

/// Pacing of uploads to the analysis service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadConfig {
    pub poll_interval_secs: u64,
    pub max_concurrent_analyses: usize,
    pub cooldown_secs: u64,
    pub stuck_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WaybackLookupConfig {
    pub endpoint: String,
    pub backoff_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            download: DownloadConfig::default(),
            upload: UploadConfig::default(),
            wayback_lookup: WaybackLookupConfig::default(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            timeout_secs: 30,
            max_tries: 5,
            max_file_not_found: 2,
            lowest_speed_limit: "1K".to_string(),
            check_certificate: false,
            // https://rationalwiki.org/wiki/Internet_Archive#Restrictions
            wayback_batch_size: 5,
            wayback_backoff_secs: 60,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            max_concurrent_analyses: 1,
            cooldown_secs: 7,
            stuck_timeout_secs: 60,
        }
    }
}

impl Default for WaybackLookupConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_WAYBACK_ENDPOINT.to_string(),
            backoff_secs: 60,
        }
    }
}

impl DownloadConfig {
    pub fn wayback_backoff(&self) -> Duration {
        Duration::from_secs(self.wayback_backoff_secs)
    }
}

impl UploadConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_timeout_secs)
    }
}

/// Load the config at `path`, or the defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> Result<ReplicationConfig> {
    let Some(path) = path else {
        return Ok(ReplicationConfig::default());
    };
    let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    let config: ReplicationConfig =
        serde_json::from_slice(&bytes).context("parse replication config JSON")?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &ReplicationConfig) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported config schema_version {}",
            config.schema_version
        ));
    }
    if config.download.wayback_batch_size == 0 {
        return Err(anyhow!("download.wayback_batch_size must be at least 1"));
    }
    if config.download.max_tries == 0 {
        return Err(anyhow!("download.max_tries must be at least 1"));
    }
    if config.download.lowest_speed_limit.trim().is_empty() {
        return Err(anyhow!("download.lowest_speed_limit must be non-empty"));
    }
    if config.upload.poll_interval_secs == 0 {
        return Err(anyhow!("upload.poll_interval_secs must be at least 1"));
    }
    if config.wayback_lookup.endpoint.trim().is_empty() {
        return Err(anyhow!("wayback_lookup.endpoint must be non-empty"));
    }
    Ok(())
}
