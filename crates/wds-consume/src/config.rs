//! Configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ============================================================================
// Consume Configuration Constants
// ============================================================================

/// Default local directory for downloaded shard archives.
pub const DEFAULT_SHARD_DIR: &str = "./shards";

/// Default maximum number of ready archives held locally.
pub const DEFAULT_MAX_LOCAL_SHARDS: usize = 9;

/// Default wait between capacity re-checks when the cache is full, in
/// seconds.
pub const DEFAULT_CAPACITY_POLL_SECS: u64 = 3;

/// Default sleep after an empty receive, in seconds.
pub const DEFAULT_EMPTY_SLEEP_SECS: u64 = 20;

/// Default long-poll wait per receive attempt in seconds.
pub const DEFAULT_RECEIVE_WAIT_SECS: u64 = 5;

/// Default visibility timeout claimed per shard message, in seconds. Large
/// archives can take a while to land on slow links.
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 600;

/// Default interval between visibility refreshes, in seconds.
pub const DEFAULT_EXTEND_EVERY_SECS: u64 = 60;

/// Consume worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeConfig {
    /// Queue carrying uploaded shard locators.
    pub shard_queue_url: String,
    /// Bucket the locators must point into.
    pub bucket: String,
    /// Endpoint override for local AWS stand-ins.
    pub aws_endpoint: Option<String>,
    pub shard_dir: PathBuf,
    pub max_local_shards: usize,
    pub capacity_poll_secs: u64,
    pub empty_sleep_secs: u64,
    pub receive_wait_secs: u64,
    pub visibility_timeout_secs: u64,
    pub extend_every_secs: u64,
}

impl ConsumeConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = ConsumeConfig {
            shard_queue_url: std::env::var("WDS_SHARD_QUEUE_URL")
                .context("WDS_SHARD_QUEUE_URL must be set")?,
            bucket: std::env::var("WDS_BUCKET").context("WDS_BUCKET must be set")?,
            aws_endpoint: std::env::var("WDS_AWS_ENDPOINT").ok(),
            shard_dir: PathBuf::from(
                std::env::var("WDS_SHARD_DIR").unwrap_or_else(|_| DEFAULT_SHARD_DIR.to_string()),
            ),
            max_local_shards: std::env::var("WDS_MAX_LOCAL_SHARDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_LOCAL_SHARDS),
            capacity_poll_secs: std::env::var("WDS_CAPACITY_POLL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CAPACITY_POLL_SECS),
            empty_sleep_secs: std::env::var("WDS_EMPTY_SLEEP_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_EMPTY_SLEEP_SECS),
            receive_wait_secs: std::env::var("WDS_RECEIVE_WAIT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RECEIVE_WAIT_SECS),
            visibility_timeout_secs: std::env::var("WDS_VISIBILITY_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT_SECS),
            extend_every_secs: std::env::var("WDS_EXTEND_EVERY_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_EXTEND_EVERY_SECS),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_local_shards == 0 {
            anyhow::bail!("Max local shards must be greater than 0");
        }

        if self.extend_every_secs >= self.visibility_timeout_secs {
            anyhow::bail!(
                "Visibility refresh interval ({}) must be shorter than the visibility timeout ({})",
                self.extend_every_secs,
                self.visibility_timeout_secs
            );
        }

        Ok(())
    }
}
