//! Configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ============================================================================
// Materialize Configuration Constants
// ============================================================================

/// Default staging directory for fetched assets.
pub const DEFAULT_STAGING_DIR: &str = "./staging";

/// Default object-storage key prefix for uploaded archives.
pub const DEFAULT_SHARD_PREFIX: &str = "wds";

/// Default number of rows per batch prefix.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Default number of rows read from the tabular shard per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 30_000;

/// Default number of concurrent asset downloads.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 500;

/// Default per-request asset download timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Default minimum staged files before a batch is eligible for bundling.
pub const DEFAULT_MIN_FILES_PER_SHARD: usize = 230;

/// Default quiescence window in seconds. A batch whose file count has not
/// changed for this long is considered complete.
pub const DEFAULT_SETTLE_SECS: u64 = 300;

/// Default staging-directory scan interval in seconds.
pub const DEFAULT_POLL_SECS: u64 = 5;

/// Default long-poll wait per receive attempt in seconds.
pub const DEFAULT_RECEIVE_WAIT_SECS: u64 = 20;

/// Default cumulative idle time before a worker exits, in seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 500;

/// Default preemption probe interval in seconds.
pub const DEFAULT_GUARD_POLL_SECS: u64 = 5;

/// Default visibility timeout claimed per training-queue message, in seconds.
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 600;

/// Default interval between visibility refreshes, in seconds.
pub const DEFAULT_EXTEND_EVERY_SECS: u64 = 60;

/// Materialize worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterializeConfig {
    pub queues: QueueConfig,
    pub storage: StorageConfig,
    pub fetch: FetchConfig,
    pub bundle: BundleConfig,
    pub dispatch: DispatchSettings,
}

/// Queue and ledger endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue carrying tabular-shard URLs to materialize.
    pub work_queue_url: String,
    /// Queue announcing uploaded shard locators downstream.
    pub shard_queue_url: String,
    /// DynamoDB table backing the dedup ledger.
    pub ledger_table: String,
    /// Endpoint override for local AWS stand-ins.
    pub aws_endpoint: Option<String>,
}

/// Object storage destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub bucket: String,
    pub shard_prefix: String,
    pub staging_dir: PathBuf,
}

/// Asset fetching parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    pub batch_size: usize,
    pub chunk_size: usize,
    pub concurrency: usize,
    pub request_timeout_secs: u64,
    /// Bearer token for gated tabular-shard hosts.
    pub bearer_token: Option<String>,
}

/// Quiescence bundling parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleConfig {
    pub min_files_per_shard: usize,
    pub settle_secs: u64,
    pub poll_secs: u64,
}

/// Dispatch loop parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    pub receive_wait_secs: u64,
    pub idle_timeout_secs: u64,
    /// Stop producing once the global shard counter reaches this value.
    pub shard_quota: Option<i64>,
    pub guard_poll_secs: u64,
    pub visibility_timeout_secs: u64,
    pub extend_every_secs: u64,
}

impl MaterializeConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = MaterializeConfig {
            queues: QueueConfig {
                work_queue_url: std::env::var("WDS_WORK_QUEUE_URL")
                    .context("WDS_WORK_QUEUE_URL must be set")?,
                shard_queue_url: std::env::var("WDS_SHARD_QUEUE_URL")
                    .context("WDS_SHARD_QUEUE_URL must be set")?,
                ledger_table: std::env::var("WDS_LEDGER_TABLE")
                    .context("WDS_LEDGER_TABLE must be set")?,
                aws_endpoint: std::env::var("WDS_AWS_ENDPOINT").ok(),
            },
            storage: StorageConfig {
                bucket: std::env::var("WDS_BUCKET").context("WDS_BUCKET must be set")?,
                shard_prefix: std::env::var("WDS_SHARD_PREFIX")
                    .unwrap_or_else(|_| DEFAULT_SHARD_PREFIX.to_string()),
                staging_dir: PathBuf::from(
                    std::env::var("WDS_STAGING_DIR")
                        .unwrap_or_else(|_| DEFAULT_STAGING_DIR.to_string()),
                ),
            },
            fetch: FetchConfig {
                batch_size: std::env::var("WDS_BATCH_SIZE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_BATCH_SIZE),
                chunk_size: std::env::var("WDS_CHUNK_SIZE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_CHUNK_SIZE),
                concurrency: std::env::var("WDS_FETCH_CONCURRENCY")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_FETCH_CONCURRENCY),
                request_timeout_secs: std::env::var("WDS_REQUEST_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
                bearer_token: std::env::var("WDS_FETCH_TOKEN").ok(),
            },
            bundle: BundleConfig {
                min_files_per_shard: std::env::var("WDS_MIN_FILES_PER_SHARD")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_MIN_FILES_PER_SHARD),
                settle_secs: std::env::var("WDS_SETTLE_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_SETTLE_SECS),
                poll_secs: std::env::var("WDS_POLL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_POLL_SECS),
            },
            dispatch: DispatchSettings {
                receive_wait_secs: std::env::var("WDS_RECEIVE_WAIT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_RECEIVE_WAIT_SECS),
                idle_timeout_secs: std::env::var("WDS_IDLE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
                shard_quota: std::env::var("WDS_SHARD_QUOTA")
                    .ok()
                    .and_then(|s| s.parse().ok()),
                guard_poll_secs: std::env::var("WDS_GUARD_POLL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_GUARD_POLL_SECS),
                visibility_timeout_secs: std::env::var("WDS_VISIBILITY_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT_SECS),
                extend_every_secs: std::env::var("WDS_EXTEND_EVERY_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_EXTEND_EVERY_SECS),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.fetch.batch_size == 0 {
            anyhow::bail!("Batch size must be greater than 0");
        }

        if self.fetch.concurrency == 0 {
            anyhow::bail!("Fetch concurrency must be greater than 0");
        }

        if self.fetch.chunk_size < self.fetch.batch_size {
            anyhow::bail!(
                "Chunk size ({}) cannot be smaller than batch size ({})",
                self.fetch.chunk_size,
                self.fetch.batch_size
            );
        }

        if self.bundle.min_files_per_shard == 0 {
            anyhow::bail!("Minimum files per shard must be greater than 0");
        }

        if self.dispatch.extend_every_secs >= self.dispatch.visibility_timeout_secs {
            anyhow::bail!(
                "Visibility refresh interval ({}) must be shorter than the visibility timeout ({})",
                self.dispatch.extend_every_secs,
                self.dispatch.visibility_timeout_secs
            );
        }

        if let Some(quota) = self.dispatch.shard_quota {
            if quota <= 0 {
                anyhow::bail!("Shard quota must be greater than 0");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn base_config() -> MaterializeConfig {
        MaterializeConfig {
            queues: QueueConfig {
                work_queue_url: "http://localhost/work".to_string(),
                shard_queue_url: "http://localhost/shards".to_string(),
                ledger_table: "wds-ledger".to_string(),
                aws_endpoint: None,
            },
            storage: StorageConfig {
                bucket: "wds-bucket".to_string(),
                shard_prefix: DEFAULT_SHARD_PREFIX.to_string(),
                staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
            },
            fetch: FetchConfig {
                batch_size: DEFAULT_BATCH_SIZE,
                chunk_size: DEFAULT_CHUNK_SIZE,
                concurrency: DEFAULT_FETCH_CONCURRENCY,
                request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
                bearer_token: None,
            },
            bundle: BundleConfig {
                min_files_per_shard: DEFAULT_MIN_FILES_PER_SHARD,
                settle_secs: DEFAULT_SETTLE_SECS,
                poll_secs: DEFAULT_POLL_SECS,
            },
            dispatch: DispatchSettings {
                receive_wait_secs: DEFAULT_RECEIVE_WAIT_SECS,
                idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
                shard_quota: None,
                guard_poll_secs: DEFAULT_GUARD_POLL_SECS,
                visibility_timeout_secs: DEFAULT_VISIBILITY_TIMEOUT_SECS,
                extend_every_secs: DEFAULT_EXTEND_EVERY_SECS,
            },
        }
    }

    #[test]
    fn test_default_config_validates() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_chunk_smaller_than_batch_rejected() {
        let mut config = base_config();
        config.fetch.chunk_size = 100;
        config.fetch.batch_size = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_refresh_interval_must_undercut_visibility() {
        let mut config = base_config();
        config.dispatch.extend_every_secs = 600;
        config.dispatch.visibility_timeout_secs = 600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_quota_rejected() {
        let mut config = base_config();
        config.dispatch.shard_quota = Some(0);
        assert!(config.validate().is_err());
    }
}
