//! Shard puller
//!
//! Keeps a training host's local shard cache topped up. Downloads land
//! under a `.tar.part` name and are renamed to `.ready.tar` only when
//! complete, so readers never open a truncated archive. The cache is
//! bounded by counting ready archives on disk; claimed archives being
//! consumed no longer count, which is what lets the cache refill while
//! training reads.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use wds_common::queue::{VisibilityExtender, WorkQueue};
use wds_common::storage::ShardStore;
use wds_common::types::ShardLocator;

use crate::config::ConsumeConfig;
use crate::stream::READY_SUFFIX;

/// Suffix of in-progress downloads. Never visible to readers.
const PARTIAL_SUFFIX: &str = ".tar.part";

/// What one pull attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// An archive was downloaded and made ready.
    Pulled,
    /// A message was consumed but pointed at nothing usable.
    Skipped,
    /// The local cache is full.
    AtCapacity,
    /// The queue had nothing for us.
    Empty,
}

pub struct ShardPuller {
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn ShardStore>,
    config: ConsumeConfig,
}

impl ShardPuller {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        store: Arc<dyn ShardStore>,
        config: ConsumeConfig,
    ) -> Self {
        Self {
            queue,
            store,
            config,
        }
    }

    /// One receive-download-rename cycle.
    pub async fn pull_once(&self) -> Result<PullOutcome> {
        tokio::fs::create_dir_all(&self.config.shard_dir)
            .await
            .context("Failed to create shard directory")?;

        let ready = ready_count(&self.config.shard_dir).await?;
        if ready >= self.config.max_local_shards {
            return Ok(PullOutcome::AtCapacity);
        }

        let message = self
            .queue
            .receive_with_visibility(
                Duration::from_secs(self.config.receive_wait_secs),
                Duration::from_secs(self.config.visibility_timeout_secs),
            )
            .await?;

        let Some(message) = message else {
            return Ok(PullOutcome::Empty);
        };

        let locator: ShardLocator = match message.body.trim().parse() {
            Ok(locator) => locator,
            Err(e) => {
                warn!(body = %message.body, "Dropping unparseable shard locator: {e}");
                self.queue.ack(&message.receipt_handle).await?;
                return Ok(PullOutcome::Skipped);
            }
        };

        if locator.bucket != self.store.bucket() {
            warn!(%locator, bucket = self.store.bucket(), "Dropping locator for foreign bucket");
            self.queue.ack(&message.receipt_handle).await?;
            return Ok(PullOutcome::Skipped);
        }

        if !self.store.exists(&locator.key).await? {
            warn!(%locator, "Dropping locator for missing archive");
            self.queue.ack(&message.receipt_handle).await?;
            return Ok(PullOutcome::Skipped);
        }

        let extender = VisibilityExtender::spawn(
            Arc::clone(&self.queue),
            message.receipt_handle.clone(),
            Duration::from_secs(self.config.visibility_timeout_secs),
            Duration::from_secs(self.config.extend_every_secs),
        );

        let result = self.download(&locator).await;
        extender.stop().await?;

        match result {
            Ok(bytes) => {
                info!(%locator, bytes, "Shard ready");
                self.queue.ack(&message.receipt_handle).await?;
                Ok(PullOutcome::Pulled)
            }
            // No ack: the message comes back after its visibility window
            // and another attempt gets a clean shot.
            Err(e) => Err(e.context(format!("Failed to pull {locator}"))),
        }
    }

    async fn download(&self, locator: &ShardLocator) -> Result<u64> {
        let stem = locator
            .file_name()
            .strip_suffix(".tar")
            .unwrap_or(locator.file_name());
        let partial = self.config.shard_dir.join(format!("{stem}{PARTIAL_SUFFIX}"));
        let ready = self.config.shard_dir.join(format!("{stem}{READY_SUFFIX}"));

        let bytes = match self.store.download_to(&locator.key, &partial).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&partial).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove {}: {rm}", partial.display());
                    }
                }
                return Err(e);
            }
        };

        tokio::fs::rename(&partial, &ready)
            .await
            .with_context(|| format!("Failed to publish {}", ready.display()))?;

        Ok(bytes)
    }

    /// Run the pull loop until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            shard_dir = %self.config.shard_dir.display(),
            max_local_shards = self.config.max_local_shards,
            "Shard puller started"
        );

        loop {
            let sleep = match self.pull_once().await {
                Ok(PullOutcome::Pulled) | Ok(PullOutcome::Skipped) => Duration::ZERO,
                Ok(PullOutcome::AtCapacity) => {
                    Duration::from_secs(self.config.capacity_poll_secs)
                }
                Ok(PullOutcome::Empty) => Duration::from_secs(self.config.empty_sleep_secs),
                Err(e) => {
                    warn!("Pull attempt failed: {e:#}");
                    Duration::from_secs(1)
                }
            };

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }
}

/// Number of ready archives in the cache directory.
pub async fn ready_count(dir: &Path) -> Result<usize> {
    let mut count = 0;
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to scan {}", dir.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        if entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.ends_with(READY_SUFFIX))
        {
            count += 1;
        }
    }

    Ok(count)
}
