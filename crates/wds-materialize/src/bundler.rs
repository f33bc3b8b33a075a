//! Quiescence bundler
//!
//! Watches the staging directory and packages batches whose staged file
//! count has stopped growing. Quiescence is the only completion signal: the
//! fetcher never tells the bundler a batch is done, it just stops writing
//! into it. The upload sequence is ordered so a crash at any point leaves
//! either retryable staged files or an already-recorded shard, never a lost
//! one.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use wds_common::ledger::DedupLedger;
use wds_common::queue::WorkQueue;
use wds_common::storage::ShardStore;
use wds_common::types::{prefix_of, BatchKey, STAGED_SEPARATOR};

use crate::config::BundleConfig;

/// Debounce tracker for per-batch file counts.
///
/// Pure state machine over observed counts so decisions are testable with a
/// fake clock. A prefix ripens when its count has been stable for the settle
/// window and exceeds the minimum shard size.
#[derive(Debug, Default)]
pub struct WatchState {
    previous: HashMap<String, usize>,
    stable_since: HashMap<String, Instant>,
}

impl WatchState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one scan of the staging directory; returns the prefixes ready
    /// to bundle.
    pub fn observe(
        &mut self,
        counts: &HashMap<String, usize>,
        now: Instant,
        min_files: usize,
        settle: Duration,
    ) -> Vec<String> {
        let mut ripe = Vec::new();

        for (prefix, count) in counts {
            if self.previous.get(prefix) == Some(count) {
                let since = *self.stable_since.entry(prefix.clone()).or_insert(now);
                if *count > min_files && now.duration_since(since) >= settle {
                    ripe.push(prefix.clone());
                }
            } else {
                self.stable_since.insert(prefix.clone(), now);
            }
        }

        self.previous = counts.clone();
        self.stable_since.retain(|prefix, _| counts.contains_key(prefix));
        ripe.sort();
        ripe
    }

    /// Forget a prefix after its archive has shipped.
    pub fn clear_prefix(&mut self, prefix: &str) {
        self.previous.remove(prefix);
        self.stable_since.remove(prefix);
    }
}

/// Count staged files per batch prefix.
pub fn scan_counts(staging: &Path) -> Result<HashMap<String, usize>> {
    let mut counts = HashMap::new();

    for entry in std::fs::read_dir(staging)
        .with_context(|| format!("Failed to scan {}", staging.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(prefix) = prefix_of(name) {
            *counts.entry(prefix.to_string()).or_insert(0) += 1;
        }
    }

    Ok(counts)
}

/// Bundles settled batches into tar archives and ships them.
pub struct Bundler {
    staging: PathBuf,
    store: Arc<dyn ShardStore>,
    ledger: Arc<dyn DedupLedger>,
    shard_queue: Arc<dyn WorkQueue>,
    shard_prefix: String,
    config: BundleConfig,
    state: WatchState,
}

impl Bundler {
    pub fn new(
        staging: PathBuf,
        store: Arc<dyn ShardStore>,
        ledger: Arc<dyn DedupLedger>,
        shard_queue: Arc<dyn WorkQueue>,
        shard_prefix: impl Into<String>,
        config: BundleConfig,
    ) -> Self {
        Self {
            staging,
            store,
            ledger,
            shard_queue,
            shard_prefix: shard_prefix.into(),
            config,
            state: WatchState::new(),
        }
    }

    /// One scan-decide-bundle cycle.
    pub async fn poll_once(&mut self) -> Result<()> {
        let staging = self.staging.clone();
        let counts =
            tokio::task::spawn_blocking(move || scan_counts(&staging)).await??;

        let ripe = self.state.observe(
            &counts,
            Instant::now(),
            self.config.min_files_per_shard,
            Duration::from_secs(self.config.settle_secs),
        );

        for prefix in ripe {
            if let Err(e) = self.bundle_and_upload(&prefix).await {
                warn!(prefix, "Bundling failed, will retry: {e:#}");
            }
        }

        Ok(())
    }

    /// Run the scan loop until `shutdown` flips, then bundle whatever
    /// already clears the size threshold so a graceful exit ships partial
    /// work instead of abandoning it.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        // The fetcher also creates this lazily, but the bundler may start
        // polling on a fresh host before anything has been staged.
        tokio::fs::create_dir_all(&self.staging)
            .await
            .context("Failed to create staging directory")?;

        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.poll_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            staging = %self.staging.display(),
            min_files = self.config.min_files_per_shard,
            settle_secs = self.config.settle_secs,
            "Bundler watching staging directory"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    // A failed scan must not end the loop.
                    if let Err(e) = self.poll_once().await {
                        warn!("Staging scan failed, will retry: {e:#}");
                    }
                }
            }
        }

        self.finalize().await
    }

    /// Bundle every tracked batch over the size threshold, settle window or
    /// not.
    pub async fn finalize(&mut self) -> Result<()> {
        let staging = self.staging.clone();
        let counts =
            tokio::task::spawn_blocking(move || scan_counts(&staging)).await??;

        for (prefix, count) in counts {
            if count > self.config.min_files_per_shard {
                info!(prefix, count, "Bundling on shutdown");
                if let Err(e) = self.bundle_and_upload(&prefix).await {
                    warn!(prefix, "Shutdown bundling failed: {e:#}");
                }
            }
        }

        Ok(())
    }

    /// Package one batch and ship it: archive, upload, ledger, announce,
    /// clean up. Upload failure leaves the staged files untouched so the
    /// next poll retries; failures after upload are logged but do not undo
    /// the shipped archive.
    async fn bundle_and_upload(&mut self, prefix: &str) -> Result<()> {
        let key = BatchKey::parse_prefix(prefix)?;
        let tar_path = self.staging.join(format!("{prefix}.tar"));

        let archive = {
            let staging = self.staging.clone();
            let prefix = prefix.to_string();
            let tar_path = tar_path.clone();
            tokio::task::spawn_blocking(move || build_archive(&staging, &prefix, &tar_path))
                .await??
        };

        let Some(pairs) = archive else {
            warn!(prefix, "No valid pairs in settled batch, discarding");
            remove_staged(&self.staging, prefix).await;
            self.state.clear_prefix(prefix);
            return Ok(());
        };

        let object_key = key.archive_key(&self.shard_prefix);
        let upload = match self.store.upload_file(&object_key, &tar_path).await {
            Ok(upload) => upload,
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&tar_path).await {
                    warn!("Failed to remove {}: {rm}", tar_path.display());
                }
                return Err(e.context(format!("Upload failed for {object_key}")));
            }
        };

        info!(
            prefix,
            pairs,
            bytes = upload.size,
            key = %object_key,
            "Shipped shard archive"
        );

        match self.ledger.mark_uploaded(&key).await {
            Ok(()) => {
                match self.ledger.increment_shard_count().await {
                    Ok(total) => debug!(total, "Shard counter incremented"),
                    Err(e) => warn!(prefix, "Failed to increment shard counter: {e:#}"),
                }
            }
            // The archive exists; a duplicate upload later is cheaper than
            // losing it now.
            Err(e) => warn!(prefix, "Failed to record upload in ledger: {e:#}"),
        }

        let locator = self.store.locator(&object_key);
        if let Err(e) = self.shard_queue.publish(&locator.to_string()).await {
            warn!(prefix, %locator, "Failed to announce shard downstream: {e:#}");
        }

        if let Err(e) = tokio::fs::remove_file(&tar_path).await {
            warn!("Failed to remove {}: {e}", tar_path.display());
        }
        remove_staged(&self.staging, prefix).await;
        self.state.clear_prefix(prefix);

        Ok(())
    }
}

/// Write the batch's valid pairs into a tar archive.
///
/// A pair is valid when the asset decodes as an image and its JSON sidecar
/// exists. Entries are written in row order, asset before sidecar. Returns
/// the pair count, or `None` when nothing in the batch survived validation
/// (no archive file is left behind in that case).
pub fn build_archive(staging: &Path, prefix: &str, tar_path: &Path) -> Result<Option<usize>> {
    let marker = format!("{prefix}{STAGED_SEPARATOR}");
    let mut by_row: BTreeMap<usize, (Option<PathBuf>, Option<PathBuf>)> = BTreeMap::new();

    for entry in std::fs::read_dir(staging)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(rest) = name.strip_prefix(&marker) else { continue };
        let Some((index, ext)) = rest.split_once('.') else { continue };
        let Ok(index) = index.parse::<usize>() else { continue };

        let slot = by_row.entry(index).or_default();
        if ext == "json" {
            slot.1 = Some(entry.path());
        } else {
            slot.0 = Some(entry.path());
        }
    }

    let file = std::fs::File::create(tar_path)
        .with_context(|| format!("Failed to create {}", tar_path.display()))?;
    let mut builder = tar::Builder::new(file);
    let mut pairs = 0usize;

    for (index, (asset, sidecar)) in &by_row {
        let (Some(asset), Some(sidecar)) = (asset, sidecar) else {
            debug!(prefix, index, "Skipping incomplete pair");
            continue;
        };

        if image::open(asset).is_err() {
            debug!(prefix, index, "Skipping undecodable asset");
            continue;
        }

        let asset_name = file_name_of(asset);
        let sidecar_name = file_name_of(sidecar);
        builder
            .append_path_with_name(asset, asset_name)
            .with_context(|| format!("Failed to archive {}", asset.display()))?;
        builder
            .append_path_with_name(sidecar, sidecar_name)
            .with_context(|| format!("Failed to archive {}", sidecar.display()))?;
        pairs += 1;
    }

    builder.finish().context("Failed to finish archive")?;
    drop(builder);

    if pairs == 0 {
        std::fs::remove_file(tar_path).ok();
        return Ok(None);
    }

    Ok(Some(pairs))
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Delete every staged file belonging to a prefix.
async fn remove_staged(staging: &Path, prefix: &str) {
    let marker = format!("{prefix}{STAGED_SEPARATOR}");
    let mut dir = match tokio::fs::read_dir(staging).await {
        Ok(dir) => dir,
        Err(e) => {
            warn!("Failed to scan {}: {e}", staging.display());
            return;
        }
    };

    while let Ok(Some(entry)) = dir.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(&marker) {
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                warn!("Failed to remove {}: {e}", entry.path().display());
            }
        }
    }
}
