//! Operator commands for filling and repairing queues

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use wds_common::queue::WorkQueue;
use wds_common::storage::ShardStore;

/// Publish one work item per non-empty line of a manifest file.
pub async fn seed_work_queue(queue: Arc<dyn WorkQueue>, manifest: &Path) -> Result<usize> {
    let contents = tokio::fs::read_to_string(manifest)
        .await
        .with_context(|| format!("Failed to read {}", manifest.display()))?;

    let mut published = 0;
    for line in contents.lines() {
        let url = line.trim();
        if url.is_empty() || url.starts_with('#') {
            continue;
        }
        queue
            .publish(url)
            .await
            .with_context(|| format!("Failed to publish {url}"))?;
        published += 1;
    }

    info!(published, manifest = %manifest.display(), "Seeded work queue");

    Ok(published)
}

/// Rebuild the downstream shard queue from what the store actually holds.
///
/// Purges first, then publishes a locator for every archive under the shard
/// prefix. Recovers from a lost or corrupted queue without re-materializing
/// anything.
pub async fn rebuild_shard_queue(
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn ShardStore>,
    shard_prefix: &str,
) -> Result<usize> {
    queue
        .purge()
        .await
        .context("Failed to purge shard queue before rebuild")?;

    let keys = store
        .list(&format!("{shard_prefix}/"))
        .await
        .context("Failed to list shard archives")?;

    let mut published = 0;
    for key in keys {
        if !key.ends_with(".tar") {
            warn!(key, "Skipping non-archive object during rebuild");
            continue;
        }
        let locator = store.locator(&key);
        queue
            .publish(&locator.to_string())
            .await
            .with_context(|| format!("Failed to publish {locator}"))?;
        published += 1;
    }

    info!(published, shard_prefix, "Rebuilt shard queue");

    Ok(published)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wds_common::testing::{MemoryStore, MemoryWorkQueue};

    #[tokio::test]
    async fn test_seed_work_queue_skips_blanks_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("shards.txt");
        tokio::fs::write(
            &manifest,
            "https://h/part-00001-a.parquet\n\n# comment\nhttps://h/part-00002-b.parquet\n",
        )
        .await
        .unwrap();

        let queue = Arc::new(MemoryWorkQueue::new());
        let published = seed_work_queue(Arc::clone(&queue) as Arc<dyn WorkQueue>, &manifest)
            .await
            .unwrap();

        assert_eq!(published, 2);
        assert_eq!(
            queue.pending(),
            vec![
                "https://h/part-00001-a.parquet".to_string(),
                "https://h/part-00002-b.parquet".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_rebuild_shard_queue_replaces_stale_entries() {
        let queue = Arc::new(MemoryWorkQueue::with_messages(["stale".to_string()]));
        let store = Arc::new(MemoryStore::with_bucket("bucket"));
        store.insert("wds/00001-0-500.tar", vec![1]);
        store.insert("wds/00002-0-500.tar", vec![2]);
        store.insert("wds/manifest.json", vec![3]);
        store.insert("other/00003-0-500.tar", vec![4]);

        let published = rebuild_shard_queue(
            Arc::clone(&queue) as Arc<dyn WorkQueue>,
            Arc::clone(&store) as Arc<dyn ShardStore>,
            "wds",
        )
        .await
        .unwrap();

        assert_eq!(published, 2);
        assert_eq!(
            queue.pending(),
            vec![
                "s3://bucket/wds/00001-0-500.tar".to_string(),
                "s3://bucket/wds/00002-0-500.tar".to_string(),
            ]
        );
    }
}
