//! In-memory fakes for the pipeline's external services
//!
//! Shared by unit and integration tests across the workspace. Each fake
//! mirrors the contract of its production counterpart closely enough to
//! exercise worker logic without AWS.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::ledger::DedupLedger;
use crate::queue::{QueueMessage, WorkQueue};
use crate::storage::{ShardStore, UploadResult};
use crate::types::BatchKey;

/// In-memory [`WorkQueue`].
///
/// `receive` returns immediately regardless of the requested wait, so tests
/// never block on long polls. Acked messages are removed; unacked in-flight
/// messages stay parked (no visibility clock).
#[derive(Default)]
pub struct MemoryWorkQueue {
    pending: Mutex<VecDeque<String>>,
    in_flight: Mutex<HashMap<String, String>>,
    next_receipt: AtomicU64,
    purge_count: AtomicU64,
    extend_count: AtomicU64,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(bodies: impl IntoIterator<Item = String>) -> Self {
        let queue = Self::new();
        queue
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(bodies);
        queue
    }

    /// Bodies still waiting to be received.
    pub fn pending(&self) -> Vec<String> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Number of received-but-unacked messages.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// How many times the queue was purged.
    pub fn purge_count(&self) -> u64 {
        self.purge_count.load(Ordering::SeqCst)
    }

    /// How many visibility extensions were requested.
    pub fn extend_count(&self) -> u64 {
        self.extend_count.load(Ordering::SeqCst)
    }

    /// Return an in-flight message to the pending queue, as a lapsed
    /// visibility window would.
    pub fn redeliver(&self, receipt_handle: &str) {
        let body = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(receipt_handle);
        if let Some(body) = body {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_front(body);
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn receive(&self, _wait: Duration) -> Result<Option<QueueMessage>> {
        let body = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        Ok(body.map(|body| {
            let receipt_handle =
                format!("receipt-{}", self.next_receipt.fetch_add(1, Ordering::SeqCst));
            self.in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(receipt_handle.clone(), body.clone());
            QueueMessage {
                body,
                receipt_handle,
            }
        }))
    }

    async fn receive_with_visibility(
        &self,
        wait: Duration,
        _visibility: Duration,
    ) -> Result<Option<QueueMessage>> {
        self.receive(wait).await
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let removed = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(receipt_handle);
        match removed {
            Some(_) => Ok(()),
            None => Err(anyhow!("Unknown receipt handle: {receipt_handle}")),
        }
    }

    async fn publish(&self, body: &str) -> Result<()> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(body.to_string());
        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.purge_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn extend_visibility(&self, _receipt_handle: &str, _timeout: Duration) -> Result<()> {
        self.extend_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory [`DedupLedger`].
#[derive(Default)]
pub struct MemoryLedger {
    uploaded: Mutex<HashSet<(String, String)>>,
    counter: Mutex<i64>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-record a batch as uploaded.
    pub fn insert(&self, key: &BatchKey) {
        self.uploaded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((key.source_id.clone(), key.batch_id.clone()));
    }

    pub fn contains(&self, key: &BatchKey) -> bool {
        self.uploaded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(key.source_id.clone(), key.batch_id.clone()))
    }

    pub fn set_count(&self, count: i64) {
        *self.counter.lock().unwrap_or_else(|e| e.into_inner()) = count;
    }
}

#[async_trait]
impl DedupLedger for MemoryLedger {
    async fn uploaded_batches(&self, source_id: &str) -> HashSet<String> {
        self.uploaded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(sid, _)| sid == source_id)
            .map(|(_, batch_id)| batch_id.clone())
            .collect()
    }

    async fn mark_uploaded(&self, key: &BatchKey) -> Result<()> {
        self.insert(key);
        Ok(())
    }

    async fn increment_shard_count(&self) -> Result<i64> {
        let mut counter = self.counter.lock().unwrap_or_else(|e| e.into_inner());
        *counter += 1;
        Ok(*counter)
    }

    async fn shard_count(&self) -> Result<i64> {
        Ok(*self.counter.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// In-memory [`ShardStore`] keyed by object name.
pub struct MemoryStore {
    bucket: String,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_uploads: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            bucket: "memory".to_string(),
            objects: Mutex::new(HashMap::new()),
            fail_uploads: AtomicBool::new(false),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    /// Make subsequent uploads fail, for retry-path tests.
    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// Place an object directly.
    pub fn insert(&self, key: &str, data: Vec<u8>) {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), data);
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl ShardStore for MemoryStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn upload_file(&self, key: &str, path: &Path) -> Result<UploadResult> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(anyhow!("Upload failure injected for test"));
        }

        let data = tokio::fs::read(path).await?;
        let size = data.len() as i64;
        self.insert(key, data);

        Ok(UploadResult {
            key: key.to_string(),
            checksum: String::new(),
            size,
        })
    }

    async fn download_to(&self, key: &str, path: &Path) -> Result<u64> {
        let data = self
            .get(key)
            .ok_or_else(|| anyhow!("No such object: {key}"))?;
        tokio::fs::write(path, &data).await?;
        Ok(data.len() as u64)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_queue_receive_ack_cycle() {
        let queue = MemoryWorkQueue::with_messages(["a".to_string(), "b".to_string()]);

        let first = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.body, "a");
        assert_eq!(queue.in_flight_len(), 1);

        queue.ack(&first.receipt_handle).await.unwrap();
        assert_eq!(queue.in_flight_len(), 0);

        queue.publish("c").await.unwrap();
        assert_eq!(queue.pending(), vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_queue_redeliver() {
        let queue = MemoryWorkQueue::with_messages(["a".to_string()]);
        let message = queue.receive(Duration::ZERO).await.unwrap().unwrap();

        queue.redeliver(&message.receipt_handle);
        assert_eq!(queue.pending(), vec!["a".to_string()]);
        assert_eq!(queue.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_memory_ledger_scoped_by_source() {
        let ledger = MemoryLedger::new();
        ledger.insert(&BatchKey::new("00001", "0-500"));
        ledger.insert(&BatchKey::new("00002", "0-500"));

        let batches = ledger.uploaded_batches("00001").await;
        assert_eq!(batches.len(), 1);
        assert!(batches.contains("0-500"));
    }

    #[tokio::test]
    async fn test_memory_ledger_counter() {
        let ledger = MemoryLedger::new();
        assert_eq!(ledger.shard_count().await.unwrap(), 0);
        assert_eq!(ledger.increment_shard_count().await.unwrap(), 1);
        assert_eq!(ledger.increment_shard_count().await.unwrap(), 2);
        assert_eq!(ledger.shard_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_memory_store_upload_failure_injection() {
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.tar");
        tokio::fs::write(&path, b"data").await.unwrap();

        store.set_fail_uploads(true);
        assert!(store.upload_file("wds/shard.tar", &path).await.is_err());
        assert!(store.keys().is_empty());

        store.set_fail_uploads(false);
        store.upload_file("wds/shard.tar", &path).await.unwrap();
        assert_eq!(store.get("wds/shard.tar").unwrap(), b"data");
    }
}
