//! Dedup ledger: which batches have been materialized, and how many shards
//! exist overall
//!
//! The ledger is the only producer-side synchronization primitive shared
//! between workers. Entries are idempotent: writing the same batch twice is
//! harmless, which is what makes duplicate bundling attempts collapse into
//! one logical upload. One reserved row holds the global shard counter,
//! maintained with an atomic add so concurrent bundlers cannot lose
//! increments.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_dynamodb::types::{AttributeValue, ReturnValue};
use std::collections::HashSet;
use tracing::warn;

use crate::types::BatchKey;

/// Partition key of the reserved global-counter row.
pub const COUNTER_SOURCE_ID: &str = "__upload_counter__";
/// Sort key of the reserved global-counter row.
pub const COUNTER_BATCH_ID: &str = "__upload_counter__";

/// Idempotent record of materialized batches.
///
/// Production uses [`DynamoLedger`]; tests use
/// [`crate::testing::MemoryLedger`].
#[async_trait]
pub trait DedupLedger: Send + Sync {
    /// Batch ids already recorded as uploaded for a source shard.
    ///
    /// Errors degrade to the empty set with a warning: a ledger outage makes
    /// the fetcher redo work rather than lose it.
    async fn uploaded_batches(&self, source_id: &str) -> HashSet<String>;

    /// Record a batch as uploaded. Idempotent.
    async fn mark_uploaded(&self, key: &BatchKey) -> Result<()>;

    /// Atomically bump the global shard counter, returning the new value.
    async fn increment_shard_count(&self) -> Result<i64>;

    /// Current value of the global shard counter (0 when absent).
    async fn shard_count(&self) -> Result<i64>;
}

/// DynamoDB-backed ledger.
///
/// Table schema: partition key `source_id` (S), sort key `batch_id` (S),
/// attribute `uploaded` (BOOL). The reserved
/// (`__upload_counter__`, `__upload_counter__`) row carries the numeric
/// `upload_count` attribute.
#[derive(Clone)]
pub struct DynamoLedger {
    client: aws_sdk_dynamodb::Client,
    table: String,
}

impl DynamoLedger {
    pub fn new(client: aws_sdk_dynamodb::Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl DedupLedger for DynamoLedger {
    async fn uploaded_batches(&self, source_id: &str) -> HashSet<String> {
        let response = self
            .client
            .query()
            .table_name(&self.table)
            .key_condition_expression("source_id = :sid")
            .expression_attribute_values(":sid", AttributeValue::S(source_id.to_string()))
            .send()
            .await;

        match response {
            Ok(output) => output
                .items()
                .iter()
                .filter_map(|item| item.get("batch_id").and_then(|v| v.as_s().ok()))
                .filter(|batch_id| batch_id.as_str() != COUNTER_BATCH_ID)
                .cloned()
                .collect(),
            Err(e) => {
                warn!(
                    source_id,
                    error = %aws_sdk_dynamodb::error::DisplayErrorContext(&e),
                    "Failed to query uploaded batches; treating all as unprocessed"
                );
                HashSet::new()
            }
        }
    }

    async fn mark_uploaded(&self, key: &BatchKey) -> Result<()> {
        self.client
            .put_item()
            .table_name(&self.table)
            .item("source_id", AttributeValue::S(key.source_id.clone()))
            .item("batch_id", AttributeValue::S(key.batch_id.clone()))
            .item("uploaded", AttributeValue::Bool(true))
            .send()
            .await
            .with_context(|| format!("Failed to mark {key} as uploaded"))?;

        Ok(())
    }

    async fn increment_shard_count(&self) -> Result<i64> {
        let response = self
            .client
            .update_item()
            .table_name(&self.table)
            .key("source_id", AttributeValue::S(COUNTER_SOURCE_ID.to_string()))
            .key("batch_id", AttributeValue::S(COUNTER_BATCH_ID.to_string()))
            .update_expression("ADD upload_count :inc")
            .expression_attribute_values(":inc", AttributeValue::N("1".to_string()))
            .return_values(ReturnValue::UpdatedNew)
            .send()
            .await
            .context("Failed to increment shard counter")?;

        let count = response
            .attributes()
            .and_then(|attrs| attrs.get("upload_count"))
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse::<i64>().ok())
            .context("Shard counter update returned no numeric value")?;

        Ok(count)
    }

    async fn shard_count(&self) -> Result<i64> {
        let response = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("source_id", AttributeValue::S(COUNTER_SOURCE_ID.to_string()))
            .key("batch_id", AttributeValue::S(COUNTER_BATCH_ID.to_string()))
            .send()
            .await
            .context("Failed to read shard counter")?;

        let count = response
            .item()
            .and_then(|item| item.get("upload_count"))
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse::<i64>().ok())
            .unwrap_or(0);

        Ok(count)
    }
}
