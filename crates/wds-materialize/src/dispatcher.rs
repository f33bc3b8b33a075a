//! Work dispatcher
//!
//! The top-level loop of a materialize worker: receive a tabular-shard URL,
//! guard it against preemption, hand it to the fetcher, ack on success.
//! Failed messages are not acked; the queue redelivers them once their
//! visibility window lapses. The loop exits on cumulative idleness (the
//! queue has drained) or when the global shard quota is reached (in which
//! case the queue is purged so sibling workers wind down too).

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use wds_common::ledger::DedupLedger;
use wds_common::queue::WorkQueue;

use crate::config::DispatchSettings;
use crate::guard::{PreemptionGuard, PreemptionProbe};

/// Processes one work-queue message body.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn process(&self, body: &str) -> Result<()>;
}

/// Why the dispatch loop exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Cumulative idle time crossed the threshold.
    Idle,
    /// The global shard counter reached the configured quota.
    QuotaReached,
}

/// Dispatch loop parameters.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub receive_wait: Duration,
    pub idle_timeout: Duration,
    pub shard_quota: Option<i64>,
    pub guard_poll: Duration,
}

impl From<&DispatchSettings> for DispatchConfig {
    fn from(settings: &DispatchSettings) -> Self {
        Self {
            receive_wait: Duration::from_secs(settings.receive_wait_secs),
            idle_timeout: Duration::from_secs(settings.idle_timeout_secs),
            shard_quota: settings.shard_quota,
            guard_poll: Duration::from_secs(settings.guard_poll_secs),
        }
    }
}

pub struct Dispatcher {
    queue: Arc<dyn WorkQueue>,
    ledger: Arc<dyn DedupLedger>,
    probe: Arc<dyn PreemptionProbe>,
    config: DispatchConfig,
    worker_id: Uuid,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        ledger: Arc<dyn DedupLedger>,
        probe: Arc<dyn PreemptionProbe>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            queue,
            ledger,
            probe,
            config,
            worker_id: Uuid::new_v4(),
        }
    }

    /// Pull and process messages until the queue runs dry or the shard
    /// quota fills.
    ///
    /// Idle time accumulates across the whole run and is never reset: a
    /// worker that keeps finding stragglers still exits once it has spent
    /// the idle budget waiting, which keeps fleets from lingering on a
    /// near-empty queue.
    pub async fn run(&self, handler: &dyn WorkHandler) -> Result<StopReason> {
        let worker = self.worker_id;
        info!(%worker, "Dispatcher started");

        let mut idle = Duration::ZERO;

        loop {
            if self.quota_reached().await {
                info!(%worker, "Shard quota reached, purging work queue");
                if let Err(e) = self.queue.purge().await {
                    warn!(%worker, "Failed to purge work queue: {e:#}");
                }
                return Ok(StopReason::QuotaReached);
            }

            let message = match self.queue.receive(self.config.receive_wait).await {
                Ok(message) => message,
                Err(e) => {
                    warn!(%worker, "Receive failed: {e:#}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let Some(message) = message else {
                idle += self.config.receive_wait;
                if idle >= self.config.idle_timeout {
                    info!(%worker, idle_secs = idle.as_secs(), "Idle budget spent, exiting");
                    return Ok(StopReason::Idle);
                }
                continue;
            };

            info!(%worker, body = %message.body, "Processing work item");

            let guard = PreemptionGuard::spawn(
                Arc::clone(&self.queue),
                message.body.clone(),
                Arc::clone(&self.probe),
                self.config.guard_poll,
            );

            match handler.process(&message.body).await {
                Ok(()) => {
                    let requeued = guard.stop().await?;
                    if requeued {
                        info!(%worker, "Work item was requeued mid-flight; acking original");
                    }
                    if let Err(e) = self.queue.ack(&message.receipt_handle).await {
                        warn!(%worker, "Failed to ack work item: {e:#}");
                    }
                }
                Err(e) => {
                    // No ack: redelivery after the visibility window is the
                    // retry mechanism.
                    error!(%worker, body = %message.body, "Work item failed: {e:#}");
                    guard.stop().await?;
                }
            }
        }
    }

    async fn quota_reached(&self) -> bool {
        let Some(quota) = self.config.shard_quota else {
            return false;
        };

        match self.ledger.shard_count().await {
            Ok(count) => count >= quota,
            Err(e) => {
                warn!("Failed to read shard counter: {e:#}");
                false
            }
        }
    }
}
