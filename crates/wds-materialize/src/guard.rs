//! Preemption guard
//!
//! Spot instances get a short warning before termination. While a work-queue
//! message is being processed, a guard task polls the instance metadata
//! endpoint and, on the first sign of imminent termination, re-publishes the
//! in-progress message so another worker can pick it up. The requeue fires
//! at most once per guarded message, and never after the guard is stopped.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use wds_common::queue::WorkQueue;

/// EC2 spot termination notice endpoint.
const SPOT_ACTION_URL: &str = "http://169.254.169.254/latest/meta-data/spot/instance-action";

/// Probe timeout. The metadata service is link-local; anything slower than
/// this means we are not on a spot instance.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Detects imminent host termination.
#[async_trait]
pub trait PreemptionProbe: Send + Sync + 'static {
    async fn imminent(&self) -> bool;
}

/// Probe backed by the EC2 instance metadata service.
///
/// The spot/instance-action document only exists once termination has been
/// scheduled, so any successful response means the clock is running.
pub struct SpotInstanceProbe {
    client: reqwest::Client,
}

impl SpotInstanceProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for SpotInstanceProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PreemptionProbe for SpotInstanceProbe {
    async fn imminent(&self) -> bool {
        let response = self
            .client
            .get(SPOT_ACTION_URL)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;

        match response {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Guards one in-flight message against loss on preemption.
///
/// Spawn when processing begins; call [`PreemptionGuard::stop`] once the
/// message is finished (acked or intentionally released). Between those two
/// points a detected preemption re-publishes the message body exactly once.
pub struct PreemptionGuard {
    fired: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl PreemptionGuard {
    pub fn spawn(
        queue: Arc<dyn WorkQueue>,
        body: String,
        probe: Arc<dyn PreemptionProbe>,
        poll: Duration,
    ) -> Self {
        let fired = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());

        let task_fired = Arc::clone(&fired);
        let task_stopped = Arc::clone(&stopped);
        let task_notify = Arc::clone(&notify);

        let handle = tokio::spawn(async move {
            loop {
                if task_stopped.load(Ordering::SeqCst) {
                    break;
                }

                if probe.imminent().await {
                    // swap keeps the requeue one-shot even if the probe
                    // stays hot across iterations
                    if !task_stopped.load(Ordering::SeqCst)
                        && !task_fired.swap(true, Ordering::SeqCst)
                    {
                        warn!("Preemption imminent; returning in-progress work to the queue");
                        match queue.publish(&body).await {
                            Ok(()) => debug!("Requeued in-progress message"),
                            Err(e) => error!("Failed to requeue in-progress message: {e:#}"),
                        }
                    }
                    break;
                }

                tokio::select! {
                    _ = task_notify.notified() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        });

        Self {
            fired,
            stopped,
            notify,
            handle,
        }
    }

    /// Whether this guard re-published its message.
    pub fn requeued(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Disarm the guard and wait for its task to finish.
    pub async fn stop(self) -> Result<bool> {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_one();
        self.handle.await?;
        Ok(self.fired.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wds_common::testing::MemoryWorkQueue;

    struct FixedProbe(bool);

    #[async_trait]
    impl PreemptionProbe for FixedProbe {
        async fn imminent(&self) -> bool {
            self.0
        }
    }

    /// Probe that flips to hot after a given number of polls.
    struct CountdownProbe {
        remaining: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl PreemptionProbe for CountdownProbe {
        async fn imminent(&self) -> bool {
            self.remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
                .map(|n| n <= 1)
                .unwrap_or(true)
        }
    }

    #[tokio::test]
    async fn test_requeues_once_on_preemption() {
        let queue = Arc::new(MemoryWorkQueue::new());
        let guard = PreemptionGuard::spawn(
            Arc::clone(&queue) as Arc<dyn WorkQueue>,
            "s3://tabular/part-00001.parquet".to_string(),
            Arc::new(FixedProbe(true)),
            Duration::from_millis(1),
        );

        // Let the guard task reach its first probe.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(guard.requeued());

        let requeued = guard.stop().await.unwrap();
        assert!(requeued);
        assert_eq!(
            queue.pending(),
            vec!["s3://tabular/part-00001.parquet".to_string()]
        );
    }

    #[tokio::test]
    async fn test_no_requeue_without_preemption() {
        let queue = Arc::new(MemoryWorkQueue::new());
        let guard = PreemptionGuard::spawn(
            Arc::clone(&queue) as Arc<dyn WorkQueue>,
            "body".to_string(),
            Arc::new(FixedProbe(false)),
            Duration::from_millis(5),
        );

        assert!(!guard.requeued());
        let requeued = guard.stop().await.unwrap();
        assert!(!requeued);
        assert!(queue.pending().is_empty());
    }

    #[tokio::test]
    async fn test_fires_after_probe_turns_hot() {
        let queue = Arc::new(MemoryWorkQueue::new());
        let probe = Arc::new(CountdownProbe {
            remaining: std::sync::atomic::AtomicU32::new(3),
        });
        let guard = PreemptionGuard::spawn(
            Arc::clone(&queue) as Arc<dyn WorkQueue>,
            "body".to_string(),
            probe,
            Duration::from_millis(1),
        );

        // Give the task a few poll cycles to reach the hot probe.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(guard.requeued());
        assert_eq!(queue.pending(), vec!["body".to_string()]);

        guard.stop().await.unwrap();
    }
}
