//! Durable work queue interface and SQS implementation
//!
//! Messages are plain strings: the upstream queue carries tabular-shard URLs,
//! the downstream queue carries shard locators. Delivery is at-least-once;
//! consumers must tolerate redelivery of anything they failed to ack.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One received message, owned until acked or its visibility window lapses.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub body: String,
    pub receipt_handle: String,
}

/// At-least-once delivery queue seam.
///
/// Production uses [`SqsQueue`]; tests use
/// [`crate::testing::MemoryWorkQueue`].
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Long-poll for a single message, waiting up to `wait`.
    async fn receive(&self, wait: Duration) -> Result<Option<QueueMessage>>;

    /// Like [`WorkQueue::receive`], but also sets the received message's
    /// visibility timeout, for long-running work whose processing outlives
    /// the queue default.
    async fn receive_with_visibility(
        &self,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Option<QueueMessage>>;

    /// Delete a message after successful processing.
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Publish a new message.
    async fn publish(&self, body: &str) -> Result<()>;

    /// Drop every queued message. Used when a shard quota is reached and
    /// sibling workers must stop picking up work.
    async fn purge(&self) -> Result<()>;

    /// Refresh the invisibility window of an in-flight message.
    async fn extend_visibility(&self, receipt_handle: &str, timeout: Duration) -> Result<()>;
}

/// Keeps one in-flight message invisible while long-running work proceeds.
///
/// Spawns a background task that refreshes the message's visibility timeout
/// on an interval; drop-in companion for work whose duration can exceed the
/// queue's default window. Call [`VisibilityExtender::stop`] once the
/// message is acked or released.
pub struct VisibilityExtender {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl VisibilityExtender {
    pub fn spawn(
        queue: Arc<dyn WorkQueue>,
        receipt_handle: String,
        timeout: Duration,
        refresh_every: Duration,
    ) -> Self {
        let (stop, mut stopped) = watch::channel(false);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stopped.changed() => {
                        if *stopped.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(refresh_every) => {
                        if let Err(e) = queue.extend_visibility(&receipt_handle, timeout).await {
                            warn!("Failed to extend message visibility: {e:#}");
                        } else {
                            debug!("Extended message visibility");
                        }
                    }
                }
            }
        });

        Self { stop, handle }
    }

    /// Stop refreshing and wait for the background task to exit.
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop.send(true);
        self.handle.await.context("Visibility extender task failed")?;
        Ok(())
    }
}

/// SQS-backed work queue.
#[derive(Clone)]
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsQueue {
    pub fn new(client: aws_sdk_sqs::Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    async fn receive_inner(
        &self,
        wait: Duration,
        visibility: Option<Duration>,
    ) -> Result<Option<QueueMessage>> {
        let mut request = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(wait.as_secs() as i32);

        if let Some(visibility) = visibility {
            request = request.visibility_timeout(visibility.as_secs() as i32);
        }

        let response = request
            .send()
            .await
            .context("Failed to receive from SQS")?;

        let message = response.messages().iter().find_map(|m| {
            match (m.body(), m.receipt_handle()) {
                (Some(body), Some(receipt_handle)) => Some(QueueMessage {
                    body: body.to_string(),
                    receipt_handle: receipt_handle.to_string(),
                }),
                _ => None,
            }
        });

        Ok(message)
    }
}

#[async_trait]
impl WorkQueue for SqsQueue {
    async fn receive(&self, wait: Duration) -> Result<Option<QueueMessage>> {
        self.receive_inner(wait, None).await
    }

    async fn receive_with_visibility(
        &self,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Option<QueueMessage>> {
        self.receive_inner(wait, Some(visibility)).await
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .context("Failed to delete SQS message")?;

        Ok(())
    }

    async fn publish(&self, body: &str) -> Result<()> {
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .context("Failed to send SQS message")?;

        debug!(queue_url = %self.queue_url, "Published message");

        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        self.client
            .purge_queue()
            .queue_url(&self.queue_url)
            .send()
            .await
            .context("Failed to purge SQS queue")?;

        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, timeout: Duration) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(timeout.as_secs() as i32)
            .send()
            .await
            .context("Failed to extend SQS message visibility")?;

        Ok(())
    }
}
