//! Best-effort owner notifications.
//!
//! When a dispatch or activation fails and the workflow names an owner
//! topic, the error text is published there. Publish failures are logged and
//! swallowed; notification never blocks the pipeline.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{info, warn};

/// SNS publish limit; longer messages are truncated.
/// https://docs.aws.amazon.com/sns/latest/api/API_Publish.html
pub const MESSAGE_MAX_BYTES: usize = 262_144;

/// Publishes failure messages to a workflow owner's topic.
#[async_trait]
pub trait OwnerNotifier: Send + Sync {
    async fn notify(&self, topic: &str, message: &str) -> anyhow::Result<()>;
}

/// Truncate to at most `max` bytes without splitting a UTF-8 character.
pub fn truncate_to_bytes(message: &str, max: usize) -> &str {
    if message.len() <= max {
        return message;
    }
    let mut end = max;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

/// Publish a failure message to the workflow owner, if one is set.
///
/// The caller has already logged the failure; this only handles delivery.
pub async fn notify_owner(notifier: &dyn OwnerNotifier, owner: Option<&str>, message: &str) {
    let Some(topic) = owner.filter(|topic| !topic.is_empty()) else {
        return;
    };
    let message = truncate_to_bytes(message, MESSAGE_MAX_BYTES);
    if let Err(err) = notifier.notify(topic, message).await {
        warn!(?err, topic, "failed to publish owner notification");
    }
}

/// Thin glue over the AWS SDK SNS client.
pub struct SnsNotifier {
    client: aws_sdk_sns::Client,
}

impl SnsNotifier {
    /// Build a client from the ambient AWS configuration.
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            client: aws_sdk_sns::Client::new(&config),
        }
    }

    pub fn new(client: aws_sdk_sns::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OwnerNotifier for SnsNotifier {
    async fn notify(&self, topic: &str, message: &str) -> anyhow::Result<()> {
        let result = self
            .client
            .publish()
            .topic_arn(topic)
            .message(message)
            .send()
            .await?;
        info!(
            topic,
            message_id = result.message_id().unwrap_or(""),
            "notified workflow owner"
        );
        Ok(())
    }
}

/// Notifier that records messages for tests.
#[derive(Default)]
pub struct MemoryNotifier {
    messages: Mutex<Vec<(String, String)>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().expect("notifier poisoned").clone()
    }
}

#[async_trait]
impl OwnerNotifier for MemoryNotifier {
    async fn notify(&self, topic: &str, message: &str) -> anyhow::Result<()> {
        self.messages
            .lock()
            .expect("notifier poisoned")
            .push((topic.to_string(), message.to_string()));
        Ok(())
    }
}
