//! Delivery policy over outbox records: dispatch by payload kind and the
//! bounded exponential backoff applied between attempts.

use std::sync::Arc;

use crate::notify::{SlackNotifier, WebhookNotifier};
use crate::queue::QueuePublisher;

use super::OutboxPayload;

#[derive(Debug, Clone, Copy)]
pub struct OutboxPolicy {
    pub max_attempts: i64,
    pub base_delay_secs: i64,
    pub max_delay_secs: i64,
}

impl Default for OutboxPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay_secs: 30,
            max_delay_secs: 3_600,
        }
    }
}

impl OutboxPolicy {
    /// Delay before the next attempt after `attempts` failures, doubling
    /// from the base and capped at the maximum.
    pub fn backoff_delay_secs(&self, attempts: i64) -> i64 {
        let exponent = u32::try_from(attempts.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay_secs
            .saturating_mul(2_i64.checked_pow(exponent).unwrap_or(i64::MAX))
            .min(self.max_delay_secs)
    }
}

pub struct OutboxDispatcher {
    webhooks: Arc<dyn WebhookNotifier>,
    slack: Arc<dyn SlackNotifier>,
    queue: Arc<dyn QueuePublisher>,
    policy: OutboxPolicy,
}

impl OutboxDispatcher {
    pub fn new(
        webhooks: Arc<dyn WebhookNotifier>,
        slack: Arc<dyn SlackNotifier>,
        queue: Arc<dyn QueuePublisher>,
        policy: OutboxPolicy,
    ) -> Self {
        Self {
            webhooks,
            slack,
            queue,
            policy,
        }
    }

    pub fn policy(&self) -> &OutboxPolicy {
        &self.policy
    }

    pub(super) fn slack(&self) -> &dyn SlackNotifier {
        self.slack.as_ref()
    }

    pub(super) fn queue(&self) -> &dyn QueuePublisher {
        self.queue.as_ref()
    }

    /// Attempts delivery of one payload. The error string becomes the
    /// record's `last_error`.
    pub async fn dispatch(&self, payload: &OutboxPayload) -> Result<(), String> {
        match payload {
            OutboxPayload::Slack { text } => self
                .slack
                .post(text)
                .await
                .map_err(|e| format!("slack: {e}")),
            OutboxPayload::Webhook { url, event, data } => self
                .webhooks
                .notify(url, event, data)
                .await
                .map_err(|e| format!("webhook {url}: {e}")),
            OutboxPayload::Queue {
                queue,
                dedup_key,
                message,
            } => self
                .queue
                .post_message(queue, dedup_key.as_deref(), message)
                .await
                .map_err(|e| format!("queue {queue}: {e}")),
        }
    }
}
