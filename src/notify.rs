//! Outbound notification seams: partner/user webhooks and Slack alerts.
//! Both are fire-and-forget from the core's point of view — transient
//! failures surface as errors here and are absorbed by the outbox retry
//! policy.

use async_trait::async_trait;
use serde::Serialize;
use url::Url;

use crate::error::NotifyError;

#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    event: &'a str,
    data: &'a serde_json::Value,
}

#[async_trait]
pub trait WebhookNotifier: Send + Sync {
    async fn notify(
        &self,
        url: &Url,
        event: &str,
        data: &serde_json::Value,
    ) -> Result<(), NotifyError>;
}

#[async_trait]
pub trait SlackNotifier: Send + Sync {
    async fn post(&self, text: &str) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone)]
pub struct HttpWebhookNotifier {
    client: reqwest::Client,
}

impl HttpWebhookNotifier {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WebhookNotifier for HttpWebhookNotifier {
    async fn notify(
        &self,
        url: &Url,
        event: &str,
        data: &serde_json::Value,
    ) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(url.clone())
            .json(&WebhookBody { event, data })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }

        Ok(())
    }
}

/// Posts to a Slack incoming-webhook URL. Without a configured URL every
/// post fails as `NotConfigured`, which the outbox records like any other
/// delivery failure.
#[derive(Debug, Clone)]
pub struct SlackWebhookNotifier {
    client: reqwest::Client,
    webhook_url: Option<Url>,
}

impl SlackWebhookNotifier {
    pub fn new(client: reqwest::Client, webhook_url: Option<Url>) -> Self {
        Self {
            client,
            webhook_url,
        }
    }
}

#[async_trait]
impl SlackNotifier for SlackWebhookNotifier {
    async fn post(&self, text: &str) -> Result<(), NotifyError> {
        let Some(url) = &self.webhook_url else {
            return Err(NotifyError::NotConfigured("slack webhook url"));
        };

        let response = self
            .client
            .post(url.clone())
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }

        Ok(())
    }
}
