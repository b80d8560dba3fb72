//! Webhook notifier
//!
//! Posts every event as JSON. The payload carries a human readable `text`
//! next to the structured event so chat-style hooks can display it as is:
//!
//! ```json
//! {
//!   "text": "[shop] circuit breaker opened for a.test after 5 failures (HTTP 503)",
//!   "event": "breaker_opened",
//!   "target": "shop",
//!   "domain": "a.test",
//!   "consecutive_failures": 5,
//!   "last_error": "server error: HTTP 503"
//! }
//! ```

use super::{CrawlEvent, Notifier, NotifyError};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use url::Url;

#[derive(Serialize)]
struct Payload<'a> {
    text: String,
    #[serde(flatten)]
    event: &'a CrawlEvent,
}

pub struct WebhookNotifier {
    url: Url,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self, NotifyError> {
        let url = Url::parse(url)
            .map_err(|e| NotifyError::InvalidConfig(format!("webhook url '{}': {}", url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(NotifyError::InvalidConfig(format!(
                "webhook url must be http or https, got '{}'",
                url
            )));
        }

        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { url, client })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &CrawlEvent) -> Result<(), NotifyError> {
        let payload = Payload {
            text: event.to_string(),
            event,
        };

        let response = self
            .client
            .post(self.url.clone())
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }

        tracing::debug!("Webhook notification delivered to {}", self.url);
        Ok(())
    }
}
